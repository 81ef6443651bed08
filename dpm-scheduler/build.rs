/// Indicates, that the RTC of the chip can be used as the wake timer.
const RTC_WAKE_TIMER: &str = "rtc_wake_timer";

const ESP32_META: &[&str] = &[RTC_WAKE_TIMER];
const ESP32S2_META: &[&str] = &[RTC_WAKE_TIMER];

fn main() {
    let meta: &[&str] = if cfg!(all(feature = "esp32", feature = "esp32s2")) {
        panic!("You may select at most one chip.");
    } else if cfg!(feature = "esp32") {
        ESP32_META
    } else if cfg!(feature = "esp32s2") {
        ESP32S2_META
    } else {
        // Without a chip the wake timer has to be provided by the platform.
        &[]
    };
    for item in meta {
        println!("cargo:rustc-cfg={item}");
    }
}
