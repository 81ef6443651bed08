use esp_hal::rtc_cntl::{sleep::TimerWakeupSource, Rtc};

use crate::{
    time::{ring_diff, Tick},
    timer::WakeTimer,
};

/// A wake timer backed by the RTC of the chip.
///
/// The RTC keeps running in light sleep, so the counter stays valid across sleeps. Arming only
/// records the wake, the station enters light sleep through [RtcWakeTimer::sleep].
pub struct RtcWakeTimer<'d> {
    rtc: Rtc<'d>,
    armed: Option<Tick>,
}
impl<'d> RtcWakeTimer<'d> {
    pub fn new(rtc: Rtc<'d>) -> Self {
        Self { rtc, armed: None }
    }
    /// The currently armed wake.
    pub fn armed(&self) -> Option<Tick> {
        self.armed
    }
    /// Enter light sleep until the armed wake.
    ///
    /// Returns immediately, if nothing is armed or the wake already passed.
    pub fn sleep(&mut self) {
        let Some(at) = self.armed.take() else {
            return;
        };
        let remaining = ring_diff(at, self.now());
        if remaining <= 0 {
            trace!("Wake at tick {} already passed.", at.raw());
            return;
        }
        let timer = TimerWakeupSource::new(core::time::Duration::from_micros(remaining as u64));
        self.rtc.sleep_light(&[&timer]);
    }
    pub fn into_inner(self) -> Rtc<'d> {
        self.rtc
    }
}
impl WakeTimer for RtcWakeTimer<'_> {
    const TICK_HZ: u32 = 1_000_000;

    fn now(&self) -> Tick {
        Tick::new(self.rtc.time_since_boot().to_micros())
    }
    fn arm(&mut self, at: Tick) {
        self.armed = Some(at);
    }
}
