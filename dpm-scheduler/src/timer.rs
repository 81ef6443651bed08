use crate::time::Tick;

/// The hardware wake timer.
///
/// The counter is expected to be monotonic within one wrap of [TICK_BITS](crate::TICK_BITS).
pub trait WakeTimer {
    /// The rate at which the counter increments.
    const TICK_HZ: u32;

    /// The current value of the counter.
    fn now(&self) -> Tick;
    /// Wake the station at or after `at`.
    ///
    /// Arming again replaces the previous wake.
    fn arm(&mut self, at: Tick);
}
impl<T: WakeTimer> WakeTimer for &mut T {
    const TICK_HZ: u32 = T::TICK_HZ;

    fn now(&self) -> Tick {
        T::now(self)
    }
    fn arm(&mut self, at: Tick) {
        T::arm(self, at)
    }
}
