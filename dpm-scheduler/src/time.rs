//! Time base of the scheduler.
//!
//! The wake counter is a free running counter of [TICK_BITS] bits, which wraps during normal
//! operation. Two [Tick]s must therefore never be compared directly, but only through
//! [ring_diff] and [ring_compare].
//!
//! Wake obligations are expressed in beacon intervals (BI), since that is what the AP works in.
//! A [SchedulePoint] counts half beacon intervals from the association, while [Periods] counts
//! whole periods of a [PeriodKind].
use core::cmp::Ordering;

use bitfield_struct::bitfield;
use macro_bits::serializable_enum;

use crate::params::DpmParams;

cfg_if::cfg_if! {
    if #[cfg(feature = "narrow-ticks")] {
        /// Width of the wake counter in bits.
        pub const TICK_BITS: u32 = 24;
    } else {
        /// Width of the wake counter in bits.
        pub const TICK_BITS: u32 = 36;
    }
}
/// All bits of the wake counter set.
pub const TICK_MASK: u64 = (1 << TICK_BITS) - 1;
/// Wakes this far ahead or further can't be told apart from wakes in the past.
pub(crate) const TICK_HALF_RANGE: u64 = 1 << (TICK_BITS - 1);

const MICROS_PER_SECOND: u64 = 1_000_000;

/// A value of the wake counter.
///
/// This intentionally doesn't implement [PartialOrd], since the counter wraps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Tick(u64);
impl Tick {
    pub const ZERO: Self = Self(0);

    /// Create a new tick, discarding all bits above [TICK_BITS].
    pub const fn new(raw: u64) -> Self {
        Self(raw & TICK_MASK)
    }
    /// The raw counter value.
    pub const fn raw(self) -> u64 {
        self.0
    }
    pub const fn wrapping_add(self, ticks: u64) -> Self {
        Self::new(self.0.wrapping_add(ticks))
    }
    pub const fn wrapping_sub(self, ticks: u64) -> Self {
        Self::new(self.0.wrapping_sub(ticks))
    }
    /// Move the tick by a signed amount of ticks.
    pub const fn offset(self, ticks: i64) -> Self {
        Self::new(self.0.wrapping_add(ticks as u64))
    }
}

/// Signed distance from `b` to `a` on the counter ring.
///
/// Distances above half the ring are interpreted as negative, i.e. `a` lies before `b`.
pub const fn ring_diff(a: Tick, b: Tick) -> i64 {
    let diff = a.0.wrapping_sub(b.0) & TICK_MASK;
    if diff > TICK_HALF_RANGE {
        diff as i64 - (1i64 << TICK_BITS)
    } else {
        diff as i64
    }
}
/// Order two ticks on the counter ring.
pub fn ring_compare(a: Tick, b: Tick) -> Ordering {
    ring_diff(a, b).cmp(&0)
}

/// Convert a duration in microseconds to ticks, rounding up.
pub const fn micros_to_ticks(us: u64, tick_hz: u32) -> u64 {
    let scaled = us as u128 * tick_hz as u128;
    scaled.div_ceil(MICROS_PER_SECOND as u128) as u64
}
/// Convert ticks to microseconds, rounding down.
pub const fn ticks_to_micros(ticks: u64, tick_hz: u32) -> u64 {
    if tick_hz == 0 {
        return 0;
    }
    (ticks as u128 * MICROS_PER_SECOND as u128 / tick_hz as u128) as u64
}
/// The amount of ticks spanned by `half_units` half beacon intervals.
pub(crate) const fn half_periods_to_ticks(
    half_units: u64,
    beacon_interval_us: u32,
    tick_hz: u32,
) -> u64 {
    (half_units as u128 * beacon_interval_us as u128 * tick_hz as u128
        / (2 * MICROS_PER_SECOND as u128)) as u64
}
/// The amount of whole half beacon intervals, that fit into `ticks`.
pub(crate) const fn ticks_to_half_periods(ticks: u64, beacon_interval_us: u32, tick_hz: u32) -> u64 {
    let half_period = beacon_interval_us as u128 * tick_hz as u128;
    if half_period == 0 {
        return 0;
    }
    (ticks as u128 * 2 * MICROS_PER_SECOND as u128 / half_period) as u64
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// The protocol period, in which an interval is counted.
    pub enum PeriodKind: u8 {
        #[default]
        /// The beacon interval.
        Beacon => 0x00,
        /// The DTIM period, which is a multiple of the beacon interval.
        Dtim => 0x01,
        /// The listen interval negotiated during association.
        ListenInterval => 0x02,
        /// The operator configured period, which is a multiple of the DTIM period.
        Force => 0x03
    }
}

/// A number of whole periods of a [PeriodKind].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Periods {
    kind: PeriodKind,
    count: u32,
}
impl Periods {
    pub const fn new(kind: PeriodKind, count: u32) -> Self {
        Self { kind, count }
    }
    /// `count` beacon intervals.
    pub const fn beacons(count: u32) -> Self {
        Self::new(PeriodKind::Beacon, count)
    }
    /// `count` DTIM periods.
    pub const fn dtims(count: u32) -> Self {
        Self::new(PeriodKind::Dtim, count)
    }
    pub const fn kind(&self) -> PeriodKind {
        self.kind
    }
    pub const fn count(&self) -> u32 {
        self.count
    }
    /// An interval of zero periods, which is never a valid delay.
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
    /// The length of these periods in beacon intervals.
    pub fn in_beacon_intervals(&self, params: &DpmParams) -> u64 {
        self.count as u64 * period_length(params, self.kind) as u64
    }
}

/// The amount of ticks spanned by `periods` and an optional half beacon interval.
///
/// Returns [None], if the span reaches half of the counter ring.
pub fn periods_to_ticks(
    params: &DpmParams,
    periods: Periods,
    half: bool,
    tick_hz: u32,
) -> Option<u64> {
    let half_units = periods
        .in_beacon_intervals(params)
        .checked_mul(2)?
        .checked_add(half as u64)?;
    let ticks = half_units as u128 * params.beacon_interval_us() as u128 * tick_hz as u128
        / (2 * MICROS_PER_SECOND as u128);
    (ticks < TICK_HALF_RANGE as u128).then_some(ticks as u64)
}

/// The number of beacon intervals in one period of `kind`.
///
/// If the period isn't configured yet, this returns one, so callers can always make progress.
pub fn period_length(params: &DpmParams, kind: PeriodKind) -> u32 {
    let length = match kind {
        PeriodKind::Beacon => 1,
        PeriodKind::Dtim => params.dtim_period() as u32,
        PeriodKind::ListenInterval => params.listen_interval() as u32,
        PeriodKind::Force => params.force_period(),
        #[allow(unreachable_patterns)]
        _ => 1,
    };
    length.max(1)
}
/// Convert a duration in microseconds to whole periods of `kind`.
///
/// This rounds up, so that a wake never happens later than requested. Durations shorter than one
/// period still take up one period.
pub fn micros_to_periods(params: &DpmParams, kind: PeriodKind, us: u64) -> Periods {
    let period_us = period_length(params, kind) as u64 * params.beacon_interval_us() as u64;
    let count = if period_us == 0 {
        1
    } else {
        us.div_ceil(period_us).max(1)
    };
    Periods::new(kind, count.min(u32::MAX as u64) as u32)
}
/// Convert a duration in milliseconds to whole periods of `kind`.
pub fn millis_to_periods(params: &DpmParams, kind: PeriodKind, ms: u64) -> Periods {
    micros_to_periods(params, kind, ms.saturating_mul(1_000))
}
/// Convert a duration in seconds to whole periods of `kind`.
pub fn seconds_to_periods(params: &DpmParams, kind: PeriodKind, seconds: u32) -> Periods {
    micros_to_periods(params, kind, seconds as u64 * MICROS_PER_SECOND)
}

/// A position on the beacon grid.
///
/// This is packed as `(period_count << 1) | half`, where `period_count` is the index of a beacon
/// interval since the association and `half` selects the mid point of that interval. The packed
/// value lives on the same ring as the wake counter.
#[bitfield(u64)]
#[derive(PartialEq, Eq, Hash)]
pub struct SchedulePoint {
    /// The point lies half a beacon interval after the start of the period.
    pub half: bool,
    #[bits(63)]
    pub period_count: u64,
}
impl SchedulePoint {
    /// The point `half` half intervals after the start of beacon interval `period_count`.
    pub const fn at(period_count: u64, half: bool) -> Self {
        Self::from_bits(((period_count << 1) | half as u64) & TICK_MASK)
    }
    /// The packed value in half beacon intervals.
    pub const fn half_units(self) -> u64 {
        self.into_bits()
    }
    /// Advance the point by `periods` beacon intervals and an optional half interval.
    pub const fn plus(self, periods: u64, half: bool) -> Self {
        Self::from_bits(
            self.into_bits()
                .wrapping_add((periods << 1) | half as u64)
                & TICK_MASK,
        )
    }
    /// Move the point back by `periods` beacon intervals and an optional half interval.
    pub const fn minus(self, periods: u64, half: bool) -> Self {
        Self::from_bits(
            self.into_bits()
                .wrapping_sub((periods << 1) | half as u64)
                & TICK_MASK,
        )
    }
    /// Signed distance from `other` to `self` in half beacon intervals.
    pub const fn half_units_since(self, other: Self) -> i64 {
        ring_diff(Tick::new(self.into_bits()), Tick::new(other.into_bits()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DpmParams {
        DpmParams::new()
            .with_beacon_interval_us(100_000)
            .with_dtim_period(3)
            .with_listen_interval(10)
    }

    #[test]
    fn ring_diff_across_wrap() {
        let before_wrap = Tick::new(TICK_MASK - 4);
        let after_wrap = Tick::new(5);
        assert_eq!(ring_diff(after_wrap, before_wrap), 10);
        assert_eq!(ring_diff(before_wrap, after_wrap), -10);
        assert_eq!(ring_compare(after_wrap, before_wrap), Ordering::Greater);
        assert_eq!(ring_compare(before_wrap, after_wrap), Ordering::Less);
        assert_eq!(ring_compare(after_wrap, after_wrap), Ordering::Equal);
    }
    #[test]
    fn ring_diff_matches_shortest_distance() {
        let ring = 1i128 << TICK_BITS;
        for base in [0, 1, TICK_HALF_RANGE - 1, TICK_HALF_RANGE, TICK_MASK - 1, TICK_MASK] {
            for delta in [-1000i64, -1, 0, 1, 7, 1000, (TICK_HALF_RANGE - 1) as i64] {
                let a = Tick::new(base).offset(delta);
                let b = Tick::new(base);
                assert_eq!(ring_diff(a, b), delta, "base {base} delta {delta}");
                let expected = (a.raw() as i128 - b.raw() as i128).rem_euclid(ring);
                let expected = if expected > TICK_HALF_RANGE as i128 {
                    expected - ring
                } else {
                    expected
                };
                assert_eq!(ring_diff(a, b) as i128, expected);
            }
        }
    }
    #[test]
    fn tick_discards_high_bits() {
        assert_eq!(Tick::new(TICK_MASK + 1), Tick::ZERO);
        assert_eq!(Tick::new(TICK_MASK).wrapping_add(1), Tick::ZERO);
        assert_eq!(Tick::ZERO.wrapping_sub(1), Tick::new(TICK_MASK));
    }
    #[test]
    fn schedule_point_packing() {
        let point = SchedulePoint::at(21, true);
        assert_eq!(point.half_units(), 43);
        assert_eq!(point.period_count(), 21);
        assert!(point.half());
    }
    #[test]
    fn schedule_point_round_trip() {
        let near_wrap = SchedulePoint::from_bits(TICK_MASK - 3);
        for point in [SchedulePoint::at(0, false), SchedulePoint::at(5, true), near_wrap] {
            for periods in [0, 1, 10, 1 << 20] {
                for half in [false, true] {
                    assert_eq!(point.plus(periods, half).minus(periods, half), point);
                }
            }
        }
        assert_eq!(
            SchedulePoint::at(3, true).plus(0, true),
            SchedulePoint::at(4, false)
        );
        assert_eq!(near_wrap.plus(2, false).half_units_since(near_wrap), 4);
    }
    #[test]
    fn period_lengths() {
        let params = params().with_force_period(7);
        assert_eq!(period_length(&params, PeriodKind::Beacon), 1);
        assert_eq!(period_length(&params, PeriodKind::Dtim), 3);
        assert_eq!(period_length(&params, PeriodKind::ListenInterval), 10);
        // The force period is rounded down to a multiple of the DTIM period.
        assert_eq!(period_length(&params, PeriodKind::Force), 6);
    }
    #[test]
    fn unconfigured_period_length_is_one() {
        let params = DpmParams::new();
        assert_eq!(period_length(&params, PeriodKind::Dtim), 1);
        assert_eq!(period_length(&params, PeriodKind::ListenInterval), 1);
        assert_eq!(
            millis_to_periods(&params, PeriodKind::Dtim, 5_000),
            Periods::dtims(1)
        );
    }
    #[test]
    fn conversion_rounds_up() {
        let params = params();
        assert_eq!(
            millis_to_periods(&params, PeriodKind::Beacon, 1_000),
            Periods::beacons(10)
        );
        assert_eq!(
            millis_to_periods(&params, PeriodKind::Beacon, 1_001),
            Periods::beacons(11)
        );
        assert_eq!(
            seconds_to_periods(&params, PeriodKind::Dtim, 1),
            Periods::dtims(4)
        );
        assert_eq!(
            micros_to_periods(&params, PeriodKind::Dtim, 1),
            Periods::dtims(1)
        );
        assert_eq!(
            micros_to_periods(&params, PeriodKind::Beacon, 0),
            Periods::beacons(1)
        );
        assert_eq!(Periods::dtims(4).in_beacon_intervals(&params), 12);
    }
    #[test]
    fn spans_stay_within_half_the_ring() {
        let params = params().with_force_period(3_000_000_000);
        assert_eq!(
            periods_to_ticks(&params, Periods::beacons(10), true, 1_000_000),
            Some(1_050_000)
        );
        let limit = ((TICK_HALF_RANGE - 1) / 100_000) as u32;
        assert_eq!(
            periods_to_ticks(&params, Periods::beacons(limit), false, 1_000_000),
            Some(limit as u64 * 100_000)
        );
        assert_eq!(
            periods_to_ticks(&params, Periods::beacons(limit + 1), false, 1_000_000),
            None
        );
        // Overflows u64 before it is even converted to ticks.
        assert_eq!(
            periods_to_ticks(
                &params,
                Periods::new(PeriodKind::Force, u32::MAX),
                false,
                1_000_000
            ),
            None
        );
        assert!(Periods::dtims(0).is_empty());
    }
    #[test]
    fn tick_conversions() {
        assert_eq!(micros_to_ticks(1_000, 32_768), 33);
        assert_eq!(ticks_to_micros(32_768, 32_768), 1_000_000);
        assert_eq!(half_periods_to_ticks(2, 102_400, 1_000_000), 102_400);
        assert_eq!(half_periods_to_ticks(1, 102_400, 32_768), 1_677);
        assert_eq!(ticks_to_half_periods(150_000, 100_000, 1_000_000), 3);
    }
}
