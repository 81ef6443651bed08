//! Telemetry of the dispatch loop.
//!
//! Sinks are best effort. They can't fail and must not block, since they are called from the
//! wake path.
use crate::{
    dispatch::{DispatchRecord, DispatchReport, Resolution},
    reason::WakeFamily,
    sync::LossSignal,
    time::Tick,
};

/// Receives the results of the dispatch loop.
pub trait TelemetrySink {
    /// Called after every dispatched wake.
    fn record(&mut self, record: &DispatchRecord);
    /// Called once the dispatch loop finished.
    fn cycle_complete(&mut self, _report: &DispatchReport, _now: Tick) {}
}
impl TelemetrySink for () {
    fn record(&mut self, _record: &DispatchRecord) {}
}
impl<S: TelemetrySink + ?Sized> TelemetrySink for &mut S {
    fn record(&mut self, record: &DispatchRecord) {
        S::record(self, record)
    }
    fn cycle_complete(&mut self, report: &DispatchReport, now: Tick) {
        S::cycle_complete(self, report, now)
    }
}
impl<A: TelemetrySink, B: TelemetrySink> TelemetrySink for (A, B) {
    fn record(&mut self, record: &DispatchRecord) {
        self.0.record(record);
        self.1.record(record);
    }
    fn cycle_complete(&mut self, report: &DispatchReport, now: Tick) {
        self.0.cycle_complete(report, now);
        self.1.cycle_complete(report, now);
    }
}
impl TelemetrySink for &LossSignal {
    fn record(&mut self, _record: &DispatchRecord) {}
    fn cycle_complete(&mut self, report: &DispatchReport, _now: Tick) {
        if let Some(lost) = report.connection_loss() {
            self.signal(lost);
        }
    }
}

/// Counters of a single family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FamilyCounters {
    pub dispatched: u32,
    pub failures: u32,
    pub escalations: u32,
    /// When the family was last serviced.
    pub last_service: Option<Tick>,
}

/// Records how well the station keeps up with the AP.
///
/// The beacon counters are fed by the receive path, everything else by the dispatch loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimPerformance {
    families: [FamilyCounters; WakeFamily::COUNT],
    beacon_rx_count: u32,
    beacon_timeout_count: u32,
    connection_loss_count: u32,
    cycles: u32,
}
impl TimPerformance {
    pub const fn new() -> Self {
        Self {
            families: [FamilyCounters {
                dispatched: 0,
                failures: 0,
                escalations: 0,
                last_service: None,
            }; WakeFamily::COUNT],
            beacon_rx_count: 0,
            beacon_timeout_count: 0,
            connection_loss_count: 0,
            cycles: 0,
        }
    }
    pub fn family(&self, family: WakeFamily) -> &FamilyCounters {
        &self.families[family.index()]
    }
    pub fn beacon_received(&mut self) {
        self.beacon_rx_count = self.beacon_rx_count.wrapping_add(1);
    }
    pub fn beacon_timed_out(&mut self) {
        self.beacon_timeout_count = self.beacon_timeout_count.wrapping_add(1);
    }
    pub const fn beacon_rx_count(&self) -> u32 {
        self.beacon_rx_count
    }
    pub const fn beacon_timeout_count(&self) -> u32 {
        self.beacon_timeout_count
    }
    /// Number of dispatch cycles, in which at least one family escalated.
    pub const fn connection_loss_count(&self) -> u32 {
        self.connection_loss_count
    }
    pub const fn cycles(&self) -> u32 {
        self.cycles
    }
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
impl Default for TimPerformance {
    fn default() -> Self {
        Self::new()
    }
}
impl TelemetrySink for TimPerformance {
    fn record(&mut self, record: &DispatchRecord) {
        let counters = &mut self.families[record.reason.family().index()];
        counters.dispatched = counters.dispatched.wrapping_add(1);
        if !record.outcome.is_success() {
            counters.failures = counters.failures.wrapping_add(1);
        }
        if let Resolution::Escalated(_) = record.resolution {
            counters.escalations = counters.escalations.wrapping_add(1);
        }
        counters.last_service = Some(record.now);
    }
    fn cycle_complete(&mut self, report: &DispatchReport, _now: Tick) {
        self.cycles = self.cycles.wrapping_add(1);
        if report.connection_loss().is_some() {
            self.connection_loss_count = self.connection_loss_count.wrapping_add(1);
        }
    }
}
