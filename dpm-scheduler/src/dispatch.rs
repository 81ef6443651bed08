use crate::{
    reason::{Stage, WakeFamily, WakeMask, WakeReason},
    table::ScheduleEntry,
    telemetry::TelemetrySink,
    time::{ring_diff, Tick},
};

/// The result of servicing a wake, as reported by the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Completed,
    Failed,
    /// The frame wasn't acknowledged by the AP.
    NoAck,
    Timeout,
}
impl Outcome {
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// A due wake, as seen by its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Wake {
    reason: WakeReason,
    stage: Stage,
    payload: u32,
    attempt: u8,
    due: Tick,
    now: Tick,
}
impl Wake {
    pub(crate) const fn new(entry: &ScheduleEntry, now: Tick) -> Self {
        Self {
            reason: entry.reason(),
            stage: entry.stage(),
            payload: entry.payload(),
            attempt: entry.attempts(),
            due: entry.due(),
            now,
        }
    }
    pub const fn reason(&self) -> WakeReason {
        self.reason
    }
    pub const fn family(&self) -> WakeFamily {
        self.reason.family()
    }
    pub const fn stage(&self) -> Stage {
        self.stage
    }
    /// The opaque payload, which was passed when scheduling.
    pub const fn payload(&self) -> u32 {
        self.payload
    }
    /// How many times the current stage was attempted before. Zero for the base stage.
    pub const fn attempt(&self) -> u8 {
        self.attempt
    }
    /// The handler shouldn't assume a healthy periodic phase of the AP, but use the timing it
    /// observed last.
    pub const fn use_last_known_timing(&self) -> bool {
        matches!(self.stage, Stage::TimeAdjust)
    }
    pub const fn due(&self) -> Tick {
        self.due
    }
    pub const fn now(&self) -> Tick {
        self.now
    }
    /// How many ticks after its due time the wake is serviced.
    pub const fn lateness(&self) -> i64 {
        ring_diff(self.now, self.due)
    }
}

/// The capability table of the radio.
///
/// Handlers must not block. A handler, that has to wait for a response, should schedule its
/// completion as another wake.
pub trait WakeHandlers {
    fn handle(&mut self, wake: &Wake) -> Outcome;
}
impl<F: FnMut(&Wake) -> Outcome> WakeHandlers for F {
    fn handle(&mut self, wake: &Wake) -> Outcome {
        (self)(wake)
    }
}

/// What happened to an entry after its handler returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Resolution {
    /// The family was armed again with this reason.
    Rearmed(WakeReason, Tick),
    /// A one-shot wake completed.
    Retired,
    /// The family exhausted its retries.
    Escalated(WakeFamily),
    /// The family couldn't be rearmed, because the table was full or the handler armed it itself.
    Dropped,
}

/// One dispatched wake, for telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DispatchRecord {
    pub reason: WakeReason,
    pub stage: Stage,
    pub attempt: u8,
    pub outcome: Outcome,
    pub resolution: Resolution,
    pub now: Tick,
}

/// Summary of one dispatch cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DispatchReport {
    /// Number of handlers called.
    pub serviced: usize,
    pub failures: usize,
    /// Families, which escalated during this cycle.
    pub escalated: WakeMask,
}
impl DispatchReport {
    /// The families, which have to be reported to the station as a connection loss.
    pub fn connection_loss(&self) -> Option<WakeMask> {
        (!self.escalated.is_empty()).then_some(self.escalated)
    }
}

/// Something, that due entries can be taken from and returned to.
pub(crate) trait DueSource {
    fn pop_due(&mut self, now: Tick) -> Option<ScheduleEntry>;
    fn complete(&mut self, entry: &ScheduleEntry, outcome: Outcome, now: Tick) -> Resolution;
}

/// Dispatch due entries until none are left, but at most `capacity`.
pub(crate) fn drive(
    source: &mut impl DueSource,
    capacity: usize,
    now: Tick,
    handlers: &mut impl WakeHandlers,
    telemetry: &mut impl TelemetrySink,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    for _ in 0..capacity {
        let Some(entry) = source.pop_due(now) else {
            break;
        };
        let wake = Wake::new(&entry, now);
        let outcome = handlers.handle(&wake);
        let resolution = source.complete(&entry, outcome, now);
        trace!(
            "Serviced {:?} with {:?}, resolved as {:?}.",
            wake.reason(),
            outcome,
            resolution
        );

        report.serviced += 1;
        if !outcome.is_success() {
            report.failures += 1;
        }
        if let Resolution::Escalated(family) = resolution {
            report.escalated |= family.mask();
        }
        telemetry.record(&DispatchRecord {
            reason: wake.reason(),
            stage: wake.stage(),
            attempt: wake.attempt(),
            outcome,
            resolution,
            now,
        });
    }
    telemetry.cycle_complete(&report, now);
    report
}
