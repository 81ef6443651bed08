//! # `dpm-scheduler`
//! This is the wake scheduler of the dynamic power management (DPM) for a battery powered Wi-Fi
//! station. While the radio and most of the SoC are powered down, it decides when to wake up next,
//! so the station can catch beacons, answer ARP and keepalive traffic, poll for buffered frames
//! and refresh TCP and UDP keepalives, while sleeping as long as possible.
//! ## Overview
//! This chapter will give a short overview of how the scheduler is structured.
//!
//! ### Time base
//! All wakes are driven by a single hardware wake timer, which is abstracted through the
//! [WakeTimer] trait. The counter of that timer has a fixed width and wraps during normal
//! operation, so all comparisons between two [Tick]s are done on the counter ring through
//! [ring_diff]. Wake obligations are naturally expressed in protocol periods (beacon interval,
//! DTIM period, listen interval and the operator configured force period), which is what
//! [Periods] and [SchedulePoint] are for.
//!
//! ### Wake reasons
//! Every obligation is identified by one bit in a 64-bit [WakeMask]. Related bits are grouped into
//! a [WakeFamily], which has a base bit and optionally a retry and a time adjust (TA) bit. Only
//! one [Stage] of a family can ever be armed, which is enforced by the [ScheduleTable], since it
//! stores at most one entry per family.
//!
//! ### Scheduling
//! The [Scheduler] owns the table, the [DpmParams] and the timer. Aligned wakes are snapped to
//! the period boundaries of the AP, which are anchored to the last observed DTIM count. Once a
//! beacon is received, [Scheduler::reconcile_dtim] corrects that anchor and moves all aligned
//! wakes, so drift never accumulates for more than one beacon interval. Before going to sleep,
//! the platform asks for the [SleepBudget] or the full [WakePlan], which also contains the
//! subsystems, that have to be powered up for the wake.
//!
//! ### Dispatching
//! On wake, [Scheduler::run] pops all due entries and hands them to the [WakeHandlers] of the
//! radio. The [Outcome] reported by the handler decides, whether the family is rearmed at its
//! interval, retired or moved on to its retry and TA stages. A family, which exhausted all of its
//! retries, is escalated as a connection loss. The scheduler never disassociates by itself, this
//! is left to the station state machine, which can await the [LossSignal].
//!
//! If the scheduler is shared between the wake path and normal task context, it can be wrapped in
//! a [SharedScheduler]. Handlers are called without holding the lock, so they can schedule
//! follow up wakes.

#![no_std]
#![allow(unexpected_cfgs)]
pub(crate) mod fmt;

mod dispatch;
mod params;
mod reason;
#[cfg(rtc_wake_timer)]
mod rtc;
mod scheduler;
mod sync;
mod table;
mod telemetry;
mod time;
mod timer;

pub use dispatch::{DispatchRecord, DispatchReport, Outcome, Resolution, Wake, WakeHandlers};
pub use params::{DpmParams, FamilyPolicy, RetryPolicy, TU_US};
pub use reason::{Preparation, Stage, WakeFamily, WakeMask, WakeReason};
#[cfg(rtc_wake_timer)]
pub use rtc::RtcWakeTimer;
pub use scheduler::{FamilyState, Scheduler, SleepBudget, WakePlan};
pub use sync::{LossSignal, SharedScheduler, WakeQueue};
pub use table::{ScheduleEntry, ScheduleTable, DEFAULT_CAPACITY, MAX_CAPACITY, PAYLOAD_BITS};
pub use telemetry::{FamilyCounters, TelemetrySink, TimPerformance};
pub use time::{
    micros_to_periods, micros_to_ticks, millis_to_periods, period_length, periods_to_ticks,
    ring_compare, ring_diff, seconds_to_periods, ticks_to_micros, PeriodKind, Periods, SchedulePoint, Tick, TICK_BITS,
    TICK_MASK,
};
pub use timer::WakeTimer;

#[cfg(not(feature = "critical_section"))]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(feature = "critical_section")]
type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// An error related to the DPM scheduler.
pub enum DpmError {
    /// A wake reason, period or payload was out of range, or the beacon timing isn't known yet.
    InvalidArgument,
    /// All slots of the schedule table are taken.
    TableFull,
    /// Another stage of the family is already armed.
    SiblingArmed,
    /// The family exhausted all of its retries and has to be reset by a new association.
    ConnectionLoss,
}
pub type DpmResult<T> = Result<T, DpmError>;
