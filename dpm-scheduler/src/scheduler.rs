use crate::{
    dispatch::{self, DispatchReport, DueSource, Outcome, Resolution, WakeHandlers},
    params::DpmParams,
    reason::{Preparation, Stage, WakeFamily, WakeMask, WakeReason},
    table::{ScheduleEntry, ScheduleTable, DEFAULT_CAPACITY},
    telemetry::TelemetrySink,
    time::{
        half_periods_to_ticks, micros_to_ticks, period_length, periods_to_ticks, ring_diff,
        ticks_to_half_periods, ticks_to_micros, PeriodKind, Periods, SchedulePoint, Tick,
        TICK_BITS, TICK_HALF_RANGE,
    },
    timer::WakeTimer,
    DpmError, DpmResult,
};

/// Once the counter is this far past the epoch, the epoch is moved forward.
const REBASE_DISTANCE: i64 = 1 << (TICK_BITS - 2);

/// The beacon grid of the AP, as seen through the wake counter.
///
/// Beacon intervals are indexed from the association. The epoch is the start of beacon interval
/// `epoch_index` and is periodically moved forward, so that ring distances from it stay valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BeaconGrid {
    epoch: Tick,
    epoch_index: u64,
    /// Index of a beacon interval, which carried a DTIM.
    dtim_anchor: u64,
    beacon_interval_us: u32,
    tick_hz: u32,
}
impl BeaconGrid {
    const fn new(epoch: Tick, beacon_interval_us: u32, tick_hz: u32) -> Self {
        Self {
            epoch,
            epoch_index: 0,
            dtim_anchor: 0,
            beacon_interval_us,
            tick_hz,
        }
    }
    const fn ticks(&self, half_units: u64) -> u64 {
        half_periods_to_ticks(half_units, self.beacon_interval_us, self.tick_hz)
    }
    /// Half beacon intervals since the association.
    ///
    /// Ticks before the epoch are treated as the epoch.
    fn half_index(&self, now: Tick) -> u64 {
        let elapsed = ring_diff(now, self.epoch).max(0) as u64;
        self.epoch_index * 2 + ticks_to_half_periods(elapsed, self.beacon_interval_us, self.tick_hz)
    }
    /// Index of the beacon interval `now` lies in.
    fn index(&self, now: Tick) -> u64 {
        self.half_index(now) / 2
    }
    fn point(&self, now: Tick) -> SchedulePoint {
        let half_index = self.half_index(now);
        SchedulePoint::at(half_index / 2, half_index % 2 == 1)
    }
    /// The tick at which beacon interval `index` starts, plus an optional half interval.
    fn tick_at(&self, index: u64, half: bool) -> Tick {
        let half_units = index.saturating_sub(self.epoch_index) * 2 + half as u64;
        self.epoch.wrapping_add(self.ticks(half_units))
    }
    /// Recover the beacon interval index of a point.
    fn index_of(&self, point: SchedulePoint) -> u64 {
        let since_epoch = point.half_units_since(SchedulePoint::at(self.epoch_index, false));
        (self.epoch_index as i64 + since_epoch.div_euclid(2)).max(0) as u64
    }
    /// `(index - dtim_anchor) mod length`
    fn phase(&self, index: u64, length: u64) -> u64 {
        (index % length + length - self.dtim_anchor % length) % length
    }
    /// The first boundary of a grid with `length` strictly after beacon interval `index`.
    fn boundary_after(&self, index: u64, length: u64) -> u64 {
        index + length - self.phase(index, length)
    }
    /// The boundary closest to `index`, preferring the later one on a tie.
    fn nearest_boundary(&self, index: u64, length: u64) -> u64 {
        let phase = self.phase(index, length);
        if phase * 2 < length {
            index.saturating_sub(phase)
        } else {
            index + length - phase
        }
    }
    /// The boundary nearest to `point`, which still lies after beacon interval `index`.
    fn snap(&self, point: SchedulePoint, length: u64, index: u64) -> u64 {
        let target = self.nearest_boundary(self.index_of(point), length);
        if target <= index {
            self.boundary_after(index, length)
        } else {
            target
        }
    }
    /// The DTIM count, that the beacon at the start of `index` carries.
    fn dtim_count_at(&self, index: u64, dtim_period: u64) -> u8 {
        ((dtim_period - self.phase(index, dtim_period)) % dtim_period) as u8
    }
    fn rebase(&mut self, now: Tick) -> bool {
        if ring_diff(now, self.epoch) < REBASE_DISTANCE {
            return false;
        }
        self.move_epoch(self.index(now));
        true
    }
    fn move_epoch(&mut self, index: u64) {
        self.epoch = self.tick_at(index, false);
        self.epoch_index = index;
    }
    /// Switch to another beacon interval, keeping the index of the current one.
    fn rescale(&mut self, now: Tick, beacon_interval_us: u32) {
        self.move_epoch(self.index(now));
        self.beacon_interval_us = beacon_interval_us;
    }
    /// Where a wake `interval` after `now` lands.
    ///
    /// Aligned wakes land on the `interval.count()`-th boundary of the period grid strictly after
    /// the current beacon interval. All other wakes are relative to `now`. Empty intervals and
    /// wakes half the counter ring or more ahead are rejected.
    fn locate(
        &self,
        params: &DpmParams,
        now: Tick,
        interval: Periods,
        half: bool,
        align: bool,
    ) -> DpmResult<(SchedulePoint, Tick)> {
        if interval.is_empty() {
            warn!("Rejecting empty interval {:?}.", interval);
            return Err(DpmError::InvalidArgument);
        }
        let located = if align {
            let length = period_length(params, interval.kind()) as u64;
            let first = self.boundary_after(self.index(now), length);
            (interval.count() as u64 - 1)
                .checked_mul(length)
                .and_then(|offset| offset.checked_add(first))
                .and_then(|index| {
                    let half_units = index
                        .checked_sub(self.epoch_index)?
                        .checked_mul(2)?
                        .checked_add(half as u64)?;
                    let since_epoch = half_units as u128
                        * self.beacon_interval_us as u128
                        * self.tick_hz as u128
                        / 2_000_000;
                    let ahead = since_epoch as i128 - ring_diff(now, self.epoch) as i128;
                    (ahead < TICK_HALF_RANGE as i128).then(|| {
                        (
                            SchedulePoint::at(index, half),
                            self.epoch.wrapping_add(since_epoch as u64),
                        )
                    })
                })
        } else {
            periods_to_ticks(params, interval, half, self.tick_hz).map(|ahead| {
                (
                    self.point(now)
                        .plus(interval.in_beacon_intervals(params), half),
                    now.wrapping_add(ahead),
                )
            })
        };
        located.ok_or_else(|| {
            warn!("Interval {:?} exceeds the range of the wake counter.", interval);
            DpmError::InvalidArgument
        })
    }
}

/// The delay, after which `entry` fires again under `params`, and its base interval.
fn pending_delay(params: &DpmParams, entry: &ScheduleEntry) -> (Periods, Periods) {
    let mut interval = entry.interval();
    if entry.family() == WakeFamily::KeepAlive {
        if let Some(keepalive) = params.keepalive_interval(interval.kind()) {
            interval = keepalive;
        }
    }
    let retry = params.policy(entry.family()).retry;
    let delay = match entry.stage() {
        Stage::Base => interval,
        Stage::Retry => retry.retry_backoff,
        Stage::TimeAdjust => retry.ta_backoff,
    };
    (delay, interval)
}

/// How long the station may sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SleepBudget {
    ticks: u64,
    due: Tick,
    tick_hz: u32,
}
impl SleepBudget {
    /// The budget in ticks of the wake timer. Overdue entries yield a budget of zero.
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }
    /// The tick at which the earliest entry is due.
    pub const fn due(&self) -> Tick {
        self.due
    }
    pub const fn as_micros(&self) -> u64 {
        ticks_to_micros(self.ticks, self.tick_hz)
    }
    pub const fn duration(&self) -> embassy_time::Duration {
        embassy_time::Duration::from_micros(self.as_micros())
    }
}

/// Everything the platform needs to know before going to sleep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WakePlan {
    /// The reasons, which will be serviced in the next wake cycle.
    pub reasons: WakeMask,
    /// The subsystems, which have to be powered up for them.
    pub preparation: Preparation,
    /// The tick at which the earliest of them is due.
    pub due: Tick,
    /// The tick at which the wake timer should fire, so the preparation is done by `due`.
    pub arm_at: Tick,
    /// The budget is shorter than the minimum sleep, so sleeping isn't worth it.
    pub stay_awake: bool,
}

/// The state of a family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FamilyState {
    Idle,
    Armed(Stage),
    /// All retries were exhausted. This is only left through a new association or a reset.
    Escalated,
}

/// The DPM wake scheduler.
///
/// This owns the schedule table, the configuration and the wake timer. All operations are
/// non-blocking and bounded by the capacity `N` of the table.
pub struct Scheduler<T: WakeTimer, const N: usize = DEFAULT_CAPACITY> {
    timer: T,
    params: DpmParams,
    table: ScheduleTable<N>,
    grid: BeaconGrid,
    escalated: WakeMask,
}
impl<T: WakeTimer, const N: usize> Scheduler<T, N> {
    /// Create a new scheduler.
    ///
    /// The beacon timing in `params` may still be unknown, in which case scheduling fails until
    /// [Self::reconfigure] is called with a complete configuration.
    pub fn new(timer: T, params: DpmParams) -> Self {
        let grid = BeaconGrid::new(timer.now(), params.beacon_interval_us(), T::TICK_HZ);
        Self {
            timer,
            params,
            table: ScheduleTable::new(),
            grid,
            escalated: WakeMask::NONE,
        }
    }
    /// Start following the beacons of a new AP.
    ///
    /// `beacon_tick` is the start of the beacon interval, in which a beacon with `dtim_count` was
    /// received. All MAC related wakes of the previous association are dropped and escalations
    /// are cleared.
    pub fn associate(&mut self, beacon_tick: Tick, dtim_count: u8) -> DpmResult<()> {
        self.params.validate()?;
        self.params.validate_range(T::TICK_HZ)?;
        if dtim_count >= self.params.dtim_period() {
            warn!(
                "DTIM count {} is outside of the DTIM period {}.",
                dtim_count,
                self.params.dtim_period()
            );
            return Err(DpmError::InvalidArgument);
        }
        self.table.delete(WakeMask::MAC);
        self.escalated = WakeMask::NONE;
        self.grid = BeaconGrid::new(beacon_tick, self.params.beacon_interval_us(), T::TICK_HZ);
        self.grid.dtim_anchor = dtim_count as u64;
        info!(
            "Associated with BI {} us and DTIM period {}.",
            self.params.beacon_interval_us(),
            self.params.dtim_period()
        );
        Ok(())
    }
    /// Drop all MAC related wakes. Full boot requests survive.
    pub fn disassociate(&mut self) {
        let removed = self.table.delete(WakeMask::MAC);
        self.escalated = WakeMask::NONE;
        info!("Disassociated, dropped {} wakes.", removed);
    }
    /// Drop everything and start over.
    pub fn reset(&mut self) {
        self.table.delete_all();
        self.escalated = WakeMask::NONE;
        self.grid = BeaconGrid::new(
            self.timer.now(),
            self.params.beacon_interval_us(),
            T::TICK_HZ,
        );
    }
    pub fn params(&self) -> &DpmParams {
        &self.params
    }
    /// Apply a new configuration.
    ///
    /// Only entries, which depend on something that changed, are moved. An entry, whose delay
    /// changed, is rederived from now. Retry and TA stages use the backoff of their policy and
    /// the keepalive family picks up the new keepalive period. Aligned entries, whose period grid
    /// changed, are moved to the nearest boundary of the new grid, which is still in the future.
    /// Everything else keeps its due tick.
    ///
    /// Nothing is applied, if any entry can't be placed with the new configuration.
    pub fn reconfigure(&mut self, params: DpmParams) -> DpmResult<()> {
        params.validate()?;
        params.validate_range(T::TICK_HZ)?;
        let now = self.timer.now();
        self.rebase(now);
        let mut grid = self.grid;
        grid.rescale(now, params.beacon_interval_us());
        let index = grid.index(now);
        let rescaled = params.beacon_interval_us() != self.params.beacon_interval_us();

        let mut table = self.table.clone();
        let mut moved = 0;
        for entry in table.iter_mut() {
            let (old_delay, _) = pending_delay(&self.params, entry);
            let (delay, interval) = pending_delay(&params, entry);
            let align = entry.is_aligned() && entry.stage() != Stage::Retry;
            let length = period_length(&params, delay.kind());
            let regridded = rescaled || period_length(&self.params, delay.kind()) != length;
            let (point, due) = if delay != old_delay {
                grid.locate(&params, now, delay, entry.half(), align)?
            } else if align && regridded {
                let target = grid.snap(entry.point(), length as u64, index);
                (
                    SchedulePoint::at(target, entry.half()),
                    grid.tick_at(target, entry.half()),
                )
            } else if rescaled {
                (grid.point(entry.due()), entry.due())
            } else {
                continue;
            };
            *entry = entry.with_interval(interval).moved_to(point, due);
            moved += 1;
        }
        self.grid = grid;
        self.table = table;
        self.params = params;
        debug!("Reconfigured, moved {} pending wakes.", moved);
        Ok(())
    }
    pub fn timer(&self) -> &T {
        &self.timer
    }
    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }
    pub fn table(&self) -> &ScheduleTable<N> {
        &self.table
    }
    /// The families, which escalated to a connection loss.
    pub fn escalated(&self) -> WakeMask {
        self.escalated
    }
    pub fn family_state(&self, family: WakeFamily) -> FamilyState {
        if self.escalated.intersects(family.mask()) {
            FamilyState::Escalated
        } else if let Some(entry) = self.table.get(family) {
            FamilyState::Armed(entry.stage())
        } else {
            FamilyState::Idle
        }
    }

    /// Arm a wake `interval` from now.
    ///
    /// With `align` set, the wake is snapped to the period grid of the AP and replaces any armed
    /// stage of the family. Otherwise it is relative to now and fails, if the family is armed.
    /// Returns the tick at which the wake is due.
    pub fn schedule(
        &mut self,
        reason: WakeReason,
        preparation: Preparation,
        interval: Periods,
        half: bool,
        payload: u32,
        align: bool,
    ) -> DpmResult<Tick> {
        self.params.validate()?;
        self.params.validate_range(T::TICK_HZ)?;
        let family = reason.family();
        if self.escalated.intersects(family.mask()) {
            debug!("Refusing to schedule escalated family {:?}.", family);
            return Err(DpmError::ConnectionLoss);
        }
        let now = self.timer.now();
        self.rebase(now);
        let (point, due) = self.grid.locate(&self.params, now, interval, half, align)?;
        let entry = ScheduleEntry::new(
            reason,
            point,
            due,
            interval,
            half,
            preparation,
            payload,
            align,
        )?;
        self.table.insert(entry)?;
        trace!("Scheduled {:?} for tick {}.", reason, due.raw());
        Ok(due)
    }
    /// Arm the null data keepalive at the configured keepalive period.
    pub fn schedule_keepalive(&mut self, preparation: Preparation, payload: u32) -> DpmResult<Tick> {
        let Some(interval) = self.params.keepalive_interval(PeriodKind::Beacon) else {
            return Err(DpmError::InvalidArgument);
        };
        self.schedule(
            WakeFamily::KeepAlive.base(),
            preparation,
            interval,
            false,
            payload,
            false,
        )
    }
    /// Cancel all wakes in `mask`. Returns the number of cancelled entries.
    pub fn delete(&mut self, mask: impl Into<WakeMask>) -> usize {
        self.table.delete(mask)
    }
    pub fn delete_all(&mut self) {
        self.table.delete_all();
    }

    fn budget_at(&self, now: Tick) -> Option<SleepBudget> {
        let earliest = self.table.earliest(now)?;
        Some(SleepBudget {
            ticks: ring_diff(earliest.due(), now).max(0) as u64,
            due: earliest.due(),
            tick_hz: T::TICK_HZ,
        })
    }
    /// The time until the earliest pending wake.
    ///
    /// Returns [None], if nothing is pending.
    pub fn sleep_budget(&self) -> Option<SleepBudget> {
        self.budget_at(self.timer.now())
    }
    /// Plan the next wake cycle.
    ///
    /// All reasons due within the minimum sleep of the earliest one are serviced together, so the
    /// preparation covers all of them.
    pub fn wake_plan(&self) -> Option<WakePlan> {
        let now = self.timer.now();
        let earliest = self.table.earliest(now)?;
        let window = micros_to_ticks(self.params.min_sleep_us() as u64, T::TICK_HZ) as i64;
        let (reasons, preparation) = self
            .table
            .iter()
            .filter(|entry| ring_diff(entry.due(), earliest.due()) <= window)
            .fold(
                (WakeMask::NONE, Preparation::NO_MAC),
                |(reasons, preparation), entry| {
                    (
                        reasons | entry.reason().mask(),
                        preparation.union(entry.preparation()),
                    )
                },
            );
        let lead = micros_to_ticks(
            self.params.preparation_lead_us(preparation) as u64,
            T::TICK_HZ,
        );
        let mut arm_at = earliest.due().wrapping_sub(lead);
        if ring_diff(arm_at, now) < 0 {
            arm_at = now;
        }
        Some(WakePlan {
            reasons,
            preparation,
            due: earliest.due(),
            arm_at,
            stay_awake: ring_diff(earliest.due(), now) < window,
        })
    }
    /// Plan the next wake cycle and arm the timer for it.
    pub fn arm_next_wake(&mut self) -> Option<WakePlan> {
        let plan = self.wake_plan()?;
        self.timer.arm(plan.arm_at);
        trace!("Armed wake timer for tick {}.", plan.arm_at.raw());
        Some(plan)
    }

    /// The DTIM count, that the beacon of the current beacon interval should carry.
    pub fn predicted_dtim_count(&self) -> Option<u8> {
        let period = self.params.dtim_period() as u64;
        (period != 0).then(|| {
            self.grid
                .dtim_count_at(self.grid.index(self.timer.now()), period)
        })
    }
    /// Compare the DTIM count of a received beacon with the prediction.
    ///
    /// On a mismatch the DTIM phase is corrected and all aligned wakes are moved to the nearest
    /// corrected boundary, which is still in the future. Returns whether anything was corrected.
    pub fn reconcile_dtim(&mut self, observed: u8) -> DpmResult<bool> {
        let period = self.params.dtim_period() as u64;
        if period == 0 || observed as u64 >= period {
            warn!("Observed DTIM count {} is out of range.", observed);
            return Err(DpmError::InvalidArgument);
        }
        let now = self.timer.now();
        self.rebase(now);
        let index = self.grid.index(now);
        let predicted = self.grid.dtim_count_at(index, period);
        if predicted == observed {
            return Ok(false);
        }
        debug!(
            "DTIM count {} doesn't match prediction {}, realigning.",
            observed,
            predicted
        );
        self.grid.dtim_anchor = index + observed as u64;
        self.realign(index);
        Ok(true)
    }
    fn realign(&mut self, index: u64) {
        let grid = self.grid;
        let params = &self.params;
        for entry in self.table.iter_mut() {
            if !entry.is_aligned() {
                continue;
            }
            let kind = match entry.stage() {
                Stage::Base => entry.interval().kind(),
                Stage::TimeAdjust => params.policy(entry.family()).retry.ta_backoff.kind(),
                // Retries are relative to the failure.
                Stage::Retry => continue,
            };
            let target = grid.snap(entry.point(), period_length(params, kind) as u64, index);
            *entry = entry.moved_to(
                SchedulePoint::at(target, entry.half()),
                grid.tick_at(target, entry.half()),
            );
            trace!("Moved {:?} to beacon interval {}.", entry.reason(), target);
        }
    }

    /// Take the earliest entry, if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Tick) -> Option<ScheduleEntry> {
        let family = self
            .table
            .earliest(now)
            .filter(|entry| ring_diff(entry.due(), now) <= 0)?
            .family();
        self.table.take(family)
    }
    fn rearm(
        &mut self,
        entry: ScheduleEntry,
        delay: Periods,
        align: bool,
        now: Tick,
    ) -> Resolution {
        let entry = match self
            .grid
            .locate(&self.params, now, delay, entry.half(), align)
        {
            Ok((point, due)) => entry.moved_to(point, due),
            Err(_) => return Resolution::Dropped,
        };
        match self.table.insert(entry) {
            Ok(()) => Resolution::Rearmed(entry.reason(), entry.due()),
            Err(_) => Resolution::Dropped,
        }
    }
    /// Apply the outcome of a dispatched entry.
    pub(crate) fn complete(
        &mut self,
        entry: &ScheduleEntry,
        outcome: Outcome,
        now: Tick,
    ) -> Resolution {
        let family = entry.family();
        let policy = *self.params.policy(family);
        if outcome.is_success() {
            if !policy.periodic {
                return Resolution::Retired;
            }
            return self.rearm(
                entry.at_stage(Stage::Base, 0),
                entry.interval(),
                entry.is_aligned(),
                now,
            );
        }

        let retry = policy.retry;
        let attempts = entry.attempts();
        let next = match entry.stage() {
            Stage::Base if retry.max_retries > 0 => Some((Stage::Retry, 1)),
            Stage::Retry if attempts < retry.max_retries => Some((Stage::Retry, attempts + 1)),
            Stage::Base | Stage::Retry => {
                (retry.max_ta_retries > 0).then_some((Stage::TimeAdjust, 1))
            }
            Stage::TimeAdjust if attempts < retry.max_ta_retries => {
                Some((Stage::TimeAdjust, attempts + 1))
            }
            Stage::TimeAdjust => None,
        };
        match next {
            Some((Stage::Retry, attempts)) => self.rearm(
                entry.at_stage(Stage::Retry, attempts),
                retry.retry_backoff,
                false,
                now,
            ),
            Some((stage, attempts)) => self.rearm(
                entry.at_stage(stage, attempts),
                retry.ta_backoff,
                entry.is_aligned(),
                now,
            ),
            None => {
                self.escalated |= family.mask();
                warn!("{:?} exhausted all retries, escalating.", family);
                Resolution::Escalated(family)
            }
        }
    }
    /// Service everything, that is due at `now`.
    ///
    /// At most `N` entries are dispatched, so this terminates even if handlers keep rearming
    /// wakes for now.
    pub fn run(
        &mut self,
        now: Tick,
        handlers: &mut impl WakeHandlers,
        telemetry: &mut impl TelemetrySink,
    ) -> DispatchReport {
        self.rebase(now);
        dispatch::drive(self, N, now, handlers, telemetry)
    }
    pub(crate) fn rebase(&mut self, now: Tick) {
        if self.grid.rebase(now) {
            trace!("Moved epoch to beacon interval {}.", self.grid.epoch_index);
        }
    }
}
impl<T: WakeTimer, const N: usize> DueSource for Scheduler<T, N> {
    fn pop_due(&mut self, now: Tick) -> Option<ScheduleEntry> {
        Scheduler::pop_due(self, now)
    }
    fn complete(&mut self, entry: &ScheduleEntry, outcome: Outcome, now: Tick) -> Resolution {
        Scheduler::complete(self, entry, outcome, now)
    }
}
