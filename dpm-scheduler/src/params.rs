use crate::{
    reason::{Preparation, WakeFamily},
    time::{millis_to_periods, periods_to_ticks, PeriodKind, Periods},
    DpmError, DpmResult,
};

/// The length of a time unit (TU) in microseconds.
pub const TU_US: u32 = 1024;

/// How often a failed wake is repeated, before the family escalates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetryPolicy {
    /// How many times the retry stage is armed, before switching to time adjust.
    pub max_retries: u8,
    /// How many times the time adjust stage is armed, before the connection is considered lost.
    pub max_ta_retries: u8,
    /// Delay of the retry stage, relative to the failure.
    pub retry_backoff: Periods,
    /// Delay of the time adjust stage, relative to the failure.
    pub ta_backoff: Periods,
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_ta_retries: 2,
            retry_backoff: Periods::beacons(1),
            ta_backoff: Periods::dtims(1),
        }
    }
}

/// Per family behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FamilyPolicy {
    /// The family is rearmed at its interval after completing.
    pub periodic: bool,
    pub retry: RetryPolicy,
}
impl FamilyPolicy {
    /// The default policy for a family.
    pub fn for_family(family: WakeFamily) -> Self {
        Self {
            periodic: family.is_periodic_by_default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Configuration of the power management.
///
/// This is set at association and updated on reconfiguration, i.e. when the AP changes its beacon
/// interval or DTIM period, or when the user changes the keepalive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DpmParams {
    beacon_interval_us: u32,
    dtim_period: u8,
    listen_interval: u16,
    /// In beacon intervals. Always a multiple of the DTIM period.
    force_period: u32,
    keepalive_ms: u32,
    min_sleep_us: u32,
    /// Power up time for DSSS RX, OFDM RX, TX and the application, in that order.
    prep_lead_us: [u32; 4],
    policies: [FamilyPolicy; WakeFamily::COUNT],
}
impl DpmParams {
    /// Create an empty configuration.
    ///
    /// Until the beacon interval and DTIM period are set, all periods have a length of one.
    pub fn new() -> Self {
        Self {
            beacon_interval_us: 0,
            dtim_period: 0,
            listen_interval: 0,
            force_period: 0,
            keepalive_ms: 0,
            min_sleep_us: 0,
            prep_lead_us: [0; 4],
            policies: WakeFamily::ALL.map(FamilyPolicy::for_family),
        }
    }
    pub fn with_beacon_interval_us(mut self, beacon_interval_us: u32) -> Self {
        self.beacon_interval_us = beacon_interval_us;
        self
    }
    /// Set the beacon interval in TUs, as it is advertised by the AP.
    pub fn with_beacon_interval_tu(self, beacon_interval_tu: u16) -> Self {
        self.with_beacon_interval_us(beacon_interval_tu as u32 * TU_US)
    }
    /// Set the DTIM period.
    ///
    /// The force period is renormalized to a multiple of the new DTIM period.
    pub fn with_dtim_period(mut self, dtim_period: u8) -> Self {
        self.dtim_period = dtim_period;
        self.force_period = Self::normalize_force_period(self.force_period, dtim_period);
        self
    }
    pub fn with_listen_interval(mut self, listen_interval: u16) -> Self {
        self.listen_interval = listen_interval;
        self
    }
    /// Set the force period in beacon intervals.
    ///
    /// This is rounded down to a multiple of the DTIM period, but never below one DTIM period.
    pub fn with_force_period(mut self, force_period: u32) -> Self {
        self.force_period = Self::normalize_force_period(force_period, self.dtim_period);
        self
    }
    pub fn with_keepalive_ms(mut self, keepalive_ms: u32) -> Self {
        self.keepalive_ms = keepalive_ms;
        self
    }
    /// Wakes closer together than this are serviced in one wake cycle.
    pub fn with_min_sleep_us(mut self, min_sleep_us: u32) -> Self {
        self.min_sleep_us = min_sleep_us;
        self
    }
    /// Set the power up time, which the hardware needs for the subsystems in `preparation`.
    pub fn with_preparation_lead_us(mut self, preparation: Preparation, lead_us: u32) -> Self {
        for (index, lead) in self.prep_lead_us.iter_mut().enumerate() {
            if preparation.requires_index(index) {
                *lead = lead_us;
            }
        }
        self
    }
    pub fn with_policy(mut self, family: WakeFamily, policy: FamilyPolicy) -> Self {
        self.set_policy(family, policy);
        self
    }
    /// Apply the same retry policy to all families.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        for policy in self.policies.iter_mut() {
            policy.retry = retry;
        }
        self
    }
    fn normalize_force_period(force_period: u32, dtim_period: u8) -> u32 {
        let dtim_period = dtim_period as u32;
        // The DTIM period may not be known yet.
        if dtim_period == 0 {
            force_period
        } else if force_period <= dtim_period {
            dtim_period
        } else {
            force_period - force_period % dtim_period
        }
    }
    pub fn set_policy(&mut self, family: WakeFamily, policy: FamilyPolicy) {
        self.policies[family.index()] = policy;
    }

    pub const fn beacon_interval_us(&self) -> u32 {
        self.beacon_interval_us
    }
    pub const fn dtim_period(&self) -> u8 {
        self.dtim_period
    }
    pub const fn listen_interval(&self) -> u16 {
        self.listen_interval
    }
    pub const fn force_period(&self) -> u32 {
        self.force_period
    }
    pub const fn keepalive_ms(&self) -> u32 {
        self.keepalive_ms
    }
    pub const fn min_sleep_us(&self) -> u32 {
        self.min_sleep_us
    }
    pub fn policy(&self, family: WakeFamily) -> &FamilyPolicy {
        &self.policies[family.index()]
    }
    /// The power up time for everything in `preparation`.
    ///
    /// Subsystems are powered up in parallel, so this is the largest of the individual times.
    pub fn preparation_lead_us(&self, preparation: Preparation) -> u32 {
        self.prep_lead_us
            .iter()
            .enumerate()
            .filter(|(index, _)| preparation.requires_index(*index))
            .map(|(_, lead)| *lead)
            .max()
            .unwrap_or(0)
    }
    /// The user keepalive, counted in periods of `kind`.
    ///
    /// Returns [None], if no keepalive is configured.
    pub fn keepalive_interval(&self, kind: PeriodKind) -> Option<Periods> {
        (self.keepalive_ms != 0).then(|| millis_to_periods(self, kind, self.keepalive_ms as u64))
    }
    /// Check if the beacon timing is known.
    pub const fn is_configured(&self) -> bool {
        self.beacon_interval_us != 0 && self.dtim_period != 0
    }
    /// Check that the configuration can be used for scheduling.
    pub fn validate(&self) -> DpmResult<()> {
        if !self.is_configured() {
            warn!(
                "Rejecting configuration with BI {} us and DTIM period {}.",
                self.beacon_interval_us,
                self.dtim_period
            );
            return Err(DpmError::InvalidArgument);
        }
        for family in WakeFamily::ALL {
            let retry = self.policy(family).retry;
            if retry.retry_backoff.is_empty() || retry.ta_backoff.is_empty() {
                warn!("Backoff of {:?} is empty.", family);
                return Err(DpmError::InvalidArgument);
            }
        }
        Ok(())
    }
    /// Check that all configured delays fit on a wake counter running at `tick_hz`.
    ///
    /// This covers the backoffs of all families and the keepalive period.
    pub fn validate_range(&self, tick_hz: u32) -> DpmResult<()> {
        let fits = |periods: Periods| periods_to_ticks(self, periods, false, tick_hz).is_some();
        if let Some(keepalive) = self.keepalive_interval(PeriodKind::Beacon) {
            if !fits(keepalive) {
                warn!("Keepalive of {} ms exceeds the wake counter.", self.keepalive_ms);
                return Err(DpmError::InvalidArgument);
            }
        }
        for family in WakeFamily::ALL {
            let retry = self.policy(family).retry;
            if !fits(retry.retry_backoff) || !fits(retry.ta_backoff) {
                warn!("Backoff of {:?} exceeds the wake counter.", family);
                return Err(DpmError::InvalidArgument);
            }
        }
        Ok(())
    }
}
impl Default for DpmParams {
    fn default() -> Self {
        Self::new()
    }
}
