use bitfield_struct::bitfield;

use crate::{
    reason::{Preparation, Stage, WakeFamily, WakeMask, WakeReason},
    time::{ring_diff, Periods, SchedulePoint, Tick},
    DpmError, DpmResult,
};

/// The capacity of the schedule table, if not specified otherwise.
pub const DEFAULT_CAPACITY: usize = 16;
/// The largest capacity a schedule table can have, since there are only 64 wake reasons.
pub const MAX_CAPACITY: usize = 64;
/// Width of the opaque payload attached to an entry.
pub const PAYLOAD_BITS: u32 = 26;
pub const PAYLOAD_MAX: u32 = (1 << PAYLOAD_BITS) - 1;

#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
struct EntryFlags {
    #[bits(26)]
    arbitrary: u32,
    /// Check the DTIM count and adjust the time, if it isn't as predicted.
    align: bool,
    half: bool,
    #[bits(4)]
    preparation: u8,
}

/// A pending wake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScheduleEntry {
    family: WakeFamily,
    stage: Stage,
    point: SchedulePoint,
    due: Tick,
    interval: Periods,
    flags: EntryFlags,
    attempts: u8,
}
impl ScheduleEntry {
    /// Create a new entry for the first attempt of `reason`.
    ///
    /// `interval` is the nominal interval of the family, which is used when it returns to its base
    /// stage. The payload must fit into [PAYLOAD_BITS].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reason: WakeReason,
        point: SchedulePoint,
        due: Tick,
        interval: Periods,
        half: bool,
        preparation: Preparation,
        payload: u32,
        align: bool,
    ) -> DpmResult<Self> {
        if payload > PAYLOAD_MAX {
            warn!(
                "Payload {} of {:?} doesn't fit into {} bits.",
                payload,
                reason,
                PAYLOAD_BITS
            );
            return Err(DpmError::InvalidArgument);
        }
        Ok(Self {
            family: reason.family(),
            stage: reason.stage(),
            point,
            due,
            interval,
            flags: EntryFlags::new()
                .with_arbitrary(payload)
                .with_align(align)
                .with_half(half)
                .with_preparation(preparation.into_bits() & 0x0f),
            attempts: 0,
        })
    }
    /// The same entry at another stage of its family.
    ///
    /// Families without a dedicated bit for `stage` keep their base bit, but the stage is still
    /// tracked.
    pub(crate) fn at_stage(mut self, stage: Stage, attempts: u8) -> Self {
        self.stage = stage;
        self.attempts = attempts;
        self
    }
    /// The same entry moved to another time.
    pub(crate) fn moved_to(mut self, point: SchedulePoint, due: Tick) -> Self {
        self.point = point;
        self.due = due;
        self
    }
    pub(crate) fn with_interval(mut self, interval: Periods) -> Self {
        self.interval = interval;
        self
    }
    /// The bit, which represents this entry in the wake mask.
    pub const fn reason(&self) -> WakeReason {
        self.family.reason_for(self.stage)
    }
    pub const fn family(&self) -> WakeFamily {
        self.family
    }
    /// The stage of the family, this entry represents.
    pub const fn stage(&self) -> Stage {
        self.stage
    }
    /// Where this entry lies on the beacon grid.
    pub const fn point(&self) -> SchedulePoint {
        self.point
    }
    /// The tick at which this entry is due.
    pub const fn due(&self) -> Tick {
        self.due
    }
    /// The nominal interval of the family.
    pub const fn interval(&self) -> Periods {
        self.interval
    }
    pub const fn half(&self) -> bool {
        self.flags.half()
    }
    pub const fn is_aligned(&self) -> bool {
        self.flags.align()
    }
    pub const fn preparation(&self) -> Preparation {
        Preparation::from_bits(self.flags.preparation())
    }
    pub const fn payload(&self) -> u32 {
        self.flags.arbitrary()
    }
    /// How many times the current stage has been armed.
    pub const fn attempts(&self) -> u8 {
        self.attempts
    }
}

/// Fixed capacity storage of the pending wakes.
///
/// Every family occupies at most one slot, so two stages of the same family can never be armed at
/// the same time. All operations are linear scans over the slots, which is faster than any
/// ordered structure at this size.
#[derive(Clone, Debug)]
pub struct ScheduleTable<const N: usize = DEFAULT_CAPACITY> {
    slots: [Option<ScheduleEntry>; N],
}
impl<const N: usize> ScheduleTable<N> {
    const CAPACITY_CHECK: () = assert!(
        N > 0 && N <= MAX_CAPACITY,
        "The schedule table must hold between 1 and 64 entries."
    );

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::CAPACITY_CHECK;
        Self { slots: [None; N] }
    }
    pub const fn capacity(&self) -> usize {
        N
    }
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
    pub fn iter(&self) -> impl Iterator<Item = &ScheduleEntry> + '_ {
        self.slots.iter().flatten()
    }
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ScheduleEntry> + '_ {
        self.slots.iter_mut().flatten()
    }
    fn slot_of(&self, family: WakeFamily) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(entry) if entry.family() == family))
    }
    /// The entry of `family`, if any stage of it is armed.
    pub fn get(&self, family: WakeFamily) -> Option<&ScheduleEntry> {
        self.slot_of(family).and_then(|slot| self.slots[slot].as_ref())
    }
    /// The bits of all armed reasons.
    pub fn armed(&self) -> WakeMask {
        self.iter()
            .fold(WakeMask::NONE, |mask, entry| mask | entry.reason().mask())
    }
    /// Insert an entry.
    ///
    /// If another stage of the family is already armed, this fails with
    /// [DpmError::SiblingArmed], unless the entry is aligned, in which case the armed stage is
    /// replaced. A new family fails with [DpmError::TableFull], if all slots are taken.
    pub fn insert(&mut self, entry: ScheduleEntry) -> DpmResult<()> {
        if let Some(slot) = self.slot_of(entry.family()) {
            if !entry.is_aligned() {
                debug!(
                    "{:?} is already armed, refusing {:?}.",
                    entry.family(),
                    entry.reason()
                );
                return Err(DpmError::SiblingArmed);
            }
            trace!("Replacing armed entry of {:?}.", entry.family());
            self.slots[slot] = Some(entry);
            return Ok(());
        }
        let Some(free) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            warn!("Schedule table full, dropping {:?}.", entry.reason());
            return Err(DpmError::TableFull);
        };
        *free = Some(entry);
        Ok(())
    }
    /// Remove the entry of `family` and return it.
    pub fn take(&mut self, family: WakeFamily) -> Option<ScheduleEntry> {
        self.slot_of(family).and_then(|slot| self.slots[slot].take())
    }
    /// Remove every entry, whose reason is in `mask`.
    ///
    /// Returns the number of removed entries.
    pub fn delete(&mut self, mask: impl Into<WakeMask>) -> usize {
        let mask = mask.into();
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(entry) if mask.contains(entry.reason())) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }
    pub fn delete_all(&mut self) {
        self.slots = [None; N];
    }
    /// The entry, which is due the soonest relative to `now`.
    ///
    /// Entries, which are already overdue, come first. Ties are broken by bit order.
    pub fn earliest(&self, now: Tick) -> Option<&ScheduleEntry> {
        self.iter().min_by_key(|entry| {
            (ring_diff(entry.due(), now), entry.reason().bit())
        })
    }
}
impl<const N: usize> Default for ScheduleTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TICK_MASK;

    fn entry(reason: WakeReason, due: u64) -> ScheduleEntry {
        ScheduleEntry::new(
            reason,
            SchedulePoint::at(due, false),
            Tick::new(due),
            Periods::beacons(1),
            false,
            Preparation::RX_DSSS,
            0,
            false,
        )
        .unwrap()
    }
    fn retry(family: WakeFamily) -> WakeReason {
        WakeReason::new(family, Stage::Retry).unwrap()
    }

    #[test]
    fn entry_fields() {
        let entry = ScheduleEntry::new(
            WakeFamily::UdpHolePunch.base(),
            SchedulePoint::at(4, true),
            Tick::new(450),
            Periods::dtims(2),
            true,
            Preparation::TX.union(Preparation::APP),
            PAYLOAD_MAX,
            true,
        )
        .unwrap();
        assert_eq!(entry.payload(), PAYLOAD_MAX);
        assert!(entry.half());
        assert!(entry.is_aligned());
        assert_eq!(entry.preparation(), Preparation::TX.union(Preparation::APP));
        assert_eq!(entry.interval(), Periods::dtims(2));
        assert_eq!(entry.attempts(), 0);
    }
    #[test]
    fn stage_without_dedicated_bit() {
        let entry = entry(WakeFamily::Tim.base(), 0).at_stage(Stage::TimeAdjust, 2);
        assert_eq!(entry.stage(), Stage::TimeAdjust);
        assert_eq!(entry.reason(), WakeFamily::Tim.base());
        assert_eq!(entry.attempts(), 2);
    }
    #[test]
    fn oversized_payload() {
        let res = ScheduleEntry::new(
            WakeFamily::Tim.base(),
            SchedulePoint::at(0, false),
            Tick::ZERO,
            Periods::beacons(1),
            false,
            Preparation::NO_MAC,
            PAYLOAD_MAX + 1,
            false,
        );
        assert_eq!(res, Err(DpmError::InvalidArgument));
    }
    #[test]
    fn one_stage_per_family() {
        let mut table = ScheduleTable::<4>::new();
        table.insert(entry(WakeFamily::KeepAlive.base(), 10)).unwrap();
        assert_eq!(
            table.insert(entry(retry(WakeFamily::KeepAlive), 5)),
            Err(DpmError::SiblingArmed)
        );
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get(WakeFamily::KeepAlive).map(ScheduleEntry::due),
            Some(Tick::new(10))
        );
    }
    #[test]
    fn aligned_insert_replaces_sibling() {
        let mut table = ScheduleTable::<4>::new();
        table.insert(entry(WakeFamily::PsPoll.base(), 10)).unwrap();
        let aligned = ScheduleEntry::new(
            retry(WakeFamily::PsPoll),
            SchedulePoint::at(3, false),
            Tick::new(3),
            Periods::beacons(1),
            false,
            Preparation::RX_OFDM,
            7,
            true,
        )
        .unwrap();
        table.insert(aligned).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.armed(), retry(WakeFamily::PsPoll).mask());
    }
    #[test]
    fn full_table_leaves_entries_untouched() {
        let mut table = ScheduleTable::<2>::new();
        table.insert(entry(WakeFamily::Tim.base(), 1)).unwrap();
        table.insert(entry(WakeFamily::BcMc.base(), 2)).unwrap();
        let before = table.clone();
        assert_eq!(
            table.insert(entry(WakeFamily::KeepAlive.base(), 3)),
            Err(DpmError::TableFull)
        );
        assert!(table.iter().eq(before.iter()));
    }
    #[test]
    fn delete_by_mask() {
        let mut table = ScheduleTable::<8>::new();
        table.insert(entry(WakeFamily::Tim.base(), 1)).unwrap();
        table.insert(entry(retry(WakeFamily::KeepAlive), 2)).unwrap();
        table.insert(entry(WakeFamily::FullBoot0.base(), 3)).unwrap();
        assert_eq!(table.delete(WakeFamily::KeepAlive.base()), 0);
        assert_eq!(table.delete(WakeFamily::KeepAlive), 1);
        assert_eq!(table.delete(WakeMask::MAC), 1);
        assert_eq!(table.armed(), WakeFamily::FullBoot0.mask());
        table.delete_all();
        assert!(table.is_empty());
    }
    #[test]
    fn earliest_across_wrap() {
        let mut table = ScheduleTable::<4>::new();
        let now = Tick::new(TICK_MASK - 10);
        table.insert(entry(WakeFamily::Tim.base(), 20)).unwrap();
        table
            .insert(entry(WakeFamily::BcMc.base(), TICK_MASK - 2))
            .unwrap();
        table.insert(entry(WakeFamily::KeepAlive.base(), 5)).unwrap();
        let earliest = table.earliest(now).unwrap();
        assert_eq!(earliest.family(), WakeFamily::BcMc);
        table.delete(WakeFamily::BcMc);
        assert_eq!(table.earliest(now).unwrap().family(), WakeFamily::KeepAlive);
        table.delete_all();
        assert!(table.earliest(now).is_none());
    }
    #[test]
    fn ties_break_by_bit_order() {
        let mut table = ScheduleTable::<4>::new();
        table.insert(entry(WakeFamily::KeepAlive.base(), 5)).unwrap();
        table.insert(entry(WakeFamily::PsPoll.base(), 5)).unwrap();
        assert_eq!(
            table.earliest(Tick::ZERO).unwrap().family(),
            WakeFamily::PsPoll
        );
    }
}
