use core::{
    cell::{Cell, RefCell},
    future::{poll_fn, Future},
    task::Poll,
};

use atomic_waker::AtomicWaker;
use embassy_sync::blocking_mutex::Mutex;
use portable_atomic::{AtomicUsize, Ordering};

use crate::{
    dispatch::{self, DispatchReport, DueSource, Outcome, Resolution, WakeHandlers},
    params::DpmParams,
    reason::{Preparation, WakeMask, WakeReason},
    scheduler::{Scheduler, SleepBudget, WakePlan},
    table::{ScheduleEntry, DEFAULT_CAPACITY},
    telemetry::TelemetrySink,
    time::{Periods, Tick},
    timer::WakeTimer,
    DefaultRawMutex, DpmResult,
};

/// Delivers connection loss escalations to the station state machine.
///
/// Escalations of multiple dispatch cycles accumulate, until they are taken.
pub struct LossSignal {
    lost: critical_section::Mutex<Cell<u64>>,
    waker: AtomicWaker,
}
impl LossSignal {
    pub const fn new() -> Self {
        Self {
            lost: critical_section::Mutex::new(Cell::new(0)),
            waker: AtomicWaker::new(),
        }
    }
    /// Report the families in `lost` as escalated.
    pub fn signal(&self, lost: WakeMask) {
        critical_section::with(|cs| {
            let cell = self.lost.borrow(cs);
            cell.set(cell.get() | lost.into_bits());
        });
        self.waker.wake();
    }
    /// Take all escalations, which were signaled so far.
    pub fn take(&self) -> Option<WakeMask> {
        let lost = critical_section::with(|cs| self.lost.borrow(cs).replace(0));
        (lost != 0).then_some(WakeMask::from_bits(lost))
    }
    pub fn reset(&self) {
        critical_section::with(|cs| self.lost.borrow(cs).set(0));
    }
    /// Wait for the next escalation.
    pub fn wait(&self) -> impl Future<Output = WakeMask> + use<'_> {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            match self.take() {
                Some(lost) => Poll::Ready(lost),
                None => Poll::Pending,
            }
        })
    }
}
impl Default for LossSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands wake timer interrupts over to the dispatch task.
///
/// Interrupts, which fire while the task is still dispatching, are not lost. Since one dispatch
/// cycle services everything that is due, they are all consumed by the next [WakeQueue::wait].
pub struct WakeQueue {
    waker: AtomicWaker,
    fired: AtomicUsize,
}
impl WakeQueue {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            fired: AtomicUsize::new(0),
        }
    }
    /// Call this from the wake timer interrupt.
    pub fn fire(&self) {
        self.fired.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
    }
    /// Interrupts, which weren't consumed by the dispatch task yet.
    pub fn pending(&self) -> usize {
        self.fired.load(Ordering::Relaxed)
    }
    /// Forget about all interrupts so far, e.g. after the timer was rearmed.
    pub fn clear(&self) {
        self.fired.store(0, Ordering::Relaxed);
    }
    /// Wait until the wake timer fired at least once.
    ///
    /// Returns the number of interrupts, which were consumed.
    pub fn wait(&self) -> impl Future<Output = usize> + use<'_> {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            match self.fired.swap(0, Ordering::Relaxed) {
                0 => Poll::Pending,
                fired => Poll::Ready(fired),
            }
        })
    }
}
impl Default for WakeQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A [Scheduler], which can be used from the wake path and from task context at the same time.
///
/// Every operation holds the lock only for the duration of a table operation. While dispatching,
/// handlers are called without holding the lock, so they can schedule follow up wakes.
pub struct SharedScheduler<T: WakeTimer, const N: usize = DEFAULT_CAPACITY> {
    inner: Mutex<DefaultRawMutex, RefCell<Scheduler<T, N>>>,
}
impl<T: WakeTimer, const N: usize> SharedScheduler<T, N> {
    pub const fn new(scheduler: Scheduler<T, N>) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(scheduler)),
        }
    }
    /// Run `f` with exclusive access to the scheduler.
    pub fn lock<R>(&self, f: impl FnOnce(&mut Scheduler<T, N>) -> R) -> R {
        self.inner.lock(|scheduler| f(&mut scheduler.borrow_mut()))
    }
    /// See [Scheduler::schedule].
    pub fn schedule(
        &self,
        reason: WakeReason,
        preparation: Preparation,
        interval: Periods,
        half: bool,
        payload: u32,
        align: bool,
    ) -> DpmResult<Tick> {
        self.lock(|scheduler| {
            scheduler.schedule(reason, preparation, interval, half, payload, align)
        })
    }
    pub fn delete(&self, mask: impl Into<WakeMask>) -> usize {
        let mask = mask.into();
        self.lock(|scheduler| scheduler.delete(mask))
    }
    pub fn sleep_budget(&self) -> Option<SleepBudget> {
        self.lock(|scheduler| scheduler.sleep_budget())
    }
    pub fn arm_next_wake(&self) -> Option<WakePlan> {
        self.lock(|scheduler| scheduler.arm_next_wake())
    }
    pub fn reconcile_dtim(&self, observed: u8) -> DpmResult<bool> {
        self.lock(|scheduler| scheduler.reconcile_dtim(observed))
    }
    pub fn reconfigure(&self, params: DpmParams) -> DpmResult<()> {
        self.lock(|scheduler| scheduler.reconfigure(params))
    }
    /// Service everything, that is due now.
    pub fn run(
        &self,
        handlers: &mut impl WakeHandlers,
        telemetry: &mut impl TelemetrySink,
    ) -> DispatchReport {
        let now = self.lock(|scheduler| {
            let now = scheduler.timer().now();
            scheduler.rebase(now);
            now
        });
        let mut source = self;
        dispatch::drive(&mut source, N, now, handlers, telemetry)
    }
    /// Wait for the wake timer to fire and service everything, that is due.
    pub async fn run_on_wake(
        &self,
        queue: &WakeQueue,
        handlers: &mut impl WakeHandlers,
        telemetry: &mut impl TelemetrySink,
    ) -> DispatchReport {
        queue.wait().await;
        self.run(handlers, telemetry)
    }
}
impl<T: WakeTimer, const N: usize> DueSource for &SharedScheduler<T, N> {
    fn pop_due(&mut self, now: Tick) -> Option<ScheduleEntry> {
        self.lock(|scheduler| scheduler.pop_due(now))
    }
    fn complete(&mut self, entry: &ScheduleEntry, outcome: Outcome, now: Tick) -> Resolution {
        self.lock(|scheduler| scheduler.complete(entry, outcome, now))
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::{dispatch::Wake, reason::WakeFamily, scheduler::tests::MockTimer};

    fn shared() -> SharedScheduler<MockTimer, 4> {
        let params = DpmParams::new()
            .with_beacon_interval_us(100_000)
            .with_dtim_period(1);
        let mut scheduler = Scheduler::new(MockTimer::at(0), params);
        scheduler.associate(Tick::ZERO, 0).unwrap();
        SharedScheduler::new(scheduler)
    }

    #[test]
    fn loss_signal_accumulates() {
        let signal = LossSignal::new();
        assert_eq!(signal.take(), None);
        signal.signal(WakeFamily::KeepAlive.mask());
        signal.signal(WakeFamily::PsPoll.mask());
        assert_eq!(
            block_on(signal.wait()),
            WakeFamily::KeepAlive.mask() | WakeFamily::PsPoll.mask()
        );
        assert_eq!(signal.take(), None);
        signal.signal(WakeFamily::Tim.mask());
        signal.reset();
        assert_eq!(signal.take(), None);
    }
    #[test]
    fn wake_queue_coalesces_interrupts() {
        let queue = WakeQueue::new();
        queue.fire();
        queue.fire();
        assert_eq!(queue.pending(), 2);
        // Both interrupts are serviced by a single dispatch cycle.
        assert_eq!(block_on(queue.wait()), 2);
        assert_eq!(queue.pending(), 0);
        queue.fire();
        queue.clear();
        assert_eq!(queue.pending(), 0);
    }
    #[test]
    fn handlers_can_schedule_while_dispatching() {
        let shared = shared();
        shared
            .schedule(
                WakeFamily::PsPoll.base(),
                Preparation::RX_OFDM,
                Periods::beacons(1),
                false,
                7,
                false,
            )
            .unwrap();
        shared.lock(|scheduler| scheduler.timer_mut().now = Tick::new(100_000));
        let queue = WakeQueue::new();
        queue.fire();

        let report = block_on(shared.run_on_wake(
            &queue,
            &mut |wake: &Wake| {
                shared
                    .schedule(
                        WakeFamily::Unicast.base(),
                        Preparation::RX_OFDM,
                        Periods::beacons(1),
                        false,
                        wake.payload(),
                        false,
                    )
                    .unwrap();
                Outcome::Completed
            },
            &mut (),
        ));
        assert_eq!(report.serviced, 1);
        shared.lock(|scheduler| {
            assert_eq!(scheduler.table().len(), 2);
            let unicast = scheduler.table().get(WakeFamily::Unicast).unwrap();
            assert_eq!(unicast.payload(), 7);
            assert_eq!(unicast.due(), Tick::new(200_000));
        });
        assert_eq!(
            shared.sleep_budget().map(|budget| budget.ticks()),
            Some(100_000)
        );
    }
    #[test]
    fn escalations_reach_the_loss_signal() {
        let shared = shared();
        shared
            .lock(|scheduler| {
                scheduler.reconfigure(scheduler.params().clone().with_retry_policy(
                    crate::params::RetryPolicy {
                        max_retries: 0,
                        max_ta_retries: 0,
                        ..Default::default()
                    },
                ))
            })
            .unwrap();
        shared
            .schedule(
                WakeFamily::ArpRequest.base(),
                Preparation::TX,
                Periods::beacons(1),
                false,
                0,
                false,
            )
            .unwrap();
        shared.lock(|scheduler| scheduler.timer_mut().now = Tick::new(100_000));
        let signal = LossSignal::new();
        let report = shared.run(&mut |_: &Wake| Outcome::NoAck, &mut &signal);
        assert_eq!(report.failures, 1);
        assert_eq!(
            block_on(signal.wait()),
            WakeFamily::ArpRequest.mask()
        );
    }
}
