//! Deadline-ordered timer service.
//!
//! One ordered table of absolute deadlines behind a single mutex. Callbacks
//! are dispatched in deadline order with the lock released, so a callback may
//! add or stop timers (including its own) without deadlocking. Periodic
//! timers re-arm at `previous_deadline + interval` to stay drift-free.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub type TimerId = u64;

type Callback = Arc<dyn Fn(TimerId) + Send + Sync>;

/// What a timer is for; log labeling only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OpportunityTimeout,
    StrategyScan,
    BestOpportunityReset,
    SnapshotValidity,
    SimulatedFill,
    CounterDump,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::OpportunityTimeout => "opportunity-timeout",
            TimerKind::StrategyScan => "strategy-scan",
            TimerKind::BestOpportunityReset => "best-opportunity-reset",
            TimerKind::SnapshotValidity => "snapshot-validity",
            TimerKind::SimulatedFill => "simulated-fill",
            TimerKind::CounterDump => "counter-dump",
        }
    }
}

struct TimerEntry {
    id: TimerId,
    kind: TimerKind,
    deadline: Instant,
    interval: Duration,
    periodic: bool,
    callback: Callback,
}

#[derive(Default)]
struct TimerTable {
    /// Deadline-ordered queue; the id disambiguates equal deadlines.
    queue: BTreeMap<(Instant, TimerId), TimerEntry>,
    deadlines: HashMap<TimerId, Instant>,
}

pub struct TimerService {
    table: Mutex<TimerTable>,
    wakeup: Condvar,
    next_id: AtomicU64,
    running: AtomicBool,
    /// Fire-delay past this is logged as a latency anomaly
    fire_delay_warn: Duration,
    /// Callback runtime past this is logged as a latency anomaly
    callback_warn: Duration,
}

impl TimerService {
    pub fn new() -> Arc<Self> {
        Self::with_thresholds(Duration::from_millis(10), Duration::from_millis(10))
    }

    pub fn with_thresholds(fire_delay_warn: Duration, callback_warn: Duration) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(TimerTable::default()),
            wakeup: Condvar::new(),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            fire_delay_warn,
            callback_warn,
        })
    }

    /// Schedule a callback after `delay`. Ids increase monotonically and are
    /// kept across periodic re-arms, so `stop` works at any point in the
    /// timer's life.
    pub fn add<F>(&self, delay: Duration, kind: TimerKind, periodic: bool, callback: F) -> TimerId
    where
        F: Fn(TimerId) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = TimerEntry {
            id,
            kind,
            deadline: Instant::now() + delay,
            interval: delay,
            periodic,
            callback: Arc::new(callback),
        };
        trace!(timer = id, kind = kind.as_str(), ?delay, periodic, "timer added");

        let mut table = self.table.lock();
        table.deadlines.insert(id, entry.deadline);
        table.queue.insert((entry.deadline, id), entry);
        drop(table);
        self.wakeup.notify_one();
        id
    }

    /// Cancel a timer. Idempotent; unknown and already-fired ids are no-ops.
    pub fn stop(&self, id: TimerId) {
        let mut table = self.table.lock();
        if let Some(deadline) = table.deadlines.remove(&id) {
            table.queue.remove(&(deadline, id));
            trace!(timer = id, "timer stopped");
        }
        drop(table);
        self.wakeup.notify_one();
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.table.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fire every timer whose deadline has passed, in deadline order, with
    /// the table unlocked during each callback. Returns the number fired.
    pub fn tick(&self) -> usize {
        let now = Instant::now();
        let mut due: Vec<TimerEntry> = Vec::new();

        {
            let mut table = self.table.lock();
            loop {
                let key = match table.queue.keys().next() {
                    Some(&(deadline, id)) if deadline <= now => (deadline, id),
                    _ => break,
                };
                let entry = table.queue.remove(&key).expect("key just observed");
                table.deadlines.remove(&entry.id);

                if entry.periodic {
                    // Re-arm from the previous deadline so the cadence does
                    // not drift with dispatch latency.
                    let next = entry.deadline + entry.interval;
                    table.deadlines.insert(entry.id, next);
                    table.queue.insert(
                        (next, entry.id),
                        TimerEntry {
                            id: entry.id,
                            kind: entry.kind,
                            deadline: next,
                            interval: entry.interval,
                            periodic: true,
                            callback: Arc::clone(&entry.callback),
                        },
                    );
                }
                due.push(entry);
            }
        }

        let fired = due.len();
        for entry in due {
            let fire_delay = now.saturating_duration_since(entry.deadline);
            if fire_delay > self.fire_delay_warn {
                warn!(
                    timer = entry.id,
                    kind = entry.kind.as_str(),
                    delay_us = fire_delay.as_micros() as u64,
                    "timer fired late"
                );
            } else {
                trace!(
                    timer = entry.id,
                    kind = entry.kind.as_str(),
                    delay_us = fire_delay.as_micros() as u64,
                    "timer fired"
                );
            }

            let started = Instant::now();
            (entry.callback)(entry.id);
            let took = started.elapsed();
            if took > self.callback_warn {
                warn!(
                    timer = entry.id,
                    kind = entry.kind.as_str(),
                    took_us = took.as_micros() as u64,
                    "slow timer callback"
                );
            }
        }
        fired
    }

    /// Run the dispatch loop until `shutdown()`. Sleeps to the next deadline;
    /// `add`/`stop` wake it early.
    pub fn spawn(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let service = Arc::clone(self);
        std::thread::Builder::new()
            .name("timer-service".into())
            .spawn(move || service.run())
            .expect("spawn timer thread")
    }

    fn run(&self) {
        debug!("timer service running");
        while self.running.load(Ordering::Acquire) {
            let next = self.table.lock().queue.keys().next().map(|&(d, _)| d);
            match next {
                Some(deadline) if deadline <= Instant::now() => {
                    self.tick();
                }
                Some(deadline) => {
                    let mut table = self.table.lock();
                    let _ = self.wakeup.wait_until(&mut table, deadline);
                }
                None => {
                    let mut table = self.table.lock();
                    let _ = self.wakeup.wait_for(&mut table, Duration::from_millis(200));
                }
            }
        }
        debug!("timer service stopped");
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.wakeup.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback(hits: &Arc<AtomicUsize>) -> impl Fn(TimerId) + Send + Sync + 'static {
        let hits = Arc::clone(hits);
        move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn one_shot_fires_exactly_once() {
        let timers = TimerService::new();
        let hits = Arc::new(AtomicUsize::new(0));
        timers.add(
            Duration::from_millis(10),
            TimerKind::StrategyScan,
            false,
            counter_callback(&hits),
        );

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(timers.tick(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(timers.tick(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_before_deadline_fires_zero_times() {
        let timers = TimerService::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = timers.add(
            Duration::from_millis(10),
            TimerKind::StrategyScan,
            false,
            counter_callback(&hits),
        );
        timers.stop(id);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(timers.tick(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Stopping again (or an unknown id) is a no-op.
        timers.stop(id);
        timers.stop(9999);
    }

    #[test]
    fn periodic_fires_n_times_and_rearms_from_deadline() {
        let timers = TimerService::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = timers.add(
            Duration::from_millis(10),
            TimerKind::StrategyScan,
            true,
            counter_callback(&hits),
        );

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(12));
            timers.tick();
        }
        assert!(hits.load(Ordering::SeqCst) >= 3);

        // Periodic timers stay stoppable by their original id.
        timers.stop(id);
        let after = hits.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(25));
        timers.tick();
        assert_eq!(hits.load(Ordering::SeqCst), after);
    }

    #[test]
    fn due_timers_fire_in_deadline_order() {
        let timers = TimerService::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for delay in [30u64, 10, 20] {
            let order = Arc::clone(&order);
            timers.add(
                Duration::from_millis(delay),
                TimerKind::StrategyScan,
                false,
                move |_| order.lock().push(delay),
            );
        }

        std::thread::sleep(Duration::from_millis(45));
        assert_eq!(timers.tick(), 3);
        assert_eq!(*order.lock(), vec![10, 20, 30]);
    }

    #[test]
    fn callback_may_stop_its_own_timer() {
        let timers = TimerService::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let service = Arc::clone(&timers);
        let hits_cb = Arc::clone(&hits);
        timers.add(
            Duration::from_millis(5),
            TimerKind::StrategyScan,
            true,
            move |id| {
                hits_cb.fetch_add(1, Ordering::SeqCst);
                service.stop(id);
            },
        );

        std::thread::sleep(Duration::from_millis(10));
        timers.tick();
        std::thread::sleep(Duration::from_millis(10));
        timers.tick();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn ids_increase_monotonically() {
        let timers = TimerService::new();
        let a = timers.add(Duration::from_secs(1), TimerKind::StrategyScan, false, |_| {});
        let b = timers.add(Duration::from_secs(1), TimerKind::StrategyScan, false, |_| {});
        assert!(b > a);
    }
}
