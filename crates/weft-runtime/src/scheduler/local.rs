//! Per-worker queues with a shared overflow queue
//!
//! - Each worker has a bounded local FIFO (SpinLock<VecDeque>)
//! - Tasks without a worker hint, and local overflow, go to a global FIFO
//!   (Mutex + Condvar, which also parks idle workers)
//! - With `ENABLE_STEALING`, a worker with nothing to do takes half of a
//!   random victim's local queue
//!
//! `Priority::Boost` entries jump to the front of the queue they land in;
//! every other priority is FIFO.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use weft_core::{Priority, ScheduleHint, SchedulerMode, SpinLock};

use super::{Queued, Scheduler, SchedulerBase};
use crate::task::TaskRef;

/// Local queue capacity per worker
const LOCAL_CAPACITY: usize = 256;

/// Look at the global queue first every N dequeues so it cannot starve
const GLOBAL_CHECK_INTERVAL: usize = 61;

struct LocalQueue {
    queue: SpinLock<VecDeque<Queued>>,
    len: AtomicUsize,
}

impl LocalQueue {
    fn new() -> Self {
        Self {
            queue: SpinLock::new(VecDeque::with_capacity(LOCAL_CAPACITY)),
            len: AtomicUsize::new(0),
        }
    }

    /// Push to back, or front when `urgent`; hands the entry back when full
    fn push(&self, item: Queued, urgent: bool) -> Result<(), Queued> {
        let mut q = self.queue.lock();
        if q.len() >= LOCAL_CAPACITY {
            return Err(item);
        }
        if urgent {
            q.push_front(item);
        } else {
            q.push_back(item);
        }
        self.len.store(q.len(), Ordering::Release);
        Ok(())
    }

    fn pop(&self) -> Option<Queued> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut q = self.queue.lock();
        let item = q.pop_front();
        self.len.store(q.len(), Ordering::Release);
        item
    }

    /// Take the older half (at least one entry when non-empty)
    fn steal_half(&self) -> Vec<Queued> {
        if self.len.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }
        let mut q = self.queue.lock();
        let n = q.len().div_ceil(2);
        let stolen: Vec<_> = q.drain(..n).collect();
        self.len.store(q.len(), Ordering::Release);
        stolen
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

struct GlobalQueue {
    queue: Mutex<VecDeque<Queued>>,
    cond: Condvar,
    len: AtomicUsize,
    parked: AtomicUsize,
}

impl GlobalQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            len: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Queued>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, item: Queued, urgent: bool) {
        let mut q = self.lock();
        if urgent {
            q.push_front(item);
        } else {
            q.push_back(item);
        }
        self.len.store(q.len(), Ordering::Release);
    }

    fn pop(&self) -> Option<Queued> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut q = self.lock();
        let item = q.pop_front();
        self.len.store(q.len(), Ordering::Release);
        item
    }

    fn pop_batch(&self, max: usize) -> Vec<Queued> {
        if self.len.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }
        let mut q = self.lock();
        let n = q.len().min(max);
        let batch: Vec<_> = q.drain(..n).collect();
        self.len.store(q.len(), Ordering::Release);
        batch
    }

    fn park(&self, timeout: Duration, has_work: impl Fn() -> bool) {
        self.parked.fetch_add(1, Ordering::AcqRel);
        let guard = self.lock();
        if guard.is_empty() && !has_work() {
            let _ = self.cond.wait_timeout(guard, timeout);
        }
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }

    fn wake_one(&self) {
        if self.parked.load(Ordering::Acquire) > 0 {
            // Taking the lock orders us after a parker's emptiness check
            drop(self.lock());
            self.cond.notify_one();
        }
    }

    fn wake_all(&self) {
        drop(self.lock());
        self.cond.notify_all();
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

/// Work-stealing scheduler with per-worker FIFOs
pub struct LocalQueueScheduler {
    base: SchedulerBase,
    local: Vec<LocalQueue>,
    global: GlobalQueue,
    /// Per-worker dequeue counter for the periodic global check
    counters: Vec<AtomicUsize>,
    /// Per-worker LCG state for victim selection
    rng: Vec<AtomicUsize>,
    round_robin: AtomicUsize,
}

impl LocalQueueScheduler {
    pub fn new(num_threads: usize, description: &str, mode: SchedulerMode) -> Self {
        let num_threads = num_threads.max(1);
        Self {
            base: SchedulerBase::new(num_threads, description, mode),
            local: (0..num_threads).map(|_| LocalQueue::new()).collect(),
            global: GlobalQueue::new(),
            counters: (0..num_threads).map(|_| AtomicUsize::new(0)).collect(),
            rng: (0..num_threads)
                .map(|i| AtomicUsize::new(i.wrapping_mul(2654435761) + 1))
                .collect(),
            round_robin: AtomicUsize::new(0),
        }
    }

    fn random_victim(&self, worker: usize) -> usize {
        let num = self.local.len();
        if num <= 1 {
            return 0;
        }
        let rng = &self.rng[worker];
        let old = rng.load(Ordering::Relaxed);
        let new = old.wrapping_mul(1103515245).wrapping_add(12345);
        rng.store(new, Ordering::Relaxed);
        (new >> 16) % num
    }

    fn try_steal(&self, worker: usize) -> Option<Queued> {
        if !self.mode().contains(SchedulerMode::ENABLE_STEALING) {
            return None;
        }
        let num = self.local.len();
        let start = self.random_victim(worker);
        for k in 0..num {
            let victim = (start + k) % num;
            if victim == worker {
                continue;
            }
            let mut stolen = self.local[victim].steal_half().into_iter();
            if let Some(first) = stolen.next() {
                for item in stolen {
                    if let Err(item) = self.local[worker].push(item, false) {
                        self.global.push(item, false);
                    }
                }
                return Some(first);
            }
        }
        None
    }

    fn try_global(&self, worker: usize) -> Option<Queued> {
        let first = self.global.pop()?;
        for item in self.global.pop_batch(LOCAL_CAPACITY / 2) {
            if let Err(item) = self.local[worker].push(item, false) {
                self.global.push(item, false);
            }
        }
        Some(first)
    }

    fn target_worker(&self, hint: ScheduleHint) -> Option<usize> {
        let num = self.local.len();
        match hint {
            ScheduleHint::Worker(w) => Some(w % num),
            ScheduleHint::Numa(_) => None,
            ScheduleHint::None if self.mode().contains(SchedulerMode::ASSIGN_WORK_ROUND_ROBIN) => {
                Some(self.round_robin.fetch_add(1, Ordering::Relaxed) % num)
            }
            ScheduleHint::None => None,
        }
    }
}

impl Scheduler for LocalQueueScheduler {
    fn enqueue(&self, task: TaskRef, priority: Priority, hint: ScheduleHint) {
        let urgent = priority == Priority::Boost;
        let item = Queued { task, since: self.base.stamp() };
        let item = match self.target_worker(hint) {
            Some(w) => self.local[w].push(item, urgent).err(),
            None => Some(item),
        };
        if let Some(item) = item {
            self.global.push(item, urgent);
        }
        self.global.wake_one();
    }

    fn dequeue(&self, worker: usize) -> Option<TaskRef> {
        if worker >= self.local.len() {
            return None;
        }

        let cnt = self.counters[worker].fetch_add(1, Ordering::Relaxed);
        let periodic = if cnt % GLOBAL_CHECK_INTERVAL == 0 { self.global.pop() } else { None };

        let steal_first = !self.mode().contains(SchedulerMode::STEAL_AFTER_LOCAL);
        let found = periodic
            .or_else(|| self.local[worker].pop())
            .or_else(|| if steal_first { self.try_steal(worker) } else { None })
            .or_else(|| self.try_global(worker))
            .or_else(|| if steal_first { None } else { self.try_steal(worker) });

        found.map(|item| self.base.dequeued(item))
    }

    fn len(&self) -> usize {
        self.global.len() + self.local.iter().map(LocalQueue::len).sum::<usize>()
    }

    fn park(&self, _worker: usize, timeout: Duration) {
        self.global.park(timeout, || self.local.iter().any(|q| q.len() > 0));
    }

    fn wake(&self) {
        self.global.wake_one();
    }

    fn wake_all(&self) {
        self.global.wake_all();
    }

    fn base(&self) -> &SchedulerBase {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::task;
    use std::sync::Arc;
    use std::time::Instant;

    fn ids(sched: &LocalQueueScheduler, worker: usize, n: usize) -> Vec<u32> {
        (0..n).filter_map(|_| sched.dequeue(worker)).map(|t| t.id().slot()).collect()
    }

    #[test]
    fn test_local_queue_fifo() {
        let lq = LocalQueue::new();
        assert_eq!(lq.len(), 0);
        assert!(lq.push(Queued { task: task(1), since: None }, false).is_ok());
        assert!(lq.push(Queued { task: task(2), since: None }, false).is_ok());
        assert_eq!(lq.len(), 2);
        assert_eq!(lq.pop().map(|q| q.task.id().slot()), Some(1));
        assert_eq!(lq.pop().map(|q| q.task.id().slot()), Some(2));
        assert!(lq.pop().is_none());
    }

    #[test]
    fn test_global_fifo() {
        let sched = LocalQueueScheduler::new(2, "g", SchedulerMode::NOTHING_SPECIAL);
        for i in 0..5 {
            sched.enqueue(task(i), Priority::Normal, ScheduleHint::None);
        }
        assert_eq!(sched.len(), 5);
        assert_eq!(ids(&sched, 0, 6), vec![0, 1, 2, 3, 4]);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_boost_jumps_the_queue() {
        let sched = LocalQueueScheduler::new(2, "b", SchedulerMode::NOTHING_SPECIAL);
        for i in 0..3 {
            sched.enqueue(task(i), Priority::Normal, ScheduleHint::None);
        }
        sched.enqueue(task(9), Priority::Boost, ScheduleHint::None);
        sched.enqueue(task(8), Priority::High, ScheduleHint::None);
        assert_eq!(ids(&sched, 0, 5), vec![9, 0, 1, 2, 8]);

        sched.enqueue(task(20), Priority::Normal, ScheduleHint::Worker(1));
        sched.enqueue(task(21), Priority::Normal, ScheduleHint::Worker(1));
        sched.enqueue(task(29), Priority::Boost, ScheduleHint::Worker(1));
        assert_eq!(ids(&sched, 1, 3), vec![29, 20, 21]);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_worker_hint() {
        let sched = LocalQueueScheduler::new(2, "h", SchedulerMode::NOTHING_SPECIAL);
        sched.enqueue(task(10), Priority::Normal, ScheduleHint::Worker(0));
        sched.enqueue(task(20), Priority::Normal, ScheduleHint::Worker(1));
        // Skip the periodic global probe
        assert_eq!(ids(&sched, 1, 1), vec![20]);
        assert_eq!(ids(&sched, 0, 1), vec![10]);
    }

    #[test]
    fn test_stealing_gated_by_mode() {
        let sched = LocalQueueScheduler::new(2, "s", SchedulerMode::NOTHING_SPECIAL);
        for i in 0..10 {
            sched.enqueue(task(i), Priority::Normal, ScheduleHint::Worker(0));
        }
        assert!(sched.dequeue(1).is_none());

        sched.add_mode(SchedulerMode::ENABLE_STEALING);
        let stolen = sched.dequeue(1).unwrap();
        assert_eq!(stolen.id().slot(), 0);
        // Half moved over to worker 1
        assert_eq!(sched.local[1].len(), 4);
        assert_eq!(sched.len(), 9);
    }

    #[test]
    fn test_round_robin_placement() {
        let sched = LocalQueueScheduler::new(3, "rr", SchedulerMode::ASSIGN_WORK_ROUND_ROBIN);
        for i in 0..6 {
            sched.enqueue(task(i), Priority::Normal, ScheduleHint::None);
        }
        assert_eq!(sched.global.len(), 0);
        for w in 0..3 {
            assert_eq!(sched.local[w].len(), 2);
        }
    }

    #[test]
    fn test_local_overflow_spills_to_global() {
        let sched = LocalQueueScheduler::new(1, "o", SchedulerMode::NOTHING_SPECIAL);
        for i in 0..(LOCAL_CAPACITY as u32 + 3) {
            sched.enqueue(task(i), Priority::Normal, ScheduleHint::Worker(0));
        }
        assert_eq!(sched.local[0].len(), LOCAL_CAPACITY);
        assert_eq!(sched.global.len(), 3);
    }

    #[test]
    fn test_park_times_out_and_wakes() {
        let sched = Arc::new(LocalQueueScheduler::new(1, "p", SchedulerMode::NOTHING_SPECIAL));
        let start = Instant::now();
        sched.park(0, Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));

        let s = Arc::clone(&sched);
        let parker = std::thread::spawn(move || {
            let start = Instant::now();
            while s.is_empty() {
                s.park(0, Duration::from_secs(5));
            }
            start.elapsed()
        });
        std::thread::sleep(Duration::from_millis(20));
        sched.enqueue(task(1), Priority::Normal, ScheduleHint::None);
        assert!(parker.join().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn test_queue_wait_times() {
        weft_core::diagnostics::set_maintain_queue_wait_times_enabled(true);
        let sched = LocalQueueScheduler::new(1, "w", SchedulerMode::NOTHING_SPECIAL);
        sched.enqueue(task(1), Priority::Normal, ScheduleHint::None);
        std::thread::sleep(Duration::from_millis(2));
        sched.dequeue(0).unwrap();
        let stats = sched.queue_wait_stats();
        assert_eq!(stats.count, 1);
        assert!(stats.max >= Duration::from_millis(2));
        assert_eq!(stats.total, stats.max);
    }
}
