//! One lock-free FIFO per priority class
//!
//! Dequeue serves `Boost`, then `High`, `Normal`, `Low`. Worker hints are
//! ignored; any worker takes any task. Strict priority, no aging: a class
//! is only served while every higher class is empty.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use weft_core::{Priority, ScheduleHint, SchedulerMode};

use super::{Queued, Scheduler, SchedulerBase};
use crate::task::TaskRef;

pub struct StaticPriorityScheduler {
    base: SchedulerBase,
    queues: [SegQueue<Queued>; Priority::COUNT],
    parked: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StaticPriorityScheduler {
    pub fn new(num_threads: usize, description: &str, mode: SchedulerMode) -> Self {
        Self {
            base: SchedulerBase::new(num_threads.max(1), description, mode),
            queues: std::array::from_fn(|_| SegQueue::new()),
            parked: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Queued tasks of one class
    pub fn len_of(&self, priority: Priority) -> usize {
        self.queues[priority.as_index()].len()
    }
}

impl Scheduler for StaticPriorityScheduler {
    fn enqueue(&self, task: TaskRef, priority: Priority, _hint: ScheduleHint) {
        self.queues[priority.as_index()].push(Queued { task, since: self.base.stamp() });
        self.wake();
    }

    fn dequeue(&self, _worker: usize) -> Option<TaskRef> {
        self.queues
            .iter()
            .find_map(SegQueue::pop)
            .map(|item| self.base.dequeued(item))
    }

    fn len(&self) -> usize {
        self.queues.iter().map(SegQueue::len).sum()
    }

    fn park(&self, _worker: usize, timeout: Duration) {
        self.parked.fetch_add(1, Ordering::AcqRel);
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_empty() {
            let _ = self.cond.wait_timeout(guard, timeout);
        }
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }

    fn wake(&self) {
        if self.parked.load(Ordering::Acquire) > 0 {
            drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
            self.cond.notify_one();
        }
    }

    fn wake_all(&self) {
        drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
        self.cond.notify_all();
    }

    fn base(&self) -> &SchedulerBase {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::task;

    #[test]
    fn test_highest_class_first_fifo_within() {
        let sched = StaticPriorityScheduler::new(2, "prio", SchedulerMode::NOTHING_SPECIAL);
        sched.enqueue(task(1), Priority::Low, ScheduleHint::None);
        sched.enqueue(task(2), Priority::Normal, ScheduleHint::None);
        sched.enqueue(task(3), Priority::Normal, ScheduleHint::None);
        sched.enqueue(task(4), Priority::Boost, ScheduleHint::Worker(1));
        sched.enqueue(task(5), Priority::High, ScheduleHint::None);
        assert_eq!(sched.len(), 5);
        assert_eq!(sched.len_of(Priority::Normal), 2);

        let order: Vec<u32> = std::iter::from_fn(|| sched.dequeue(0)).map(|t| t.id().slot()).collect();
        assert_eq!(order, vec![4, 5, 2, 3, 1]);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let sched = std::sync::Arc::new(StaticPriorityScheduler::new(4, "mt", SchedulerMode::NOTHING_SPECIAL));
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let s = std::sync::Arc::clone(&sched);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let prio = Priority::from_index((i % 4) as usize).unwrap();
                        s.enqueue(task(p * 100 + i), prio, ScheduleHint::None);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        let mut seen: Vec<u32> = std::iter::from_fn(|| sched.dequeue(0)).map(|t| t.id().slot()).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 200);
    }
}
