//! Scheduler abstraction
//!
//! A scheduler owns the ready queues of one pool and the parking of its
//! idle workers. Nothing else: tasks are run and their states changed by the
//! pool and the thread manager.
//!
//! # Implementations
//! - [`LocalQueueScheduler`] - per-worker FIFOs, shared overflow, stealing
//! - [`StaticPriorityScheduler`] - one lock-free FIFO per priority class
//!
//! Two optional instrumentations live in [`SchedulerBase`], compiled in by
//! the `deadlock-detection` and `queue-waittime` features and switched on
//! at runtime through [`weft_core::diagnostics`].

mod local;
mod static_priority;

pub use local::LocalQueueScheduler;
pub use static_priority::StaticPriorityScheduler;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft_core::{diagnostics, kerror, Priority, ScheduleHint, SchedulerMode};

use crate::task::TaskRef;

/// Queue discipline behind a pool
pub trait Scheduler: Send + Sync {
    /// Make a task runnable
    fn enqueue(&self, task: TaskRef, priority: Priority, hint: ScheduleHint);

    /// Next task for `worker`, or `None` when nothing is runnable
    fn dequeue(&self, worker: usize) -> Option<TaskRef>;

    /// Approximate number of queued tasks
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block `worker` until work may be available or `timeout` passes
    fn park(&self, worker: usize, timeout: Duration);

    /// Wake one parked worker
    fn wake(&self);

    /// Wake every parked worker
    fn wake_all(&self);

    /// Shared counters and settings
    fn base(&self) -> &SchedulerBase;

    fn num_threads(&self) -> usize {
        self.base().num_threads()
    }

    fn description(&self) -> &str {
        self.base().description()
    }

    fn mode(&self) -> SchedulerMode {
        self.base().mode()
    }

    fn set_mode(&self, mode: SchedulerMode) {
        self.base().set_mode(mode);
    }

    fn add_mode(&self, mode: SchedulerMode) {
        self.base().set_mode(self.mode() | mode);
    }

    fn remove_mode(&self, mode: SchedulerMode) {
        self.base().set_mode(self.mode().without(mode));
    }

    fn queue_wait_stats(&self) -> QueueWaitStats {
        self.base().queue_wait_stats()
    }

    /// Report a queue that has not been drained for longer than the
    /// deadlock threshold; may abort the process
    fn check_deadlock(&self) -> bool {
        self.base().check_stall(self.len())
    }
}

/// Builds a scheduler for `num_threads` workers
pub type SchedulerFactory = Arc<dyn Fn(usize, &str, SchedulerMode) -> Arc<dyn Scheduler> + Send + Sync>;

/// Which scheduler a pool gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchedulingPolicy {
    /// Whatever the runtime configuration names
    Unspecified,
    #[default]
    Local,
    StaticPriority,
    /// Built by a caller-provided [`SchedulerFactory`]
    UserDefined,
}

impl SchedulingPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            SchedulingPolicy::Unspecified => "unspecified",
            SchedulingPolicy::Local => "local",
            SchedulingPolicy::StaticPriority => "static-priority",
            SchedulingPolicy::UserDefined => "user-defined",
        }
    }

    /// Factory for a built-in policy
    pub fn factory(self) -> Option<SchedulerFactory> {
        match self {
            SchedulingPolicy::Local => Some(Arc::new(|n, desc: &str, mode| {
                Arc::new(LocalQueueScheduler::new(n, desc, mode)) as Arc<dyn Scheduler>
            })),
            SchedulingPolicy::StaticPriority => Some(Arc::new(|n, desc: &str, mode| {
                Arc::new(StaticPriorityScheduler::new(n, desc, mode)) as Arc<dyn Scheduler>
            })),
            SchedulingPolicy::Unspecified | SchedulingPolicy::UserDefined => None,
        }
    }
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unspecified" => Ok(SchedulingPolicy::Unspecified),
            "local" => Ok(SchedulingPolicy::Local),
            "static-priority" | "static_priority" => Ok(SchedulingPolicy::StaticPriority),
            "user-defined" => Ok(SchedulingPolicy::UserDefined),
            other => Err(format!("unknown scheduling policy {:?}", other)),
        }
    }
}

/// Enqueue-to-dequeue latency summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueWaitStats {
    /// Dequeues measured
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl QueueWaitStats {
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// A queued task plus when it was queued (if wait times are tracked)
pub(crate) struct Queued {
    pub task: TaskRef,
    pub since: Option<Instant>,
}

/// State every scheduler carries
pub struct SchedulerBase {
    description: String,
    num_threads: usize,
    mode: AtomicU32,
    epoch: Instant,
    /// Nanoseconds since `epoch` of the last dequeue
    last_progress: AtomicU64,
    wait_count: AtomicU64,
    wait_total_ns: AtomicU64,
    wait_max_ns: AtomicU64,
}

impl SchedulerBase {
    pub fn new(num_threads: usize, description: &str, mode: SchedulerMode) -> Self {
        Self {
            description: description.to_owned(),
            num_threads,
            mode: AtomicU32::new(mode.bits()),
            epoch: Instant::now(),
            last_progress: AtomicU64::new(0),
            wait_count: AtomicU64::new(0),
            wait_total_ns: AtomicU64::new(0),
            wait_max_ns: AtomicU64::new(0),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn mode(&self) -> SchedulerMode {
        SchedulerMode::from_bits_truncate(self.mode.load(Ordering::Relaxed))
    }

    pub fn set_mode(&self, mode: SchedulerMode) {
        self.mode.store(mode.bits(), Ordering::Relaxed);
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Timestamp for a task being queued, when tracking is on
    pub(crate) fn stamp(&self) -> Option<Instant> {
        (cfg!(feature = "queue-waittime") && diagnostics::maintain_queue_wait_times_enabled())
            .then(Instant::now)
    }

    /// Account for a task leaving the queue
    pub(crate) fn dequeued(&self, queued: Queued) -> TaskRef {
        if cfg!(feature = "deadlock-detection") {
            self.last_progress.store(self.now_ns(), Ordering::Relaxed);
        }
        if let Some(since) = queued.since {
            let waited = since.elapsed().as_nanos() as u64;
            self.wait_count.fetch_add(1, Ordering::Relaxed);
            self.wait_total_ns.fetch_add(waited, Ordering::Relaxed);
            self.wait_max_ns.fetch_max(waited, Ordering::Relaxed);
        }
        queued.task
    }

    pub fn queue_wait_stats(&self) -> QueueWaitStats {
        QueueWaitStats {
            count: self.wait_count.load(Ordering::Relaxed),
            total: Duration::from_nanos(self.wait_total_ns.load(Ordering::Relaxed)),
            max: Duration::from_nanos(self.wait_max_ns.load(Ordering::Relaxed)),
        }
    }

    /// `queued` tasks have been waiting since the last dequeue; past the
    /// threshold that is logged and, if configured, fatal
    pub fn check_stall(&self, queued: usize) -> bool {
        if !cfg!(feature = "deadlock-detection") || !diagnostics::deadlock_detection_enabled() || queued == 0 {
            return false;
        }
        let now = self.now_ns();
        let last = self.last_progress.load(Ordering::Relaxed);
        let stalled = Duration::from_nanos(now.saturating_sub(last));
        if stalled < diagnostics::deadlock_threshold() {
            return false;
        }
        kerror!(
            "scheduler '{}': {} task(s) queued, nothing dequeued for {:?} (possible deadlock)",
            self.description,
            queued,
            stalled
        );
        if diagnostics::deadlock_abort() {
            std::process::abort();
        }
        // Report once per threshold period
        self.last_progress.store(now, Ordering::Relaxed);
        true
    }
}

impl fmt::Debug for SchedulerBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBase")
            .field("description", &self.description)
            .field("num_threads", &self.num_threads)
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::coroutine::Coroutine;
    use crate::task::TaskControlBlock;
    use weft_core::TaskId;

    /// A never-run task for queue tests
    pub(crate) fn task(id: u32) -> TaskRef {
        let co = Coroutine::create(|_| {}, 16 * 4096).unwrap();
        Arc::new(TaskControlBlock::new(TaskId::new(id), 0, co, Priority::Normal, ScheduleHint::None, None))
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("local".parse::<SchedulingPolicy>(), Ok(SchedulingPolicy::Local));
        assert_eq!("static-priority".parse::<SchedulingPolicy>(), Ok(SchedulingPolicy::StaticPriority));
        assert!("fifo".parse::<SchedulingPolicy>().is_err());
        assert_eq!(SchedulingPolicy::StaticPriority.to_string(), "static-priority");
        assert!(SchedulingPolicy::Unspecified.factory().is_none());
    }

    #[test]
    fn test_factories_build_named_schedulers() {
        for policy in [SchedulingPolicy::Local, SchedulingPolicy::StaticPriority] {
            let make = policy.factory().unwrap();
            let sched = make(3, "pool", SchedulerMode::DEFAULT_MODE);
            assert_eq!(sched.num_threads(), 3);
            assert_eq!(sched.description(), "pool");
            assert!(sched.is_empty());
        }
    }

    #[test]
    fn test_mode_changes() {
        let sched = LocalQueueScheduler::new(1, "m", SchedulerMode::NOTHING_SPECIAL);
        sched.add_mode(SchedulerMode::ENABLE_STEALING | SchedulerMode::STEAL_AFTER_LOCAL);
        assert!(sched.mode().contains(SchedulerMode::ENABLE_STEALING));
        sched.remove_mode(SchedulerMode::ENABLE_STEALING);
        assert_eq!(sched.mode(), SchedulerMode::STEAL_AFTER_LOCAL);
        sched.set_mode(SchedulerMode::NOTHING_SPECIAL);
        assert!(sched.mode().is_empty());
    }

    #[test]
    fn test_wait_stats_average() {
        let stats = QueueWaitStats {
            count: 4,
            total: Duration::from_micros(40),
            max: Duration::from_micros(20),
        };
        assert_eq!(stats.average(), Duration::from_micros(10));
        assert_eq!(QueueWaitStats::default().average(), Duration::ZERO);
    }

    #[test]
    fn test_stall_check_off_by_default() {
        let base = SchedulerBase::new(1, "s", SchedulerMode::NOTHING_SPECIAL);
        assert!(!base.check_stall(10));
    }
}
