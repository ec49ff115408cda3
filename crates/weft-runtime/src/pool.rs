//! Thread pools
//!
//! A pool owns `N` OS worker threads, one scheduler and a stack pool. Each
//! worker binds itself to its affinity mask and loops: dequeue a task,
//! resume its coroutine, then act on how the coroutine came back (yield,
//! suspend, terminate, return) until the pool stops.
//!
//! Lifecycle: `Created -> run() -> Running <-> Suspended -> stop() ->
//! Stopping -> Stopped`. `stop()` drains the queues and joins; `abort()`
//! joins after the current tasks and hands the still-queued tasks back.
//! Once the last queued task is gone the pool refuses new work, so a task
//! is never queued on a pool no worker will drain.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use weft_core::activity::{decrement_global_activity_count, increment_global_activity_count};
use weft_core::error::{RuntimeError, RuntimeResult, WorkerError};
use weft_core::{
    kdebug, kerror, kprint, kwarn, Backoff, Mask, Priority, ScheduleHint, ScheduleState, SchedulerMode,
    SpinLock, SwitchHint, TaskId,
};

use crate::affinity::AffinityData;
use crate::coroutine::{coroutine_self, Coroutine, CoroutineFn, CoroutineState};
use crate::memory::StackPool;
use crate::notifier::{panic_message, CallbackNotifier};
use crate::scheduler::{Scheduler, SchedulerFactory};
use crate::task::{SwitchRequest, TaskRef, TaskTable};
use crate::topology;

/// Everything a pool is built from, produced by the partitioner
#[derive(Clone)]
pub struct PoolInitParameters {
    pub index: usize,
    pub name: String,
    /// Global index of this pool's first worker
    pub thread_offset: usize,
    pub num_threads: usize,
    /// Masks of all workers; this pool uses `thread_offset..thread_offset + num_threads`
    pub affinity: Arc<AffinityData>,
    pub notifier: CallbackNotifier,
    pub scheduler: SchedulerFactory,
    pub mode: SchedulerMode,
    pub stack_size: usize,
    pub stack_pool_limit: usize,
    pub idle_spins: u32,
    pub park_timeout: Duration,
}

impl fmt::Debug for PoolInitParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolInitParameters")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("thread_offset", &self.thread_offset)
            .field("num_threads", &self.num_threads)
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Created = 0,
    Running = 1,
    Suspended = 2,
    Stopping = 3,
    Stopped = 4,
}

impl From<u8> for PoolState {
    fn from(v: u8) -> Self {
        match v {
            0 => PoolState::Created,
            1 => PoolState::Running,
            2 => PoolState::Suspended,
            3 => PoolState::Stopping,
            _ => PoolState::Stopped,
        }
    }
}

/// Per-worker counters
#[derive(Debug)]
pub struct WorkerState {
    current: AtomicU64,
    executed: AtomicU64,
    parked: AtomicBool,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            current: AtomicU64::new(TaskId::NONE.as_u64()),
            executed: AtomicU64::new(0),
            parked: AtomicBool::new(false),
        }
    }

    /// Task being executed right now
    pub fn current_task(&self) -> Option<TaskId> {
        TaskId::from_raw(self.current.load(Ordering::Relaxed)).to_option()
    }

    /// Resumptions performed by this worker
    pub fn tasks_executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn is_parked(&self) -> bool {
        self.parked.load(Ordering::Relaxed)
    }
}

struct PoolShared {
    index: usize,
    name: String,
    /// Copy of `name` for log line prefixes; pool names live for the process
    log_name: &'static str,
    thread_offset: usize,
    affinity: Arc<AffinityData>,
    /// NUMA node of each worker's primary PU
    worker_nodes: Vec<Option<usize>>,
    scheduler: Arc<dyn Scheduler>,
    notifier: CallbackNotifier,
    state: AtomicU8,
    abort: AtomicBool,
    /// Cleared once no worker will dequeue again
    accepting: SpinLock<bool>,
    workers: Vec<WorkerState>,
    /// Workers inside a task right now
    busy: AtomicUsize,
    started: AtomicUsize,
    numa_rr: AtomicUsize,
    stacks: StackPool,
    tasks: Arc<TaskTable>,
    idle_spins: u32,
    park_timeout: Duration,
}

/// A set of workers sharing one scheduler
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    handles: SpinLock<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Build the pool; no thread is started before [`run`](Self::run)
    pub fn new(params: PoolInitParameters, tasks: Arc<TaskTable>) -> ThreadPool {
        let num_threads = params.num_threads.max(1);
        let description = format!("{}#{}", params.name, params.index);
        let scheduler = (params.scheduler)(num_threads, &description, params.mode);

        let topo = topology::try_get_topology().ok();
        let worker_nodes = (0..num_threads)
            .map(|local| {
                let pu = params.affinity.pu_num(params.thread_offset + local)?;
                topo.as_ref()?.numa_node_of_pu(pu)
            })
            .collect();

        let shared = Arc::new(PoolShared {
            index: params.index,
            log_name: Box::leak(params.name.clone().into_boxed_str()),
            name: params.name,
            thread_offset: params.thread_offset,
            affinity: params.affinity,
            worker_nodes,
            scheduler,
            notifier: params.notifier,
            state: AtomicU8::new(PoolState::Created as u8),
            abort: AtomicBool::new(false),
            accepting: SpinLock::new(true),
            workers: (0..num_threads).map(|_| WorkerState::new()).collect(),
            busy: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            numa_rr: AtomicUsize::new(0),
            stacks: StackPool::new(params.stack_size, params.stack_pool_limit),
            tasks,
            idle_spins: params.idle_spins,
            park_timeout: params.park_timeout,
        });
        ThreadPool { shared, handles: SpinLock::new(Vec::new()) }
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn num_threads(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn thread_offset(&self) -> usize {
        self.shared.thread_offset
    }

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.shared.scheduler
    }

    /// Affinity mask of local worker `local`
    pub fn mask(&self, local: usize) -> Mask {
        self.shared.affinity.mask(self.shared.thread_offset + local)
    }

    pub fn worker_state(&self, local: usize) -> Option<&WorkerState> {
        self.shared.workers.get(local)
    }

    /// Resumptions across all workers
    pub fn tasks_executed(&self) -> u64 {
        self.shared.workers.iter().map(WorkerState::tasks_executed).sum()
    }

    /// Queued tasks
    pub fn queue_len(&self) -> usize {
        self.shared.scheduler.len()
    }

    /// Start the workers and wait until every one of them is up
    pub fn run(&self) -> RuntimeResult<()> {
        self.shared.transition(PoolState::Created, PoolState::Running)?;
        let mut handles = self.handles.lock();
        for local in 0..self.num_threads() {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("weft-{}-{}", self.shared.name, local))
                .spawn(move || worker_main(shared, local));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    kerror!("pool '{}': spawning worker {} failed: {}", self.shared.name, local, e);
                    self.shared.abort.store(true, Ordering::SeqCst);
                    self.shared.scheduler.wake_all();
                    for handle in handles.drain(..) {
                        let _ = handle.join();
                    }
                    self.shared.set_state(PoolState::Stopped);
                    return Err(WorkerError::SpawnFailed.into());
                }
            }
        }
        drop(handles);

        let mut backoff = Backoff::with_max_sleep(Duration::from_millis(1));
        while self.shared.started.load(Ordering::Acquire) < self.num_threads() {
            backoff.snooze();
        }
        kdebug!("pool '{}' running {} worker(s)", self.shared.name, self.num_threads());
        Ok(())
    }

    /// Pause dequeueing; running tasks finish their current slice
    pub fn suspend(&self) -> RuntimeResult<()> {
        self.shared.transition(PoolState::Running, PoolState::Suspended)
    }

    pub fn resume(&self) -> RuntimeResult<()> {
        self.shared.transition(PoolState::Suspended, PoolState::Running)?;
        self.shared.scheduler.wake_all();
        Ok(())
    }

    /// Run until the queues are empty, then join every worker
    ///
    /// Suspended tasks are not waited for.
    pub fn stop(&self) {
        match self.state() {
            PoolState::Created => {
                self.shared.close();
                self.shared.set_state(PoolState::Stopped);
                return;
            }
            PoolState::Stopped => return,
            _ => {}
        }
        self.shared.set_state(PoolState::Stopping);
        self.shared.scheduler.wake_all();
        self.join();
        self.shared.stacks.clear();
        self.shared.set_state(PoolState::Stopped);
        kdebug!("pool '{}' stopped", self.shared.name);
    }

    /// Stop after the tasks currently executing; returns what is still queued
    pub fn abort(&self) -> Vec<TaskRef> {
        self.shared.abort.store(true, Ordering::SeqCst);
        self.shared.set_state(PoolState::Stopping);
        self.shared.scheduler.wake_all();
        self.join();
        self.shared.close();
        self.shared.set_state(PoolState::Stopped);

        let leftover: Vec<TaskRef> = std::iter::from_fn(|| self.shared.scheduler.dequeue(0))
            .filter(|t| !t.state().is_terminated())
            .collect();
        if !leftover.is_empty() {
            kwarn!("pool '{}' aborted with {} queued task(s)", self.shared.name, leftover.len());
        }
        self.shared.stacks.clear();
        leftover
    }

    fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                kerror!("pool '{}': a worker thread panicked", self.shared.name);
            }
        }
    }

    /// Queue a task on this pool
    ///
    /// Fails with `InvalidStatus` once the pool has stopped taking work; the
    /// task is not queued then.
    pub fn schedule(&self, task: TaskRef, priority: Priority, hint: ScheduleHint) -> RuntimeResult<()> {
        if self.shared.schedule(task, priority, hint) {
            Ok(())
        } else {
            Err(RuntimeError::InvalidStatus)
        }
    }

    /// Whether [`schedule`](Self::schedule) still queues tasks
    pub fn is_accepting(&self) -> bool {
        *self.shared.accepting.lock()
    }

    /// Coroutine on a recycled stack
    pub(crate) fn new_coroutine(&self, entry: CoroutineFn) -> RuntimeResult<Coroutine> {
        Ok(Coroutine::with_stack(entry, self.shared.stacks.get()?))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if matches!(self.state(), PoolState::Running | PoolState::Suspended | PoolState::Stopping) {
            kwarn!("pool '{}' dropped while running, aborting", self.shared.name);
            self.abort();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("index", &self.index())
            .field("name", &self.name())
            .field("num_threads", &self.num_threads())
            .field("state", &self.state())
            .finish()
    }
}

impl PoolShared {
    fn state(&self) -> PoolState {
        PoolState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PoolState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: PoolState, to: PoolState) -> RuntimeResult<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| RuntimeError::InvalidStatus)
    }

    /// Queue `task` unless the pool is closed; returns whether it was queued
    fn schedule(&self, task: TaskRef, priority: Priority, hint: ScheduleHint) -> bool {
        let hint = self.resolve_hint(hint);
        {
            let accepting = self.accepting.lock();
            if !*accepting {
                return false;
            }
            self.scheduler.enqueue(task, priority, hint);
        }
        self.notifier.on_task_added(&self.name);
        true
    }

    fn close(&self) {
        *self.accepting.lock() = false;
    }

    /// Turn NUMA and parent-worker placement into a concrete worker
    fn resolve_hint(&self, hint: ScheduleHint) -> ScheduleHint {
        match hint {
            ScheduleHint::None if self.scheduler.mode().contains(SchedulerMode::ASSIGN_WORK_THREAD_PARENT) => {
                match current_worker_of(self) {
                    Some(local) => ScheduleHint::Worker(local),
                    None => hint,
                }
            }
            ScheduleHint::Numa(node) => {
                let on_node: Vec<usize> = self
                    .worker_nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| **n == Some(node))
                    .map(|(w, _)| w)
                    .collect();
                if on_node.is_empty() {
                    ScheduleHint::None
                } else {
                    let pick = self.numa_rr.fetch_add(1, Ordering::Relaxed) % on_node.len();
                    ScheduleHint::Worker(on_node[pick])
                }
            }
            other => other,
        }
    }

    fn should_exit(&self) -> bool {
        if self.abort.load(Ordering::SeqCst) {
            return true;
        }
        if self.state() != PoolState::Stopping {
            return false;
        }
        // Decided under the gate so no enqueue slips in behind the check
        let mut accepting = self.accepting.lock();
        if !*accepting {
            return true;
        }
        // Queue first: a worker holding a dequeued task stays busy until its
        // requeue, which waits on the gate
        let drained = self.scheduler.is_empty() && self.busy.load(Ordering::SeqCst) == 0;
        if drained {
            *accepting = false;
        }
        drained
    }
}

// ============================================================================
// Worker loop
// ============================================================================

fn worker_main(shared: Arc<PoolShared>, local: usize) {
    let global = shared.thread_offset + local;
    set_current_worker(Some(WorkerSlot { pool: Arc::as_ptr(&shared) as usize, local, global }));
    kprint::set_worker_context(shared.log_name, local);

    let mask = shared.affinity.mask(global);
    if mask.is_empty() {
        kdebug!("worker {} running unbound", global);
    } else if let Err(e) = topology::bind_current_thread(&mask) {
        kwarn!("worker {} could not bind to PUs {}: {}; running unbound", global, mask, e);
    }
    shared.notifier.on_start_thread(local, global, &shared.name, "");
    shared.started.fetch_add(1, Ordering::AcqRel);

    let ws = &shared.workers[local];
    let mut idle = 0u32;
    loop {
        if shared.should_exit() {
            break;
        }
        if shared.state() == PoolState::Suspended {
            park(&shared, ws, local);
            continue;
        }

        shared.busy.fetch_add(1, Ordering::SeqCst);
        let outcome = shared.scheduler.dequeue(local).map(|task| run_task(&shared, ws, global, task));
        shared.busy.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Some(true) => {
                idle = 0;
                continue;
            }
            Some(false) => {
                kerror!("worker {} stopping after task failure", global);
                break;
            }
            None => {}
        }

        if idle < shared.idle_spins {
            idle += 1;
            std::hint::spin_loop();
            continue;
        }
        shared.notifier.on_worker_idle(local, global);
        shared.scheduler.check_deadlock();
        park(&shared, ws, local);
    }

    shared.notifier.on_stop_thread(local, global, &shared.name, "");
    kprint::clear_worker_context();
    set_current_worker(None);
}

fn park(shared: &PoolShared, ws: &WorkerState, local: usize) {
    ws.parked.store(true, Ordering::Relaxed);
    shared.scheduler.park(local, shared.park_timeout);
    ws.parked.store(false, Ordering::Relaxed);
}

/// Resume one task and act on how it came back; false stops the worker
fn run_task(shared: &PoolShared, ws: &WorkerState, global: usize, task: TaskRef) -> bool {
    loop {
        match task.state() {
            s @ (ScheduleState::Pending | ScheduleState::PendingBoost) => {
                if task.cas_state(s, ScheduleState::Active).is_ok() {
                    break;
                }
            }
            // Made active directly through set_thread_state
            ScheduleState::Active => break,
            // Terminated while queued
            ScheduleState::Suspended | ScheduleState::Terminated => return true,
        }
    }

    task.claim();
    let Some(mut co) = task.take_coroutine() else {
        task.unclaim();
        return true;
    };

    ws.current.store(task.id().as_u64(), Ordering::Relaxed);
    set_current_task(Some(Arc::clone(&task)));
    kprint::set_task_context(task.id().slot());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| co.resume_with(SwitchHint::Invoke)));

    kprint::clear_task_context();
    set_current_task(None);
    ws.current.store(TaskId::NONE.as_u64(), Ordering::Relaxed);
    ws.executed.fetch_add(1, Ordering::Relaxed);

    match outcome {
        Err(payload) if payload.is::<TaskExit>() => {
            terminate(shared, &task, co);
            true
        }
        Err(payload) => {
            kerror!("task {} ({}) panicked: {}", task.id(), task.description(), panic_message(&*payload));
            let keep_going = shared.notifier.on_error(global, &*payload);
            terminate(shared, &task, co);
            keep_going
        }
        Ok(CoroutineState::Complete) => {
            terminate(shared, &task, co);
            true
        }
        Ok(_) => {
            match task.take_request() {
                SwitchRequest::Suspend => {
                    task.put_coroutine(co);
                    suspend(shared, &task);
                }
                request @ (SwitchRequest::None | SwitchRequest::Yield | SwitchRequest::YieldBoost) => {
                    task.put_coroutine(co);
                    requeue(shared, &task, request == SwitchRequest::YieldBoost);
                }
            }
            true
        }
    }
}

fn terminate(shared: &PoolShared, task: &TaskRef, co: Coroutine) {
    if let Err(actual) = task.cas_state(ScheduleState::Active, ScheduleState::Terminated) {
        kerror!("task {} left Active behind the worker's back (found {})", task.id(), actual);
    }
    task.unclaim();
    if let Some(stack) = co.into_stack() {
        shared.stacks.put(stack);
    }
    shared.tasks.remove(task);
    decrement_global_activity_count();
}

fn requeue(shared: &PoolShared, task: &TaskRef, boost: bool) {
    task.unclaim();
    let boost = task.take_boost() || boost;
    let (state, priority) = if boost {
        (ScheduleState::PendingBoost, Priority::Boost)
    } else {
        (ScheduleState::Pending, task.priority())
    };
    if task.cas_state(ScheduleState::Active, state).is_ok() {
        reschedule(shared, task, priority);
    }
}

fn suspend(shared: &PoolShared, task: &TaskRef) {
    task.unclaim();
    // A wake-up that arrived while the task was still running
    if task.take_boost() {
        if task.cas_state(ScheduleState::Active, ScheduleState::PendingBoost).is_ok() {
            reschedule(shared, task, Priority::Boost);
        }
        return;
    }
    if task.cas_state(ScheduleState::Active, ScheduleState::Suspended).is_err() {
        return;
    }
    decrement_global_activity_count();

    // Raced with an external boost that saw the task still active
    if task.take_boost() && task.cas_state(ScheduleState::Suspended, ScheduleState::PendingBoost).is_ok() {
        increment_global_activity_count();
        reschedule(shared, task, Priority::Boost);
    }
}

/// Queue a task a worker just ran; the gate stays open while any worker is busy
fn reschedule(shared: &PoolShared, task: &TaskRef, priority: Priority) {
    if !shared.schedule(Arc::clone(task), priority, task.hint()) {
        kerror!("pool '{}' closed under running task {}", shared.name, task.id());
    }
}

/// Unwind payload that ends the running task without counting as a failure
pub(crate) struct TaskExit;

/// End the running task; its frames unwind and drop what they own
pub(crate) fn exit_current() -> ! {
    panic::resume_unwind(Box::new(TaskExit))
}

/// Switch the running task back to its worker with `request`
///
/// Returns once the task is resumed again.
pub(crate) fn switch_out(request: SwitchRequest) -> RuntimeResult<()> {
    let task = current_task().ok_or(RuntimeError::InvalidStatus)?;
    let me = coroutine_self().ok_or(RuntimeError::InvalidStatus)?;
    task.set_request(request);
    drop(task);
    me.suspend_with(SwitchHint::Yield);
    Ok(())
}

// ============================================================================
// Thread-local worker and task slots
// ============================================================================
//
// Read from inside tasks, which can move between workers across a switch;
// the accessors are never inlined.

#[derive(Clone, Copy)]
struct WorkerSlot {
    pool: usize,
    local: usize,
    global: usize,
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerSlot>> = const { Cell::new(None) };
    static CURRENT_TASK: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
}

#[inline(never)]
fn set_current_worker(slot: Option<WorkerSlot>) {
    CURRENT_WORKER.with(|c| c.set(slot));
}

#[inline(never)]
fn current_worker_of(pool: &PoolShared) -> Option<usize> {
    CURRENT_WORKER
        .with(|c| c.get())
        .filter(|w| w.pool == pool as *const PoolShared as usize)
        .map(|w| w.local)
}

/// Global index of the worker this thread is, if any
#[inline(never)]
pub fn current_worker_index() -> Option<usize> {
    CURRENT_WORKER.with(|c| c.get()).map(|w| w.global)
}

#[inline(never)]
fn set_current_task(task: Option<TaskRef>) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = task);
}

/// Task running on this thread, if any
#[inline(never)]
pub fn current_task() -> Option<TaskRef> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::AffinitySpec;
    use crate::coroutine::CoroutineSelf;
    use crate::scheduler::SchedulingPolicy;
    use crate::task::TaskControlBlock;

    fn params(policy: SchedulingPolicy, threads: usize) -> PoolInitParameters {
        PoolInitParameters {
            index: 0,
            name: "test".into(),
            thread_offset: 0,
            num_threads: threads,
            affinity: Arc::new(AffinityData::from_masks(vec![Mask::EMPTY; threads], AffinitySpec::None, false)),
            notifier: CallbackNotifier::new(),
            scheduler: policy.factory().unwrap(),
            mode: SchedulerMode::DEFAULT_MODE,
            stack_size: 64 * 1024,
            stack_pool_limit: 16,
            idle_spins: 8,
            park_timeout: Duration::from_millis(2),
        }
    }

    fn spawn(pool: &ThreadPool, tasks: &TaskTable, body: impl FnOnce() + Send + 'static) -> TaskRef {
        let co = pool.new_coroutine(Box::new(move |_: &CoroutineSelf| body())).unwrap();
        let task = tasks
            .insert(|id| TaskControlBlock::new(id, pool.index(), co, Priority::Normal, ScheduleHint::None, None))
            .unwrap();
        increment_global_activity_count();
        pool.schedule(Arc::clone(&task), Priority::Normal, ScheduleHint::None).unwrap();
        task
    }

    #[test]
    fn test_runs_yielding_tasks_to_completion() {
        for policy in [SchedulingPolicy::Local, SchedulingPolicy::StaticPriority] {
            let tasks = Arc::new(TaskTable::new(1024));
            let pool = ThreadPool::new(params(policy, 2), Arc::clone(&tasks));
            pool.run().unwrap();
            assert_eq!(pool.state(), PoolState::Running);

            let done = Arc::new(AtomicUsize::new(0));
            for _ in 0..50 {
                let done = Arc::clone(&done);
                spawn(&pool, &tasks, move || {
                    assert!(current_task().is_some());
                    switch_out(SwitchRequest::Yield).unwrap();
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }
            pool.stop();
            assert_eq!(pool.state(), PoolState::Stopped);
            assert_eq!(done.load(Ordering::SeqCst), 50);
            assert!(tasks.is_empty());
            assert!(pool.tasks_executed() >= 100);
        }
    }

    #[test]
    fn test_state_transitions() {
        let pool = ThreadPool::new(params(SchedulingPolicy::Local, 1), Arc::new(TaskTable::new(16)));
        assert_eq!(pool.state(), PoolState::Created);
        assert_eq!(pool.suspend(), Err(RuntimeError::InvalidStatus));
        pool.run().unwrap();
        assert_eq!(pool.run(), Err(RuntimeError::InvalidStatus));
        pool.suspend().unwrap();
        assert_eq!(pool.state(), PoolState::Suspended);
        pool.resume().unwrap();
        pool.stop();
        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(pool.worker_state(0).unwrap().current_task().is_none());
    }

    #[test]
    fn test_suspended_pool_holds_work() {
        let tasks = Arc::new(TaskTable::new(16));
        let pool = ThreadPool::new(params(SchedulingPolicy::Local, 1), Arc::clone(&tasks));
        pool.run().unwrap();
        pool.suspend().unwrap();
        // Let the worker observe the suspension
        std::thread::sleep(Duration::from_millis(20));

        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        spawn(&pool, &tasks, move || r.store(true, Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));

        pool.resume().unwrap();
        pool.stop();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_task_reaches_error_callback() {
        let errors = Arc::new(AtomicUsize::new(0));
        let mut p = params(SchedulingPolicy::Local, 1);
        let e = Arc::clone(&errors);
        p.notifier.set_on_error(move |_, payload| {
            assert_eq!(panic_message(payload), "task blew up");
            e.fetch_add(1, Ordering::SeqCst);
            true
        });
        let tasks = Arc::new(TaskTable::new(16));
        let pool = ThreadPool::new(p, Arc::clone(&tasks));
        pool.run().unwrap();
        spawn(&pool, &tasks, || panic!("task blew up"));
        let after = Arc::new(AtomicBool::new(false));
        let a = Arc::clone(&after);
        spawn(&pool, &tasks, move || a.store(true, Ordering::SeqCst));
        pool.stop();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(after.load(Ordering::SeqCst));
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_abort_hands_back_queued_tasks() {
        let tasks = Arc::new(TaskTable::new(16));
        let pool = ThreadPool::new(params(SchedulingPolicy::StaticPriority, 2), Arc::clone(&tasks));
        for _ in 0..3 {
            let co = pool.new_coroutine(Box::new(|_: &CoroutineSelf| {})).unwrap();
            let task = tasks
                .insert(|id| TaskControlBlock::new(id, 0, co, Priority::Low, ScheduleHint::None, None))
                .unwrap();
            pool.schedule(task, Priority::Low, ScheduleHint::None).unwrap();
        }
        let leftover = pool.abort();
        assert_eq!(leftover.len(), 3);
        assert!(leftover.iter().all(|t| t.state() == ScheduleState::Pending));
        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(!pool.is_accepting());
    }

    #[test]
    fn test_stopped_pool_refuses_work() {
        let tasks = Arc::new(TaskTable::new(16));
        let pool = ThreadPool::new(params(SchedulingPolicy::Local, 2), Arc::clone(&tasks));
        pool.run().unwrap();
        assert!(pool.is_accepting());
        pool.stop();
        assert!(!pool.is_accepting());

        let co = pool.new_coroutine(Box::new(|_: &CoroutineSelf| {})).unwrap();
        let task = tasks
            .insert(|id| TaskControlBlock::new(id, 0, co, Priority::Normal, ScheduleHint::None, None))
            .unwrap();
        assert_eq!(
            pool.schedule(Arc::clone(&task), Priority::Normal, ScheduleHint::None),
            Err(RuntimeError::InvalidStatus)
        );
        assert_eq!(pool.queue_len(), 0);

        // Never run, never queued
        let idle = ThreadPool::new(params(SchedulingPolicy::Local, 1), Arc::clone(&tasks));
        idle.stop();
        assert_eq!(idle.schedule(task, Priority::Normal, ScheduleHint::None), Err(RuntimeError::InvalidStatus));
    }

    #[test]
    fn test_task_exit_unwinds_without_error() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let errors = Arc::new(AtomicUsize::new(0));
        let mut p = params(SchedulingPolicy::Local, 1);
        let e = Arc::clone(&errors);
        p.notifier.set_on_error(move |_, _| {
            e.fetch_add(1, Ordering::SeqCst);
            true
        });
        let tasks = Arc::new(TaskTable::new(16));
        let pool = ThreadPool::new(p, Arc::clone(&tasks));
        pool.run().unwrap();

        let dropped = Arc::new(AtomicUsize::new(0));
        let held = Arc::new(());
        let (d, h) = (Arc::clone(&dropped), Arc::clone(&held));
        spawn(&pool, &tasks, move || {
            let _guard = Guard(d);
            let _held = h;
            exit_current();
        });
        pool.stop();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(Arc::strong_count(&held), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_workers_report_start_and_stop() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut p = params(SchedulingPolicy::Local, 3);
        p.name = "io".into();
        p.thread_offset = 4;
        p.affinity = Arc::new(AffinityData::from_masks(vec![Mask::EMPTY; 7], AffinitySpec::None, false));
        let s = Arc::clone(&seen);
        p.notifier.add_on_start_thread(move |local, global, pool, _| {
            assert_eq!(current_worker_index(), Some(global));
            s.lock().unwrap().push((local, global, pool.to_owned()));
        });
        let pool = ThreadPool::new(p, Arc::new(TaskTable::new(4)));
        pool.run().unwrap();
        pool.stop();
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![(0, 4, "io".to_owned()), (1, 5, "io".to_owned()), (2, 6, "io".to_owned())]
        );
        assert_eq!(current_worker_index(), None);
    }
}
