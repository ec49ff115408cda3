//! Thread manager
//!
//! Owns the pools and the task table. Tasks are created here and change
//! state only through [`ThreadManager::set_thread_state`]; the workers
//! apply the switches a running task asks for.
//!
//! External transitions:
//!
//! | from \ to    | Pending | Active | Suspended | PendingBoost | Terminated |
//! |--------------|---------|--------|-----------|--------------|------------|
//! | Pending      | error   | ok     | error     | error        | ok         |
//! | Active       | retry   | retry  | self only | boost flag   | retry      |
//! | Suspended    | queued  | error  | error     | queued boost | ok         |
//! | PendingBoost | error   | ok     | error     | error        | ok         |
//! | Terminated   | error   | error  | error     | error        | error      |
//!
//! A task calling it on itself yields (`Pending`, `PendingBoost`),
//! suspends (`Suspended`) or exits (`Terminated`). Exiting unwinds the
//! task's frames. Waking a task whose pool no longer takes work fails and
//! leaves the task suspended.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use weft_core::activity::{decrement_global_activity_count, increment_global_activity_count};
use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::{
    is_quiescent, kdebug, kwarn, Backoff, Priority, RestartState, ScheduleHint, ScheduleState, TaskId,
};

use crate::coroutine::CoroutineSelf;
use crate::pool::{self, PoolInitParameters, PoolState, ThreadPool};
use crate::task::{SwitchRequest, TaskControlBlock, TaskRef, TaskTable};

/// How a new task starts out
#[derive(Debug, Clone)]
pub struct TaskInit {
    pub priority: Priority,
    pub hint: ScheduleHint,
    /// Pool index; the default pool when `None`
    pub pool: Option<usize>,
    pub description: Option<String>,
    /// `Pending` (queued right away) or `Suspended` (waits for a wake-up)
    pub initial_state: ScheduleState,
}

impl Default for TaskInit {
    fn default() -> Self {
        TaskInit {
            priority: Priority::Normal,
            hint: ScheduleHint::None,
            pool: None,
            description: None,
            initial_state: ScheduleState::Pending,
        }
    }
}

impl TaskInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn hint(mut self, hint: ScheduleHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn pool(mut self, pool: usize) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn suspended(mut self) -> Self {
        self.initial_state = ScheduleState::Suspended;
        self
    }
}

pub struct ThreadManager {
    pools: RwLock<Vec<Arc<ThreadPool>>>,
    tasks: Arc<TaskTable>,
    retry_on_active_limit: u32,
}

impl ThreadManager {
    /// Build one pool per parameter set; nothing runs before [`run`](Self::run)
    pub fn new(pools: Vec<PoolInitParameters>, max_tasks: usize, retry_on_active_limit: u32) -> ThreadManager {
        let tasks = Arc::new(TaskTable::new(max_tasks));
        let pools = pools
            .into_iter()
            .map(|p| Arc::new(ThreadPool::new(p, Arc::clone(&tasks))))
            .collect();
        ThreadManager { pools: RwLock::new(pools), tasks, retry_on_active_limit }
    }

    fn pools(&self) -> Vec<Arc<ThreadPool>> {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn pool(&self, index: usize) -> RuntimeResult<Arc<ThreadPool>> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
            .ok_or(RuntimeError::PoolNotFound)
    }

    pub fn pool_by_name(&self, name: &str) -> RuntimeResult<Arc<ThreadPool>> {
        self.pools()
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or(RuntimeError::PoolNotFound)
    }

    pub fn default_pool(&self) -> RuntimeResult<Arc<ThreadPool>> {
        self.pool(0)
    }

    pub fn num_pools(&self) -> usize {
        self.pools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Workers across all pools
    pub fn num_threads(&self) -> usize {
        self.pools().iter().map(|p| p.num_threads()).sum()
    }

    /// Add a pool built after startup; it is started if the others are
    pub fn add_pool(&self, params: PoolInitParameters) -> RuntimeResult<Arc<ThreadPool>> {
        let index = params.index;
        let pool = Arc::new(ThreadPool::new(params, Arc::clone(&self.tasks)));
        let running = {
            let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
            if index != pools.len() {
                return Err(RuntimeError::invalid_argument(format!(
                    "pool index {} does not follow the {} existing pool(s)",
                    index,
                    pools.len()
                )));
            }
            pools.push(Arc::clone(&pool));
            pools.first().is_some_and(|p| p.state() != PoolState::Created)
        };
        if running {
            pool.run()?;
        }
        Ok(pool)
    }

    pub fn run(&self) -> RuntimeResult<()> {
        for pool in self.pools() {
            pool.run()?;
        }
        Ok(())
    }

    pub fn suspend(&self) -> RuntimeResult<()> {
        for pool in self.pools() {
            pool.suspend()?;
        }
        Ok(())
    }

    pub fn resume(&self) -> RuntimeResult<()> {
        for pool in self.pools() {
            pool.resume()?;
        }
        Ok(())
    }

    /// Drain and join every pool, then terminate tasks left suspended
    ///
    /// Returns how many suspended tasks were terminated.
    pub fn stop(&self) -> usize {
        for pool in self.pools() {
            pool.stop();
        }
        self.terminate_suspended(RestartState::Terminate)
    }

    /// Join every pool after the current tasks; queued and suspended tasks
    /// are terminated with `RestartState::Abort`
    pub fn abort(&self) -> usize {
        let mut dropped = 0;
        for pool in self.pools() {
            for task in pool.abort() {
                if self.terminate(&task, RestartState::Abort).is_ok() {
                    dropped += 1;
                }
            }
        }
        dropped + self.terminate_suspended(RestartState::Abort)
    }

    fn terminate_suspended(&self, reason: RestartState) -> usize {
        let suspended: Vec<TaskRef> = self
            .tasks
            .snapshot()
            .into_iter()
            .filter(|(_, state, _)| *state == ScheduleState::Suspended)
            .filter_map(|(id, _, _)| self.tasks.get(id))
            .collect();
        let count = suspended.iter().filter(|t| self.terminate(t, reason).is_ok()).count();
        if count > 0 {
            kwarn!("terminated {} task(s) that were still suspended", count);
        }
        count
    }

    fn terminate(&self, task: &TaskRef, reason: RestartState) -> RuntimeResult<ScheduleState> {
        self.set_thread_state(task.id(), ScheduleState::Terminated, reason, None, ScheduleHint::None, false)
    }

    /// Live tasks
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn task(&self, id: TaskId) -> Option<TaskRef> {
        self.tasks.get(id)
    }

    /// Id, state and description of every live task
    pub fn task_snapshot(&self) -> Vec<(TaskId, ScheduleState, String)> {
        self.tasks.snapshot()
    }

    /// State of `id`; tasks that finished are no longer known
    pub fn thread_state(&self, id: TaskId) -> RuntimeResult<ScheduleState> {
        Ok(self.tasks.try_get(id)?.state())
    }

    /// Task running on this thread, if any
    pub fn current_task(&self) -> Option<TaskRef> {
        pool::current_task()
    }

    /// Create a task and, unless it starts suspended, queue it
    pub fn create_thread<F>(&self, entry: F, init: TaskInit) -> RuntimeResult<TaskId>
    where
        F: FnOnce(&CoroutineSelf) + Send + 'static,
    {
        if !matches!(init.initial_state, ScheduleState::Pending | ScheduleState::Suspended) {
            return Err(RuntimeError::invalid_argument(format!(
                "tasks start pending or suspended, not {}",
                init.initial_state
            )));
        }
        let pool = self.pool(init.pool.unwrap_or(0))?;
        if matches!(pool.state(), PoolState::Stopping | PoolState::Stopped) {
            return Err(RuntimeError::InvalidStatus);
        }

        let coroutine = pool.new_coroutine(Box::new(entry))?;
        let TaskInit { priority, hint, description, initial_state, .. } = init;
        let task = self
            .tasks
            .insert(|id| TaskControlBlock::new(id, pool.index(), coroutine, priority, hint, description))?;

        if initial_state == ScheduleState::Suspended {
            // Not handed out yet, nobody else can move it
            let _ = task.cas_state(ScheduleState::Pending, ScheduleState::Suspended);
        } else {
            increment_global_activity_count();
            if let Err(e) = pool.schedule(Arc::clone(&task), priority, hint) {
                decrement_global_activity_count();
                let _ = task.cas_state(ScheduleState::Pending, ScheduleState::Terminated);
                self.discard(&task);
                return Err(e);
            }
        }
        Ok(task.id())
    }

    /// Move task `id` to `new_state`; returns the state it was in
    ///
    /// `restart` is what a woken task finds in
    /// [`TaskControlBlock::restart_state`]; `priority` and `hint` replace
    /// the task's own when given (`ScheduleHint::None` keeps it). With
    /// `retry_on_active`, a running target is waited for with backoff up to
    /// the configured number of attempts.
    ///
    /// Called by the task on itself, `Pending`/`PendingBoost` yield,
    /// `Suspended` suspends and `Terminated` exits without returning. Those
    /// return `Active` once the task runs again.
    pub fn set_thread_state(
        &self,
        id: TaskId,
        new_state: ScheduleState,
        restart: RestartState,
        priority: Option<Priority>,
        hint: ScheduleHint,
        retry_on_active: bool,
    ) -> RuntimeResult<ScheduleState> {
        if let Some(me) = pool::current_task().filter(|t| t.id() == id) {
            return set_own_state(me, new_state, restart);
        }

        // Reaped tasks are past Terminated
        let task = self.tasks.get(id).ok_or(RuntimeError::InvalidStatus)?;
        let mut backoff = Backoff::with_max_sleep(Duration::from_millis(1));
        let mut attempts = 0u32;
        loop {
            let previous = task.state();
            match (previous, new_state) {
                (ScheduleState::Terminated, _) | (_, ScheduleState::Suspended) => {
                    return Err(RuntimeError::InvalidStatus)
                }

                (ScheduleState::Active, ScheduleState::PendingBoost) => {
                    task.request_boost();
                    let now = task.state();
                    // Whoever takes the flag back owns the wake-up
                    if now == ScheduleState::Active || !task.take_boost() {
                        return Ok(ScheduleState::Active);
                    }
                    match now {
                        ScheduleState::Suspended => continue,
                        ScheduleState::Terminated => return Err(RuntimeError::InvalidStatus),
                        already_queued => return Ok(already_queued),
                    }
                }

                (ScheduleState::Active, _) => {
                    if !retry_on_active || attempts >= self.retry_on_active_limit {
                        return Err(RuntimeError::InvalidStatus);
                    }
                    attempts += 1;
                    backoff.snooze();
                }

                (ScheduleState::Suspended, ScheduleState::Pending | ScheduleState::PendingBoost) => {
                    if task.cas_state(previous, new_state).is_err() {
                        continue;
                    }
                    task.set_restart_state(restart);
                    if let Some(priority) = priority {
                        task.set_priority(priority);
                    }
                    if hint != ScheduleHint::None {
                        task.set_hint(hint);
                    }
                    let priority = if new_state == ScheduleState::PendingBoost {
                        task.take_boost();
                        Priority::Boost
                    } else {
                        task.priority()
                    };
                    increment_global_activity_count();
                    let queued = self
                        .pool(task.pool())
                        .and_then(|pool| pool.schedule(Arc::clone(&task), priority, task.hint()));
                    if let Err(e) = queued {
                        // Lost a race with terminate when this fails; it settled the count
                        if task.cas_state(new_state, ScheduleState::Suspended).is_ok() {
                            decrement_global_activity_count();
                        }
                        kdebug!("wake of task {} refused: {}", task.id(), e);
                        return Err(RuntimeError::InvalidStatus);
                    }
                    return Ok(previous);
                }

                (ScheduleState::Suspended, ScheduleState::Terminated) => {
                    if task.cas_state(previous, new_state).is_err() {
                        continue;
                    }
                    task.set_restart_state(restart);
                    self.discard(&task);
                    return Ok(previous);
                }

                (ScheduleState::Pending | ScheduleState::PendingBoost, ScheduleState::Terminated) => {
                    if task.cas_state(previous, new_state).is_err() {
                        continue;
                    }
                    task.set_restart_state(restart);
                    decrement_global_activity_count();
                    // The stale queue entry is skipped by the worker
                    self.discard(&task);
                    return Ok(previous);
                }

                (ScheduleState::Pending | ScheduleState::PendingBoost, ScheduleState::Active) => {
                    if task.cas_state(previous, new_state).is_err() {
                        continue;
                    }
                    return Ok(previous);
                }

                (ScheduleState::Suspended, ScheduleState::Active)
                | (
                    ScheduleState::Pending | ScheduleState::PendingBoost,
                    ScheduleState::Pending | ScheduleState::PendingBoost,
                ) => return Err(RuntimeError::InvalidStatus),
            }
        }
    }

    /// Drop a terminated task's coroutine and forget the task
    fn discard(&self, task: &TaskRef) {
        task.claim();
        let coroutine = task.take_coroutine();
        task.unclaim();
        drop(coroutine);
        self.tasks.remove(task);
        kdebug!("task {} ({}) terminated", task.id(), task.description());
    }

    /// Block until no task is pending or active, or `timeout` passes
    ///
    /// Returns whether quiescence was reached.
    pub fn wait_quiescent(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut backoff = Backoff::with_max_sleep(Duration::from_millis(1));
        while !is_quiescent() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            backoff.snooze();
        }
        true
    }
}

impl std::fmt::Debug for ThreadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadManager")
            .field("pools", &self.num_pools())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

fn set_own_state(me: TaskRef, new_state: ScheduleState, restart: RestartState) -> RuntimeResult<ScheduleState> {
    let request = match new_state {
        ScheduleState::Pending => SwitchRequest::Yield,
        ScheduleState::PendingBoost => SwitchRequest::YieldBoost,
        ScheduleState::Suspended => SwitchRequest::Suspend,
        ScheduleState::Terminated => {
            me.set_restart_state(restart);
            drop(me);
            pool::exit_current()
        }
        ScheduleState::Active => return Err(RuntimeError::InvalidStatus),
    };
    drop(me);
    pool::switch_out(request)?;
    Ok(ScheduleState::Active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::{AffinityData, AffinitySpec};
    use crate::notifier::CallbackNotifier;
    use crate::scheduler::SchedulingPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use weft_core::{Barrier, Mask, SchedulerMode};

    fn manager(threads: usize) -> ThreadManager {
        let params = PoolInitParameters {
            index: 0,
            name: "tm".into(),
            thread_offset: 0,
            num_threads: threads,
            affinity: Arc::new(AffinityData::from_masks(vec![Mask::EMPTY; threads], AffinitySpec::None, false)),
            notifier: CallbackNotifier::new(),
            scheduler: SchedulingPolicy::Local.factory().unwrap(),
            mode: SchedulerMode::DEFAULT_MODE,
            stack_size: 64 * 1024,
            stack_pool_limit: 64,
            idle_spins: 16,
            park_timeout: Duration::from_millis(2),
        };
        ThreadManager::new(vec![params], 4096, 64)
    }

    /// Poll until `f` holds, for at most five seconds
    fn eventually(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_suspend_and_wake() {
        let tm = Arc::new(manager(2));
        tm.run().unwrap();

        let (tx, rx) = mpsc::channel();
        let woken = Arc::new(AtomicUsize::new(0));
        let w = Arc::clone(&woken);
        let tm2 = Arc::clone(&tm);
        let id = tm
            .create_thread(
                move |_| {
                    let me = tm2.current_task().unwrap();
                    tx.send(me.id()).unwrap();
                    let r = tm2.set_thread_state(
                        me.id(),
                        ScheduleState::Suspended,
                        RestartState::Unknown,
                        None,
                        ScheduleHint::None,
                        false,
                    );
                    assert_eq!(r, Ok(ScheduleState::Active));
                    assert_eq!(me.restart_state(), RestartState::Signaled);
                    w.fetch_add(1, Ordering::SeqCst);
                },
                TaskInit::new().description("sleeper"),
            )
            .unwrap();
        assert_eq!(rx.recv().unwrap(), id);
        assert!(eventually(|| tm.thread_state(id) == Ok(ScheduleState::Suspended)));
        assert_eq!(tm.task(id).unwrap().description(), "sleeper");

        // Only the task may suspend itself, nothing else may activate it
        let no = tm.set_thread_state(id, ScheduleState::Suspended, RestartState::Unknown, None, ScheduleHint::None, false);
        assert_eq!(no, Err(RuntimeError::InvalidStatus));
        let no = tm.set_thread_state(id, ScheduleState::Active, RestartState::Unknown, None, ScheduleHint::None, false);
        assert_eq!(no, Err(RuntimeError::InvalidStatus));

        let prev = tm
            .set_thread_state(id, ScheduleState::Pending, RestartState::Signaled, None, ScheduleHint::None, false)
            .unwrap();
        assert_eq!(prev, ScheduleState::Suspended);
        assert!(eventually(|| woken.load(Ordering::SeqCst) == 1));
        assert!(eventually(|| tm.thread_state(id) == Err(RuntimeError::TaskNotFound)));
        assert_eq!(tm.stop(), 0);
    }

    #[test]
    fn test_terminate_suspended_and_pending() {
        let tm = manager(1);
        let ran = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&ran);
        let parked = tm
            .create_thread(
                move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                TaskInit::new().suspended(),
            )
            .unwrap();
        assert_eq!(tm.thread_state(parked), Ok(ScheduleState::Suspended));

        // Pool not running yet, so this one stays queued
        let r = Arc::clone(&ran);
        let queued = tm
            .create_thread(
                move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                TaskInit::new(),
            )
            .unwrap();
        assert_eq!(tm.thread_state(queued), Ok(ScheduleState::Pending));

        for id in [parked, queued] {
            assert!(tm
                .set_thread_state(id, ScheduleState::Terminated, RestartState::Terminate, None, ScheduleHint::None, false)
                .is_ok());
            assert_eq!(tm.thread_state(id), Err(RuntimeError::TaskNotFound));
            let again =
                tm.set_thread_state(id, ScheduleState::Pending, RestartState::Signaled, None, ScheduleHint::None, false);
            assert_eq!(again, Err(RuntimeError::InvalidStatus));
        }
        assert_eq!(tm.num_tasks(), 0);

        tm.run().unwrap();
        tm.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pending_only_to_active_or_terminated() {
        let tm = manager(1);
        let id = tm.create_thread(|_| {}, TaskInit::new().priority(Priority::Low)).unwrap();
        for target in [ScheduleState::Pending, ScheduleState::PendingBoost, ScheduleState::Suspended] {
            let r = tm.set_thread_state(id, target, RestartState::Unknown, None, ScheduleHint::None, true);
            assert_eq!(r, Err(RuntimeError::InvalidStatus), "{}", target);
        }
        let prev = tm
            .set_thread_state(id, ScheduleState::Active, RestartState::Unknown, None, ScheduleHint::None, false)
            .unwrap();
        assert_eq!(prev, ScheduleState::Pending);

        // Active and nobody running it: retries run out
        let r = tm.set_thread_state(id, ScheduleState::Pending, RestartState::Unknown, None, ScheduleHint::None, false);
        assert_eq!(r, Err(RuntimeError::InvalidStatus));
        let r = tm.set_thread_state(id, ScheduleState::Terminated, RestartState::Unknown, None, ScheduleHint::None, true);
        assert_eq!(r, Err(RuntimeError::InvalidStatus));

        // A worker picks up the forced-active entry and runs it to the end
        tm.run().unwrap();
        tm.stop();
        assert_eq!(tm.num_tasks(), 0);
    }

    #[test]
    fn test_terminate_race_has_one_winner() {
        let tm = Arc::new(manager(1));
        let id = tm.create_thread(|_| {}, TaskInit::new().suspended()).unwrap();
        let start = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tm = Arc::clone(&tm);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    tm.set_thread_state(id, ScheduleState::Terminated, RestartState::Abort, None, ScheduleHint::None, false)
                        .is_ok()
                })
            })
            .collect();
        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(winners, 1);
        assert_eq!(tm.num_tasks(), 0);
    }

    #[test]
    fn test_boost_while_active_is_not_lost() {
        let tm = Arc::new(manager(1));
        tm.run().unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let tm2 = Arc::clone(&tm);
        let id = tm
            .create_thread(
                move |_| {
                    let me = tm2.current_task().unwrap().id();
                    started_tx.send(()).unwrap();
                    // Wait until the boost has been requested, then suspend
                    go_rx.recv().unwrap();
                    tm2.set_thread_state(me, ScheduleState::Suspended, RestartState::Unknown, None, ScheduleHint::None, false)
                        .unwrap();
                    d.fetch_add(1, Ordering::SeqCst);
                },
                TaskInit::new(),
            )
            .unwrap();
        started_rx.recv().unwrap();
        let prev = tm
            .set_thread_state(id, ScheduleState::PendingBoost, RestartState::Signaled, None, ScheduleHint::None, false)
            .unwrap();
        assert_eq!(prev, ScheduleState::Active);
        go_tx.send(()).unwrap();

        assert!(eventually(|| done.load(Ordering::SeqCst) == 1));
        tm.stop();
    }

    #[test]
    fn test_create_errors() {
        let tm = manager(1);
        assert_eq!(tm.create_thread(|_| {}, TaskInit::new().pool(3)), Err(RuntimeError::PoolNotFound));
        let mut init = TaskInit::new();
        init.initial_state = ScheduleState::Active;
        assert!(matches!(tm.create_thread(|_| {}, init), Err(RuntimeError::InvalidArgument(_))));
        tm.run().unwrap();
        tm.stop();
        assert_eq!(tm.create_thread(|_| {}, TaskInit::new()), Err(RuntimeError::InvalidStatus));
    }

    #[test]
    fn test_self_transitions() {
        let tm = Arc::new(manager(2));
        tm.run().unwrap();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&steps);
        let tm2 = Arc::clone(&tm);
        tm.create_thread(
            move |_| {
                let me = tm2.current_task().unwrap().id();
                let set = |state| tm2.set_thread_state(me, state, RestartState::Unknown, None, ScheduleHint::None, false);
                assert_eq!(set(ScheduleState::Active), Err(RuntimeError::InvalidStatus));
                assert_eq!(set(ScheduleState::Pending), Ok(ScheduleState::Active));
                s.fetch_add(1, Ordering::SeqCst);
                assert_eq!(set(ScheduleState::PendingBoost), Ok(ScheduleState::Active));
                s.fetch_add(1, Ordering::SeqCst);
                let _ = set(ScheduleState::Terminated);
                unreachable!("terminated task resumed");
            },
            TaskInit::new(),
        )
        .unwrap();
        assert!(eventually(|| steps.load(Ordering::SeqCst) == 2 && tm.num_tasks() == 0));
        tm.stop();
    }

    #[test]
    fn test_recycled_slot_ignores_stale_id() {
        let tm = manager(1);
        let old = tm.create_thread(|_| {}, TaskInit::new().suspended()).unwrap();
        tm.set_thread_state(old, ScheduleState::Terminated, RestartState::Terminate, None, ScheduleHint::None, false)
            .unwrap();
        let new = tm.create_thread(|_| {}, TaskInit::new().suspended()).unwrap();
        assert_eq!(new.slot(), old.slot());
        assert_ne!(new, old);

        for target in [ScheduleState::Pending, ScheduleState::PendingBoost, ScheduleState::Terminated] {
            let r = tm.set_thread_state(old, target, RestartState::Signaled, None, ScheduleHint::None, false);
            assert_eq!(r, Err(RuntimeError::InvalidStatus), "{}", target);
        }
        assert_eq!(tm.thread_state(old), Err(RuntimeError::TaskNotFound));
        assert!(tm.task(old).is_none());
        assert_eq!(tm.thread_state(new), Ok(ScheduleState::Suspended));
        assert_eq!(tm.stop(), 1);
    }

    #[test]
    fn test_wake_into_stopped_pool_is_refused() {
        let tm = manager(1);
        tm.run().unwrap();
        let id = tm.create_thread(|_| {}, TaskInit::new().suspended()).unwrap();
        let pool = tm.pool(0).unwrap();
        pool.stop();
        assert!(!pool.is_accepting());

        for target in [ScheduleState::Pending, ScheduleState::PendingBoost] {
            let r = tm.set_thread_state(id, target, RestartState::Signaled, None, ScheduleHint::None, false);
            assert_eq!(r, Err(RuntimeError::InvalidStatus), "{}", target);
            assert_eq!(tm.thread_state(id), Ok(ScheduleState::Suspended));
        }
        assert_eq!(pool.queue_len(), 0);
        assert_eq!(tm.create_thread(|_| {}, TaskInit::new()), Err(RuntimeError::InvalidStatus));
        assert_eq!(tm.stop(), 1);
        assert_eq!(tm.num_tasks(), 0);
    }

    #[test]
    fn test_activate_race_has_one_winner() {
        let tm = Arc::new(manager(1));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let id = tm
            .create_thread(
                move |_| {
                    r.fetch_add(1, Ordering::SeqCst);
                },
                TaskInit::new(),
            )
            .unwrap();
        let start = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tm = Arc::clone(&tm);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    tm.set_thread_state(id, ScheduleState::Active, RestartState::Unknown, None, ScheduleHint::None, false)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| **r == Ok(ScheduleState::Pending)).count(), 1);
        assert_eq!(results.iter().filter(|r| **r == Err(RuntimeError::InvalidStatus)).count(), 3);
        assert_eq!(tm.thread_state(id), Ok(ScheduleState::Active));

        // The queued entry still runs it exactly once
        tm.run().unwrap();
        tm.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(tm.num_tasks(), 0);
    }

    #[test]
    fn test_self_terminate_unwinds_frames() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let tm = Arc::new(manager(1));
        tm.run().unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let held = Arc::new(());
        let (d, h, tm2) = (Arc::clone(&dropped), Arc::clone(&held), Arc::clone(&tm));
        let id = tm
            .create_thread(
                move |_| {
                    let _guard = Guard(d);
                    let _held = h;
                    let me = tm2.current_task().unwrap();
                    let _ = tm2.set_thread_state(
                        me.id(),
                        ScheduleState::Terminated,
                        RestartState::Terminate,
                        None,
                        ScheduleHint::None,
                        false,
                    );
                    unreachable!("terminated task resumed");
                },
                TaskInit::new(),
            )
            .unwrap();
        assert!(eventually(|| tm.thread_state(id) == Err(RuntimeError::TaskNotFound)));
        assert!(eventually(|| Arc::strong_count(&held) == 1));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        tm.stop();
    }
}
