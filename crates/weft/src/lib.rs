//! # weft
//!
//! User-space task runtime: stackful tasks multiplexed onto worker threads
//! pinned to cores, hyperthreads and NUMA nodes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::{RuntimeConfig, spawn, yield_now};
//!
//! fn main() -> weft::RuntimeResult<()> {
//!     weft::run(RuntimeConfig::from_env().num_threads(4), |_rt| {
//!         for i in 0..8 {
//!             spawn(move || {
//!                 println!("task {} on its first slice", i);
//!                 yield_now();
//!                 println!("task {} again", i);
//!             })
//!             .unwrap();
//!         }
//!     })
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         User Code                           │
//! │        spawn(), yield_now(), suspend(), wake(), run()       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Runtime / Thread Manager                       │
//! │   lifecycle, create_thread, set_thread_state, task table    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Pool 0   │      │  Pool 1   │      │    ...    │
//!    │ scheduler │      │ scheduler │      │           │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │
//!          ▼                   ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │   Workers bound to affinity masks from the partitioner  │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use weft_core::{
    Barrier, Mask, PartitionerMode, Priority, RestartState, RuntimeError, RuntimeResult, RuntimeState,
    ScheduleHint, ScheduleState, SchedulerMode, SpinLock, TaskId,
};
pub use weft_core::{diagnostics, get_global_activity_count, is_quiescent};

// Re-export kprint macros for debug logging
pub use weft_core::{kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use weft_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use weft_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use weft_runtime::{
    get_runtime, init, thread_manager_is, try_get_runtime, CoroutineSelf, Resource, ResourcePartitioner, Runtime,
    RuntimeConfig, SchedulingPolicy, TaskInit,
};
pub use weft_runtime::{affinity, topology};

use std::sync::Arc;

/// Start a runtime, hand it to `f`, wait for quiescence, then stop it
pub fn run<F, T>(config: RuntimeConfig, f: F) -> RuntimeResult<T>
where
    F: FnOnce(&Arc<Runtime>) -> T,
{
    let rt = init(config)?;
    let result = f(&rt);
    rt.wait();
    rt.stop()?;
    Ok(result)
}

/// Spawn a task with normal priority on the default pool
pub fn spawn<F>(f: F) -> RuntimeResult<TaskId>
where
    F: FnOnce() + Send + 'static,
{
    spawn_with(move |_| f(), TaskInit::new())
}

/// Spawn a task with the given priority on the default pool
pub fn spawn_with_priority<F>(f: F, priority: Priority) -> RuntimeResult<TaskId>
where
    F: FnOnce() + Send + 'static,
{
    spawn_with(move |_| f(), TaskInit::new().priority(priority))
}

/// Spawn a task with full control over pool, priority, hint and start state
///
/// The body gets the coroutine capability of the task.
pub fn spawn_with<F>(f: F, init: TaskInit) -> RuntimeResult<TaskId>
where
    F: FnOnce(&CoroutineSelf) + Send + 'static,
{
    try_get_runtime()?.thread_manager().create_thread(f, init)
}

/// Let other tasks run
///
/// The current task goes back to its queue. Outside a task this yields the
/// OS thread.
pub fn yield_now() {
    let id = current_id();
    if id.is_none() {
        std::thread::yield_now();
        return;
    }
    if let Some(rt) = get_runtime() {
        // Only fails for a task that is not running, which `id` is
        let _ = rt
            .thread_manager()
            .set_thread_state(id, ScheduleState::Pending, RestartState::Unknown, None, ScheduleHint::None, false);
    }
}

/// Suspend the current task until someone [`wake`]s it
///
/// Returns the reason it was restarted with.
pub fn suspend() -> RuntimeResult<RestartState> {
    let id = current_id();
    if id.is_none() {
        return Err(RuntimeError::InvalidStatus);
    }
    let rt = try_get_runtime()?;
    let tm = rt.thread_manager();
    let me = tm.task(id).ok_or(RuntimeError::TaskNotFound)?;
    tm.set_thread_state(id, ScheduleState::Suspended, RestartState::Unknown, None, ScheduleHint::None, false)?;
    Ok(me.restart_state())
}

/// Wake a suspended task with `RestartState::Signaled`
pub fn wake(id: TaskId) -> RuntimeResult<()> {
    try_get_runtime()?
        .thread_manager()
        .set_thread_state(id, ScheduleState::Pending, RestartState::Signaled, None, ScheduleHint::None, true)
        .map(|_| ())
}

/// Id of the running task, `TaskId::NONE` outside tasks
#[inline]
pub fn current_id() -> TaskId {
    weft_runtime::pool::current_task().map_or(TaskId::NONE, |t| t.id())
}

/// Whether the caller runs inside a task
#[inline]
pub fn is_in_task() -> bool {
    weft_runtime::pool::current_task().is_some()
}
