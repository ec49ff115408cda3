//! # weft-core
//!
//! Core types for the weft task runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Topology discovery, stacks, context switching and the worker threads
//! live in `weft-runtime`.
//!
//! ## Modules
//!
//! - `id` - task identifier
//! - `state` - task states, restart reasons, priorities, hints
//! - `runtime_state` - global lifecycle states
//! - `mode` - scheduler and partitioner flag sets
//! - `mask` - processing-unit bit set
//! - `spinlock` - spinlock and backoff
//! - `barrier` - reusable phase barrier
//! - `slot` - task id allocator
//! - `activity` - global activity (quiescence) counter
//! - `diagnostics` - deadlock detection and queue-wait toggles
//! - `error` - error types
//! - `kprint` - kernel-style logging macros
//! - `env` - environment variable helpers

pub mod id;
pub mod state;
pub mod runtime_state;
pub mod mode;
pub mod mask;
pub mod spinlock;
pub mod barrier;
pub mod slot;
pub mod activity;
pub mod diagnostics;
pub mod error;
pub mod kprint;
pub mod env;

pub use id::TaskId;
pub use state::{Priority, RestartState, ScheduleHint, ScheduleState, SwitchHint};
pub use runtime_state::{AtomicRuntimeState, RuntimeState};
pub use mode::{PartitionerMode, SchedulerMode};
pub use mask::{Mask, MAX_PUS};
pub use spinlock::{Backoff, SpinLock, SpinLockGuard};
pub use barrier::Barrier;
pub use slot::SlotAllocator;
pub use activity::{get_global_activity_count, is_quiescent};
pub use error::{MemoryError, RuntimeError, RuntimeResult, WorkerError};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Layout constants
pub mod constants {
    /// Smallest usable coroutine stack accepted by the config (4 pages)
    pub const MIN_STACK_SIZE: usize = 4 * 4096;

    /// Upper bound on workers across all pools
    pub const MAX_WORKERS: usize = crate::mask::MAX_PUS;

    /// Default capacity of the task table
    pub const DEFAULT_MAX_TASKS: usize = 65536;

    cfg_if::cfg_if! {
        if #[cfg(all(target_arch = "aarch64", target_vendor = "apple"))] {
            pub const CACHE_LINE_SIZE: usize = 128;
        } else {
            pub const CACHE_LINE_SIZE: usize = 64;
        }
    }
}
