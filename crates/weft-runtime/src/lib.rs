//! # weft-runtime
//!
//! Platform layer and orchestration for the weft task runtime.
//!
//! This crate provides:
//! - Hardware topology discovery and affinity masks per worker
//! - Guarded coroutine stacks (mmap) and architecture context switching
//! - Stackful coroutines and task control blocks
//! - Schedulers, thread pools and the resource partitioner
//! - The thread manager (`create_thread`, `set_thread_state`) and the
//!   runtime lifecycle

pub mod config;
pub mod topology;
pub mod affinity;
pub mod memory;
mod arch;
pub mod coroutine;
pub mod task;
pub mod scheduler;
pub mod notifier;
pub mod pool;
pub mod partitioner;
pub mod thread_manager;
pub mod runtime;

// Re-exports
pub use affinity::{AffinityData, AffinitySpec, Mapping};
pub use config::{ConfigError, RuntimeConfig};
pub use coroutine::{coroutine_self, in_coroutine, Coroutine, CoroutineSelf, CoroutineState};
pub use notifier::CallbackNotifier;
pub use partitioner::{Resource, ResourcePartitioner, DEFAULT_POOL_NAME};
pub use pool::{PoolInitParameters, PoolState, ThreadPool};
pub use runtime::{get_runtime, init, thread_manager_is, try_get_runtime, Runtime};
pub use scheduler::{
    LocalQueueScheduler, QueueWaitStats, Scheduler, SchedulerFactory, SchedulingPolicy, StaticPriorityScheduler,
};
pub use task::{TaskControlBlock, TaskRef};
pub use thread_manager::{TaskInit, ThreadManager};
pub use topology::{get_topology, Topology};
