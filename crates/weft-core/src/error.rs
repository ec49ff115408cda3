//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A value handed in by the caller is unusable (bad affinity spec,
    /// unknown pool layout, too many threads for the machine, ...)
    InvalidArgument(String),

    /// The requested task transition is not allowed from the current state
    InvalidStatus,

    /// No task with this id exists
    TaskNotFound,

    /// No pool with this name or index exists
    PoolNotFound,

    /// Task table is full
    NoSlotsAvailable,

    /// Runtime not initialized
    NotInitialized,

    /// Runtime already initialized
    AlreadyInitialized,

    /// Lifecycle transition not permitted from the current runtime state
    InvalidTransition,

    /// Hardware topology could not be discovered
    TopologyProbe(String),

    /// Affinity mask became empty after intersecting with the process mask
    EmptyAffinityMask {
        /// Global worker index whose mask became empty
        thread: usize,
    },

    /// Stack allocation/protection failed
    Memory(MemoryError),

    /// Worker thread error
    Worker(WorkerError),
}

impl RuntimeError {
    /// Shorthand for `InvalidArgument`
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        RuntimeError::InvalidArgument(msg.into())
    }

    /// True for errors that mean the requested resources can never be satisfied
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            RuntimeError::InvalidArgument(_)
                | RuntimeError::TopologyProbe(_)
                | RuntimeError::EmptyAffinityMask { .. }
        )
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            RuntimeError::InvalidStatus => write!(f, "invalid task status for transition"),
            RuntimeError::TaskNotFound => write!(f, "task not found"),
            RuntimeError::PoolNotFound => write!(f, "thread pool not found"),
            RuntimeError::NoSlotsAvailable => write!(f, "no task slots available"),
            RuntimeError::NotInitialized => write!(f, "runtime not initialized"),
            RuntimeError::AlreadyInitialized => write!(f, "runtime already initialized"),
            RuntimeError::InvalidTransition => write!(f, "invalid runtime state transition"),
            RuntimeError::TopologyProbe(msg) => write!(f, "topology probe failed: {}", msg),
            RuntimeError::EmptyAffinityMask { thread } => {
                write!(f, "affinity mask for thread {} is empty under the process mask", thread)
            }
            RuntimeError::Memory(e) => write!(f, "memory error: {}", e),
            RuntimeError::Worker(e) => write!(f, "worker error: {}", e),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Memory-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect failed
    ProtectionFailed,

    /// madvise failed
    AdviseFailed,

    /// Requested stack size overflows the address space
    StackTooLarge,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "guard page protection failed"),
            MemoryError::AdviseFailed => write!(f, "memory advise failed"),
            MemoryError::StackTooLarge => write!(f, "stack size too large"),
        }
    }
}

impl From<MemoryError> for RuntimeError {
    fn from(e: MemoryError) -> Self {
        RuntimeError::Memory(e)
    }
}

/// Worker thread related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker thread panicked
    Panicked,

    /// Failed to set thread affinity
    AffinityFailed,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
            WorkerError::AffinityFailed => write!(f, "failed to set thread affinity"),
        }
    }
}

impl From<WorkerError> for RuntimeError {
    fn from(e: WorkerError) -> Self {
        RuntimeError::Worker(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::InvalidStatus;
        assert_eq!(format!("{}", e), "invalid task status for transition");

        let e = RuntimeError::Memory(MemoryError::AllocationFailed);
        assert_eq!(format!("{}", e), "memory error: stack allocation failed");

        let e = RuntimeError::invalid_argument("bad mapping: foo");
        assert_eq!(format!("{}", e), "invalid argument: bad mapping: foo");
    }

    #[test]
    fn test_error_conversion() {
        let err: RuntimeError = WorkerError::SpawnFailed.into();
        assert!(matches!(err, RuntimeError::Worker(WorkerError::SpawnFailed)));
    }

    #[test]
    fn test_fatal_config() {
        assert!(RuntimeError::EmptyAffinityMask { thread: 3 }.is_fatal_config());
        assert!(RuntimeError::TopologyProbe("no sysfs".into()).is_fatal_config());
        assert!(!RuntimeError::InvalidStatus.is_fatal_config());
    }
}
