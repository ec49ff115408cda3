//! Global runtime lifecycle states
//!
//! ```text
//! Invalid -> Initialized -> PreStartup -> Startup -> PreMain -> Starting -> Running
//! Running <-> Suspended
//! Running -> PreSleep -> Sleeping -> Running
//! Running -> PreShutdown -> Shutdown -> Stopping -> Terminating -> Stopped
//! ```

use core::fmt;
use core::sync::atomic::{AtomicI8, Ordering};

/// Lifecycle state of the runtime, ordered by progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i8)]
pub enum RuntimeState {
    Invalid = -1,
    Initialized = 0,
    PreStartup = 1,
    Startup = 2,
    PreMain = 3,
    Starting = 4,
    Running = 5,
    Suspended = 6,
    PreSleep = 7,
    Sleeping = 8,
    PreShutdown = 9,
    Shutdown = 10,
    Stopping = 11,
    Terminating = 12,
    Stopped = 13,
}

impl RuntimeState {
    /// Number of states after `Invalid`
    pub const COUNT: usize = 14;

    pub const fn from_i8(v: i8) -> RuntimeState {
        match v {
            0 => RuntimeState::Initialized,
            1 => RuntimeState::PreStartup,
            2 => RuntimeState::Startup,
            3 => RuntimeState::PreMain,
            4 => RuntimeState::Starting,
            5 => RuntimeState::Running,
            6 => RuntimeState::Suspended,
            7 => RuntimeState::PreSleep,
            8 => RuntimeState::Sleeping,
            9 => RuntimeState::PreShutdown,
            10 => RuntimeState::Shutdown,
            11 => RuntimeState::Stopping,
            12 => RuntimeState::Terminating,
            13 => RuntimeState::Stopped,
            _ => RuntimeState::Invalid,
        }
    }

    /// Single-step successors permitted from `self`
    pub const fn can_transition_to(self, next: RuntimeState) -> bool {
        use RuntimeState::*;
        matches!(
            (self, next),
            (Invalid, Initialized)
                | (Initialized, PreStartup)
                | (PreStartup, Startup)
                | (Startup, PreMain)
                | (PreMain, Starting)
                | (Starting, Running)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Running, PreSleep)
                | (PreSleep, Sleeping)
                | (Sleeping, Running)
                | (Running, PreShutdown)
                | (PreShutdown, Shutdown)
                | (Shutdown, Stopping)
                | (Stopping, Terminating)
                | (Terminating, Stopped)
        )
    }

    /// Answer for "is the runtime in `self`?" when no runtime exists:
    /// a missing runtime is treated as not yet up or already down.
    #[inline]
    pub const fn assumed_without_runtime(self) -> bool {
        (self as i8) <= RuntimeState::Starting as i8 || (self as i8) >= RuntimeState::Stopping as i8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            RuntimeState::Invalid => "invalid",
            RuntimeState::Initialized => "initialized",
            RuntimeState::PreStartup => "pre_startup",
            RuntimeState::Startup => "startup",
            RuntimeState::PreMain => "pre_main",
            RuntimeState::Starting => "starting",
            RuntimeState::Running => "running",
            RuntimeState::Suspended => "suspended",
            RuntimeState::PreSleep => "pre_sleep",
            RuntimeState::Sleeping => "sleeping",
            RuntimeState::PreShutdown => "pre_shutdown",
            RuntimeState::Shutdown => "shutdown",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Terminating => "terminating",
            RuntimeState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one authoritative, atomically updated copy of a runtime's state
#[derive(Debug)]
pub struct AtomicRuntimeState(AtomicI8);

impl AtomicRuntimeState {
    pub const fn new(state: RuntimeState) -> Self {
        AtomicRuntimeState(AtomicI8::new(state as i8))
    }

    #[inline]
    pub fn load(&self) -> RuntimeState {
        RuntimeState::from_i8(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to` if the current value is `from` and the edge exists
    ///
    /// Returns the observed state on failure.
    pub fn transition(&self, from: RuntimeState, to: RuntimeState) -> Result<(), RuntimeState> {
        if !from.can_transition_to(to) {
            return Err(self.load());
        }
        self.0
            .compare_exchange(from as i8, to as i8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(RuntimeState::from_i8)
    }

    /// Advance along the startup/shutdown chain until `target` is reached
    ///
    /// Each hop uses [`transition`](Self::transition), so a concurrent mover
    /// makes this fail with the state it observed.
    pub fn advance_to(
        &self,
        target: RuntimeState,
        mut on_enter: impl FnMut(RuntimeState),
    ) -> Result<(), RuntimeState> {
        loop {
            let current = self.load();
            if current == target {
                return Ok(());
            }
            let next = match next_on_path(current, target) {
                Some(n) => n,
                None => return Err(current),
            };
            self.transition(current, next)?;
            on_enter(next);
        }
    }
}

/// Next hop from `from` toward `target` along the lifecycle graph
fn next_on_path(from: RuntimeState, target: RuntimeState) -> Option<RuntimeState> {
    use RuntimeState::*;
    let next = match (from, target) {
        (Running, Suspended) => Suspended,
        (Suspended, _) => Running,
        (Running, PreSleep) | (Running, Sleeping) => PreSleep,
        (PreSleep, _) => Sleeping,
        (Sleeping, _) => Running,
        (Running, t) if t >= PreShutdown => PreShutdown,
        (f, t) if f < Running && t > f => RuntimeState::from_i8(f as i8 + 1),
        (f, t) if f >= PreShutdown && t > f => RuntimeState::from_i8(f as i8 + 1),
        _ => return None,
    };
    if from.can_transition_to(next) {
        Some(next)
    } else {
        None
    }
}
