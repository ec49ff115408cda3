//! Task state, restart reason, priority and scheduling hint types

use core::fmt;

/// Scheduling state of a task
///
/// Stored as a `u8` inside the task control block so that transitions can
/// be done with a single compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ScheduleState {
    /// Created or woken, waiting in a scheduler queue
    Pending = 0,

    /// Running on a worker
    Active = 1,

    /// Blocked on a dependency; resumed by an external transition
    Suspended = 2,

    /// Reschedule with a priority boost was requested while the task ran
    PendingBoost = 3,

    /// Finished; the control block only survives for outstanding queries
    Terminated = 4,
}

impl ScheduleState {
    /// Waiting in a queue (either flavour of pending)
    #[inline]
    pub const fn is_pending(self) -> bool {
        matches!(self, ScheduleState::Pending | ScheduleState::PendingBoost)
    }

    #[inline]
    pub const fn is_terminated(self) -> bool {
        matches!(self, ScheduleState::Terminated)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ScheduleState::Pending => "pending",
            ScheduleState::Active => "active",
            ScheduleState::Suspended => "suspended",
            ScheduleState::PendingBoost => "pending_boost",
            ScheduleState::Terminated => "terminated",
        }
    }
}

impl From<u8> for ScheduleState {
    fn from(v: u8) -> Self {
        match v {
            0 => ScheduleState::Pending,
            1 => ScheduleState::Active,
            2 => ScheduleState::Suspended,
            3 => ScheduleState::PendingBoost,
            _ => ScheduleState::Terminated,
        }
    }
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a suspended task was restarted
///
/// Carried as `new_state_ex` through `set_thread_state` and observable by the
/// task when its suspend call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RestartState {
    #[default]
    Unknown = 0,
    /// Woken because the dependency it waited on was satisfied
    Signaled = 1,
    Timeout = 2,
    /// Woken in order to exit
    Terminate = 3,
    Abort = 4,
}

impl From<u8> for RestartState {
    fn from(v: u8) -> Self {
        match v {
            1 => RestartState::Signaled,
            2 => RestartState::Timeout,
            3 => RestartState::Terminate,
            4 => RestartState::Abort,
            _ => RestartState::Unknown,
        }
    }
}

/// Priority class of a task
///
/// Lower discriminant is served first; `Boost` is what `PendingBoost`
/// re-enqueues at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    Boost = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const COUNT: usize = 4;

    #[inline]
    pub const fn as_index(self) -> usize {
        self as usize
    }

    pub const fn from_index(idx: usize) -> Option<Priority> {
        match idx {
            0 => Some(Priority::Boost),
            1 => Some(Priority::High),
            2 => Some(Priority::Normal),
            3 => Some(Priority::Low),
            _ => None,
        }
    }

    /// Highest to lowest
    pub fn iter() -> impl Iterator<Item = Priority> {
        [Priority::Boost, Priority::High, Priority::Normal, Priority::Low].into_iter()
    }
}

impl From<u8> for Priority {
    fn from(v: u8) -> Self {
        Priority::from_index(v as usize).unwrap_or_default()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Boost => write!(f, "BOOST"),
            Priority::High => write!(f, "HIGH"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

/// Placement hint passed along with an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleHint {
    /// Let the scheduler pick
    #[default]
    None,
    /// Prefer the queue of this pool-local worker index
    Worker(usize),
    /// Prefer a worker bound to this NUMA node
    Numa(usize),
}

impl ScheduleHint {
    #[inline]
    pub const fn worker(self) -> Option<usize> {
        match self {
            ScheduleHint::Worker(w) => Some(w),
            _ => None,
        }
    }
}

/// How a coroutine switch is expected to be used
///
/// Only a performance hint: `Yield` marks a cooperative suspend that will be
/// resumed later by a scheduler, `Invoke` marks a nested call-style resume
/// that returns to the invoker right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchHint {
    #[default]
    Yield,
    Invoke,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_state_roundtrip_u8() {
        for s in [
            ScheduleState::Pending,
            ScheduleState::Active,
            ScheduleState::Suspended,
            ScheduleState::PendingBoost,
            ScheduleState::Terminated,
        ] {
            assert_eq!(ScheduleState::from(s as u8), s);
        }
        assert!(ScheduleState::PendingBoost.is_pending());
        assert!(!ScheduleState::Active.is_pending());
        assert!(ScheduleState::Terminated.is_terminated());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Boost < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Priority::from(17u8), Priority::Normal);
        let all: Vec<_> = Priority::iter().collect();
        assert_eq!(all.len(), Priority::COUNT);
    }

    #[test]
    fn test_restart_state_from_u8() {
        assert_eq!(RestartState::from(1), RestartState::Signaled);
        assert_eq!(RestartState::from(200), RestartState::Unknown);
    }

    #[test]
    fn test_hint_worker() {
        assert_eq!(ScheduleHint::Worker(3).worker(), Some(3));
        assert_eq!(ScheduleHint::Numa(1).worker(), None);
    }
}
