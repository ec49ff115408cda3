//! Task identifier type

use core::fmt;

/// Identifier of a task in the thread manager's task table
///
/// The low 32 bits select a table slot; the high 32 bits count how many
/// times that slot has been reused. A stale id therefore never matches the
/// task that took over its slot. `u64::MAX` is reserved as the "no task"
/// sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub const NONE: TaskId = TaskId(u64::MAX);

    /// First-generation id for `slot`
    #[inline]
    pub const fn new(slot: u32) -> Self {
        TaskId(slot as u64)
    }

    #[inline]
    pub const fn from_parts(slot: u32, generation: u32) -> Self {
        TaskId(((generation as u64) << 32) | slot as u64)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        TaskId(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn slot(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Table index of the slot
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.slot() as usize
    }

    /// Same slot, next generation
    #[inline]
    pub const fn next_generation(self) -> Self {
        let mut generation = self.generation().wrapping_add(1);
        // Skip the combination that would collide with NONE
        if self.slot() == u32::MAX && generation == u32::MAX {
            generation = 0;
        }
        TaskId::from_parts(self.slot(), generation)
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    #[inline]
    pub const fn to_option(self) -> Option<TaskId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "TaskId(NONE)")
        } else {
            write!(f, "TaskId({}:{})", self.slot(), self.generation())
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else if self.generation() == 0 {
            write!(f, "t{}", self.slot())
        } else {
            write!(f, "t{}.{}", self.slot(), self.generation())
        }
    }
}

impl Default for TaskId {
    fn default() -> Self {
        TaskId::NONE
    }
}
