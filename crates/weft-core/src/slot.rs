//! Task id allocator
//!
//! Hands out `TaskId`s over a dense range of slots below a fixed capacity.
//! Released slots go on a LIFO stack and are reused first, keeping the task
//! table compact. Each reuse bumps the slot's generation, so the new id
//! differs from every id the slot carried before.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{RuntimeError, RuntimeResult};
use crate::id::TaskId;
use crate::spinlock::SpinLock;

pub struct SlotAllocator {
    free_stack: SpinLock<Vec<TaskId>>,
    next_fresh: AtomicU32,
    max_slots: u32,
    allocated: AtomicU32,
}

impl SlotAllocator {
    pub fn new(max_slots: usize) -> Self {
        let max_slots = max_slots.min(u32::MAX as usize - 1) as u32;
        Self {
            free_stack: SpinLock::new(Vec::new()),
            next_fresh: AtomicU32::new(0),
            max_slots,
            allocated: AtomicU32::new(0),
        }
    }

    /// Reuse the most recently released slot, or take a fresh one
    pub fn allocate(&self) -> RuntimeResult<TaskId> {
        if let Some(id) = self.free_stack.lock().pop() {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        let claimed = self
            .next_fresh
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_slots).then_some(n + 1)
            })
            .map_err(|_| RuntimeError::NoSlotsAvailable)?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(TaskId::new(claimed))
    }

    pub fn release(&self, id: TaskId) {
        if id.is_none() {
            return;
        }
        self.free_stack.lock().push(id.next_generation());
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn allocated_count(&self) -> u32 {
        self.allocated.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    /// Highest slot ever handed out plus one
    #[inline]
    pub fn high_water(&self) -> u32 {
        self.next_fresh.load(Ordering::Acquire)
    }
}
