//! Coroutine stacks
//!
//! Each stack is its own anonymous mapping with a `PROT_NONE` guard page
//! below the usable region, so an overflow faults instead of scribbling
//! over a neighbour. Finished stacks go back to a [`StackPool`] which
//! releases their physical pages and hands the mapping out again.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix as platform;
    }
}

use weft_core::error::{MemoryError, RuntimeResult};
use weft_core::SpinLock;

/// A guarded, page-aligned stack mapping
pub struct Stack {
    /// Start of the mapping (the guard page)
    base: *mut u8,
    /// Whole mapping, guard included
    len: usize,
    guard: usize,
}

// Safety: a Stack owns its mapping exclusively
unsafe impl Send for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    pub fn new(size: usize) -> RuntimeResult<Stack> {
        let page = page_size();
        let usable = round_up(size.max(page), page).ok_or(MemoryError::StackTooLarge)?;
        let len = usable.checked_add(page).ok_or(MemoryError::StackTooLarge)?;
        let base = platform::map_stack(len, page)?;
        Ok(Stack { base, len, guard: page })
    }

    /// Highest address; stacks grow down from here
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // Safety: len is the mapping size
        unsafe { self.base.add(self.len) }
    }

    /// Lowest usable address, just above the guard page
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        // Safety: guard < len
        unsafe { self.base.add(self.guard) }
    }

    /// Usable bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.len - self.guard
    }

    /// Give the physical pages back to the OS, keeping the mapping
    pub fn release_pages(&self) -> RuntimeResult<()> {
        platform::discard(self.bottom(), self.size())
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        platform::unmap_stack(self.base, self.len);
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .field("size", &self.size())
            .finish()
    }
}

/// Recycles stacks of one size
///
/// Holds at most `limit` idle stacks; beyond that, returned stacks are
/// unmapped.
pub struct StackPool {
    stack_size: usize,
    limit: usize,
    free: SpinLock<Vec<Stack>>,
}

impl StackPool {
    pub const fn new(stack_size: usize, limit: usize) -> Self {
        StackPool { stack_size, limit, free: SpinLock::new(Vec::new()) }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Reuse an idle stack or map a new one
    pub fn get(&self) -> RuntimeResult<Stack> {
        if let Some(stack) = self.free.lock().pop() {
            return Ok(stack);
        }
        Stack::new(self.stack_size)
    }

    /// Take back a stack whose coroutine finished
    pub fn put(&self, stack: Stack) {
        if stack.size() < self.stack_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() >= self.limit {
            return;
        }
        if stack.release_pages().is_ok() {
            free.push(stack);
        }
    }

    /// Idle stacks currently held
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Unmap every idle stack
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.free.lock());
        drop(drained);
    }
}

#[inline]
pub fn page_size() -> usize {
    platform::page_size()
}

fn round_up(n: usize, align: usize) -> Option<usize> {
    Some(n.checked_add(align - 1)? / align * align)
}
