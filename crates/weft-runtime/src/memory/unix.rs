//! Unix stack mappings via mmap/mprotect/madvise

use weft_core::error::{MemoryError, RuntimeResult};
use weft_core::kwarn;

pub(super) fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

/// Map `len` bytes read/write and turn the lowest `guard` bytes into a guard page
pub(super) fn map_stack(len: usize, guard: usize) -> RuntimeResult<*mut u8> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed.into());
    }

    // Overflow runs into this page and faults
    let ret = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
    if ret != 0 {
        unsafe { libc::munmap(base, len) };
        return Err(MemoryError::ProtectionFailed.into());
    }
    Ok(base as *mut u8)
}

pub(super) fn unmap_stack(base: *mut u8, len: usize) {
    let ret = unsafe { libc::munmap(base as *mut libc::c_void, len) };
    if ret != 0 {
        kwarn!("munmap of stack at {:p} ({} bytes) failed", base, len);
    }
}

/// Tell the kernel the pages are unused; they read back zeroed
pub(super) fn discard(addr: *mut u8, len: usize) -> RuntimeResult<()> {
    let ret = unsafe { libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED) };
    if ret != 0 {
        return Err(MemoryError::AdviseFailed.into());
    }
    Ok(())
}
