//! Architecture-specific context switching
//!
//! Each backend provides a `Registers` block holding the callee-saved state
//! of a suspended context, `init_context` to prepare a fresh stack so that
//! the first switch lands in an entry function, and `switch_context` to save
//! the current context and resume another.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::{init_context, switch_context, Registers};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::{init_context, switch_context, Registers};
    } else {
        compile_error!("weft context switching supports x86_64 and aarch64 only");
    }
}

/// Entry of a fresh context; it must switch away instead of returning
pub type EntryFn = unsafe extern "C" fn(usize) -> !;
