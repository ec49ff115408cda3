//! Stackful coroutines
//!
//! A [`Coroutine`] owns a guarded stack and a saved register block. The
//! resumer calls [`Coroutine::resume`]; the body runs until it calls
//! [`CoroutineSelf::suspend`] or returns. Bodies get a `&CoroutineSelf`
//! capability; code that is not handed one can look it up with
//! [`coroutine_self`].
//!
//! The thread-local "current coroutine" slot is set on resume and restored
//! to its previous value when the coroutine switches back, so nested
//! resumes unwind correctly.

use std::any::Any;
use std::cell::Cell;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};

use weft_core::error::RuntimeResult;
use weft_core::{kerror, SwitchHint};

use crate::arch::{self, Registers};
use crate::memory::Stack;

/// Body of a coroutine
pub type CoroutineFn = Box<dyn FnOnce(&CoroutineSelf) + Send + 'static>;

/// Where a coroutine is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    /// Created, never resumed
    Ready,
    /// Executing on some thread
    Running,
    /// Parked in `suspend`
    Suspended,
    /// Body returned or panicked
    Complete,
}

struct Context {
    regs: Registers,
    caller: Registers,
    state: CoroutineState,
    hint: SwitchHint,
    entry: Option<CoroutineFn>,
    panic: Option<Box<dyn Any + Send>>,
    stack: Option<Stack>,
}

/// A stackful coroutine
pub struct Coroutine {
    ctx: NonNull<Context>,
}

// Safety: the context is only touched by whichever thread currently
// resumes the coroutine, and the body is Send
unsafe impl Send for Coroutine {}

impl Coroutine {
    /// Create a coroutine running `entry` on a fresh stack of `stack_size` bytes
    pub fn create<F>(entry: F, stack_size: usize) -> RuntimeResult<Coroutine>
    where
        F: FnOnce(&CoroutineSelf) + Send + 'static,
    {
        Ok(Coroutine::with_stack(Box::new(entry), Stack::new(stack_size)?))
    }

    /// Create a coroutine on a stack taken from a pool
    pub fn with_stack(entry: CoroutineFn, stack: Stack) -> Coroutine {
        let top = stack.top();
        let ctx = NonNull::from(Box::leak(Box::new(Context {
            regs: Registers::default(),
            caller: Registers::default(),
            state: CoroutineState::Ready,
            hint: SwitchHint::default(),
            entry: Some(entry),
            panic: None,
            stack: Some(stack),
        })));
        let raw = ctx.as_ptr();
        // Safety: top is the top of the stack now owned by ctx
        unsafe { arch::init_context(&mut (*raw).regs, top, coroutine_entry, raw as usize) };
        Coroutine { ctx }
    }

    pub fn state(&self) -> CoroutineState {
        // Safety: ctx is live for the lifetime of self
        unsafe { (*self.ctx.as_ptr()).state }
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state() == CoroutineState::Complete
    }

    /// Hint the body passed on its last switch back
    pub fn last_hint(&self) -> SwitchHint {
        unsafe { (*self.ctx.as_ptr()).hint }
    }

    /// Run the body until it suspends or completes
    ///
    /// A panic in the body is re-raised here after the coroutine is marked
    /// complete.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine is running or complete.
    pub fn resume(&mut self) -> CoroutineState {
        self.resume_with(SwitchHint::Yield)
    }

    /// [`resume`](Self::resume) with an explicit switch hint
    ///
    /// Both hints take the same path on the supported architectures.
    pub fn resume_with(&mut self, hint: SwitchHint) -> CoroutineState {
        let ctx = self.ctx.as_ptr();
        // Safety: ctx is live; state checks below keep the stack exclusive
        unsafe {
            match (*ctx).state {
                CoroutineState::Ready | CoroutineState::Suspended => {}
                state => panic!("weft: resume of a {:?} coroutine", state),
            }
            (*ctx).state = CoroutineState::Running;
            (*ctx).hint = hint;

            let outer = replace_current(ctx);
            arch::switch_context(&mut (*ctx).caller, &(*ctx).regs);
            set_current(outer);

            if let Some(payload) = (*ctx).panic.take() {
                panic::resume_unwind(payload);
            }
            (*ctx).state
        }
    }

    /// Free the coroutine
    ///
    /// A suspended body is abandoned without unwinding its frames.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine is running.
    pub fn destroy(self) {
        drop(self);
    }

    /// Destroy and keep the stack for reuse (only once the body returned)
    pub fn into_stack(self) -> Option<Stack> {
        if !self.is_complete() {
            return None;
        }
        // Safety: complete, nothing runs on the stack any more
        unsafe { (*self.ctx.as_ptr()).stack.take() }
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        let ctx = self.ctx.as_ptr();
        // Safety: a running coroutine is only reachable through the &mut
        // borrow held by resume, so this is the final owner
        unsafe {
            assert!(
                (*ctx).state != CoroutineState::Running,
                "weft: destroy of a running coroutine"
            );
            drop(Box::from_raw(ctx));
        }
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine").field("state", &self.state()).finish()
    }
}

/// Handle a running coroutine has to itself
///
/// Not `Send`: it is only meaningful on the thread currently running the
/// coroutine.
#[derive(Clone)]
pub struct CoroutineSelf {
    ctx: *mut Context,
    _not_send: PhantomData<*mut ()>,
}

impl CoroutineSelf {
    /// Switch back to the resumer
    pub fn suspend(&self) {
        self.suspend_with(SwitchHint::Yield);
    }

    /// Switch back to the resumer, telling it how the switch was meant
    ///
    /// # Panics
    ///
    /// Panics when called from outside this coroutine.
    pub fn suspend_with(&self, hint: SwitchHint) {
        assert!(self.is_current(), "weft: suspend outside of its coroutine");
        let ctx = self.ctx;
        // Safety: we are running on ctx's stack, so the resumer's registers
        // in ctx.caller are valid
        unsafe {
            (*ctx).state = CoroutineState::Suspended;
            (*ctx).hint = hint;
            arch::switch_context(&mut (*ctx).regs, &(*ctx).caller);
        }
    }

    /// True when this is the innermost coroutine running on this thread
    pub fn is_current(&self) -> bool {
        ptr::eq(current(), self.ctx)
    }

    /// Hint the resumer passed
    pub fn resume_hint(&self) -> SwitchHint {
        unsafe { (*self.ctx).hint }
    }
}

impl std::fmt::Debug for CoroutineSelf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoroutineSelf").field("ctx", &self.ctx).finish()
    }
}

/// Handle to the innermost coroutine running on this thread
pub fn coroutine_self() -> Option<CoroutineSelf> {
    let ctx = current();
    (!ctx.is_null()).then_some(CoroutineSelf { ctx, _not_send: PhantomData })
}

/// True when called from inside a coroutine
pub fn in_coroutine() -> bool {
    !current().is_null()
}

unsafe extern "C" fn coroutine_entry(arg: usize) -> ! {
    let ctx = arg as *mut Context;
    let me = CoroutineSelf { ctx, _not_send: PhantomData };

    if let Some(body) = (*ctx).entry.take() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body(&me))) {
            (*ctx).panic = Some(payload);
        }
    }
    (*ctx).state = CoroutineState::Complete;
    arch::switch_context(&mut (*ctx).regs, &(*ctx).caller);

    kerror!("completed coroutine was resumed");
    std::process::abort();
}

// ============================================================================
// Thread-local slot
// ============================================================================
//
// A coroutine may suspend on one worker and resume on another, so these are
// never inlined into code that spans a switch.

thread_local! {
    static CURRENT: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
}

#[inline(never)]
fn current() -> *mut Context {
    CURRENT.with(|c| c.get())
}

#[inline(never)]
fn replace_current(ctx: *mut Context) -> *mut Context {
    CURRENT.with(|c| c.replace(ctx))
}

#[inline(never)]
fn set_current(ctx: *mut Context) {
    CURRENT.with(|c| c.set(ctx));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const STACK: usize = 256 * 1024;

    #[test]
    fn test_round_trip_counter() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let mut co = Coroutine::create(
            move |me| {
                for _ in 0..3 {
                    c.fetch_add(1, Ordering::SeqCst);
                    me.suspend();
                }
            },
            STACK,
        )
        .unwrap();

        assert_eq!(co.state(), CoroutineState::Ready);
        for expected in 1..=3 {
            assert_eq!(co.resume(), CoroutineState::Suspended);
            assert_eq!(counter.load(Ordering::SeqCst), expected);
        }
        assert_eq!(co.resume(), CoroutineState::Complete);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        co.destroy();
    }

    #[test]
    fn test_coroutine_self_tracks_nesting() {
        assert!(!in_coroutine());
        let mut outer = Coroutine::create(
            |me| {
                assert!(me.is_current());
                let mut inner = Coroutine::create(
                    |me| {
                        assert!(me.is_current());
                        me.suspend();
                    },
                    STACK,
                )
                .unwrap();
                inner.resume();
                // Back in outer after the nested switch
                assert!(me.is_current());
                assert!(coroutine_self().unwrap().is_current());
                inner.resume();
                assert!(inner.is_complete());
            },
            STACK,
        )
        .unwrap();
        assert_eq!(outer.resume(), CoroutineState::Complete);
        assert!(coroutine_self().is_none());
    }

    #[test]
    fn test_hints_are_visible_on_both_sides() {
        let mut co = Coroutine::create(
            |me| {
                assert_eq!(me.resume_hint(), SwitchHint::Invoke);
                me.suspend_with(SwitchHint::Invoke);
            },
            STACK,
        )
        .unwrap();
        co.resume_with(SwitchHint::Invoke);
        assert_eq!(co.last_hint(), SwitchHint::Invoke);
        co.resume();
        assert!(co.is_complete());
    }

    #[test]
    fn test_panic_reaches_resumer() {
        let mut co = Coroutine::create(|_| panic!("boom"), STACK).unwrap();
        let err = panic::catch_unwind(AssertUnwindSafe(|| co.resume())).unwrap_err();
        assert_eq!(err.downcast_ref::<&str>(), Some(&"boom"));
        assert!(co.is_complete());
        assert!(!in_coroutine());
    }

    #[test]
    #[should_panic(expected = "resume of a Complete coroutine")]
    fn test_resume_completed_panics() {
        let mut co = Coroutine::create(|_| {}, STACK).unwrap();
        co.resume();
        co.resume();
    }

    #[test]
    #[should_panic(expected = "suspend outside of its coroutine")]
    fn test_suspend_outside_panics() {
        let co = Coroutine::create(|_| {}, STACK).unwrap();
        let handle = CoroutineSelf { ctx: co.ctx.as_ptr(), _not_send: PhantomData };
        handle.suspend();
    }

    #[test]
    fn test_resume_on_another_thread() {
        let hops = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hops);
        let mut co = Coroutine::create(
            move |me| {
                let mut names = Vec::new();
                for _ in 0..2 {
                    names.push(std::thread::current().name().map(str::to_owned));
                    h.fetch_add(1, Ordering::SeqCst);
                    me.suspend();
                }
                assert_ne!(names[0], names[1]);
            },
            STACK,
        )
        .unwrap();

        co = std::thread::Builder::new()
            .name("first".into())
            .spawn(move || {
                co.resume();
                co
            })
            .unwrap()
            .join()
            .unwrap();
        co = std::thread::Builder::new()
            .name("second".into())
            .spawn(move || {
                co.resume();
                co.resume();
                co
            })
            .unwrap()
            .join()
            .unwrap();
        assert!(co.is_complete());
        assert_eq!(hops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stack_reuse() {
        let mut co = Coroutine::create(|_| {}, STACK).unwrap();
        co.resume();
        let stack = co.into_stack().unwrap();
        let mut again = Coroutine::with_stack(Box::new(|me| me.suspend()), stack);
        assert_eq!(again.resume(), CoroutineState::Suspended);
        assert!(again.into_stack().is_none());
    }
}
