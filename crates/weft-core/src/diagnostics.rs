//! Process-wide diagnostic toggles
//!
//! The detectors are compiled in by the `deadlock-detection` and
//! `queue-waittime` features. Without the feature the setters still exist
//! but the matching `*_enabled()` query always reports false, so callers can
//! toggle unconditionally.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

static SPINLOCK_DEADLOCK_DETECTION: AtomicBool = AtomicBool::new(false);
static SPINLOCK_DEADLOCK_LIMIT: AtomicUsize = AtomicUsize::new(1 << 24);

static DEADLOCK_DETECTION: AtomicBool = AtomicBool::new(false);
static DEADLOCK_THRESHOLD_US: AtomicU64 = AtomicU64::new(10_000_000);
static DEADLOCK_ABORT: AtomicBool = AtomicBool::new(false);

static QUEUE_WAIT_TIMES: AtomicBool = AtomicBool::new(false);

// --- spinlock -------------------------------------------------------------

pub fn set_spinlock_deadlock_detection_enabled(enabled: bool) {
    SPINLOCK_DEADLOCK_DETECTION.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn spinlock_deadlock_detection_enabled() -> bool {
    cfg!(feature = "deadlock-detection") && SPINLOCK_DEADLOCK_DETECTION.load(Ordering::Relaxed)
}

/// Spin iterations a lock acquisition may take before the process aborts
pub fn set_spinlock_deadlock_detection_limit(limit: usize) {
    SPINLOCK_DEADLOCK_LIMIT.store(limit.max(1), Ordering::Relaxed);
}

#[inline]
pub fn spinlock_deadlock_detection_limit() -> usize {
    SPINLOCK_DEADLOCK_LIMIT.load(Ordering::Relaxed)
}

// --- scheduler ------------------------------------------------------------

pub fn set_deadlock_detection_enabled(enabled: bool) {
    DEADLOCK_DETECTION.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn deadlock_detection_enabled() -> bool {
    cfg!(feature = "deadlock-detection") && DEADLOCK_DETECTION.load(Ordering::Relaxed)
}

/// How long a pool may hold only suspended tasks before it is reported
pub fn set_deadlock_threshold(threshold: Duration) {
    DEADLOCK_THRESHOLD_US.store(threshold.as_micros() as u64, Ordering::Relaxed);
}

pub fn deadlock_threshold() -> Duration {
    Duration::from_micros(DEADLOCK_THRESHOLD_US.load(Ordering::Relaxed))
}

/// Abort the process (instead of only logging) when a stall is detected
pub fn set_deadlock_abort(abort: bool) {
    DEADLOCK_ABORT.store(abort, Ordering::Relaxed);
}

pub fn deadlock_abort() -> bool {
    DEADLOCK_ABORT.load(Ordering::Relaxed)
}

pub fn set_maintain_queue_wait_times_enabled(enabled: bool) {
    QUEUE_WAIT_TIMES.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn maintain_queue_wait_times_enabled() -> bool {
    cfg!(feature = "queue-waittime") && QUEUE_WAIT_TIMES.load(Ordering::Relaxed)
}
