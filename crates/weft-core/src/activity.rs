//! Process-wide count of schedulable work
//!
//! Incremented when a task becomes schedulable (created or woken) and
//! decremented when it terminates or suspends. Zero means quiescence,
//! independent of how many pools exist.

use core::sync::atomic::{AtomicI64, Ordering};

static GLOBAL_ACTIVITY: AtomicI64 = AtomicI64::new(0);

#[inline]
pub fn increment_global_activity_count() -> i64 {
    GLOBAL_ACTIVITY.fetch_add(1, Ordering::AcqRel) + 1
}

#[inline]
pub fn decrement_global_activity_count() -> i64 {
    let now = GLOBAL_ACTIVITY.fetch_sub(1, Ordering::AcqRel) - 1;
    debug_assert!(now >= 0, "global activity count went negative");
    now
}

#[inline]
pub fn get_global_activity_count() -> i64 {
    GLOBAL_ACTIVITY.load(Ordering::Acquire)
}

#[inline]
pub fn is_quiescent() -> bool {
    get_global_activity_count() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // The counter is global and other tests in this crate do not touch it.
    #[test]
    fn test_increment_decrement() {
        let base = get_global_activity_count();
        assert_eq!(increment_global_activity_count(), base + 1);
        assert_eq!(increment_global_activity_count(), base + 2);
        assert_eq!(decrement_global_activity_count(), base + 1);
        assert_eq!(decrement_global_activity_count(), base);
    }
}
