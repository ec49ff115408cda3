//! Reusable spinning barrier
//!
//! `N` participants block in [`Barrier::wait`] until all of them arrived.
//! A generation counter separates phases, so a thread that leaves one phase
//! and immediately calls `wait` again is counted toward the next phase.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::spinlock::Backoff;

pub struct Barrier {
    participants: usize,
    arrived: AtomicUsize,
    generation: AtomicUsize,
}

impl Barrier {
    /// # Panics
    ///
    /// Panics if `participants` is zero.
    pub fn new(participants: usize) -> Self {
        assert!(participants > 0, "barrier needs at least one participant");
        Self {
            participants,
            arrived: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    /// Completed phases
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    /// Block until all participants arrived; returns true on exactly one
    /// thread per phase (the last to arrive).
    pub fn wait(&self) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.participants {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            return true;
        }

        let mut backoff = Backoff::new();
        while self.generation.load(Ordering::Acquire) == generation {
            backoff.snooze();
        }
        false
    }
}
