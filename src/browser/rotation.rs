//! Shuffled round-robin rotation over session usernames
//!
//! The order is shuffled once at build so restarts do not hammer the same
//! session first; after that, selection walks the fixed cycle. Flag and
//! disabled checks happen at the pool layer — the rotation only hands out
//! the next candidate name.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;

#[derive(Debug)]
pub struct Rotation {
    order: Vec<String>,
    next: AtomicUsize,
}

impl Rotation {
    pub fn new(mut usernames: Vec<String>) -> Self {
        usernames.shuffle(&mut rand::rng());
        Self {
            order: usernames,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Next username in the cycle; `None` when no sessions exist
    pub fn next(&self) -> Option<&str> {
        if self.order.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.order.len();
        Some(&self.order[idx])
    }
}
