//! Wake Latch
//!
//! Per-backend wake signal. Setting is sticky until the owner resets it,
//! and several sets before a reset collapse into one.

use parking_lot::{Condvar, Mutex};

/// A resettable, sticky wake-up flag
#[derive(Debug, Default)]
pub struct Latch {
    is_set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Create an unset latch
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch, waking the owner if it is blocked
    pub fn set(&self) {
        let mut is_set = self.is_set.lock();
        if !*is_set {
            *is_set = true;
            self.cond.notify_all();
        }
    }

    /// Clear the latch. Only the owner resets, and always before it
    /// re-checks the condition it is waiting for.
    pub fn reset(&self) {
        *self.is_set.lock() = false;
    }

    /// Whether the latch is currently set
    pub fn is_set(&self) -> bool {
        *self.is_set.lock()
    }

    /// Block until the latch is set. Returns immediately if it already is.
    pub fn wait(&self) {
        let mut is_set = self.is_set.lock();
        while !*is_set {
            self.cond.wait(&mut is_set);
        }
    }
}
