// SPDX-License-Identifier: GPL-3.0-only

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Admits at most one pending resync job at a time.
///
/// `try_enter` succeeding obliges the caller to enqueue exactly one job, and
/// that job must call `leave` before it starts resyncing so events arriving
/// during the resync schedule a fresh one.
#[derive(Debug, Default)]
pub struct CoalescingGate {
    pending: Mutex<u32>,
}

impl CoalescingGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u32> {
        // The counter stays consistent even if a holder panicked.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true when the gate opened and a job must be enqueued.
    pub fn try_enter(&self) -> bool {
        let mut pending = self.lock();
        if *pending == 0 {
            *pending += 1;
            true
        } else {
            false
        }
    }

    pub fn leave(&self) {
        let mut pending = self.lock();
        if *pending > 0 {
            *pending -= 1;
        } else {
            tracing::warn!("Coalescing gate released while not held");
        }
    }

    pub fn is_pending(&self) -> bool {
        *self.lock() > 0
    }
}
