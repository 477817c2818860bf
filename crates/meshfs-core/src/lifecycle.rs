//! Busy-lock lifecycle gate: admits operations while running, drains on stop.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use tokio::sync::Notify;

const RUNNING: u8 = 0;
const BLOCKING: u8 = 1;
const BLOCKED: u8 = 2;

/// Gate that every public operation passes through.
///
/// `enter` succeeds only while the gate is running; once `block` has been
/// called it fails permanently. `block` waits for all admitted operations to
/// leave before returning.
#[derive(Debug)]
pub struct BusyLock {
    state: AtomicU8,
    active: AtomicUsize,
    drained: Notify,
}

/// Proof of admission; leaving happens on drop.
#[derive(Debug)]
pub struct BusyGuard<'a> {
    lock: &'a BusyLock,
}

impl BusyLock {
    /// Creates a running gate.
    pub fn new() -> Self {
        BusyLock {
            state: AtomicU8::new(RUNNING),
            active: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Attempts to enter the busy section. Returns `None` once blocked.
    pub fn enter(&self) -> Option<BusyGuard<'_>> {
        if self.state.load(Ordering::Acquire) != RUNNING {
            return None;
        }

        self.active.fetch_add(1, Ordering::AcqRel);

        // Re-check: block() may have flipped the state between the first
        // load and the increment.
        if self.state.load(Ordering::Acquire) != RUNNING {
            self.leave();
            return None;
        }

        Some(BusyGuard { lock: self })
    }

    fn leave(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Blocks new entries and waits until every admitted operation left.
    pub async fn block(&self) {
        self.state.store(BLOCKING, Ordering::Release);

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);

            // Register before checking the counter, so a leave() racing
            // with this check cannot be missed.
            notified.as_mut().enable();

            if self.active.load(Ordering::Acquire) == 0 {
                break;
            }

            notified.await;
        }

        self.state.store(BLOCKED, Ordering::Release);
    }

    /// True once `block` has been invoked.
    pub fn is_blocked(&self) -> bool {
        self.state.load(Ordering::Acquire) != RUNNING
    }
}

impl Default for BusyLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.lock.leave();
    }
}
