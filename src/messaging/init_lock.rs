//! Initialization lock
//!
//! Mutual exclusion with FIFO waiters. Ownership passes to the next waiter
//! through a oneshot, so releasing never runs waiter code on the releasing
//! task. A holder older than the staleness threshold is discarded on the
//! next acquisition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::MessagingError;

struct Holder {
    token: u64,
    since: Instant,
}

struct Waiter {
    token: u64,
    tx: oneshot::Sender<Result<(), MessagingError>>,
}

#[derive(Default)]
struct LockInner {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
    next_token: u64,
}

impl LockInner {
    fn issue_token(&mut self) -> u64 {
        self.next_token = self.next_token.wrapping_add(1);
        self.next_token
    }

    fn holds(&self, token: u64) -> bool {
        self.holder.as_ref().map(|h| h.token) == Some(token)
    }

    /// Hand ownership to the first waiter that is still listening
    fn release(&mut self, token: u64) {
        if !self.holds(token) {
            return;
        }
        self.holder = None;

        while let Some(waiter) = self.waiters.pop_front() {
            self.holder = Some(Holder {
                token: waiter.token,
                since: Instant::now(),
            });
            if waiter.tx.send(Ok(())).is_ok() {
                debug!(token = waiter.token, "init_lock_handed_off");
                return;
            }
            self.holder = None;
        }
    }

    fn force_release(&mut self) -> usize {
        self.holder = None;
        let rejected = self.waiters.len();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(Err(MessagingError::LockCancelled));
        }
        rejected
    }
}

pub struct InitializationLock {
    inner: Arc<Mutex<LockInner>>,
    stale_after: Duration,
}

impl InitializationLock {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LockInner::default())),
            stale_after,
        }
    }

    /// Wait up to `timeout` in the FIFO queue for ownership
    pub async fn acquire(&self, timeout: Duration) -> Result<InitLockGuard, MessagingError> {
        let started = Instant::now();

        let (token, rx) = {
            let mut inner = self.inner.lock();

            if let Some(holder) = &inner.holder {
                let held_for = holder.since.elapsed();
                if held_for >= self.stale_after {
                    let rejected = inner.force_release();
                    warn!(
                        held_ms = held_for.as_millis() as u64,
                        rejected_waiters = rejected,
                        "init_lock_stale_released"
                    );
                }
            }

            let token = inner.issue_token();
            if inner.holder.is_none() {
                inner.holder = Some(Holder {
                    token,
                    since: Instant::now(),
                });
                return Ok(self.guard(token));
            }

            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter { token, tx });
            debug!(token, queued = inner.waiters.len(), "init_lock_waiting");
            (token, rx)
        };

        let mut pending = PendingWaiter {
            inner: Arc::clone(&self.inner),
            token,
            armed: true,
        };

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(self.guard(token)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(MessagingError::LockCancelled),
            Err(_) => {
                let mut inner = self.inner.lock();
                // Ownership may have been handed over as the timer fired
                if inner.holds(token) {
                    Ok(self.guard(token))
                } else {
                    inner.waiters.retain(|w| w.token != token);
                    Err(MessagingError::LockTimeout {
                        waited: started.elapsed(),
                    })
                }
            }
        };
        pending.armed = false;
        result
    }

    /// Discard the current holder and reject every waiter
    pub fn force_release(&self) {
        let rejected = self.inner.lock().force_release();
        if rejected > 0 {
            warn!(rejected_waiters = rejected, "init_lock_force_released");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().holder.is_some()
    }

    pub fn held_for(&self) -> Option<Duration> {
        self.inner.lock().holder.as_ref().map(|h| h.since.elapsed())
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    fn guard(&self, token: u64) -> InitLockGuard {
        InitLockGuard {
            inner: Arc::clone(&self.inner),
            token,
        }
    }
}

/// Ownership of the initialization lock; released on drop
pub struct InitLockGuard {
    inner: Arc<Mutex<LockInner>>,
    token: u64,
}

impl Drop for InitLockGuard {
    fn drop(&mut self) {
        self.inner.lock().release(self.token);
    }
}

// Cleans up if the acquiring future is dropped while queued.
struct PendingWaiter {
    inner: Arc<Mutex<LockInner>>,
    token: u64,
    armed: bool,
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.holds(self.token) {
            inner.release(self.token);
        } else {
            inner.waiters.retain(|w| w.token != self.token);
        }
    }
}
