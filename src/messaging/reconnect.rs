//! Reconnect backoff and retry timer
//!
//! At most one retry timer is outstanding. Arming a new one aborts the
//! previous timer; a timer that has already fired is not affected.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::config::ReconnectConfig;

/// Backoff before jitter: `min(base * multiplier^(attempt-1), cap)`
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(64) as i32;
    let raw = config.base_delay.as_secs_f64() * config.multiplier.powi(exponent);
    let capped = raw.min(config.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped.max(0.0))
}

/// Apply a uniform jitter factor in `[jitter_min, jitter_max)`
pub fn with_jitter(config: &ReconnectConfig, delay: Duration) -> Duration {
    let factor = if config.jitter_max > config.jitter_min {
        rand::thread_rng().gen_range(config.jitter_min..config.jitter_max)
    } else {
        config.jitter_min
    };
    delay.mul_f64(factor.max(0.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: u32, delay: Duration },
    /// Attempts exceeded the configured maximum; nothing was armed
    Exhausted { attempts: u32 },
}

struct PendingRetry {
    generation: u64,
    attempt: u32,
    due_at: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    pending: Option<PendingRetry>,
    generation: u64,
}

pub struct ReconnectScheduler {
    config: ReconnectConfig,
    slot: Arc<Mutex<TimerSlot>>,
}

impl ReconnectScheduler {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            slot: Arc::new(Mutex::new(TimerSlot::default())),
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Arm a one-shot timer running `task` for retry number `attempt`.
    ///
    /// `min_delay` lets the caller stretch the delay, e.g. to an open
    /// breaker's remaining cooldown.
    pub fn schedule<F>(&self, attempt: u32, min_delay: Option<Duration>, task: F) -> RetryDecision
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if attempt > self.config.max_attempts {
            self.cancel();
            return RetryDecision::Exhausted {
                attempts: attempt.saturating_sub(1),
            };
        }

        let delay = with_jitter(&self.config, backoff_delay(&self.config, attempt))
            .max(min_delay.unwrap_or_default());

        let mut slot = self.slot.lock();
        if let Some(previous) = slot.pending.take() {
            previous.handle.abort();
            debug!(attempt = previous.attempt, "reconnect_timer_replaced");
        }
        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;

        let timer_slot = Arc::clone(&self.slot);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                // Claim our own slot so a cancel issued by the task does not abort it
                let mut slot = timer_slot.lock();
                match slot.pending.as_ref() {
                    Some(p) if p.generation == generation => {
                        slot.pending = None;
                    }
                    _ => return,
                }
            }
            task.await;
        });

        slot.pending = Some(PendingRetry {
            generation,
            attempt,
            due_at: Instant::now() + delay,
            handle,
        });

        RetryDecision::Scheduled { attempt, delay }
    }

    /// Cancel the outstanding timer; returns true if one was armed
    pub fn cancel(&self) -> bool {
        match self.slot.lock().pending.take() {
            Some(pending) => {
                pending.handle.abort();
                debug!(attempt = pending.attempt, "reconnect_timer_cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    /// Time until the outstanding timer fires
    pub fn pending_due_in(&self) -> Option<Duration> {
        self.slot
            .lock()
            .pending
            .as_ref()
            .map(|p| p.due_at.saturating_duration_since(Instant::now()))
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        if let Some(pending) = self.slot.lock().pending.take() {
            pending.handle.abort();
        }
    }
}
