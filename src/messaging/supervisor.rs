//! Session supervisor
//!
//! Owns the single transport session and drives it through the lifecycle:
//! - `initialize` serializes bootstrap attempts (one in flight; concurrent
//!   callers share its outcome) and runs them inside the bootstrap breaker
//! - lifecycle events from the transport are pumped into the state machine
//! - failures hand over to the reconnect scheduler unless the operator
//!   asked for the disconnect
//! - `send` runs an ordered batch through the send breaker and records
//!   every successful message id in the delivery tracker

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitStatus};
use super::config::MessagingConfig;
use super::delivery::DeliveryTracker;
use super::error::MessagingError;
use super::events::{EventBus, MessagingEvent, ObserverHandle, PairingSession};
use super::init_lock::InitializationLock;
use super::reconnect::{ReconnectScheduler, RetryDecision};
use super::state::{ConnectionPhase, ConnectionStateMachine, ErrorRecord, SessionEvent};
use super::transport::{AuthConfig, Transport, TransportEvent, TransportSession};
use crate::storage::DeliveryStore;

// ============================================================================
// Public types
// ============================================================================

/// How a successful `initialize` resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InitOutcome {
    Connected,
    /// A pairing code is waiting to be scanned
    Pairing { code: Option<String> },
}

/// One item of an outbound batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub request_id: String,
    pub address: String,
    pub body: String,
}

/// Per-item result of `send`; item failures never fail the batch
#[derive(Debug, Clone)]
pub struct SendResult {
    pub request_id: String,
    pub address: String,
    /// Transport message id on success
    pub outcome: Result<String, MessagingError>,
}

impl SendResult {
    pub fn is_sent(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub phase: ConnectionPhase,
    pub ready: bool,
    pub reconnect_attempts: u32,
    pub last_error: Option<ErrorRecord>,
    pub manual_disconnect_requested: bool,
    pub connected_since: Option<DateTime<Utc>>,
    pub initializing: bool,
    pub pairing: Option<PairingSession>,
    pub observers: usize,
    pub bootstrap_breaker: CircuitStatus,
    pub send_breaker: CircuitStatus,
    pub lock_held_ms: Option<u64>,
    pub retry_due_in_ms: Option<u64>,
    pub tracked_messages: usize,
}

// ============================================================================
// Internals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownMode {
    /// Close the session, keep stored auth
    Destroy,
    /// Close the session and invalidate stored auth
    Logout,
}

struct Attached {
    generation: u64,
    session: Arc<dyn TransportSession>,
}

enum BootstrapSignal {
    Transport(TransportEvent),
    Cancelled,
}

/// Routes lifecycle events of the session being bootstrapped to the
/// bootstrap task instead of the general handler
struct BootstrapSink {
    generation: u64,
    tx: mpsc::UnboundedSender<BootstrapSignal>,
}

struct SinkGuard<'a> {
    slot: &'a Mutex<Option<BootstrapSink>>,
    generation: u64,
}

impl Drop for SinkGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|s| s.generation) == Some(self.generation) {
            *slot = None;
        }
    }
}

type SharedOutcome = Option<Result<InitOutcome, MessagingError>>;

struct InFlight {
    id: u64,
    rx: watch::Receiver<SharedOutcome>,
}

struct DestroyGuard<'a>(&'a ConnectionStateMachine);

impl<'a> DestroyGuard<'a> {
    fn begin(state: &'a ConnectionStateMachine) -> Option<Self> {
        state.begin_destroy().then(|| Self(state))
    }
}

impl Drop for DestroyGuard<'_> {
    fn drop(&mut self) {
        self.0.end_destroy();
    }
}

type RetryFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct SessionSupervisor {
    config: MessagingConfig,
    auth: AuthConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DeliveryStore>,
    events: Arc<EventBus>,
    state: ConnectionStateMachine,
    lock: InitializationLock,
    bootstrap_breaker: CircuitBreaker,
    send_breaker: CircuitBreaker,
    scheduler: ReconnectScheduler,
    tracker: DeliveryTracker,
    session: RwLock<Option<Attached>>,
    generation: AtomicU64,
    bootstrap_sink: Mutex<Option<BootstrapSink>>,
    in_flight: Mutex<Option<InFlight>>,
    attempt_ids: AtomicU64,
}

impl SessionSupervisor {
    pub fn new(
        config: MessagingConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DeliveryStore>,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::default());
        let auth = AuthConfig {
            client_id: config.client_id.clone(),
            data_path: config.auth_data_path.clone(),
        };

        Arc::new(Self {
            auth,
            state: ConnectionStateMachine::new(Arc::clone(&events)),
            lock: InitializationLock::new(config.init_timeout),
            bootstrap_breaker: CircuitBreaker::new("bootstrap", config.bootstrap_breaker.clone()),
            send_breaker: CircuitBreaker::new("send", config.send_breaker.clone()),
            scheduler: ReconnectScheduler::new(config.reconnect.clone()),
            tracker: DeliveryTracker::new(
                config.delivery.clone(),
                Arc::clone(&store),
                Arc::clone(&events),
            ),
            transport,
            store,
            events,
            session: RwLock::new(None),
            generation: AtomicU64::new(0),
            bootstrap_sink: Mutex::new(None),
            in_flight: Mutex::new(None),
            attempt_ids: AtomicU64::new(0),
            config,
        })
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Bring the session up. An explicit call clears a previous manual
    /// disconnect.
    pub async fn initialize(self: &Arc<Self>, force: bool) -> Result<InitOutcome, MessagingError> {
        self.state.set_manual_disconnect(false);
        self.initialize_inner(force).await
    }

    async fn initialize_inner(self: &Arc<Self>, force: bool) -> Result<InitOutcome, MessagingError> {
        if !force && self.is_ready() {
            return Ok(InitOutcome::Connected);
        }

        let (rx, bound) = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(in_flight) if !force => {
                    debug!(attempt = in_flight.id, "initialize_joined_in_flight");
                    (in_flight.rx.clone(), self.config.lock_timeout)
                }
                _ => {
                    let id = self.attempt_ids.fetch_add(1, Ordering::Relaxed) + 1;
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(InFlight { id, rx: rx.clone() });

                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        let result = this.run_attempt(force).await;
                        let _ = tx.send(Some(result));
                        this.clear_in_flight(id);
                    });
                    (rx, self.config.lock_timeout + self.config.init_timeout)
                }
            }
        };

        Self::await_outcome(rx, bound).await
    }

    async fn await_outcome(
        mut rx: watch::Receiver<SharedOutcome>,
        bound: Duration,
    ) -> Result<InitOutcome, MessagingError> {
        let started = Instant::now();
        match tokio::time::timeout(bound, rx.wait_for(|outcome| outcome.is_some())).await {
            Ok(Ok(outcome)) => outcome.clone().unwrap_or_else(|| {
                Err(MessagingError::Transport(
                    "initialization outcome missing".to_string(),
                ))
            }),
            Ok(Err(_)) => Err(MessagingError::Transport(
                "initialization task ended without an outcome".to_string(),
            )),
            Err(_) => Err(MessagingError::LockTimeout {
                waited: started.elapsed(),
            }),
        }
    }

    fn clear_in_flight(&self, id: u64) {
        let mut slot = self.in_flight.lock();
        if slot.as_ref().map(|f| f.id) == Some(id) {
            *slot = None;
        }
    }

    async fn run_attempt(self: &Arc<Self>, force: bool) -> Result<InitOutcome, MessagingError> {
        let _lock = self
            .lock
            .acquire(self.config.lock_timeout)
            .await
            .map_err(|e| {
                warn!(error = %e, "init_lock_unavailable");
                e
            })?;

        if force {
            self.teardown("forced restart", TeardownMode::Destroy).await;
        } else if let Some(outcome) = self.settled_outcome() {
            debug!(?outcome, "initialize_already_settled");
            return Ok(outcome);
        }

        // A half-paired session from an earlier attempt is replaced
        if let Some(stale) = self.detach() {
            self.close_session(stale, TeardownMode::Destroy).await;
        }

        if let Err(illegal) = self.state.apply(SessionEvent::InitializeRequested, "initialize") {
            return Err(MessagingError::NotReady {
                phase: illegal.from,
            });
        }
        self.events.publish(MessagingEvent::Initializing { force });

        let init_deadline = Instant::now() + self.config.init_timeout;
        let result = self
            .bootstrap_breaker
            .execute(|| self.bootstrap(init_deadline))
            .await;

        match result {
            Ok(outcome) => {
                info!(?outcome, "initialize_completed");
                Ok(outcome)
            }
            Err(e) => {
                self.handle_bootstrap_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Outcome for a caller that arrives after the work is already done
    fn settled_outcome(&self) -> Option<InitOutcome> {
        let attached = self.session.read().is_some();
        match self.state.phase() {
            ConnectionPhase::Connected if attached => Some(InitOutcome::Connected),
            ConnectionPhase::Initializing if attached => self
                .events
                .pairing()
                .map(|p| InitOutcome::Pairing { code: Some(p.code) }),
            _ => None,
        }
    }

    /// `init_deadline` bounds the attempt until a pairing code arrives; from
    /// then on the pairing window decides.
    async fn bootstrap(self: &Arc<Self>, init_deadline: Instant) -> Result<InitOutcome, MessagingError> {
        let timed_out = MessagingError::InitTimeout {
            after: self.config.init_timeout,
        };
        let handle = tokio::time::timeout_at(init_deadline, self.transport.create_session(&self.auth))
            .await
            .map_err(|_| timed_out.clone())?
            .map_err(MessagingError::transport)?;

        let (tx, mut signals) = mpsc::unbounded_channel();
        let generation = self.attach(handle.session, tx);
        let sink = SinkGuard {
            slot: &self.bootstrap_sink,
            generation,
        };
        self.spawn_event_pump(generation, handle.events);
        debug!(generation, "transport_session_created");

        // Teardown may have run while the session was being created
        if self.state.phase() != ConnectionPhase::Initializing {
            drop(sink);
            self.abandon(generation).await;
            return Err(MessagingError::LockCancelled);
        }

        let mut pairing_deadline: Option<Instant> = None;
        loop {
            let deadline = pairing_deadline.unwrap_or(init_deadline);
            let signal = match tokio::time::timeout_at(deadline, signals.recv()).await {
                Ok(signal) => signal,
                Err(_) if pairing_deadline.is_some() => {
                    drop(sink);
                    return self.finish_pairing(generation, signals).await;
                }
                Err(_) => return Err(timed_out),
            };

            match signal {
                Some(BootstrapSignal::Transport(TransportEvent::Ready)) => {
                    if !self.mark_connected("transport ready") {
                        drop(sink);
                        self.abandon(generation).await;
                        return Err(MessagingError::LockCancelled);
                    }
                    drop(sink);
                    self.drain_signals(generation, signals).await;
                    return Ok(InitOutcome::Connected);
                }
                Some(BootstrapSignal::Transport(TransportEvent::PairingCode(code))) => {
                    self.events.set_pairing(code);
                    if pairing_deadline.is_none() {
                        info!(
                            pairing_timeout_ms = millis(self.config.pairing_timeout),
                            "pairing_code_issued"
                        );
                        pairing_deadline = Some(Instant::now() + self.config.pairing_timeout);
                    }
                }
                Some(BootstrapSignal::Transport(TransportEvent::AuthFailure(msg))) => {
                    return Err(MessagingError::AuthFailure(msg));
                }
                Some(BootstrapSignal::Transport(TransportEvent::Disconnected(reason))) => {
                    return Err(MessagingError::Transport(format!(
                        "disconnected during initialization: {}",
                        reason
                    )));
                }
                Some(BootstrapSignal::Transport(TransportEvent::MessageAcknowledged { .. })) => {}
                Some(BootstrapSignal::Cancelled) => return Err(MessagingError::LockCancelled),
                None => {
                    return Err(MessagingError::Transport(
                        "bootstrap signal channel closed".to_string(),
                    ))
                }
            }
        }
    }

    /// The pairing window elapsed: keep the session and report `Pairing`
    async fn finish_pairing(
        self: &Arc<Self>,
        generation: u64,
        signals: mpsc::UnboundedReceiver<BootstrapSignal>,
    ) -> Result<InitOutcome, MessagingError> {
        let _ = self
            .state
            .apply(SessionEvent::PairingTimedOut, "pairing window elapsed");
        info!("pairing_window_elapsed");

        // Ready may have raced the deadline
        self.drain_signals(generation, signals).await;
        if self.is_ready() {
            return Ok(InitOutcome::Connected);
        }
        Ok(InitOutcome::Pairing {
            code: self.events.pairing().map(|p| p.code),
        })
    }

    async fn drain_signals(
        self: &Arc<Self>,
        generation: u64,
        mut signals: mpsc::UnboundedReceiver<BootstrapSignal>,
    ) {
        while let Ok(signal) = signals.try_recv() {
            if let BootstrapSignal::Transport(event) = signal {
                self.handle_lifecycle(generation, event).await;
            }
        }
    }

    async fn handle_bootstrap_failure(self: &Arc<Self>, err: &MessagingError) {
        let manual = self.state.manual_disconnect_requested();
        if matches!(err, MessagingError::LockCancelled)
            || (manual && self.state.phase() == ConnectionPhase::Disconnected)
        {
            info!(error = %err, "initialize_cancelled");
            return;
        }

        if let Some(session) = self.detach() {
            self.close_session(session, TeardownMode::Destroy).await;
        }
        self.events.clear_pairing();

        let event = match err {
            MessagingError::AuthFailure(_) => SessionEvent::AuthFailed,
            _ => SessionEvent::BootstrapFailed,
        };
        let _ = self.state.apply(event, err.kind());
        self.state.record_error(err);
        warn!(error = %err, kind = err.kind(), "initialize_failed");

        if manual {
            debug!("reconnect_suppressed_manual_disconnect");
            return;
        }
        self.schedule_retry(err);
    }

    // ------------------------------------------------------------------
    // Reconnect
    // ------------------------------------------------------------------

    fn schedule_retry(self: &Arc<Self>, err: &MessagingError) {
        let attempt = self.state.increment_attempts();
        let task = Self::retry_task(Arc::downgrade(self));

        match self.scheduler.schedule(attempt, err.retry_after(), task) {
            RetryDecision::Scheduled { attempt, delay } => {
                info!(
                    attempt,
                    delay_ms = millis(delay),
                    reason = err.kind(),
                    "reconnect_scheduled"
                );
            }
            RetryDecision::Exhausted { attempts } => {
                error!(attempts, reason = err.kind(), "reconnect_attempts_exhausted");
                self.bootstrap_breaker.trip("reconnect_exhausted");
            }
        }
    }

    fn retry_task(supervisor: Weak<Self>) -> RetryFuture {
        Box::pin(async move {
            let Some(this) = supervisor.upgrade() else {
                return;
            };
            if this.state.manual_disconnect_requested() {
                debug!("reconnect_skipped_manual_disconnect");
                return;
            }
            match this.initialize_inner(false).await {
                Ok(outcome) => debug!(?outcome, "reconnect_attempt_finished"),
                Err(e) => debug!(error = %e, "reconnect_attempt_failed"),
            }
        })
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    fn spawn_event_pump(self: &Arc<Self>, generation: u64, mut events: mpsc::Receiver<TransportEvent>) {
        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = supervisor.upgrade() else {
                    return;
                };
                this.dispatch(generation, event).await;
            }

            if let Some(this) = supervisor.upgrade() {
                if this.is_current(generation) {
                    this.dispatch(
                        generation,
                        TransportEvent::Disconnected("transport event stream closed".to_string()),
                    )
                    .await;
                }
            }
            debug!(generation, "transport_event_pump_stopped");
        });
    }

    async fn dispatch(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        // Acks stay meaningful after the session that produced them is gone
        if let TransportEvent::MessageAcknowledged {
            message_id,
            ack_code,
        } = &event
        {
            self.tracker.apply_acknowledgement(message_id, *ack_code).await;
            return;
        }

        if let Some(event) = self.forward_to_bootstrap(generation, event) {
            self.handle_lifecycle(generation, event).await;
        }
    }

    /// Returns the event back if no bootstrap is waiting for it
    fn forward_to_bootstrap(&self, generation: u64, event: TransportEvent) -> Option<TransportEvent> {
        let sink = self.bootstrap_sink.lock();
        match sink.as_ref() {
            Some(sink) if sink.generation == generation => {
                match sink.tx.send(BootstrapSignal::Transport(event)) {
                    Ok(()) => None,
                    Err(mpsc::error::SendError(BootstrapSignal::Transport(event))) => Some(event),
                    Err(_) => None,
                }
            }
            _ => Some(event),
        }
    }

    async fn handle_lifecycle(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        if !self.is_current(generation) {
            debug!(generation, ?event, "stale_session_event_ignored");
            return;
        }

        match event {
            TransportEvent::Ready => {
                self.mark_connected("transport ready");
            }
            TransportEvent::PairingCode(code) => {
                self.events.set_pairing(code);
            }
            TransportEvent::AuthFailure(msg) => {
                self.on_session_failure(
                    generation,
                    MessagingError::AuthFailure(msg),
                    SessionEvent::AuthFailed,
                )
                .await;
            }
            TransportEvent::Disconnected(reason) => {
                self.on_session_failure(
                    generation,
                    MessagingError::SessionLost(reason),
                    SessionEvent::TransportDisconnected,
                )
                .await;
            }
            TransportEvent::MessageAcknowledged {
                message_id,
                ack_code,
            } => {
                self.tracker.apply_acknowledgement(&message_id, ack_code).await;
            }
        }
    }

    /// Returns true if the connection is CONNECTED afterwards
    fn mark_connected(&self, reason: &str) -> bool {
        match self.state.apply(SessionEvent::TransportReady, reason) {
            Ok(transition) => {
                if transition.changed() {
                    self.events.clear_pairing();
                    self.scheduler.cancel();
                    self.events.publish(MessagingEvent::ClientReady { at: Utc::now() });
                }
                true
            }
            Err(_) => false,
        }
    }

    async fn on_session_failure(
        self: &Arc<Self>,
        generation: u64,
        err: MessagingError,
        event: SessionEvent,
    ) {
        let Some(session) = self.detach_generation(generation) else {
            return;
        };

        let transition = self.state.apply(event, err.kind());
        self.state.record_error(&err);
        self.events.clear_pairing();
        warn!(error = %err, generation, "transport_session_lost");

        self.close_session(session, TeardownMode::Destroy).await;

        if transition.is_err() {
            return;
        }
        if self.state.manual_disconnect_requested() {
            debug!("reconnect_suppressed_manual_disconnect");
            return;
        }
        self.schedule_retry(&err);
    }

    // ------------------------------------------------------------------
    // Session slot
    // ------------------------------------------------------------------

    fn attach(&self, session: Arc<dyn TransportSession>, tx: mpsc::UnboundedSender<BootstrapSignal>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.bootstrap_sink.lock() = Some(BootstrapSink { generation, tx });
        *self.session.write() = Some(Attached {
            generation,
            session,
        });
        generation
    }

    fn detach(&self) -> Option<Arc<dyn TransportSession>> {
        self.session.write().take().map(|a| a.session)
    }

    fn detach_generation(&self, generation: u64) -> Option<Arc<dyn TransportSession>> {
        let mut slot = self.session.write();
        if slot.as_ref().map(|a| a.generation) == Some(generation) {
            slot.take().map(|a| a.session)
        } else {
            None
        }
    }

    async fn abandon(&self, generation: u64) {
        if let Some(session) = self.detach_generation(generation) {
            self.close_session(session, TeardownMode::Destroy).await;
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session.read().as_ref().map(|a| a.generation) == Some(generation)
    }

    fn attached(&self) -> Option<(u64, Arc<dyn TransportSession>)> {
        self.session
            .read()
            .as_ref()
            .map(|a| (a.generation, Arc::clone(&a.session)))
    }

    fn current_session(&self) -> Option<Arc<dyn TransportSession>> {
        self.session.read().as_ref().map(|a| Arc::clone(&a.session))
    }

    fn cancel_bootstrap(&self) -> bool {
        match self.bootstrap_sink.lock().take() {
            Some(sink) => {
                let _ = sink.tx.send(BootstrapSignal::Cancelled);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn teardown(&self, reason: &str, mode: TeardownMode) {
        if self.cancel_bootstrap() {
            debug!(reason, "bootstrap_cancelled");
        }
        let session = self.detach();
        let _ = self.state.apply(SessionEvent::Teardown, reason);
        self.events.clear_pairing();

        match session {
            Some(session) => self.close_session(session, mode).await,
            None if mode == TeardownMode::Logout => {
                match tokio::time::timeout(self.config.teardown_timeout, self.transport.clear_auth(&self.auth)).await {
                    Ok(Ok(())) => debug!("stored_auth_cleared"),
                    Ok(Err(e)) => warn!(error = %e, "stored_auth_clear_failed"),
                    Err(_) => warn!("stored_auth_clear_timed_out"),
                }
            }
            None => {}
        }
    }

    async fn close_session(&self, session: Arc<dyn TransportSession>, mode: TeardownMode) {
        let limit = self.config.teardown_timeout;
        let result = match mode {
            TeardownMode::Destroy => tokio::time::timeout(limit, session.destroy()).await,
            TeardownMode::Logout => tokio::time::timeout(limit, session.logout()).await,
        };
        match result {
            Ok(Ok(())) => debug!(?mode, "transport_session_closed"),
            Ok(Err(e)) => warn!(?mode, error = %e, "transport_session_close_failed"),
            Err(_) => warn!(?mode, timeout_ms = millis(limit), "transport_session_close_timed_out"),
        }
    }

    async fn shut_session(&self, reason: &str, mode: TeardownMode) {
        let Some(_destroying) = DestroyGuard::begin(&self.state) else {
            debug!(reason, "teardown_already_in_progress");
            return;
        };

        self.state.set_manual_disconnect(true);
        self.scheduler.cancel();
        self.teardown(reason, mode).await;
        self.bootstrap_breaker.reset();
        self.send_breaker.reset();
        info!(reason, ?mode, "messaging_session_closed");
    }

    /// Tear down the session, keeping stored auth. Idempotent.
    pub async fn destroy(&self) {
        self.shut_session("destroy", TeardownMode::Destroy).await;
    }

    /// Tear down the session and invalidate stored auth
    pub async fn logout(&self) {
        self.shut_session("logout", TeardownMode::Logout).await;
    }

    /// Tear down (keeping auth), reset breakers and counters, initialize again
    pub async fn restart(self: &Arc<Self>) -> Result<InitOutcome, MessagingError> {
        info!("messaging_restart_requested");
        self.events.publish(MessagingEvent::Restarting);
        self.scheduler.cancel();
        self.bootstrap_breaker.reset();
        self.send_breaker.reset();
        self.state.reset_attempts();
        self.initialize(true).await
    }

    /// Process shutdown: no reconnects, no pending timers, no held lock
    pub async fn graceful_shutdown(&self, reason: &str) {
        info!(reason, "messaging_graceful_shutdown");
        self.state.set_manual_disconnect(true);
        self.scheduler.cancel();
        // Queued initializers are rejected before the holder's bootstrap is
        // cancelled, so the lock cannot pass to one of them
        self.lock.force_release();
        self.teardown(reason, TeardownMode::Destroy).await;
    }

    /// Operator recovery after exhaustion
    pub fn reset_circuit(&self) {
        self.bootstrap_breaker.reset();
        self.send_breaker.reset();
        self.state.reset_attempts();
        info!("circuit_reset_by_operator");
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn is_ready(&self) -> bool {
        self.state.phase() == ConnectionPhase::Connected && self.session.read().is_some()
    }

    fn ensure_ready(&self) -> Result<(), MessagingError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(MessagingError::NotReady {
                phase: self.state.phase(),
            })
        }
    }

    /// Ask the transport itself before committing to a batch. Returns the
    /// generation the batch is bound to.
    async fn confirm_connected(self: &Arc<Self>) -> Result<u64, MessagingError> {
        self.ensure_ready()?;
        let (generation, session) = self.attached().ok_or(MessagingError::NotReady {
            phase: self.state.phase(),
        })?;

        match tokio::time::timeout(self.config.send_timeout, session.connection_state()).await {
            Ok(Ok(state)) if state.eq_ignore_ascii_case("CONNECTED") => Ok(generation),
            Ok(Ok(state)) => {
                warn!(state = %state, generation, "transport_reports_not_connected");
                self.on_session_failure(
                    generation,
                    MessagingError::SessionLost(format!("transport reports {}", state)),
                    SessionEvent::TransportDisconnected,
                )
                .await;
                Err(MessagingError::NotReady {
                    phase: self.state.phase(),
                })
            }
            // The send path surfaces a broken session on its own
            Ok(Err(e)) => {
                warn!(error = %e, "connection_state_query_failed");
                Ok(generation)
            }
            Err(_) => {
                warn!(timeout_ms = millis(self.config.send_timeout), "connection_state_query_timed_out");
                Ok(generation)
            }
        }
    }

    /// Send a batch in order. Fails up front only if not CONNECTED.
    pub async fn send(self: &Arc<Self>, items: Vec<OutboundMessage>) -> Result<Vec<SendResult>, MessagingError> {
        let generation = self.confirm_connected().await?;

        let total = items.len();
        info!(total, "send_batch_started");
        self.events.publish(MessagingEvent::BatchStarted { total });

        let mut results = Vec::with_capacity(total);
        let mut lost: Option<String> = None;

        for (index, item) in items.into_iter().enumerate() {
            if index > 0 && lost.is_none() {
                if self.config.send_delay.is_zero() {
                    // Let the event pump apply a disconnect reported by the last send
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(self.config.send_delay).await;
                }
            }
            if lost.is_none() && !(self.is_ready() && self.is_current(generation)) {
                lost = Some(match self.state.phase() {
                    ConnectionPhase::Connected => "session replaced during batch".to_string(),
                    phase => format!("connection {} during batch", phase),
                });
            }

            let outcome = match &lost {
                Some(reason) => Err(MessagingError::SessionLost(reason.clone())),
                None => self.send_one(&item).await,
            };

            match &outcome {
                Ok(message_id) => {
                    self.tracker.record_sent(message_id, &item.request_id).await;
                    debug!(request_id = %item.request_id, message_id = %message_id, "message_sent");
                    self.events.publish(MessagingEvent::MessageSent {
                        request_id: item.request_id.clone(),
                        message_id: message_id.clone(),
                        address: item.address.clone(),
                    });
                }
                Err(e) => {
                    warn!(request_id = %item.request_id, error = %e, "message_failed");
                    self.events.publish(MessagingEvent::MessageFailed {
                        request_id: item.request_id.clone(),
                        address: item.address.clone(),
                        kind: e.kind().to_string(),
                        error: e.to_string(),
                    });
                    if lost.is_none() && !(self.is_ready() && self.is_current(generation)) {
                        lost = Some(format!("connection dropped during batch: {}", e));
                    }
                }
            }

            results.push(SendResult {
                request_id: item.request_id,
                address: item.address,
                outcome,
            });
        }

        let sent = results.iter().filter(|r| r.is_sent()).count();
        let failed = total - sent;
        info!(sent, failed, "send_batch_finished");
        self.events.publish(MessagingEvent::BatchFinished { sent, failed });

        Ok(results)
    }

    async fn send_one(&self, item: &OutboundMessage) -> Result<String, MessagingError> {
        let session = self
            .current_session()
            .ok_or_else(|| MessagingError::SessionLost("no attached session".to_string()))?;
        let limit = self.config.send_timeout;

        self.send_breaker
            .execute(|| async move {
                match tokio::time::timeout(limit, session.send(&item.address, &item.body)).await {
                    Ok(Ok(message_id)) => Ok(message_id),
                    Ok(Err(e)) => Err(MessagingError::transport(e)),
                    Err(_) => Err(MessagingError::Transport(format!(
                        "send timed out after {}ms",
                        millis(limit)
                    ))),
                }
            })
            .await
    }

    /// Load the reminder batch for `date` and send it
    pub async fn send_reminders_for_date(self: &Arc<Self>, date: NaiveDate) -> Result<Vec<SendResult>, MessagingError> {
        self.ensure_ready()?;

        let batch = self
            .store
            .fetch_reminder_batch(date)
            .await
            .map_err(MessagingError::storage)?;
        info!(%date, reminders = batch.len(), "reminder_batch_loaded");

        let items = batch
            .request_ids
            .into_iter()
            .zip(batch.addresses)
            .zip(batch.bodies)
            .map(|((request_id, address), body)| OutboundMessage {
                request_id,
                address,
                body,
            })
            .collect();

        self.send(items).await
    }

    // ------------------------------------------------------------------
    // Observers and status
    // ------------------------------------------------------------------

    pub fn register_observer(&self) -> ObserverHandle {
        self.events.register_observer()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessagingEvent> {
        self.events.subscribe()
    }

    /// An observer opened the UI: bring the session up if nothing else will
    pub fn on_observer_connected(self: &Arc<Self>) {
        let snapshot = self.state.snapshot();
        if snapshot.phase != ConnectionPhase::Disconnected
            || snapshot.manual_disconnect_requested
            || self.in_flight.lock().is_some()
            || self.scheduler.is_pending()
        {
            return;
        }

        info!("observer_triggered_initialize");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.initialize_inner(false).await {
                warn!(error = %e, "observer_initialize_failed");
            }
        });
    }

    pub fn delivery(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase()
    }

    /// Pure read
    pub fn status(&self) -> SupervisorStatus {
        let state = self.state.snapshot();
        SupervisorStatus {
            phase: state.phase,
            ready: self.is_ready(),
            reconnect_attempts: state.reconnect_attempts,
            last_error: state.last_error,
            manual_disconnect_requested: state.manual_disconnect_requested,
            connected_since: state.connected_since,
            initializing: self.in_flight.lock().is_some(),
            pairing: self.events.pairing(),
            observers: self.events.observer_count(),
            bootstrap_breaker: self.bootstrap_breaker.status(),
            send_breaker: self.send_breaker.status(),
            lock_held_ms: self.lock.held_for().map(millis),
            retry_due_in_ms: self.scheduler.pending_due_in().map(millis),
            tracked_messages: self.tracker.len(),
        }
    }
}
