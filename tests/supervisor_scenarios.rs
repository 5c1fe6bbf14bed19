//! End-to-end supervisor behavior against a scripted transport

mod common;

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use clinic_messenger::messaging::{
    CircuitBreakerConfig, CircuitPhase, ConnectionPhase, DeliveryStatus, InitOutcome,
    MessagingConfig, MessagingError, MessagingEvent, OutboundMessage, TransportEvent,
};
use clinic_messenger::storage::NewAppointment;

use common::{
    settle, supervisor_with, supervisor_with_config, test_config, Behavior, ScriptedTransport,
};

fn batch(n: usize) -> Vec<OutboundMessage> {
    (1..=n)
        .map(|i| OutboundMessage {
            request_id: format!("req-{}", i),
            address: format!("55119999900{:02}", i),
            body: format!("reminder {}", i),
        })
        .collect()
}

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_initialize_creates_one_session() {
    let transport = ScriptedTransport::ready();
    let (supervisor, _store) = supervisor_with(transport.clone());

    let (first, second) = tokio::join!(supervisor.initialize(false), supervisor.initialize(false));

    assert_eq!(first.unwrap(), InitOutcome::Connected);
    assert_eq!(second.unwrap(), InitOutcome::Connected);
    assert_eq!(transport.sessions_created(), 1);
    assert_eq!(supervisor.phase(), ConnectionPhase::Connected);

    // Already connected: no new bootstrap
    assert_eq!(supervisor.initialize(false).await.unwrap(), InitOutcome::Connected);
    assert_eq!(transport.sessions_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_failures_trip_circuit() {
    let transport = ScriptedTransport::new(Behavior::Unreachable);
    let (supervisor, _store) = supervisor_with(transport.clone());

    for _ in 0..3 {
        let err = supervisor.initialize(false).await.unwrap_err();
        assert!(matches!(err, MessagingError::Transport(_)));
    }
    assert_eq!(transport.sessions_created(), 3);
    assert_eq!(supervisor.status().bootstrap_breaker.phase, CircuitPhase::Open);

    let err = supervisor.initialize(false).await.unwrap_err();
    assert!(matches!(err, MessagingError::CircuitOpen { .. }));
    assert!(err.retry_after().is_some());
    // Fails fast without touching the transport
    assert_eq!(transport.sessions_created(), 3);
    assert_eq!(supervisor.phase(), ConnectionPhase::Error);

    supervisor.reset_circuit();
    assert_eq!(supervisor.status().bootstrap_breaker.phase, CircuitPhase::Closed);
    assert_eq!(supervisor.status().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_pairing_window_resolves_to_pairing() {
    let transport = ScriptedTransport::new(Behavior::PairingOnly {
        code: "QR-1".to_string(),
    });
    let (supervisor, _store) = supervisor_with(transport.clone());
    let _observer = supervisor.register_observer();
    let mut events = supervisor.subscribe();

    let outcome = supervisor.initialize(false).await.unwrap();
    assert_eq!(
        outcome,
        InitOutcome::Pairing {
            code: Some("QR-1".to_string())
        }
    );
    assert_eq!(supervisor.phase(), ConnectionPhase::Initializing);

    let mut saw_code = false;
    while let Ok(event) = events.try_recv() {
        if let MessagingEvent::PairingCode { code, .. } = event {
            assert_eq!(code, "QR-1");
            saw_code = true;
        }
    }
    assert!(saw_code);

    // A late caller gets the outstanding code, not a second session
    let again = supervisor.initialize(false).await.unwrap();
    assert!(matches!(again, InitOutcome::Pairing { .. }));
    assert_eq!(transport.sessions_created(), 1);

    // Scanned after the window closed
    transport.emit(TransportEvent::Ready).await;
    settle().await;
    assert_eq!(supervisor.phase(), ConnectionPhase::Connected);
    assert!(supervisor.status().pairing.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_pairing_code_held_without_observers() {
    let transport = ScriptedTransport::new(Behavior::PairingOnly {
        code: "QR-2".to_string(),
    });
    let (supervisor, _store) = supervisor_with(transport);
    let mut events = supervisor.subscribe();

    supervisor.initialize(false).await.unwrap();

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, MessagingEvent::PairingCode { .. }));
    }
    assert_eq!(supervisor.status().pairing.unwrap().code, "QR-2");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_mid_batch_fails_remaining_items() {
    let transport = ScriptedTransport::ready();
    transport.disconnect_after_sends(2);
    let (supervisor, _store) = supervisor_with(transport.clone());
    supervisor.initialize(false).await.unwrap();

    let results = supervisor.send(batch(5)).await.unwrap();

    assert_eq!(results.len(), 5);
    assert!(results[..2].iter().all(|r| r.is_sent()));
    for result in &results[2..] {
        assert!(matches!(result.outcome, Err(MessagingError::SessionLost(_))));
    }
    assert_eq!(supervisor.phase(), ConnectionPhase::Disconnected);
    assert_eq!(transport.last_session().unwrap().sent().len(), 2);
    // Transport-side drop schedules a reconnect
    assert!(supervisor.status().retry_due_in_ms.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_ack_does_not_regress() {
    let transport = ScriptedTransport::ready();
    let (supervisor, store) = supervisor_with(transport.clone());
    let request_id = store
        .insert_appointment(&NewAppointment {
            patient_name: "Ana".to_string(),
            phone: Some("+55 11 99999-0001".to_string()),
            appointment_at: at("2026-03-10 09:30"),
        })
        .unwrap();
    supervisor.initialize(false).await.unwrap();

    let results = supervisor
        .send(vec![OutboundMessage {
            request_id: request_id.clone(),
            address: "5511999990001".to_string(),
            body: "hello".to_string(),
        }])
        .await
        .unwrap();
    let message_id = results[0].outcome.clone().unwrap();
    assert_eq!(
        supervisor.delivery().get(&message_id).unwrap().status,
        DeliveryStatus::Sent
    );

    transport
        .emit(TransportEvent::MessageAcknowledged {
            message_id: message_id.clone(),
            ack_code: 2,
        })
        .await;
    transport
        .emit(TransportEvent::MessageAcknowledged {
            message_id: message_id.clone(),
            ack_code: 1,
        })
        .await;
    settle().await;

    assert_eq!(
        supervisor.delivery().get(&message_id).unwrap().status,
        DeliveryStatus::DeviceDelivered
    );
    let stored = store.delivery_status(&request_id).unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::DeviceDelivered);
    assert_eq!(stored.ack_code, Some(2));

    // Failure overrides any progress
    transport
        .emit(TransportEvent::MessageAcknowledged {
            message_id: message_id.clone(),
            ack_code: -1,
        })
        .await;
    settle().await;
    assert_eq!(
        supervisor.delivery().get(&message_id).unwrap().status,
        DeliveryStatus::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn test_destroy_is_idempotent() {
    let transport = ScriptedTransport::ready();
    let (supervisor, _store) = supervisor_with(transport.clone());
    supervisor.initialize(false).await.unwrap();

    supervisor.destroy().await;
    supervisor.destroy().await;

    let status = supervisor.status();
    assert_eq!(status.phase, ConnectionPhase::Disconnected);
    assert!(status.manual_disconnect_requested);
    assert!(status.retry_due_in_ms.is_none());
    assert!(transport.last_session().unwrap().is_destroyed());

    // Events from the closed session are ignored
    transport
        .emit(TransportEvent::Disconnected("late".to_string()))
        .await;
    settle().await;
    assert!(supervisor.status().retry_due_in_ms.is_none());
    assert_eq!(supervisor.phase(), ConnectionPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_schedules_reconnect() {
    let transport = ScriptedTransport::new(Behavior::AuthFailure {
        message: "credentials revoked".to_string(),
    });
    let (supervisor, _store) = supervisor_with(transport.clone());

    let err = supervisor.initialize(false).await.unwrap_err();
    assert!(matches!(err, MessagingError::AuthFailure(_)));

    let status = supervisor.status();
    assert_eq!(status.phase, ConnectionPhase::Error);
    assert_eq!(status.reconnect_attempts, 1);
    assert_eq!(status.last_error.unwrap().kind, "auth_failure");
    assert_eq!(status.retry_due_in_ms, Some(5_000));

    // Credentials fixed before the retry fires
    transport.set_behavior(Behavior::Ready {
        delay: Duration::from_millis(50),
    });
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(supervisor.phase(), ConnectionPhase::Connected);
    assert_eq!(transport.sessions_created(), 2);
    assert_eq!(supervisor.status().reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_replaces_session() {
    let transport = ScriptedTransport::ready();
    let (supervisor, _store) = supervisor_with(transport.clone());
    supervisor.initialize(false).await.unwrap();
    let first = transport.last_session().unwrap();

    let outcome = supervisor.restart().await.unwrap();

    assert_eq!(outcome, InitOutcome::Connected);
    assert!(first.is_destroyed());
    assert_eq!(transport.sessions_created(), 2);
    assert_eq!(supervisor.phase(), ConnectionPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_logout_without_session_clears_auth() {
    let transport = ScriptedTransport::ready();
    let (supervisor, _store) = supervisor_with(transport.clone());

    supervisor.logout().await;

    assert!(transport.auth_cleared());
    assert_eq!(supervisor.phase(), ConnectionPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_connection() {
    let transport = ScriptedTransport::ready();
    let (supervisor, _store) = supervisor_with(transport);

    let err = supervisor.send(batch(1)).await.unwrap_err();
    assert_eq!(
        err,
        MessagingError::NotReady {
            phase: ConnectionPhase::Disconnected
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_observer_connect_brings_session_up() {
    let transport = ScriptedTransport::ready();
    let (supervisor, _store) = supervisor_with(transport.clone());

    let _observer = supervisor.register_observer();
    supervisor.on_observer_connected();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(supervisor.phase(), ConnectionPhase::Connected);

    // An operator disconnect is not undone by the UI
    supervisor.destroy().await;
    supervisor.on_observer_connected();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(supervisor.phase(), ConnectionPhase::Disconnected);
    assert_eq!(transport.sessions_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reminders_for_date() {
    let transport = ScriptedTransport::ready();
    let (supervisor, store) = supervisor_with(transport.clone());
    let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();

    let later = store
        .insert_appointment(&NewAppointment {
            patient_name: "Bruno".to_string(),
            phone: Some("(11) 98888-0002".to_string()),
            appointment_at: at("2026-03-10 15:00"),
        })
        .unwrap();
    let earlier = store
        .insert_appointment(&NewAppointment {
            patient_name: "Ana".to_string(),
            phone: Some("+55 11 99999-0001".to_string()),
            appointment_at: at("2026-03-10 08:30"),
        })
        .unwrap();
    store
        .insert_appointment(&NewAppointment {
            patient_name: "Caio".to_string(),
            phone: None,
            appointment_at: at("2026-03-10 10:00"),
        })
        .unwrap();
    store
        .insert_appointment(&NewAppointment {
            patient_name: "Dora".to_string(),
            phone: Some("11977770003".to_string()),
            appointment_at: at("2026-03-11 10:00"),
        })
        .unwrap();

    supervisor.initialize(false).await.unwrap();
    let results = supervisor.send_reminders_for_date(date).await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_sent()));
    assert_eq!(results[0].request_id, earlier);
    assert_eq!(results[1].request_id, later);

    let sent = transport.last_session().unwrap().sent();
    assert_eq!(sent[0].0, "5511999990001");
    assert!(sent[0].1.contains("Ana"));
    assert!(sent[1].1.contains("15:00"));

    let stored = store.delivery_status(&earlier).unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Sent);

    // Already sent reminders are not picked up again
    let again = supervisor.send_reminders_for_date(date).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_late_pairing_code_outlives_init_window() {
    // Code shows up 4s in; init window is 5s, pairing window 2s
    let transport = ScriptedTransport::new(Behavior::LatePairing {
        delay: Duration::from_secs(4),
        code: "QR-late".to_string(),
    });
    let (supervisor, _store) = supervisor_with(transport.clone());

    let outcome = supervisor.initialize(false).await.unwrap();

    assert_eq!(
        outcome,
        InitOutcome::Pairing {
            code: Some("QR-late".to_string())
        }
    );
    assert_eq!(supervisor.phase(), ConnectionPhase::Initializing);
    assert!(!transport.last_session().unwrap().is_destroyed());
    assert_eq!(supervisor.status().pairing.unwrap().code, "QR-late");
}

#[tokio::test(start_paused = true)]
async fn test_init_timeout_releases_lock_and_arms_retry() {
    let transport = ScriptedTransport::new(Behavior::Silent);
    let (supervisor, _store) = supervisor_with(transport.clone());

    let err = supervisor.initialize(false).await.unwrap_err();
    assert_eq!(
        err,
        MessagingError::InitTimeout {
            after: Duration::from_secs(5)
        }
    );

    let status = supervisor.status();
    assert_eq!(status.phase, ConnectionPhase::Error);
    assert!(status.lock_held_ms.is_none());
    assert_eq!(status.retry_due_in_ms, Some(5_000));
    assert!(status.pairing.is_none());
    assert_eq!(status.last_error.unwrap().kind, "init_timeout");
    assert!(transport.last_session().unwrap().is_destroyed());
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_failure_withdraws_pairing_code() {
    let transport = ScriptedTransport::new(Behavior::PairingOnly {
        code: "QR-3".to_string(),
    });
    let (supervisor, _store) = supervisor_with(transport.clone());

    let pending = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.initialize(false).await })
    };
    settle().await;
    assert_eq!(supervisor.status().pairing.unwrap().code, "QR-3");

    transport
        .emit(TransportEvent::AuthFailure("scan rejected".to_string()))
        .await;
    let err = pending.await.unwrap().unwrap_err();

    assert!(matches!(err, MessagingError::AuthFailure(_)));
    assert_eq!(supervisor.phase(), ConnectionPhase::Error);
    assert!(supervisor.status().pairing.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_mid_batch_without_send_delay() {
    let transport = ScriptedTransport::ready();
    transport.disconnect_after_sends(2);
    let config = MessagingConfig {
        send_delay: Duration::ZERO,
        ..test_config()
    };
    let (supervisor, _store) = supervisor_with_config(transport.clone(), config);
    supervisor.initialize(false).await.unwrap();

    let results = supervisor.send(batch(5)).await.unwrap();

    assert_eq!(results.iter().filter(|r| r.is_sent()).count(), 2);
    for result in &results[2..] {
        assert!(matches!(result.outcome, Err(MessagingError::SessionLost(_))));
    }
    assert_eq!(transport.last_session().unwrap().sent().len(), 2);
    assert_eq!(supervisor.phase(), ConnectionPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion_latches_breaker() {
    let transport = ScriptedTransport::new(Behavior::Unreachable);
    let mut config = test_config();
    config.bootstrap_breaker = CircuitBreakerConfig {
        failure_threshold: 5,
        cooldown: Duration::from_secs(60),
        half_open_max_probes: 1,
    };
    config.reconnect.max_attempts = 2;
    let (supervisor, _store) = supervisor_with_config(transport.clone(), config);

    supervisor.initialize(false).await.unwrap_err();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let status = supervisor.status();
    assert_eq!(transport.sessions_created(), 3);
    assert!(status.retry_due_in_ms.is_none());
    assert_eq!(status.bootstrap_breaker.phase, CircuitPhase::Open);
    assert!(status.bootstrap_breaker.latched);

    // Cooldown has long passed; only the operator reopens it
    let err = supervisor.initialize(false).await.unwrap_err();
    assert!(matches!(err, MessagingError::CircuitOpen { .. }));
    assert_eq!(transport.sessions_created(), 3);

    supervisor.reset_circuit();
    transport.set_behavior(Behavior::Ready {
        delay: Duration::from_millis(50),
    });
    assert_eq!(supervisor.initialize(false).await.unwrap(), InitOutcome::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_rejects_queued_initializers() {
    let transport = ScriptedTransport::new(Behavior::Silent);
    let (supervisor, _store) = supervisor_with(transport.clone());

    let first = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.initialize(false).await })
    };
    settle().await;
    let forced = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.initialize(true).await })
    };
    settle().await;
    assert!(supervisor.status().lock_held_ms.is_some());

    supervisor.graceful_shutdown("test").await;

    assert_eq!(first.await.unwrap().unwrap_err(), MessagingError::LockCancelled);
    assert_eq!(forced.await.unwrap().unwrap_err(), MessagingError::LockCancelled);

    let status = supervisor.status();
    assert_eq!(status.phase, ConnectionPhase::Disconnected);
    assert!(status.lock_held_ms.is_none());
    assert!(status.retry_due_in_ms.is_none());
    assert!(status.manual_disconnect_requested);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.sessions_created(), 1);
    assert_eq!(supervisor.phase(), ConnectionPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_batch_refused_when_transport_reports_unpaired() {
    let transport = ScriptedTransport::ready();
    let (supervisor, _store) = supervisor_with(transport.clone());
    supervisor.initialize(false).await.unwrap();
    let session = transport.last_session().unwrap();
    session.report_state("UNPAIRED");

    let err = supervisor.send(batch(2)).await.unwrap_err();

    assert_eq!(
        err,
        MessagingError::NotReady {
            phase: ConnectionPhase::Disconnected
        }
    );
    assert!(session.sent().is_empty());
    assert!(session.is_destroyed());
    assert!(supervisor.status().retry_due_in_ms.is_some());
}
