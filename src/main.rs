//! Clinic messenger service
//!
//! Hosts the messaging control API and the observer socket in front of a
//! single supervised chat session.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clinic_messenger::{
    api::{router, AppState},
    messaging::{MessagingConfig, SessionSupervisor},
    storage::SqliteDeliveryStore,
    transport::BridgeTransport,
};

#[derive(Parser, Debug)]
#[command(name = "clinic-messenger", about = "Appointment reminder messaging service")]
struct Args {
    /// Address the HTTP API listens on
    #[arg(long, env = "CLINIC_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    listen: String,

    /// SQLite database holding appointments and delivery status
    #[arg(long, env = "CLINIC_DB_PATH", default_value = "clinic.db")]
    db_path: String,

    /// WebSocket URL of the chat bridge sidecar
    #[arg(long, env = "CLINIC_BRIDGE_URL", default_value = "ws://127.0.0.1:3001")]
    bridge_url: String,

    /// Optional TOML file with messaging settings; env overrides still apply
    #[arg(long, env = "CLINIC_MESSAGING_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "CLINIC_LOG", default_value = "clinic_messenger=debug,tower_http=info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = load_config(args.config.as_deref())?;
    info!(
        init_timeout_ms = config.init_timeout.as_millis() as u64,
        pairing_timeout_ms = config.pairing_timeout.as_millis() as u64,
        breaker_threshold = config.bootstrap_breaker.failure_threshold,
        client_id = %config.client_id,
        "messaging_config_loaded"
    );

    let store = Arc::new(
        SqliteDeliveryStore::new(&args.db_path)
            .with_context(|| format!("failed to open database {}", args.db_path))?,
    );
    let transport = Arc::new(BridgeTransport::new(&args.bridge_url, config.send_timeout));
    let supervisor = SessionSupervisor::new(config, transport, store.clone());

    let app = router(AppState {
        supervisor: supervisor.clone(),
        store,
    });

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(addr = %args.listen, bridge = %args.bridge_url, "server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    supervisor.graceful_shutdown("process_shutdown").await;
    info!("server_stopped");
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<MessagingConfig> {
    let mut config = match path {
        Some(path) => MessagingConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => MessagingConfig::default(),
    };
    config.apply_env();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid messaging config: {}", e))?;
    Ok(config)
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv::dotenv();

    // Also try the crate root when started from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown_signal_received");
}
