//! Messaging connection manager configuration
//!
//! Defaults are tuned for a single clinic workstation session. Every field
//! can be overridden from a TOML file or from `MESSAGING_*` environment
//! variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// End-to-end window for one initialization attempt
    #[serde(with = "duration_ms")]
    pub init_timeout: Duration,
    /// How long to wait for a scan once a pairing code has been issued
    #[serde(with = "duration_ms")]
    pub pairing_timeout: Duration,
    /// Maximum wait in the initialization lock queue
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
    /// Delay between consecutive outbound messages in a batch
    #[serde(with = "duration_ms")]
    pub send_delay: Duration,
    /// Upper bound for a single transport send call
    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,
    /// Upper bound for transport teardown calls
    #[serde(with = "duration_ms")]
    pub teardown_timeout: Duration,
    /// Session identity handed to the transport
    pub client_id: String,
    /// Where the transport keeps its authentication material
    pub auth_data_path: PathBuf,
    pub bootstrap_breaker: CircuitBreakerConfig,
    pub send_breaker: CircuitBreakerConfig,
    pub reconnect: ReconnectConfig,
    pub delivery: DeliveryConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(60),
            pairing_timeout: Duration::from_secs(45),
            lock_timeout: Duration::from_secs(60),
            send_delay: Duration::from_secs(1),
            send_timeout: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(10),
            client_id: "clinic".to_string(),
            auth_data_path: PathBuf::from(".messaging_auth"),
            bootstrap_breaker: CircuitBreakerConfig::default(),
            send_breaker: CircuitBreakerConfig {
                failure_threshold: 10,
                cooldown: Duration::from_secs(30),
                half_open_max_probes: 1,
            },
            reconnect: ReconnectConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl MessagingConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `MESSAGING_*` environment overrides on top of the current values
    pub fn apply_env(&mut self) {
        if let Some(ms) = env_u64("MESSAGING_INIT_TIMEOUT_MS") {
            self.init_timeout = Duration::from_millis(ms);
            // Stale-lock threshold tracks the init window unless set explicitly.
            self.lock_timeout = self.init_timeout;
        }
        if let Some(ms) = env_u64("MESSAGING_LOCK_TIMEOUT_MS") {
            self.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("MESSAGING_PAIRING_TIMEOUT_MS") {
            self.pairing_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("MESSAGING_SEND_DELAY_MS") {
            self.send_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("MESSAGING_SEND_TIMEOUT_MS") {
            self.send_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = env_u64("MESSAGING_BREAKER_THRESHOLD") {
            self.bootstrap_breaker.failure_threshold = v.max(1) as u32;
        }
        if let Some(ms) = env_u64("MESSAGING_BREAKER_COOLDOWN_MS") {
            self.bootstrap_breaker.cooldown = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("MESSAGING_RECONNECT_BASE_MS") {
            self.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("MESSAGING_RECONNECT_MAX_MS") {
            self.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(v) = env_u64("MESSAGING_RECONNECT_MAX_ATTEMPTS") {
            self.reconnect.max_attempts = v as u32;
        }
        if let Some(v) = env_u64("MESSAGING_DELIVERY_CAPACITY") {
            self.delivery.capacity = (v as usize).max(1);
        }
        if let Ok(v) = std::env::var("MESSAGING_CLIENT_ID") {
            if !v.trim().is_empty() {
                self.client_id = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("MESSAGING_AUTH_PATH") {
            if !v.trim().is_empty() {
                self.auth_data_path = PathBuf::from(v.trim());
            }
        }
    }

    /// Reject combinations that would make the supervisor misbehave
    pub fn validate(&self) -> Result<(), String> {
        if self.init_timeout.is_zero() {
            return Err("init_timeout must be greater than zero".to_string());
        }
        if self.pairing_timeout > self.init_timeout {
            return Err("pairing_timeout must not exceed init_timeout".to_string());
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err("reconnect base_delay must not exceed max_delay".to_string());
        }
        if self.reconnect.multiplier < 1.0 {
            return Err("reconnect multiplier must be >= 1.0".to_string());
        }
        if self.bootstrap_breaker.half_open_max_probes == 0
            || self.send_breaker.half_open_max_probes == 0
        {
            return Err("half_open_max_probes must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures while CLOSED before the breaker opens
    pub failure_threshold: u32,
    /// Time since the last failure before a probe is allowed
    #[serde(with = "duration_ms")]
    pub cooldown: Duration,
    /// Concurrent probes allowed while HALF_OPEN
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_max_probes: 1,
        }
    }
}

/// Reconnect backoff tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Cap applied before jitter
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Attempts beyond this count escalate to the circuit breaker
    pub max_attempts: u32,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 1.5,
            max_attempts: 10,
            jitter_min: 0.75,
            jitter_max: 1.25,
        }
    }
}

/// Retention for in-memory delivery records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub capacity: usize,
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(24 * 3600),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

// Durations are written as plain milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
