//! Orchestrator configuration
//!
//! Defines all configurable parameters for the orchestrator including
//! agent liveness timing, cancellation grace, retention windows and
//! event delivery bounds.

use std::str::FromStr;
use std::time::Duration;

/// What happens when a subscriber's delivery queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the oldest queued event and report a gap to the subscriber
    #[default]
    DropOldest,

    /// Disconnect the subscriber; it must resubscribe from its cursor
    Disconnect,
}

impl FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            "disconnect" => Ok(OverflowPolicy::Disconnect),
            other => anyhow::bail!("unknown overflow policy: {other}"),
        }
    }
}

/// Orchestrator configuration
///
/// All timeouts and windows are configurable to allow tuning
/// for different deployment scenarios (dev vs prod, small vs large fleets).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP binding listens on
    pub bind_addr: String,

    /// Expected interval between agent heartbeats. Agents silent for three
    /// intervals are disconnected.
    pub heartbeat_interval: Duration,

    /// How long a disconnected agent is kept before it is removed
    pub disconnected_retention: Duration,

    /// How long an agent has to acknowledge a cancellation before its step
    /// is forced to Errored
    pub cancel_grace_period: Duration,

    /// How long a completed run stays in the live working set
    pub run_retention: Duration,

    /// Events retained per run for replay
    pub history_capacity: usize,

    /// Bound of each subscriber's delivery queue
    pub subscriber_queue_capacity: usize,

    /// Policy applied when a subscriber's queue is full
    pub overflow_policy: OverflowPolicy,

    /// Output chunks retained per step for log replay
    pub log_retained_chunks: usize,

    /// Whether `allow_failure` stages are excluded from run failure
    pub honor_allow_failure: bool,
}

impl Config {
    /// Number of missed heartbeat intervals after which an agent is disconnected
    pub const MISSED_HEARTBEATS: u32 = 3;

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - QUAY_BIND_ADDR (default: 0.0.0.0:8080)
    /// - QUAY_HEARTBEAT_INTERVAL (seconds, default: 10)
    /// - QUAY_DISCONNECTED_RETENTION (seconds, default: 300)
    /// - QUAY_CANCEL_GRACE_PERIOD (seconds, default: 10)
    /// - QUAY_RUN_RETENTION (seconds, default: 3600)
    /// - QUAY_HISTORY_CAPACITY (default: 1024)
    /// - QUAY_SUBSCRIBER_QUEUE (default: 256)
    /// - QUAY_OVERFLOW_POLICY (drop-oldest | disconnect, default: drop-oldest)
    /// - QUAY_LOG_RETAINED_CHUNKS (default: 2000)
    /// - QUAY_ALLOW_FAILURE (true | false, default: true)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let overflow_policy = match std::env::var("QUAY_OVERFLOW_POLICY") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.overflow_policy,
        };

        Ok(Self {
            bind_addr: std::env::var("QUAY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            heartbeat_interval: env_secs("QUAY_HEARTBEAT_INTERVAL")
                .unwrap_or(defaults.heartbeat_interval),
            disconnected_retention: env_secs("QUAY_DISCONNECTED_RETENTION")
                .unwrap_or(defaults.disconnected_retention),
            cancel_grace_period: env_secs("QUAY_CANCEL_GRACE_PERIOD")
                .unwrap_or(defaults.cancel_grace_period),
            run_retention: env_secs("QUAY_RUN_RETENTION").unwrap_or(defaults.run_retention),
            history_capacity: env_parse("QUAY_HISTORY_CAPACITY")
                .unwrap_or(defaults.history_capacity),
            subscriber_queue_capacity: env_parse("QUAY_SUBSCRIBER_QUEUE")
                .unwrap_or(defaults.subscriber_queue_capacity),
            overflow_policy,
            log_retained_chunks: env_parse("QUAY_LOG_RETAINED_CHUNKS")
                .unwrap_or(defaults.log_retained_chunks),
            honor_allow_failure: env_parse("QUAY_ALLOW_FAILURE")
                .unwrap_or(defaults.honor_allow_failure),
        })
    }

    /// Heartbeat age after which an agent counts as disconnected
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * Self::MISSED_HEARTBEATS
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.heartbeat_interval.is_zero() {
            anyhow::bail!("heartbeat_interval must be greater than 0");
        }

        if self.cancel_grace_period.is_zero() {
            anyhow::bail!("cancel_grace_period must be greater than 0");
        }

        if self.history_capacity == 0 {
            anyhow::bail!("history_capacity must be greater than 0");
        }

        if self.subscriber_queue_capacity == 0 {
            anyhow::bail!("subscriber_queue_capacity must be greater than 0");
        }

        if self.log_retained_chunks == 0 {
            anyhow::bail!("log_retained_chunks must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            disconnected_retention: Duration::from_secs(300),
            cancel_grace_period: Duration::from_secs(10),
            run_retention: Duration::from_secs(3600),
            history_capacity: 1024,
            subscriber_queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
            log_retained_chunks: 2000,
            honor_allow_failure: true,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}
