//! Types shared by the monitoring engine and its collaborators.

use chrono::{DateTime, Utc};
use liveness::{BackoffPolicy, ProbeKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Machine identifier
pub type MachineId = u64;

/// Persisted machine status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Active,
    Unreachable,
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineStatus::Active => write!(f, "active"),
            MachineStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A machine as the record store knows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub address: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Scheduling state of one monitored machine.
///
/// Owned by that machine's monitor loop; everyone else sees copies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorState {
    pub machine_id: MachineId,
    pub address: String,
    pub consecutive_failures: u32,
    #[serde(with = "humantime_serde")]
    pub next_check_interval: Duration,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_is_alive: Option<bool>,
}

impl MonitorState {
    /// Fresh state for a machine that has not been probed yet
    pub fn new(machine_id: MachineId, address: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            machine_id,
            address: address.into(),
            consecutive_failures: 0,
            next_check_interval: min_interval,
            last_check_time: None,
            last_is_alive: None,
        }
    }
}

/// History entry written after every probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeRecord {
    pub machine_id: MachineId,
    pub is_alive: bool,
    pub response_time: Option<Duration>,
    pub consecutive_failures: u32,
    #[serde(with = "humantime_serde")]
    pub next_check_interval: Duration,
    pub checked_at: DateTime<Utc>,
}

/// Written whenever a machine is declared unreachable
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureLog {
    pub machine_id: MachineId,
    pub hostname: Option<String>,
    pub address: String,
    pub consecutive_failures: u32,
    pub failure_detected_at: DateTime<Utc>,
}

/// Emitted when a machine crosses between active and unreachable
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChangeEvent {
    pub machine_id: MachineId,
    pub status: MachineStatus,
    pub is_alive: bool,
    pub response_time: Option<Duration>,
    pub observed_at: DateTime<Utc>,
}

impl StatusChangeEvent {
    /// Wire form delivered to observers
    pub fn to_message(&self) -> ObserverMessage {
        ObserverMessage::StatusUpdate {
            machine_id: self.machine_id,
            status: self.status,
            is_alive: self.is_alive,
            response_time: self.response_time.map(|d| d.as_nanos() as f64 / 1_000_000.0),
            last_seen: self.observed_at,
        }
    }
}

/// Messages pushed to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    /// A machine changed status (response time in milliseconds)
    StatusUpdate {
        machine_id: MachineId,
        status: MachineStatus,
        is_alive: bool,
        response_time: Option<f64>,
        last_seen: DateTime<Utc>,
    },

    /// Greeting sent when an observer connects
    Connection { message: String },
}

/// Knobs of the per-machine monitor loop
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    /// Check interval after a success
    pub min_check_interval: Duration,

    /// Cap on the backed-off check interval
    pub max_check_interval: Duration,

    /// Consecutive failures before a machine is declared unreachable
    pub failure_threshold: u32,

    /// Delay before retrying after an internal error
    pub error_retry_delay: Duration,
}

impl MonitorSettings {
    /// Backoff policy for these bounds
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.min_check_interval, self.max_check_interval)
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            min_check_interval: Duration::from_secs(60),
            max_check_interval: Duration::from_secs(3600),
            failure_threshold: 3,
            error_retry_delay: Duration::from_secs(60),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Monitor loop settings
    pub monitor: MonitorSettings,

    /// Probe mechanism
    pub probe_kind: ProbeKind,

    /// Timeout of a single probe
    pub probe_timeout: Duration,

    /// Cap on simultaneously in-flight probes
    pub max_parallel_probes: usize,

    /// Queue depth of each observer
    pub observer_buffer: usize,

    /// Serve the HTTP endpoints
    pub http_enabled: bool,

    /// HTTP listen address
    pub listen_addr: String,

    /// Collect Prometheus metrics
    pub metrics_enabled: bool,

    /// Machines seeded into the record store at startup
    pub machines: Vec<Machine>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorSettings::default(),
            probe_kind: ProbeKind::Icmp,
            probe_timeout: Duration::from_secs(2),
            max_parallel_probes: 100,
            observer_buffer: 64,
            http_enabled: true,
            listen_addr: "0.0.0.0:9100".to_string(),
            metrics_enabled: true,
            machines: Vec::new(),
        }
    }
}
