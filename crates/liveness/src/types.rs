//! Probe types and structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result of a single reachability probe.
///
/// `response_time` is only ever present when `is_alive` is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// Whether the host answered within the timeout
    pub is_alive: bool,

    /// Round-trip time of the answered probe
    pub response_time: Option<Duration>,
}

impl ProbeOutcome {
    /// Create an outcome for a host that answered
    pub fn alive(response_time: Duration) -> Self {
        Self {
            is_alive: true,
            response_time: Some(response_time),
        }
    }

    /// Create an outcome for a host that did not answer
    pub fn unreachable() -> Self {
        Self {
            is_alive: false,
            response_time: None,
        }
    }

    /// Response time in fractional milliseconds
    pub fn response_time_ms(&self) -> Option<f64> {
        self.response_time.map(|d| d.as_nanos() as f64 / 1_000_000.0)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.response_time_ms() {
            Some(ms) if self.is_alive => write!(f, "ALIVE ({:.2}ms)", ms),
            _ => write!(f, "UNREACHABLE"),
        }
    }
}

/// Probe mechanism used to decide whether a host is alive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeKind {
    /// ICMP echo request
    #[default]
    Icmp,

    /// TCP connection check
    Tcp {
        /// Port to connect to
        port: u16,
    },

    /// HTTP/HTTPS check
    Http {
        /// Port to connect to
        port: u16,
        /// Request path
        #[serde(default = "default_http_path")]
        path: String,
        /// Expected status codes (empty accepts any status)
        #[serde(default)]
        expected_codes: Vec<u16>,
        /// Use HTTPS
        #[serde(default)]
        https: bool,
    },
}

fn default_http_path() -> String {
    "/".to_string()
}

impl ProbeKind {
    /// Short name used in logs and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            ProbeKind::Icmp => "icmp",
            ProbeKind::Tcp { .. } => "tcp",
            ProbeKind::Http { .. } => "http",
        }
    }
}

/// Errors raised by probe mechanisms.
///
/// These never leave the probe layer: the executor folds every one of them
/// into an unreachable [`ProbeOutcome`].
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("could not resolve address: {0}")]
    Resolve(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),

    #[error("malformed reply: {0}")]
    Protocol(&'static str),
}
