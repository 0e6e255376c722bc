//! Configuration loading and validation for the liveness server

use crate::types::{Machine, MonitorSettings, ServerConfig};
use liveness::ProbeKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "LIVENESS_CONFIG";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitoring: MonitoringSettings,

    #[serde(default)]
    pub probe: ProbeSettings,

    #[serde(default)]
    pub broadcast: BroadcastSettings,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    /// Machines seeded into the record store
    #[serde(default)]
    pub machines: Vec<Machine>,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.monitoring.validate()?;
        self.probe.validate()?;
        self.broadcast.validate()?;
        self.http.validate()?;
        Ok(())
    }
}

/// Monitor loop scheduling
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_interval_bounds"))]
pub struct MonitoringSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_min_interval")]
    pub min_check_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub max_check_interval: Duration,

    #[validate(range(min = 1, max = 100))]
    pub failure_threshold: u32,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_retry_delay")]
    pub error_retry_delay: Duration,
}

/// Probe mechanism and limits
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProbeSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_probe_timeout")]
    pub timeout: Duration,

    #[validate(range(min = 1, max = 10000))]
    pub max_parallel: usize,

    #[validate(custom = "validate_check")]
    pub check: ProbeKind,
}

/// Observer fan-out
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BroadcastSettings {
    #[validate(range(min = 1, max = 10000))]
    pub observer_buffer: usize,
}

/// HTTP surface
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HttpSettings {
    pub enabled: bool,

    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// Prometheus metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
}

/// OpenTelemetry export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub service_name: String,
    pub otlp_endpoint: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for MonitoringSettings {
    fn default() -> Self {
        let settings = MonitorSettings::default();
        Self {
            min_check_interval: settings.min_check_interval,
            max_check_interval: settings.max_check_interval,
            failure_threshold: settings.failure_threshold,
            error_retry_delay: settings.error_retry_delay,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_parallel: 100,
            check: ProbeKind::Icmp,
        }
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self { observer_buffer: 64 }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9100".to_string(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "liveness-server".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
        }
    }
}

// Custom validators

fn validate_interval_bounds(settings: &MonitoringSettings) -> Result<(), ValidationError> {
    if settings.min_check_interval > settings.max_check_interval {
        return Err(ValidationError::new("min_check_interval_exceeds_max"));
    }
    Ok(())
}

fn validate_min_interval(interval: &Duration) -> Result<(), ValidationError> {
    if *interval < Duration::from_secs(1) {
        return Err(ValidationError::new("min_check_interval_too_small"));
    }
    Ok(())
}

fn validate_retry_delay(delay: &Duration) -> Result<(), ValidationError> {
    if delay.is_zero() {
        return Err(ValidationError::new("error_retry_delay_zero"));
    }
    Ok(())
}

fn validate_probe_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    let millis = timeout.as_millis();
    if !(10..=60_000).contains(&millis) {
        return Err(ValidationError::new("probe_timeout_out_of_range"));
    }
    Ok(())
}

fn validate_check(check: &ProbeKind) -> Result<(), ValidationError> {
    match check {
        ProbeKind::Tcp { port: 0 } | ProbeKind::Http { port: 0, .. } => {
            Err(ValidationError::new("probe_port_zero"))
        }
        ProbeKind::Http { path, .. } if !path.starts_with('/') => {
            Err(ValidationError::new("http_path_not_absolute"))
        }
        _ => Ok(()),
    }
}

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<std::net::SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

// Configuration loading implementation

impl Config {
    /// Load configuration from `LIVENESS_CONFIG` or the default search paths
    pub fn load() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path));
            }
            tracing::info!("Loading configuration from: {}", path.display());
            return Self::load_from_file(&path);
        }

        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/liveness/liveness-server.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./liveness-server.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/liveness/liveness-server.yaml"))
    }

    /// Convert to the internal server configuration
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            monitor: MonitorSettings {
                min_check_interval: self.monitoring.min_check_interval,
                max_check_interval: self.monitoring.max_check_interval,
                failure_threshold: self.monitoring.failure_threshold,
                error_retry_delay: self.monitoring.error_retry_delay,
            },
            probe_kind: self.probe.check.clone(),
            probe_timeout: self.probe.timeout,
            max_parallel_probes: self.probe.max_parallel,
            observer_buffer: self.broadcast.observer_buffer,
            http_enabled: self.http.enabled,
            listen_addr: self.http.listen_addr.clone(),
            metrics_enabled: self.metrics.enabled,
            machines: self.machines.clone(),
        }
    }
}
