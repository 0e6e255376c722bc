//! Prometheus metrics for the liveness server.

use crate::types::MachineStatus;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::time::Duration;

/// Labels for probe result metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    /// Probe mechanism (icmp, tcp, http)
    pub prober: String,
    /// Result (alive, unreachable)
    pub result: String,
}

/// Labels for per-mechanism metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProberLabels {
    /// Probe mechanism (icmp, tcp, http)
    pub prober: String,
}

/// Labels for status transition metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    /// New status (active, unreachable)
    pub to: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error type (store, ...)
    pub error_type: String,
}

/// Metrics registry with all liveness server metrics
pub struct MetricsRegistry {
    /// Prometheus registry. Counters are registered without the `_total`
    /// suffix, the encoder appends it.
    pub registry: Registry,

    // Probe metrics
    probes_total: Family<ProbeLabels, Counter>,
    probe_response_time_seconds: Family<ProberLabels, Histogram>,
    probes_in_flight: Gauge,

    // Monitor metrics
    monitors_active: Gauge,
    state_transitions_total: Family<TransitionLabels, Counter>,
    iteration_errors_total: Family<ErrorLabels, Counter>,
    monitor_iteration_duration_seconds: Histogram,

    // Broadcast metrics
    observers_connected: Gauge,
    observers_pruned_total: Counter,
    broadcasts_total: Counter,
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let probes_total = Family::<ProbeLabels, Counter>::default();
        registry.register(
            "liveness_probes",
            "Total probes performed",
            probes_total.clone(),
        );

        let probe_response_time_seconds = Family::<ProberLabels, Histogram>::new_with_constructor(|| {
            // 100us to ~3s
            Histogram::new(exponential_buckets(0.0001, 2.0, 15))
        });
        registry.register(
            "liveness_probe_response_time_seconds",
            "Round-trip time of answered probes in seconds",
            probe_response_time_seconds.clone(),
        );

        let probes_in_flight = Gauge::default();
        registry.register(
            "liveness_probes_in_flight",
            "Probes currently holding a limiter slot",
            probes_in_flight.clone(),
        );

        let monitors_active = Gauge::default();
        registry.register(
            "liveness_monitors_active",
            "Number of running monitor loops",
            monitors_active.clone(),
        );

        let state_transitions_total = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "liveness_state_transitions",
            "Total machine status transitions",
            state_transitions_total.clone(),
        );

        let iteration_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "liveness_iteration_errors",
            "Monitor iterations aborted by an internal error",
            iteration_errors_total.clone(),
        );

        let monitor_iteration_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 12));
        registry.register(
            "liveness_monitor_iteration_duration_seconds",
            "Duration of one monitor iteration, probe included",
            monitor_iteration_duration_seconds.clone(),
        );

        let observers_connected = Gauge::default();
        registry.register(
            "liveness_observers_connected",
            "Connected status observers",
            observers_connected.clone(),
        );

        let observers_pruned_total = Counter::default();
        registry.register(
            "liveness_observers_pruned",
            "Observers removed after a failed delivery",
            observers_pruned_total.clone(),
        );

        let broadcasts_total = Counter::default();
        registry.register(
            "liveness_broadcasts",
            "Status change events broadcast",
            broadcasts_total.clone(),
        );

        Self {
            registry,
            probes_total,
            probe_response_time_seconds,
            probes_in_flight,
            monitors_active,
            state_transitions_total,
            iteration_errors_total,
            monitor_iteration_duration_seconds,
            observers_connected,
            observers_pruned_total,
            broadcasts_total,
        }
    }

    /// Record a probe outcome
    pub fn record_probe(&self, prober: &str, is_alive: bool, response_time: Option<Duration>) {
        let result = if is_alive { "alive" } else { "unreachable" };
        self.probes_total
            .get_or_create(&ProbeLabels {
                prober: prober.to_string(),
                result: result.to_string(),
            })
            .inc();

        if let Some(rtt) = response_time {
            self.probe_response_time_seconds
                .get_or_create(&ProberLabels {
                    prober: prober.to_string(),
                })
                .observe(rtt.as_secs_f64());
        }
    }

    /// Update the in-flight probe gauge
    pub fn set_probes_in_flight(&self, count: usize) {
        self.probes_in_flight.set(count as i64);
    }

    /// Update running monitor count
    pub fn update_monitor_count(&self, count: usize) {
        self.monitors_active.set(count as i64);
    }

    /// Record a status transition
    pub fn record_state_transition(&self, to: MachineStatus) {
        self.state_transitions_total
            .get_or_create(&TransitionLabels { to: to.to_string() })
            .inc();
    }

    /// Record an aborted monitor iteration
    pub fn record_iteration_error(&self, error_type: &str) {
        self.iteration_errors_total
            .get_or_create(&ErrorLabels {
                error_type: error_type.to_string(),
            })
            .inc();
    }

    /// Record monitor iteration duration
    pub fn record_iteration_duration(&self, duration: Duration) {
        self.monitor_iteration_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Update connected observer count
    pub fn set_observers_connected(&self, count: usize) {
        self.observers_connected.set(count as i64);
    }

    /// Record observers dropped after a failed delivery
    pub fn record_observers_pruned(&self, count: usize) {
        self.observers_pruned_total.inc_by(count as u64);
    }

    /// Record one broadcast
    pub fn record_broadcast(&self) {
        self.broadcasts_total.inc();
    }

    /// Render in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_probe() {
        let registry = MetricsRegistry::new();
        registry.record_probe("icmp", true, Some(Duration::from_millis(2)));
        registry.record_probe("icmp", false, None);

        let text = registry.encode().unwrap();
        assert!(text.contains(r#"liveness_probes_total{prober="icmp",result="alive"} 1"#));
        assert!(text.contains(r#"liveness_probes_total{prober="icmp",result="unreachable"} 1"#));
        assert!(text.contains("liveness_probe_response_time_seconds_count{prober=\"icmp\"} 1"));
    }

    #[test]
    fn test_state_transitions() {
        let registry = MetricsRegistry::new();
        registry.record_state_transition(MachineStatus::Unreachable);
        registry.record_state_transition(MachineStatus::Active);
        registry.record_state_transition(MachineStatus::Unreachable);

        let text = registry.encode().unwrap();
        assert!(text.contains(r#"liveness_state_transitions_total{to="unreachable"} 2"#));
        assert!(text.contains(r#"liveness_state_transitions_total{to="active"} 1"#));
    }

    #[test]
    fn test_gauges() {
        let registry = MetricsRegistry::new();
        registry.update_monitor_count(10);
        registry.update_monitor_count(5);
        registry.set_observers_connected(3);
        registry.set_probes_in_flight(7);

        let text = registry.encode().unwrap();
        assert!(text.contains("liveness_monitors_active 5"));
        assert!(text.contains("liveness_observers_connected 3"));
        assert!(text.contains("liveness_probes_in_flight 7"));
    }

    #[test]
    fn test_broadcast_counters() {
        let registry = MetricsRegistry::new();
        registry.record_broadcast();
        registry.record_broadcast();
        registry.record_observers_pruned(2);
        registry.record_iteration_error("store");
        registry.record_iteration_duration(Duration::from_millis(5));

        let text = registry.encode().unwrap();
        assert!(text.contains("liveness_broadcasts_total 2"));
        assert!(text.contains("liveness_observers_pruned_total 2"));
        assert!(text.contains(r#"liveness_iteration_errors_total{error_type="store"} 1"#));
    }
}
