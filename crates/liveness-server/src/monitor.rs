//! Per-machine monitor loop.

use crate::broadcaster::Broadcaster;
use crate::metrics::MetricsRegistry;
use crate::store::RecordStore;
use crate::types::{
    MachineId, MachineStatus, MonitorSettings, MonitorState, ProbeRecord, StatusChangeEvent,
};
use chrono::Utc;
use common::{Error, Result};
use futures::FutureExt;
use liveness::{BackoffPolicy, ProbeExecutor, ProbeOutcome};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators shared by every monitor loop
#[derive(Clone)]
pub struct MonitorContext {
    pub settings: MonitorSettings,
    pub executor: Arc<ProbeExecutor>,
    pub store: Arc<dyn RecordStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub metrics: Option<Arc<MetricsRegistry>>,
}

/// Scheduling unit for one machine.
///
/// The monitor owns its [`MonitorState`]; every iteration publishes a copy
/// on a watch channel so readers never touch the live instance.
pub struct MachineMonitor {
    state: MonitorState,
    backoff: BackoffPolicy,
    failure_threshold: u32,
    ctx: MonitorContext,
    snapshot: watch::Sender<MonitorState>,
}

impl MachineMonitor {
    /// Create a monitor for `machine_id` and a receiver for its state snapshots
    pub fn new(
        machine_id: MachineId,
        address: impl Into<String>,
        ctx: MonitorContext,
    ) -> (Self, watch::Receiver<MonitorState>) {
        let backoff = ctx.settings.backoff();
        let state = MonitorState::new(machine_id, address, backoff.min_interval());
        let (snapshot, rx) = watch::channel(state.clone());

        let monitor = Self {
            state,
            backoff,
            failure_threshold: ctx.settings.failure_threshold.max(1),
            ctx,
            snapshot,
        };
        (monitor, rx)
    }

    /// Current scheduling state
    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// Run a single iteration: probe, evaluate, record.
    ///
    /// Probe failures are not errors. An `Err` means a collaborator failed
    /// after the state was already updated.
    pub async fn check_once(&mut self) -> Result<()> {
        let outcome = self.ctx.executor.probe(&self.state.address).await;
        self.evaluate(outcome).await
    }

    /// Loop until `cancel` fires.
    ///
    /// Cancellation is honored at every await: waiting for or running a
    /// probe, recording its outcome, and the inter-check sleep. A stop in the
    /// middle of recording abandons that iteration's remaining store calls.
    /// Collaborator errors and panics never end the loop; the iteration is
    /// retried after `error_retry_delay`.
    pub async fn run(mut self, cancel: CancellationToken) {
        let machine_id = self.state.machine_id;
        debug!(machine_id, address = %self.state.address, "Monitor loop started");

        loop {
            let started = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.ctx.executor.probe(&self.state.address) => outcome,
            };

            let evaluated = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = AssertUnwindSafe(self.evaluate(outcome)).catch_unwind() => {
                    result.unwrap_or_else(|_| Err(Error::other("panic while recording probe outcome")))
                }
            };

            let delay = match evaluated {
                Ok(()) => self.state.next_check_interval,
                Err(e) => {
                    error!(
                        machine_id,
                        error = %e,
                        retry_in_secs = self.ctx.settings.error_retry_delay.as_secs(),
                        "Monitor iteration failed"
                    );
                    if let Some(ref m) = self.ctx.metrics {
                        m.record_iteration_error(error_type(&e));
                    }
                    self.ctx.settings.error_retry_delay
                }
            };

            if let Some(ref m) = self.ctx.metrics {
                m.record_iteration_duration(started.elapsed());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        debug!(machine_id, "Monitor loop stopped");
    }

    /// Apply one probe outcome to the state and its collaborators
    async fn evaluate(&mut self, outcome: ProbeOutcome) -> Result<()> {
        let machine_id = self.state.machine_id;
        let now = Utc::now();

        self.state.last_check_time = Some(now);
        self.state.last_is_alive = Some(outcome.is_alive);

        if let Some(ref m) = self.ctx.metrics {
            m.record_probe(self.ctx.executor.prober_name(), outcome.is_alive, outcome.response_time);
            m.set_probes_in_flight(self.ctx.executor.in_flight());
        }

        let transition = if outcome.is_alive {
            let was_down = self.state.consecutive_failures >= self.failure_threshold;
            self.state.consecutive_failures = 0;
            self.state.next_check_interval = self.backoff.min_interval();
            was_down.then_some(MachineStatus::Active)
        } else {
            self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
            self.state.next_check_interval = self.backoff.next_interval(self.state.consecutive_failures);
            // Fires once per failure episode; only a success re-arms it.
            (self.state.consecutive_failures == self.failure_threshold)
                .then_some(MachineStatus::Unreachable)
        };

        debug!(
            machine_id,
            outcome = %outcome,
            consecutive_failures = self.state.consecutive_failures,
            next_check_secs = self.state.next_check_interval.as_secs(),
            "Probe evaluated"
        );

        self.snapshot.send_replace(self.state.clone());

        if let Some(status) = transition {
            self.transition(status, outcome, now).await?;
        }

        self.ctx
            .store
            .record_probe(ProbeRecord {
                machine_id,
                is_alive: outcome.is_alive,
                response_time: outcome.response_time,
                consecutive_failures: self.state.consecutive_failures,
                next_check_interval: self.state.next_check_interval,
                checked_at: now,
            })
            .await
    }

    async fn transition(
        &self,
        status: MachineStatus,
        outcome: ProbeOutcome,
        observed_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let machine_id = self.state.machine_id;

        match status {
            MachineStatus::Unreachable => {
                warn!(
                    machine_id,
                    address = %self.state.address,
                    consecutive_failures = self.state.consecutive_failures,
                    "Machine is now UNREACHABLE"
                );
                self.ctx
                    .store
                    .mark_unreachable(machine_id, self.state.consecutive_failures)
                    .await?;
            }
            MachineStatus::Active => {
                info!(machine_id, address = %self.state.address, "Machine is ACTIVE again");
                self.ctx.store.mark_active(machine_id).await?;
            }
        }

        if let Some(ref m) = self.ctx.metrics {
            m.record_state_transition(status);
        }

        self.ctx.broadcaster.broadcast(&StatusChangeEvent {
            machine_id,
            status,
            is_alive: outcome.is_alive,
            response_time: outcome.response_time,
            observed_at,
        });

        Ok(())
    }
}

/// Metric label for an iteration error
fn error_type(error: &Error) -> &'static str {
    match error {
        Error::Store(_) => "store",
        Error::UnknownMachine(_) => "unknown_machine",
        Error::Io(_) => "io",
        Error::Serialization(_) => "serialization",
        Error::Other(_) => "other",
    }
}
