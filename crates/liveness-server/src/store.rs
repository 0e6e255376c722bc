//! Record store collaborator.
//!
//! The monitoring engine persists probe history and machine status through
//! [`RecordStore`]. [`MemoryStore`] keeps everything in process.

use crate::types::{FailureLog, Machine, MachineId, MachineStatus, ProbeRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Error, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default number of probe records kept by [`MemoryStore`]
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// Persistence operations consumed by the monitoring engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All machines that should be monitored
    async fn fetch_machines(&self) -> Result<Vec<Machine>>;

    /// Append one probe outcome to the history
    async fn record_probe(&self, record: ProbeRecord) -> Result<()>;

    /// Mark a machine unreachable and write a failure log entry
    async fn mark_unreachable(&self, machine_id: MachineId, consecutive_failures: u32) -> Result<()>;

    /// Mark a machine active again and refresh its last-seen time
    async fn mark_active(&self, machine_id: MachineId) -> Result<()>;
}

/// Machine row with its persisted status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineRecord {
    #[serde(flatten)]
    pub machine: Machine,
    pub status: MachineStatus,
    /// Failure count reported when the machine was marked unreachable
    pub consecutive_failures: u32,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// In-process record store
pub struct MemoryStore {
    machines: DashMap<MachineId, MachineRecord>,
    history: RwLock<VecDeque<ProbeRecord>>,
    failure_logs: RwLock<Vec<FailureLog>>,
    history_limit: usize,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create an empty store keeping at most `history_limit` probe records
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            machines: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
            failure_logs: RwLock::new(Vec::new()),
            history_limit: history_limit.max(1),
        }
    }

    /// Create a store holding `machines`
    pub fn with_machines(machines: impl IntoIterator<Item = Machine>) -> Self {
        let store = Self::new();
        for machine in machines {
            store.insert_machine(machine);
        }
        store
    }

    /// Insert or replace a machine. New machines start active.
    ///
    /// Returns true if the machine was not known before.
    pub fn insert_machine(&self, machine: Machine) -> bool {
        let now = Utc::now();
        match self.machines.get_mut(&machine.id) {
            Some(mut existing) => {
                existing.machine = machine;
                false
            }
            None => {
                debug!(machine_id = machine.id, address = %machine.address, "Machine registered");
                self.machines.insert(
                    machine.id,
                    MachineRecord {
                        machine,
                        status: MachineStatus::Active,
                        consecutive_failures: 0,
                        last_seen: now,
                        registered_at: now,
                    },
                );
                true
            }
        }
    }

    /// Remove a machine; unreachable machines get a final failure log entry.
    ///
    /// Returns false if the machine was unknown.
    pub async fn remove_machine(&self, machine_id: MachineId) -> bool {
        let Some((_, record)) = self.machines.remove(&machine_id) else {
            return false;
        };

        if record.status == MachineStatus::Unreachable {
            self.failure_logs.write().await.push(FailureLog {
                machine_id,
                hostname: record.machine.hostname.clone(),
                address: record.machine.address.clone(),
                consecutive_failures: record.consecutive_failures,
                failure_detected_at: Utc::now(),
            });
        }

        info!(machine_id, "Machine removed");
        true
    }

    /// Snapshot of one machine
    pub fn machine(&self, machine_id: MachineId) -> Option<MachineRecord> {
        self.machines.get(&machine_id).map(|entry| entry.value().clone())
    }

    /// Probe history of one machine, oldest first
    pub async fn history(&self, machine_id: MachineId) -> Vec<ProbeRecord> {
        self.history
            .read()
            .await
            .iter()
            .filter(|record| record.machine_id == machine_id)
            .cloned()
            .collect()
    }

    /// All failure log entries, oldest first
    pub async fn failure_logs(&self) -> Vec<FailureLog> {
        self.failure_logs.read().await.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch_machines(&self) -> Result<Vec<Machine>> {
        let mut machines: Vec<Machine> = self
            .machines
            .iter()
            .map(|entry| entry.machine.clone())
            .collect();
        machines.sort_by_key(|m| m.id);
        Ok(machines)
    }

    async fn record_probe(&self, record: ProbeRecord) -> Result<()> {
        let mut history = self.history.write().await;
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(record);
        Ok(())
    }

    async fn mark_unreachable(&self, machine_id: MachineId, consecutive_failures: u32) -> Result<()> {
        let log = {
            let mut entry = self
                .machines
                .get_mut(&machine_id)
                .ok_or(Error::UnknownMachine(machine_id))?;
            let now = Utc::now();
            entry.status = MachineStatus::Unreachable;
            entry.consecutive_failures = consecutive_failures;
            entry.last_seen = now;

            FailureLog {
                machine_id,
                hostname: entry.machine.hostname.clone(),
                address: entry.machine.address.clone(),
                consecutive_failures,
                failure_detected_at: now,
            }
        };

        self.failure_logs.write().await.push(log);
        Ok(())
    }

    async fn mark_active(&self, machine_id: MachineId) -> Result<()> {
        let mut entry = self
            .machines
            .get_mut(&machine_id)
            .ok_or(Error::UnknownMachine(machine_id))?;
        entry.status = MachineStatus::Active;
        entry.consecutive_failures = 0;
        entry.last_seen = Utc::now();
        Ok(())
    }
}
