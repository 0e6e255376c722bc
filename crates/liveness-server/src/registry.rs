//! Registry of running monitor loops.

use crate::monitor::{MachineMonitor, MonitorContext};
use crate::store::RecordStore;
use crate::types::{MachineId, MonitorState};
use common::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to one loop. `task` is taken once a stop begins; the entry stays
/// in the map as a stopping marker until the loop has terminated.
struct MonitorHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    state: watch::Receiver<MonitorState>,
}

impl MonitorHandle {
    fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

/// Wait for a cancelled loop to finish
async fn join_loop(machine_id: MachineId, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!(machine_id, error = %e, "Monitor loop terminated abnormally");
    }
}

/// Owns every running monitor loop, keyed by machine id.
///
/// Only registry operations add or remove entries; the loops never touch the
/// map. A machine being stopped keeps its entry until its loop has ended, so
/// a concurrent `start` for the same id cannot overlap the old loop.
pub struct MonitorRegistry {
    monitors: DashMap<MachineId, MonitorHandle>,
    ctx: MonitorContext,
}

impl MonitorRegistry {
    /// Create an empty registry whose loops share `ctx`
    pub fn new(ctx: MonitorContext) -> Self {
        Self {
            monitors: DashMap::new(),
            ctx,
        }
    }

    /// Start monitoring a machine.
    ///
    /// Returns false, without touching the running loop, if the machine is
    /// already monitored or its previous loop is still stopping.
    pub fn start(&self, machine_id: MachineId, address: impl Into<String>) -> bool {
        let address = address.into();

        // The entry guard locks its shard; len() must wait until it is gone.
        let started = match self.monitors.entry(machine_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let (monitor, state) = MachineMonitor::new(machine_id, address.clone(), self.ctx.clone());
                let cancel = CancellationToken::new();
                let task = tokio::spawn(monitor.run(cancel.clone()));
                slot.insert(MonitorHandle {
                    cancel,
                    task: Some(task),
                    state,
                });
                true
            }
        };

        if started {
            info!(machine_id, address = %address, "Started monitoring");
            self.update_gauge();
        } else {
            debug!(machine_id, address = %address, "Machine already monitored");
        }
        started
    }

    /// Start a loop for every machine the store knows.
    ///
    /// Returns the number of loops started.
    pub async fn start_all(&self, store: &dyn RecordStore) -> Result<usize> {
        let machines = store.fetch_machines().await?;
        let started = machines
            .into_iter()
            .filter(|machine| self.start(machine.id, machine.address.clone()))
            .count();

        info!(started, total = self.len(), "Monitoring started for known machines");
        Ok(started)
    }

    /// Stop monitoring a machine.
    ///
    /// Returns once the loop has terminated, so no probe for this machine is
    /// in flight afterwards. Returns false if the machine was not monitored
    /// or another caller is already stopping it.
    pub async fn stop(&self, machine_id: MachineId) -> bool {
        let task = self.monitors.get_mut(&machine_id).and_then(|mut handle| {
            handle.cancel.cancel();
            handle.task.take()
        });
        let Some(task) = task else {
            debug!(machine_id, "Machine not monitored");
            return false;
        };

        join_loop(machine_id, task).await;
        self.monitors.remove(&machine_id);
        self.update_gauge();
        info!(machine_id, "Stopped monitoring");
        true
    }

    /// Cancel every loop concurrently and wait for all of them
    pub async fn shutdown(&self) {
        let tasks: Vec<(MachineId, JoinHandle<()>)> = self
            .monitors
            .iter_mut()
            .filter_map(|mut handle| {
                handle.cancel.cancel();
                let machine_id = *handle.key();
                handle.task.take().map(|task| (machine_id, task))
            })
            .collect();
        if tasks.is_empty() {
            return;
        }

        let count = tasks.len();
        let ids: Vec<MachineId> = tasks.iter().map(|(id, _)| *id).collect();
        join_all(tasks.into_iter().map(|(id, task)| join_loop(id, task))).await;

        for id in ids {
            self.monitors.remove(&id);
        }
        self.update_gauge();

        info!(stopped = count, "All monitor loops stopped");
    }

    /// Copy of one machine's scheduling state
    pub fn status(&self, machine_id: MachineId) -> Option<MonitorState> {
        self.monitors
            .get(&machine_id)
            .filter(|handle| handle.is_running())
            .map(|handle| handle.state.borrow().clone())
    }

    /// Copies of every machine's scheduling state, ordered by machine id
    pub fn all_statuses(&self) -> Vec<MonitorState> {
        let mut statuses: Vec<MonitorState> = self
            .monitors
            .iter()
            .filter(|entry| entry.is_running())
            .map(|entry| entry.state.borrow().clone())
            .collect();
        statuses.sort_by_key(|state| state.machine_id);
        statuses
    }

    /// Whether `machine_id` is monitored
    pub fn contains(&self, machine_id: MachineId) -> bool {
        self.monitors
            .get(&machine_id)
            .is_some_and(|handle| handle.is_running())
    }

    /// Number of running loops
    pub fn len(&self) -> usize {
        self.monitors.iter().filter(|entry| entry.is_running()).count()
    }

    /// Whether no loop is running
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update_gauge(&self) {
        if let Some(ref m) = self.ctx.metrics {
            m.update_monitor_count(self.len());
        }
    }
}
