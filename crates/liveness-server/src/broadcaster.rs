//! Status change fan-out to connected observers.
//!
//! Observers are push endpoints (WebSocket sessions in the daemon). Delivery
//! never waits on an observer: each send is a non-blocking enqueue, and an
//! observer whose send fails is dropped from the set during that broadcast.

use crate::metrics::MetricsRegistry;
use crate::types::{ObserverMessage, StatusChangeEvent};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifier handed out by [`Broadcaster::connect`]
pub type ObserverId = u64;

/// Why a message could not be handed to an observer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObserverError {
    #[error("observer queue is full")]
    Full,

    #[error("observer is closed")]
    Closed,
}

/// A connected status consumer
pub trait Observer: Send + Sync {
    /// Enqueue `message` without waiting
    fn try_send(&self, message: &str) -> Result<(), ObserverError>;
}

/// Observer backed by a bounded channel.
///
/// The receiving half is drained by whatever serves the session.
pub struct ChannelObserver {
    tx: mpsc::Sender<String>,
}

impl ChannelObserver {
    /// Create an observer queueing at most `buffer` undelivered messages
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn try_send(&self, message: &str) -> Result<(), ObserverError> {
        self.tx.try_send(message.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ObserverError::Full,
            mpsc::error::TrySendError::Closed(_) => ObserverError::Closed,
        })
    }
}

/// Fan-out of status change events
pub struct Broadcaster {
    observers: DashMap<ObserverId, Arc<dyn Observer>>,
    next_id: AtomicU64,
    // Serializes fan-out so every observer sees events in call order.
    fan_out: Mutex<()>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Broadcaster {
    /// Create a broadcaster with no observers
    pub fn new(metrics: Option<Arc<MetricsRegistry>>) -> Self {
        Self {
            observers: DashMap::new(),
            next_id: AtomicU64::new(1),
            fan_out: Mutex::new(()),
            metrics,
        }
    }

    /// Add an observer to the set
    pub fn connect(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.insert(id, observer);
        self.update_gauge();
        debug!(observer_id = id, observers = self.observers.len(), "Observer connected");
        id
    }

    /// Create a channel observer, connect it and return its receiving half
    pub fn subscribe(&self, buffer: usize) -> (ObserverId, mpsc::Receiver<String>) {
        let (observer, rx) = ChannelObserver::new(buffer);
        (self.connect(Arc::new(observer)), rx)
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn disconnect(&self, id: ObserverId) -> bool {
        let removed = self.observers.remove(&id).is_some();
        if removed {
            self.update_gauge();
            debug!(observer_id = id, observers = self.observers.len(), "Observer disconnected");
        }
        removed
    }

    /// Number of connected observers
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Deliver a status change to every connected observer.
    ///
    /// Returns the number of observers the event was handed to.
    pub fn broadcast(&self, event: &StatusChangeEvent) -> usize {
        self.broadcast_message(&event.to_message())
    }

    /// Deliver an arbitrary message to every connected observer
    pub fn broadcast_message(&self, message: &ObserverMessage) -> usize {
        if self.observers.is_empty() {
            return 0;
        }

        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize observer message");
                return 0;
            }
        };

        let _ordered = self.fan_out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut delivered = 0;
        let mut failed = Vec::new();
        for entry in self.observers.iter() {
            match entry.value().try_send(&payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(observer_id = *entry.key(), error = %e, "Observer send failed");
                    failed.push(*entry.key());
                }
            }
        }

        // Iteration holds shard read locks, so removal happens afterwards.
        let pruned = failed
            .into_iter()
            .filter(|id| self.observers.remove(id).is_some())
            .count();

        if pruned > 0 {
            debug!(pruned, observers = self.observers.len(), "Pruned failed observers");
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_broadcast();
            if pruned > 0 {
                metrics.record_observers_pruned(pruned);
                metrics.set_observers_connected(self.observers.len());
            }
        }

        delivered
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_observers_connected(self.observers.len());
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(None)
    }
}
