//! Fleet liveness monitoring engine and daemon.
//!
//! Every registered machine gets its own monitor loop. A loop probes the
//! machine through the shared [`liveness::ProbeExecutor`], backs off while
//! the machine keeps failing, and reports threshold crossings to the record
//! store and to connected observers.
//!
//! # Components
//!
//! - **MachineMonitor**: the per-machine probe/evaluate/record loop
//! - **MonitorRegistry**: starts, stops and shuts down monitor loops
//! - **Broadcaster**: pushes status changes to observers, dropping dead ones
//! - **RecordStore**: persistence collaborator ([`MemoryStore`] in process)
//! - **HttpServer**: health, metrics, monitor snapshots and the status WebSocket

pub mod broadcaster;
pub mod config;
pub mod http_server;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod types;

pub use broadcaster::{Broadcaster, ChannelObserver, Observer, ObserverError, ObserverId};
pub use config::{Config, ConfigError};
pub use http_server::{AppState, HttpServer};
pub use metrics::MetricsRegistry;
pub use monitor::{MachineMonitor, MonitorContext};
pub use registry::MonitorRegistry;
pub use server::{BoxError, LivenessServer};
pub use store::{MemoryStore, RecordStore};
pub use telemetry::{TelemetryGuard, TracingOptions, setup_tracing};
pub use types::{
    Machine, MachineId, MachineStatus, MonitorSettings, MonitorState, ObserverMessage, ServerConfig,
    StatusChangeEvent,
};
