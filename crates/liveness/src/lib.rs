//! Reachability probing for fleet liveness monitoring.
//!
//! This crate provides the probe layer of the monitoring engine:
//! - ICMP echo, TCP connect and HTTP probe mechanisms
//! - A probe executor bounding how many probes run at once
//! - The backoff policy that spaces out checks of failing hosts
//!
//! # Example
//!
//! ```no_run
//! use liveness::{BackoffPolicy, ProbeExecutor, ProbeKind, build_prober};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let prober = build_prober(&ProbeKind::Icmp, Duration::from_secs(2))?;
//! let executor = ProbeExecutor::new(prober, 100, Duration::from_secs(2));
//!
//! let outcome = executor.probe("10.0.0.5").await;
//! let policy = BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(3600));
//! let next = policy.next_interval(if outcome.is_alive { 0 } else { 1 });
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod executor;
pub mod icmp;
pub mod probers;
pub mod types;

pub use backoff::BackoffPolicy;
pub use executor::ProbeExecutor;
pub use probers::{HttpProber, IcmpProber, Prober, TcpProber, build_prober};
pub use types::{ProbeError, ProbeKind, ProbeOutcome};
