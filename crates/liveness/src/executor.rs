//! Bounded-concurrency probe execution.

use crate::probers::Prober;
use crate::types::ProbeOutcome;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Runs probes under a shared concurrency cap.
///
/// Every call holds one limiter slot for the duration of the probe and waits
/// for a slot when all are taken. Probes never fail: timeouts, transport
/// errors and panics inside the probe mechanism all yield
/// [`ProbeOutcome::unreachable`].
pub struct ProbeExecutor {
    prober: Arc<dyn Prober>,
    limiter: Semaphore,
    capacity: usize,
    timeout_duration: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Tracks one in-flight probe; decrements on drop, including on cancellation.
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProbeExecutor {
    /// Create a new executor allowing `max_parallel` probes at once
    pub fn new(prober: Arc<dyn Prober>, max_parallel: usize, timeout_duration: Duration) -> Self {
        let capacity = max_parallel.max(1);
        Self {
            prober,
            limiter: Semaphore::new(capacity),
            capacity,
            timeout_duration,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Probe `address` with the configured timeout
    pub async fn probe(&self, address: &str) -> ProbeOutcome {
        self.probe_with_timeout(address, self.timeout_duration).await
    }

    /// Probe `address`, giving up after `timeout_duration`
    pub async fn probe_with_timeout(&self, address: &str, timeout_duration: Duration) -> ProbeOutcome {
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(address, "Probe limiter closed");
                return ProbeOutcome::unreachable();
            }
        };
        let _slot = InFlightGuard::enter(&self.in_flight, &self.peak_in_flight);

        let attempt = timeout(timeout_duration, self.prober.probe(address));
        match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(Ok(Ok(rtt))) => ProbeOutcome::alive(rtt),
            Ok(Ok(Err(e))) => {
                debug!(address, prober = self.prober.name(), error = %e, "Probe failed");
                ProbeOutcome::unreachable()
            }
            Ok(Err(_)) => {
                debug!(
                    address,
                    prober = self.prober.name(),
                    timeout_ms = timeout_duration.as_millis() as u64,
                    "Probe timed out"
                );
                ProbeOutcome::unreachable()
            }
            Err(_) => {
                warn!(address, prober = self.prober.name(), "Probe mechanism panicked");
                ProbeOutcome::unreachable()
            }
        }
    }

    /// Name of the underlying prober
    pub fn prober_name(&self) -> &str {
        self.prober.name()
    }

    /// Maximum number of simultaneous probes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured probe timeout
    pub fn timeout(&self) -> Duration {
        self.timeout_duration
    }

    /// Probes currently holding a limiter slot
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous probes observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProbeError;
    use async_trait::async_trait;

    struct FixedProber(Result<Duration, ()>);

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, _address: &str) -> Result<Duration, ProbeError> {
            self.0.map_err(|_| ProbeError::Protocol("refused"))
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct HangingProber;

    #[async_trait]
    impl Prober for HangingProber {
        async fn probe(&self, _address: &str) -> Result<Duration, ProbeError> {
            std::future::pending().await
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    struct PanickingProber;

    #[async_trait]
    impl Prober for PanickingProber {
        async fn probe(&self, _address: &str) -> Result<Duration, ProbeError> {
            panic!("probe mechanism blew up")
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_alive_outcome_carries_rtt() {
        let executor = ProbeExecutor::new(
            Arc::new(FixedProber(Ok(Duration::from_millis(3)))),
            4,
            Duration::from_secs(1),
        );
        let outcome = executor.probe("10.0.0.5").await;
        assert!(outcome.is_alive);
        assert_eq!(outcome.response_time, Some(Duration::from_millis(3)));
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_maps_to_unreachable() {
        let executor = ProbeExecutor::new(Arc::new(FixedProber(Err(()))), 4, Duration::from_secs(1));
        assert_eq!(executor.probe("10.0.0.5").await, ProbeOutcome::unreachable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_unreachable() {
        let executor = ProbeExecutor::new(Arc::new(HangingProber), 4, Duration::from_secs(2));
        let outcome = executor.probe("10.0.0.5").await;
        assert!(!outcome.is_alive);
        assert!(outcome.response_time.is_none());
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panic_maps_to_unreachable() {
        let executor = ProbeExecutor::new(Arc::new(PanickingProber), 1, Duration::from_secs(1));
        assert_eq!(executor.probe("10.0.0.5").await, ProbeOutcome::unreachable());
        // The slot is released: a second probe does not deadlock.
        assert_eq!(executor.probe("10.0.0.5").await, ProbeOutcome::unreachable());
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let executor = ProbeExecutor::new(Arc::new(HangingProber), 0, Duration::from_secs(1));
        assert_eq!(executor.capacity(), 1);
    }
}
