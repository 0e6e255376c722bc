//! Integration tests for MonitorRegistry and the monitor loops it runs

use async_trait::async_trait;
use common::{Error, Result};
use liveness::{ProbeError, ProbeExecutor, Prober};
use liveness_server::types::{Machine, MachineId, ProbeRecord};
use liveness_server::{
    Broadcaster, MachineStatus, MemoryStore, MonitorContext, MonitorRegistry, MonitorSettings,
    RecordStore,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Prober with a per-address script; unscripted probes fail after `delay`.
#[derive(Default)]
struct TestProber {
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl TestProber {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn script(&self, address: &str, outcomes: &[bool]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(address.to_string(), outcomes.iter().copied().collect());
    }
}

#[async_trait]
impl Prober for TestProber {
    async fn probe(&self, address: &str) -> std::result::Result<Duration, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(address)
            .and_then(|script| script.pop_front());
        match next {
            Some(true) => Ok(Duration::from_millis(1)),
            _ => Err(ProbeError::Protocol("no reply")),
        }
    }

    fn name(&self) -> &str {
        "test"
    }
}

struct Harness {
    registry: MonitorRegistry,
    broadcaster: Arc<Broadcaster>,
    executor: Arc<ProbeExecutor>,
    prober: Arc<TestProber>,
}

fn harness(prober: TestProber, store: Arc<dyn RecordStore>, max_parallel: usize) -> Harness {
    let prober = Arc::new(prober);
    let executor = Arc::new(ProbeExecutor::new(prober.clone(), max_parallel, Duration::from_secs(2)));
    let broadcaster = Arc::new(Broadcaster::default());
    let registry = MonitorRegistry::new(MonitorContext {
        settings: MonitorSettings::default(),
        executor: executor.clone(),
        store,
        broadcaster: broadcaster.clone(),
        metrics: None,
    });

    Harness {
        registry,
        broadcaster,
        executor,
        prober,
    }
}

fn machines(count: u64) -> Vec<Machine> {
    (1..=count)
        .map(|id| Machine {
            id,
            address: format!("10.0.{}.{}", id / 256, id % 256),
            hostname: None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let h = harness(TestProber::default(), Arc::new(MemoryStore::new()), 10);

    assert!(h.registry.start(1, "10.0.0.5"));
    assert!(!h.registry.start(1, "10.0.0.99"));
    assert_eq!(h.registry.len(), 1);
    assert_eq!(h.registry.status(1).unwrap().address, "10.0.0.5");

    h.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_removes_status() {
    let h = harness(TestProber::default(), Arc::new(MemoryStore::new()), 10);
    h.registry.start(1, "10.0.0.1");
    h.registry.start(2, "10.0.0.2");

    assert!(h.registry.stop(1).await);
    let ids: Vec<MachineId> = h.registry.all_statuses().iter().map(|s| s.machine_id).collect();
    assert_eq!(ids, vec![2]);
    assert!(h.registry.status(1).is_none());

    // Unknown id is a no-op
    assert!(!h.registry.stop(42).await);

    h.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_with_no_loops_is_noop() {
    let h = harness(TestProber::default(), Arc::new(MemoryStore::new()), 10);
    tokio::time::timeout(Duration::from_millis(1), h.registry.shutdown())
        .await
        .expect("shutdown of an empty registry should return immediately");
    assert!(h.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_every_loop() {
    let store = Arc::new(MemoryStore::with_machines(machines(50)));
    let h = harness(TestProber::default(), store.clone(), 10);

    assert_eq!(h.registry.start_all(store.as_ref()).await.unwrap(), 50);
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.registry.shutdown().await;
    assert!(h.registry.is_empty());

    // No loop keeps probing after shutdown returned.
    let calls = h.prober.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(7200)).await;
    assert_eq!(h.prober.calls.load(Ordering::SeqCst), calls);
    assert_eq!(h.executor.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_in_flight_probe() {
    let h = harness(
        TestProber::with_delay(Duration::from_secs(30)),
        Arc::new(MemoryStore::new()),
        10,
    );
    h.registry.start(1, "10.0.0.1");

    // Let the loop enter its probe.
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.executor.in_flight(), 1);

    let started = Instant::now();
    assert!(h.registry.stop(1).await);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.executor.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_episode_timeline() {
    common::logging::init_for_tests();

    let store = Arc::new(MemoryStore::with_machines([Machine {
        id: 1,
        address: "10.0.0.5".to_string(),
        hostname: Some("web-1".to_string()),
    }]));
    let prober = TestProber::default();
    prober.script("10.0.0.5", &[false, false, false, false, false, true]);
    let h = harness(prober, store.clone(), 10);
    let (_observer, mut events) = h.broadcaster.subscribe(16);

    let started = Instant::now();
    h.registry.start(1, "10.0.0.5");

    // Probes at 0, 60, 180: the third failure crosses the threshold.
    let event: serde_json::Value = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
    assert_eq!(event["status"], "unreachable");
    assert_eq!(event["is_alive"], false);
    assert_eq!(started.elapsed().as_secs(), 180);

    // Then 420, 900 (no events) and the success at 1860.
    let event: serde_json::Value = serde_json::from_str(&events.recv().await.unwrap()).unwrap();
    assert_eq!(event["status"], "active");
    assert_eq!(event["is_alive"], true);
    assert_eq!(started.elapsed().as_secs(), 1860);

    // History is written right after the broadcast.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let history = store.history(1).await;
    let intervals: Vec<u64> = history.iter().map(|r| r.next_check_interval.as_secs()).collect();
    assert_eq!(intervals, vec![60, 120, 240, 480, 960, 60]);
    assert_eq!(store.failure_logs().await.len(), 1);
    assert_eq!(store.machine(1).unwrap().status, MachineStatus::Active);

    h.registry.shutdown().await;
}

/// Store whose first `failures` history writes fail
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn fetch_machines(&self) -> Result<Vec<Machine>> {
        self.inner.fetch_machines().await
    }

    async fn record_probe(&self, record: ProbeRecord) -> Result<()> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::store("connection reset"));
        }
        self.inner.record_probe(record).await
    }

    async fn mark_unreachable(&self, machine_id: MachineId, consecutive_failures: u32) -> Result<()> {
        self.inner.mark_unreachable(machine_id, consecutive_failures).await
    }

    async fn mark_active(&self, machine_id: MachineId) -> Result<()> {
        self.inner.mark_active(machine_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_store_error_keeps_loop_alive() {
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::with_machines(machines(1)),
        failures: AtomicUsize::new(2),
    });
    let prober = TestProber::default();
    prober.script("10.0.0.1", &[true, true, true, true]);
    let h = harness(prober, store.clone(), 10);

    h.registry.start(1, "10.0.0.1");

    // Two failed iterations retry after 60s each, then the loop records normally.
    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(h.prober.calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.inner.history(1).await.len(), 1);
    assert!(h.registry.contains(1));

    h.registry.shutdown().await;
}

/// Store whose history writes take ten minutes
struct SlowStore(MemoryStore);

#[async_trait]
impl RecordStore for SlowStore {
    async fn fetch_machines(&self) -> Result<Vec<Machine>> {
        self.0.fetch_machines().await
    }

    async fn record_probe(&self, record: ProbeRecord) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        self.0.record_probe(record).await
    }

    async fn mark_unreachable(&self, machine_id: MachineId, consecutive_failures: u32) -> Result<()> {
        self.0.mark_unreachable(machine_id, consecutive_failures).await
    }

    async fn mark_active(&self, machine_id: MachineId) -> Result<()> {
        self.0.mark_active(machine_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_does_not_wait_for_slow_store() {
    let h = harness(
        TestProber::default(),
        Arc::new(SlowStore(MemoryStore::with_machines(machines(1)))),
        10,
    );
    h.registry.start(1, "10.0.0.1");

    // The loop is now stuck writing its first record.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.prober.calls.load(Ordering::SeqCst), 1);

    let started = Instant::now();
    assert!(h.registry.stop(1).await);
    // Probe timeout is 2s.
    assert!(started.elapsed() <= Duration::from_secs(2));
    assert!(!h.registry.contains(1));
}

/// Store that panics on every history write
struct PanickingStore(MemoryStore);

#[async_trait]
impl RecordStore for PanickingStore {
    async fn fetch_machines(&self) -> Result<Vec<Machine>> {
        self.0.fetch_machines().await
    }

    async fn record_probe(&self, _record: ProbeRecord) -> Result<()> {
        panic!("history table dropped")
    }

    async fn mark_unreachable(&self, machine_id: MachineId, consecutive_failures: u32) -> Result<()> {
        self.0.mark_unreachable(machine_id, consecutive_failures).await
    }

    async fn mark_active(&self, machine_id: MachineId) -> Result<()> {
        self.0.mark_active(machine_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_store_panic_keeps_loop_alive() {
    let h = harness(
        TestProber::default(),
        Arc::new(PanickingStore(MemoryStore::with_machines(machines(1)))),
        10,
    );
    h.registry.start(1, "10.0.0.1");

    // Every iteration panics and is retried after the 60s fallback delay.
    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(h.prober.calls.load(Ordering::SeqCst), 3);

    let state = h.registry.status(1).unwrap();
    assert_eq!(state.consecutive_failures, 3);
    assert!(!h.registry.start(1, "10.0.0.1"));

    // The loop is still cancellable and stops cleanly.
    assert!(h.registry.stop(1).await);
    assert!(h.registry.start(1, "10.0.0.1"));
    h.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_during_stop_does_not_overlap_loops() {
    let h = harness(
        TestProber::with_delay(Duration::from_secs(30)),
        Arc::new(MemoryStore::new()),
        10,
    );
    h.registry.start(1, "10.0.0.1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.executor.in_flight(), 1);

    // stop is polled first and parks on the old loop; start runs inside that window.
    let (stopped, restarted) = tokio::join!(h.registry.stop(1), async {
        h.registry.start(1, "10.0.0.1")
    });
    assert!(stopped);
    assert!(!restarted);
    assert_eq!(h.executor.peak_in_flight(), 1);
    assert!(!h.registry.contains(1));

    // Once the old loop is gone the machine can be monitored again.
    assert!(h.registry.start(1, "10.0.0.1"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.executor.in_flight(), 1);
    h.registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_probe_concurrency_never_exceeds_cap() {
    let store = Arc::new(MemoryStore::with_machines(machines(1000)));
    let h = harness(TestProber::with_delay(Duration::from_millis(50)), store.clone(), 100);

    h.registry.start_all(store.as_ref()).await.unwrap();
    assert_eq!(h.registry.len(), 1000);

    // All 1000 first probes run in waves of 100.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.prober.calls.load(Ordering::SeqCst), 1000);
    assert_eq!(h.executor.peak_in_flight(), 100);

    h.registry.shutdown().await;
    assert_eq!(h.executor.in_flight(), 0);
}
