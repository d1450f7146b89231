//! End-to-end scenarios for the job coordinator, driven through in-memory
//! fakes of every seam: binding after a delay, binding timeout, failed
//! resolution, mid-run automation failure, operator interruption, and the
//! guarantee that release runs exactly once on every path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coordinator::automation::{DriverError, UiDriver, UiSession};
use coordinator::probe::LivenessProbe;
use coordinator::resolver::{PodLocator, PodRef, ResolveError};
use coordinator::store::{JobStore, StoreError};
use coordinator::tunnel::{derive_local_port, PortForward, TunnelError, TunnelFactory};
use coordinator::{FarmConfig, JobCoordinator, JobState, Seams};

// ── Fakes ────────────────────────────────────────────────────────────

fn connectivity_error(op: &'static str) -> StoreError {
    StoreError {
        op,
        source: (redis::ErrorKind::IoError, "connection refused").into(),
    }
}

#[derive(Default)]
struct FakeStore {
    /// Binding appears after this many polls; `u32::MAX` means never.
    reveal_after: u32,
    address: Option<String>,
    fail_clear: bool,
    polls: AtomicU32,
    queue: Mutex<Vec<String>>,
    clears: AtomicU32,
    removes: AtomicU32,
}

impl FakeStore {
    fn never_binds() -> Self {
        Self {
            reveal_after: u32::MAX,
            ..Self::default()
        }
    }

    fn binds_to(address: &str, reveal_after: u32) -> Self {
        Self {
            reveal_after,
            address: Some(address.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl JobStore for FakeStore {
    async fn enqueue(&self, job_id: &str) -> Result<(), StoreError> {
        self.queue.lock().unwrap().push(job_id.to_string());
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<bool, StoreError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.queue.lock().unwrap();
        let before = queue.len();
        queue.retain(|id| id != job_id);
        Ok(queue.len() < before)
    }

    async fn pending(&self) -> Result<usize, StoreError> {
        Ok(self.queue.lock().unwrap().len())
    }

    async fn binding(&self, _job_id: &str) -> Result<Option<String>, StoreError> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if poll > self.reveal_after {
            Ok(self.address.clone())
        } else {
            Ok(None)
        }
    }

    async fn clear_binding(&self, _job_id: &str) -> Result<bool, StoreError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        if self.fail_clear {
            return Err(connectivity_error("hdel"));
        }
        Ok(self.address.is_some())
    }

    async fn bindings(&self) -> Result<Vec<(String, String)>, StoreError> {
        Ok(Vec::new())
    }
}

struct FakeLocator {
    pod_name: Option<String>,
    resolves: AtomicU32,
    deletes: AtomicU32,
}

impl FakeLocator {
    fn resolves_to(name: &str) -> Self {
        Self {
            pod_name: Some(name.to_string()),
            resolves: AtomicU32::new(0),
            deletes: AtomicU32::new(0),
        }
    }

    fn no_match() -> Self {
        Self {
            pod_name: None,
            resolves: AtomicU32::new(0),
            deletes: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PodLocator for FakeLocator {
    async fn pod_by_address(&self, address: &str) -> Result<PodRef, ResolveError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        match &self.pod_name {
            Some(name) => Ok(PodRef {
                name: name.clone(),
                address: Some(address.to_string()),
            }),
            None => Err(ResolveError::NoMatch {
                namespace: "keda".to_string(),
                address: address.to_string(),
            }),
        }
    }

    async fn list_workers(&self) -> Result<Vec<PodRef>, ResolveError> {
        Ok(Vec::new())
    }

    async fn delete_pod(&self, _name: &str) -> Result<(), ResolveError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeTunnels {
    fail_open: bool,
    opened: AtomicU32,
    last_local_port: AtomicU32,
    shutdowns: Arc<AtomicU32>,
}

struct FakeForward {
    local_port: u16,
    shutdowns: Arc<AtomicU32>,
}

#[async_trait]
impl PortForward for FakeForward {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn shutdown(&mut self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TunnelFactory for FakeTunnels {
    async fn open(
        &self,
        target: &str,
        _remote_port: u16,
        local_port: u16,
    ) -> Result<Box<dyn PortForward>, TunnelError> {
        if self.fail_open {
            return Err(TunnelError::StartupFailed {
                target: target.to_string(),
                stderr: "unable to listen".to_string(),
            });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.last_local_port
            .store(u32::from(local_port), Ordering::SeqCst);
        Ok(Box::new(FakeForward {
            local_port,
            shutdowns: Arc::clone(&self.shutdowns),
        }))
    }
}

struct FakeProbe {
    ready_after: u32,
    checks: AtomicU32,
}

impl FakeProbe {
    fn ready_immediately() -> Self {
        Self {
            ready_after: 0,
            checks: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LivenessProbe for FakeProbe {
    async fn check(&self, _endpoint: &str) -> bool {
        let check = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        check > self.ready_after
    }
}

struct FakeDriver {
    title: Option<String>,
    opens: AtomicU32,
    quits: Arc<AtomicU32>,
}

impl FakeDriver {
    fn returns_title(title: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            opens: AtomicU32::new(0),
            quits: Arc::new(AtomicU32::new(0)),
        }
    }

    fn raises_mid_run() -> Self {
        Self {
            title: None,
            opens: AtomicU32::new(0),
            quits: Arc::new(AtomicU32::new(0)),
        }
    }
}

struct FakeSession {
    title: Option<String>,
    quits: Arc<AtomicU32>,
}

#[async_trait]
impl UiDriver for FakeDriver {
    async fn open(&self, _endpoint: &str) -> Result<Box<dyn UiSession>, DriverError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            title: self.title.clone(),
            quits: Arc::clone(&self.quits),
        }))
    }
}

#[async_trait]
impl UiSession for FakeSession {
    async fn exercise(&mut self, _target_url: &str) -> Result<String, DriverError> {
        self.title
            .clone()
            .ok_or_else(|| DriverError::Protocol("element went stale mid-run".to_string()))
    }

    async fn quit(&mut self) -> Result<(), DriverError> {
        self.quits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    store: Arc<FakeStore>,
    locator: Arc<FakeLocator>,
    tunnels: Arc<FakeTunnels>,
    driver: Arc<FakeDriver>,
    coordinator: JobCoordinator,
}

fn fast_config() -> FarmConfig {
    FarmConfig {
        bind_attempts: 5,
        bind_interval: Duration::from_millis(1),
        probe_attempts: 3,
        probe_interval: Duration::from_millis(1),
        ..FarmConfig::default()
    }
}

fn harness(store: FakeStore, locator: FakeLocator, driver: FakeDriver) -> Harness {
    harness_with(store, locator, FakeTunnels::default(), driver, fast_config())
}

fn harness_with(
    store: FakeStore,
    locator: FakeLocator,
    tunnels: FakeTunnels,
    driver: FakeDriver,
    cfg: FarmConfig,
) -> Harness {
    let store = Arc::new(store);
    let locator = Arc::new(locator);
    let tunnels = Arc::new(tunnels);
    let driver = Arc::new(driver);
    let seams = Seams {
        store: Arc::clone(&store) as Arc<dyn JobStore>,
        locator: Arc::clone(&locator) as Arc<dyn PodLocator>,
        tunnels: Arc::clone(&tunnels) as Arc<dyn TunnelFactory>,
        probe: Arc::new(FakeProbe::ready_immediately()),
        driver: Arc::clone(&driver) as Arc<dyn UiDriver>,
    };
    Harness {
        coordinator: JobCoordinator::new(seams, cfg),
        store,
        locator,
        tunnels,
        driver,
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn binding_after_two_polls_runs_to_completion() {
    let h = harness(
        FakeStore::binds_to("10.0.0.5", 2),
        FakeLocator::resolves_to("emu-7"),
        FakeDriver::returns_title("Google"),
    );

    let report = h.coordinator.run("https://www.google.com").await;

    assert_eq!(report.state, JobState::Completed);
    assert!(report.succeeded());
    assert_eq!(report.page_title.as_deref(), Some("Google"));
    assert!(report.cleanup_failures.is_empty());

    // Two empty polls, then the third sees the address and polling stops.
    assert_eq!(h.store.polls.load(Ordering::SeqCst), 3);
    assert_eq!(h.locator.resolves.load(Ordering::SeqCst), 1);

    // Tunnel went to the port derived from this job's token.
    assert_eq!(
        h.tunnels.last_local_port.load(Ordering::SeqCst),
        u32::from(derive_local_port(&report.job_id))
    );

    // Release ran exactly once, touching every resource.
    assert_eq!(h.driver.quits.load(Ordering::SeqCst), 1);
    assert_eq!(h.tunnels.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.clears.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.removes.load(Ordering::SeqCst), 1);
    assert_eq!(h.locator.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn binding_timeout_is_classified_and_released() {
    let h = harness(
        FakeStore::never_binds(),
        FakeLocator::resolves_to("emu-1"),
        FakeDriver::returns_title("unused"),
    );

    let report = h.coordinator.run("https://www.google.com").await;

    assert_eq!(report.state, JobState::TimedOut);
    assert_eq!(report.failed_step, Some("await-binding"));
    assert!(report.cause.as_deref().unwrap().contains("no worker bound"));

    // The poll budget was exhausted exactly, never exceeded.
    assert_eq!(h.store.polls.load(Ordering::SeqCst), 5);

    // No worker: nothing tunneled, but registry delete and queue removal
    // were both still attempted, and neither counts as a failure.
    assert_eq!(h.tunnels.opened.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.clears.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.removes.load(Ordering::SeqCst), 1);
    assert!(report.cleanup_failures.is_empty());
}

#[tokio::test]
async fn unresolvable_address_fails_before_tunneling() {
    let h = harness(
        FakeStore::binds_to("10.0.0.99", 0),
        FakeLocator::no_match(),
        FakeDriver::returns_title("unused"),
    );

    let report = h.coordinator.run("https://www.google.com").await;

    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.failed_step, Some("resolve"));
    assert!(report.cause.as_deref().unwrap().contains("10.0.0.99"));

    // The tunnel is never opened, and there is no pod to delete.
    assert_eq!(h.tunnels.opened.load(Ordering::SeqCst), 0);
    assert_eq!(h.locator.deletes.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.clears.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn automation_failure_still_tears_everything_down() {
    let h = harness(
        FakeStore::binds_to("10.0.0.5", 0),
        FakeLocator::resolves_to("emu-3"),
        FakeDriver::raises_mid_run(),
    );

    let report = h.coordinator.run("https://www.google.com").await;

    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.failed_step, Some("run"));
    assert!(report.cause.as_deref().unwrap().contains("automation failure"));

    // Tunnel termination and registry deletion both still occurred.
    assert_eq!(h.tunnels.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.clears.load(Ordering::SeqCst), 1);
    assert_eq!(h.driver.quits.load(Ordering::SeqCst), 1);
    assert_eq!(h.locator.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tunnel_startup_failure_releases_the_pod() {
    let tunnels = FakeTunnels {
        fail_open: true,
        ..FakeTunnels::default()
    };
    let h = harness_with(
        FakeStore::binds_to("10.0.0.5", 0),
        FakeLocator::resolves_to("emu-4"),
        tunnels,
        FakeDriver::returns_title("unused"),
        fast_config(),
    );

    let report = h.coordinator.run("https://www.google.com").await;

    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.failed_step, Some("tunnel"));
    assert!(report.cause.as_deref().unwrap().contains("tunnel unavailable"));

    // The pod was resolved before the tunnel failed, so release still
    // deletes it.
    assert_eq!(h.locator.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(h.driver.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn interruption_runs_the_same_release_path() {
    let store = FakeStore::never_binds();
    let cfg = FarmConfig {
        bind_attempts: 1000,
        bind_interval: Duration::from_millis(20),
        ..fast_config()
    };
    let h = harness_with(
        store,
        FakeLocator::resolves_to("emu-5"),
        FakeTunnels::default(),
        FakeDriver::returns_title("unused"),
        cfg,
    );

    let report = h
        .coordinator
        .run_until("https://www.google.com", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
        })
        .await;

    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.failed_step, Some("interrupt"));
    assert_eq!(h.store.clears.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.removes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cleanup_failure_never_masks_the_primary_outcome() {
    let mut store = FakeStore::binds_to("10.0.0.5", 0);
    store.fail_clear = true;
    let h = harness(
        store,
        FakeLocator::resolves_to("emu-6"),
        FakeDriver::returns_title("Google"),
    );

    let report = h.coordinator.run("https://www.google.com").await;

    // The job itself completed; the registry failure is reported on the
    // side, not promoted.
    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.cleanup_failures.len(), 1);
    assert_eq!(report.cleanup_failures[0].step, "registry");
}

#[tokio::test]
async fn queue_outage_on_submit_is_fatal() {
    struct DeadStore;

    #[async_trait]
    impl JobStore for DeadStore {
        async fn enqueue(&self, _job_id: &str) -> Result<(), StoreError> {
            Err(connectivity_error("lpush"))
        }
        async fn remove(&self, _job_id: &str) -> Result<bool, StoreError> {
            Err(connectivity_error("lrem"))
        }
        async fn pending(&self) -> Result<usize, StoreError> {
            Err(connectivity_error("llen"))
        }
        async fn binding(&self, _job_id: &str) -> Result<Option<String>, StoreError> {
            Err(connectivity_error("hget"))
        }
        async fn clear_binding(&self, _job_id: &str) -> Result<bool, StoreError> {
            Err(connectivity_error("hdel"))
        }
        async fn bindings(&self) -> Result<Vec<(String, String)>, StoreError> {
            Err(connectivity_error("hgetall"))
        }
    }

    let seams = Seams {
        store: Arc::new(DeadStore),
        locator: Arc::new(FakeLocator::resolves_to("emu-8")),
        tunnels: Arc::new(FakeTunnels::default()),
        probe: Arc::new(FakeProbe::ready_immediately()),
        driver: Arc::new(FakeDriver::returns_title("unused")),
    };
    let coordinator = JobCoordinator::new(seams, fast_config());

    let report = coordinator.run("https://www.google.com").await;

    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.failed_step, Some("submit"));
    assert!(matches!(
        report.cause.as_deref(),
        Some(cause) if cause.contains("queue unavailable")
    ));
    // Nothing was enqueued, so release only clears the (absent) binding;
    // its failure on the dead store is reported, not escalated.
    assert_eq!(report.cleanup_failures.len(), 1);
}
