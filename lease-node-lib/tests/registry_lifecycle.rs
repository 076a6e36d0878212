//! End-to-end allocation registry flows over the in-memory runtime, job
//! queue and clock.
//!
//! Covers register/deregister/check sequencing, ownership checks, the
//! terminate-before-provision ordering and the single pending expiry job.

use chrono::{DateTime, Local, TimeZone, Utc};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use lease_node_lib::registry::{CpuRequest, GpuRequest};
use lease_node_lib::{AllocationRegistry, Clock, JobQueue, LeaseScheduler, ResourceRequest};
use lease_runtime::LeaseError;
use lease_runtime::lifecycle::{Capacity, LoginInfo};
use lease_runtime::runtime::mock::MockRuntime;
use lease_runtime::{
    AllocationStore, GpuCapacity, LifecycleConfig, LifecycleController, SandboxKind, SandboxSpec,
    SandboxState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Fixture
// ─────────────────────────────────────────────────────────────────────────────

struct FixedClock(DateTime<Utc>);

#[async_trait::async_trait]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }

    async fn sleep(&self, _duration: Duration) {}
}

#[derive(Default)]
struct MockJobQueue {
    jobs: Mutex<Vec<String>>,
    submitted: Mutex<u32>,
    fail_submit: AtomicBool,
}

impl MockJobQueue {
    fn pending_ids(&self) -> Vec<String> {
        self.jobs.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl JobQueue for MockJobQueue {
    async fn pending(&self) -> lease_runtime::error::Result<Vec<String>> {
        Ok(self.pending_ids())
    }

    async fn cancel(&self, job_id: &str) -> lease_runtime::error::Result<()> {
        self.jobs.lock().unwrap().retain(|id| id != job_id);
        Ok(())
    }

    async fn submit(&self, _fire_at: DateTime<Local>, _command: &str) -> lease_runtime::error::Result<String> {
        if self.fail_submit.load(Ordering::Relaxed) {
            return Err(LeaseError::Scheduling("at unavailable".into()));
        }
        let mut submitted = self.submitted.lock().unwrap();
        *submitted += 1;
        let id = submitted.to_string();
        self.jobs.lock().unwrap().push(id.clone());
        Ok(id)
    }
}

struct Node {
    _dir: tempfile::TempDir,
    runtime: Arc<MockRuntime>,
    queue: Arc<MockJobQueue>,
    registry: AllocationRegistry,
}

fn node(runtime: MockRuntime) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(runtime);
    let queue = Arc::new(MockJobQueue::default());
    let clock = Arc::new(FixedClock(
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 30, 0).unwrap(),
    ));
    let records = AllocationStore::open(dir.path().join("allocation.json")).unwrap();
    let lifecycle = Arc::new(LifecycleController::new(
        LifecycleConfig::default(),
        runtime.clone(),
        records,
    ));
    let scheduler = LeaseScheduler::new(queue.clone(), clock, "lease-node terminate");
    Node {
        _dir: dir,
        runtime,
        queue,
        registry: AllocationRegistry::new(lifecycle, scheduler),
    }
}

fn renter() -> (k256::SecretKey, String) {
    let secret = k256::SecretKey::random(&mut rand::rngs::OsRng);
    let public = hex::encode(secret.public_key().to_encoded_point(true).as_bytes());
    (secret, public)
}

fn request(cpus: u32, gpu: Option<GpuCapacity>, testing: bool) -> ResourceRequest {
    ResourceRequest {
        cpu: CpuRequest { count: cpus },
        gpu: Some(GpuRequest { capacity: gpu }),
        hard_disk: Capacity {
            capacity: 10 * 1_073_741_824,
        },
        ram: Capacity {
            capacity: 4 * 1_073_741_824,
        },
        testing,
    }
}

fn sandbox() -> SandboxSpec {
    SandboxSpec {
        base_image: "ubuntu:22.04".into(),
        volume_path: "/srv/lease".into(),
        ssh_key: "ssh-ed25519 AAAA renter".into(),
        ssh_port: 4444,
        dockerfile: "apt-get update".into(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn register_deregister_frees_the_slot() {
    let n = node(MockRuntime::new());
    let (secret, key) = renter();
    let req = request(2, Some(GpuCapacity::All), false);

    assert!(n.registry.check_allocation(1.0, &req).await.status);

    let response = n.registry.register(1.0, &req, &key, &sandbox()).await;
    assert!(response.status);
    let sealed = response.info.unwrap();
    let login: LoginInfo =
        serde_json::from_slice(&lease_runtime::crypto::open_sealed(&secret, &sealed).unwrap())
            .unwrap();
    assert_eq!(login.port, 4444);

    let launch = n.runtime.launches.lock().unwrap()[0].clone();
    assert_eq!(launch.cpuset, "0-1");
    assert_eq!(launch.gpu, GpuCapacity::All);

    assert!(!n.registry.check_allocation(1.0, &req).await.status);
    assert!(n.registry.check_if_allocated(&key).await.status);
    assert_eq!(n.queue.pending_ids().len(), 1);

    assert!(n.registry.deregister(&key).await.status);
    assert!(n.registry.check_allocation(1.0, &req).await.status);
    assert!(n.registry.lifecycle().records().load().unwrap().is_none());
}

#[tokio::test]
async fn register_stamps_expiry_from_scheduled_job() {
    let n = node(MockRuntime::new());
    let (_, key) = renter();
    n.registry
        .try_register(2.0, &request(1, None, false), &key, &sandbox())
        .await
        .unwrap();

    let record = n.registry.lifecycle().records().load().unwrap().unwrap();
    let expected = Utc.with_ymd_and_hms(2026, 5, 3, 9, 30, 0).unwrap().timestamp() as u64;
    assert_eq!(record.expires_at, Some(expected));
    assert_eq!(record.kind, SandboxKind::Production);
}

#[tokio::test]
async fn wrong_key_cannot_deregister() {
    let n = node(MockRuntime::new());
    let (_, owner) = renter();
    let (_, stranger) = renter();
    n.registry
        .register(1.0, &request(1, None, false), &owner, &sandbox())
        .await;

    assert!(!n.registry.deregister(&stranger).await.status);
    assert!(!n.registry.check_if_allocated(&stranger).await.status);
    assert_eq!(n.runtime.state_of("container"), Some(SandboxState::Running));
    assert!(!n.runtime.calls().iter().any(|c| c.starts_with("remove:")));
}

#[tokio::test]
async fn terminate_failure_blocks_provision_and_schedule() {
    let n = node(MockRuntime::with_containers(&[(
        "container",
        SandboxState::Running,
    )]));
    n.runtime.fail_remove.store(true, Ordering::Relaxed);
    let (_, key) = renter();

    let response = n
        .registry
        .register(1.0, &request(1, None, false), &key, &sandbox())
        .await;

    assert!(!response.status);
    assert!(n.runtime.launches.lock().unwrap().is_empty());
    assert!(n.queue.pending_ids().is_empty());
}

#[tokio::test]
async fn schedule_failure_fails_register_after_provision() {
    let n = node(MockRuntime::new());
    n.queue.fail_submit.store(true, Ordering::Relaxed);
    let (_, key) = renter();

    let response = n
        .registry
        .register(1.0, &request(1, None, false), &key, &sandbox())
        .await;

    assert!(!response.status);
    // Provisioning is not rolled back.
    assert_eq!(n.runtime.launches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn reregister_replaces_instance_and_expiry_job() {
    let n = node(MockRuntime::new());
    let (_, first) = renter();
    let (_, second) = renter();

    assert!(
        n.registry
            .register(1.0, &request(1, None, false), &first, &sandbox())
            .await
            .status
    );
    assert!(
        n.registry
            .register(3.0, &request(4, Some(GpuCapacity::Count(1)), false), &second, &sandbox())
            .await
            .status
    );

    assert_eq!(n.queue.pending_ids().len(), 1);
    assert!(n.registry.check_if_allocated(&second).await.status);
    assert!(!n.registry.check_if_allocated(&first).await.status);
    let launches = n.runtime.launches.lock().unwrap().clone();
    assert_eq!(launches.len(), 2);
    assert_eq!(launches[1].cpuset, "0-3");
    assert_eq!(launches[1].gpu, GpuCapacity::Count(1));
}

#[tokio::test]
async fn testing_request_uses_test_instance() {
    let n = node(MockRuntime::new());
    let (_, key) = renter();

    assert!(
        n.registry
            .register(1.0, &request(1, None, true), &key, &sandbox())
            .await
            .status
    );
    assert_eq!(n.runtime.state_of("test_container"), Some(SandboxState::Running));
    assert_eq!(n.runtime.state_of("container"), None);

    assert!(n.registry.pause(&key).await.status);
    assert_eq!(n.runtime.state_of("test_container"), Some(SandboxState::Paused));
    assert!(n.registry.resume(&key).await.status);
}

#[tokio::test]
async fn invalid_lease_terms_fail_without_provisioning() {
    let n = node(MockRuntime::new());
    let (_, key) = renter();

    assert!(
        !n.registry
            .register(0.0, &request(1, None, false), &key, &sandbox())
            .await
            .status
    );
    assert!(
        !n.registry
            .register(1.0, &request(0, None, false), &key, &sandbox())
            .await
            .status
    );
    assert!(n.runtime.launches.lock().unwrap().is_empty());
    assert!(n.queue.pending_ids().is_empty());
}

#[tokio::test]
async fn expire_terminates_and_clears() {
    let n = node(MockRuntime::new());
    let (_, key) = renter();
    n.registry
        .register(1.0, &request(1, None, false), &key, &sandbox())
        .await;

    assert!(n.registry.expire().await);
    assert!(n.registry.lifecycle().records().load().unwrap().is_none());
    assert!(!n.registry.lifecycle().inspect().await);
    assert!(!n.registry.check_if_allocated(&key).await.status);
}

#[tokio::test]
async fn paused_instance_is_not_reported_allocated() {
    let n = node(MockRuntime::new());
    let (_, key) = renter();
    n.registry
        .register(1.0, &request(1, None, false), &key, &sandbox())
        .await;
    assert!(n.registry.check_if_allocated(&key).await.status);

    assert!(n.registry.pause(&key).await.status);
    assert_eq!(n.runtime.state_of("container"), Some(SandboxState::Paused));
    assert!(!n.registry.check_if_allocated(&key).await.status);
    assert!(matches!(
        n.registry.try_check_if_allocated(&key).await,
        Ok(false)
    ));
}

#[tokio::test]
async fn deregister_keeps_record_when_terminate_fails() {
    let n = node(MockRuntime::new());
    let (_, key) = renter();
    n.registry
        .register(1.0, &request(1, None, false), &key, &sandbox())
        .await;
    n.runtime.fail_remove.store(true, Ordering::Relaxed);

    assert!(!n.registry.deregister(&key).await.status);
    let record = n.registry.lifecycle().records().load().unwrap();
    assert!(record.is_some());
    assert_eq!(n.queue.pending_ids().len(), 1);
}

#[tokio::test]
async fn deregister_cancels_expiry_job() {
    let n = node(MockRuntime::new());
    let (_, key) = renter();
    n.registry
        .register(1.0, &request(1, None, false), &key, &sandbox())
        .await;
    assert_eq!(n.queue.pending_ids().len(), 1);

    assert!(n.registry.deregister(&key).await.status);
    assert!(n.queue.pending_ids().is_empty());
}

#[tokio::test]
async fn instance_that_dies_at_launch_is_not_leased() {
    let n = node(MockRuntime::new());
    n.runtime.exit_on_launch.store(true, Ordering::Relaxed);
    let (_, key) = renter();

    let response = n
        .registry
        .register(1.0, &request(1, None, false), &key, &sandbox())
        .await;

    assert!(!response.status);
    assert!(n.registry.lifecycle().records().load().unwrap().is_none());
    assert!(n.queue.pending_ids().is_empty());
    assert!(n.registry.check_allocation(1.0, &request(1, None, false)).await.status);
}
