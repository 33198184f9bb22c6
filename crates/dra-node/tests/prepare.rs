//! End-to-end prepare/unprepare flows against recording fake adapters.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dra_core::device::AttributeValue;
use dra_core::OpContext;
use dra_node::adapters::{
    Adapters, CdiWriter, MigManager, MigTransition, MpsManager, TimeSlicingManager, VfioManager,
};
use dra_node::cdi::CdiSpec;
use dra_node::checkpoint::{CheckpointStore, FsCheckpointStore};
use dra_node::config::{
    ConfigOverride, ConfigSource, DeviceConfig, MpsConfig, TimeSliceInterval, TimeSlicingConfig,
};
use dra_node::flock::FileLocker;
use dra_node::prepare::{
    PrepareDevice, PrepareOutcome, PrepareRequest, PrepareService, PreparedClaim,
};
use dra_node::PrepareError;

/// Call counters shared by all fakes of one test.
#[derive(Default)]
struct Calls {
    ensure: usize,
    dissolve: usize,
    bind: usize,
    unbind: usize,
    set_time_slice: usize,
    time_slice_clear: usize,
    mps_configure: usize,
    mps_clear: usize,
    cdi_write: usize,
    cdi_remove: usize,
}

struct FakeMig {
    calls: Arc<Mutex<Calls>>,
    /// How many `ensure` calls report an in-flight transition first.
    pending: AtomicUsize,
    present: Mutex<BTreeSet<(String, String)>>,
}

#[async_trait]
impl MigManager for FakeMig {
    async fn ensure(
        &self,
        _ctx: &OpContext,
        parent_uuid: &str,
        profile: &str,
    ) -> anyhow::Result<MigTransition> {
        self.calls.lock().unwrap().ensure += 1;
        if self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_sub(1))
            .is_ok()
        {
            return Ok(MigTransition::InProgress);
        }
        let created = self
            .present
            .lock()
            .unwrap()
            .insert((parent_uuid.to_string(), profile.to_string()));
        Ok(MigTransition::Applied { created })
    }

    async fn dissolve(&self, _ctx: &OpContext, parent_uuid: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().dissolve += 1;
        self.present
            .lock()
            .unwrap()
            .retain(|(parent, _)| parent != parent_uuid);
        Ok(())
    }
}

struct FakeVfio {
    calls: Arc<Mutex<Calls>>,
}

#[async_trait]
impl VfioManager for FakeVfio {
    async fn bind(&self, _ctx: &OpContext, _pci_address: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().bind += 1;
        Ok(())
    }

    async fn unbind(&self, _ctx: &OpContext, _pci_address: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().unbind += 1;
        Ok(())
    }
}

struct FakeTimeSlicing {
    calls: Arc<Mutex<Calls>>,
}

#[async_trait]
impl TimeSlicingManager for FakeTimeSlicing {
    async fn set_time_slice(
        &self,
        _ctx: &OpContext,
        _uuids: &[String],
        _interval: TimeSliceInterval,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().set_time_slice += 1;
        Ok(())
    }

    async fn clear(&self, _ctx: &OpContext, _uuids: &[String]) -> anyhow::Result<()> {
        self.calls.lock().unwrap().time_slice_clear += 1;
        Ok(())
    }
}

struct FakeMps {
    calls: Arc<Mutex<Calls>>,
}

#[async_trait]
impl MpsManager for FakeMps {
    async fn configure(
        &self,
        _ctx: &OpContext,
        _uuids: &[String],
        _config: &MpsConfig,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().mps_configure += 1;
        Ok(())
    }

    async fn clear(&self, _ctx: &OpContext, _uuids: &[String]) -> anyhow::Result<()> {
        self.calls.lock().unwrap().mps_clear += 1;
        Ok(())
    }
}

struct FakeCdi {
    calls: Arc<Mutex<Calls>>,
    specs: Mutex<BTreeMap<String, CdiSpec>>,
}

#[async_trait]
impl CdiWriter for FakeCdi {
    async fn write(&self, _ctx: &OpContext, spec: &CdiSpec) -> anyhow::Result<Vec<String>> {
        self.calls.lock().unwrap().cdi_write += 1;
        let claim_uid = spec.devices[0]
            .name
            .split("--")
            .next()
            .unwrap()
            .to_string();
        self.specs.lock().unwrap().insert(claim_uid, spec.clone());
        Ok(spec.device_ids())
    }

    async fn remove(&self, _ctx: &OpContext, claim_uid: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().cdi_remove += 1;
        self.specs.lock().unwrap().remove(claim_uid);
        Ok(())
    }
}

struct Harness {
    service: PrepareService,
    checkpoints: Arc<FsCheckpointStore>,
    calls: Arc<Mutex<Calls>>,
    _dir: tempfile::TempDir,
}

fn harness_with_pending_mig(pending: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Mutex::new(Calls::default()));
    let adapters = Adapters {
        mig: Arc::new(FakeMig {
            calls: calls.clone(),
            pending: AtomicUsize::new(pending),
            present: Mutex::new(BTreeSet::new()),
        }),
        vfio: Arc::new(FakeVfio {
            calls: calls.clone(),
        }),
        time_slicing: Arc::new(FakeTimeSlicing {
            calls: calls.clone(),
        }),
        mps: Arc::new(FakeMps {
            calls: calls.clone(),
        }),
        checker: None,
        cdi: Arc::new(FakeCdi {
            calls: calls.clone(),
            specs: Mutex::new(BTreeMap::new()),
        }),
    };
    let checkpoints = Arc::new(FsCheckpointStore::new(dir.path().join("checkpoints")));
    let service = PrepareService::new(
        "gpu.example.com",
        adapters,
        checkpoints.clone(),
        Arc::new(FileLocker::new(dir.path().join("locks"))),
    );
    Harness {
        service,
        checkpoints,
        calls,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with_pending_mig(0)
}

fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, AttributeValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), AttributeValue::from(*v)))
        .collect()
}

fn gpu_device(name: &str) -> PrepareDevice {
    PrepareDevice {
        request: "gpu".to_string(),
        pool: "pool-a".to_string(),
        device: name.to_string(),
        share_id: None,
        consumed_capacity: BTreeMap::new(),
        attributes: attrs(&[
            ("type", "gpu"),
            ("uuid", "GPU-aaaa"),
            ("pciAddress", "0000:02:00.0"),
        ]),
        config: None,
    }
}

fn mig_device(name: &str) -> PrepareDevice {
    PrepareDevice {
        request: "slice".to_string(),
        pool: "pool-a".to_string(),
        device: name.to_string(),
        share_id: None,
        consumed_capacity: BTreeMap::new(),
        attributes: attrs(&[
            ("type", "mig"),
            ("uuid", "MIG-cccc"),
            ("parentUuid", "GPU-aaaa"),
            ("profile", "1g.10gb"),
            ("pciAddress", "0000:02:00.0"),
        ]),
        config: None,
    }
}

fn request(claim_uid: &str, devices: Vec<PrepareDevice>) -> PrepareRequest {
    PrepareRequest {
        claim_uid: claim_uid.to_string(),
        node: "node-1".to_string(),
        vfio: false,
        devices,
        configs: Vec::new(),
    }
}

fn ready(outcome: PrepareOutcome) -> PreparedClaim {
    match outcome {
        PrepareOutcome::Ready(claim) => claim,
        PrepareOutcome::Retry { step, .. } => panic!("unexpected retry from step {}", step),
    }
}

#[tokio::test]
async fn physical_gpu_prepares_to_a_cdi_id() {
    let h = harness();
    let ctx = OpContext::background();
    let outcome = h
        .service
        .prepare(&ctx, request("claim-1", vec![gpu_device("dev-1")]))
        .await
        .unwrap();
    let claim = ready(outcome);
    assert_eq!(claim.devices.len(), 1);
    assert_eq!(
        claim.devices[0].cdi_ids,
        vec!["gpu.example.com/gpu=claim-1--dev-1".to_string()]
    );
    // The checkpoint is on disk.
    let record = h.checkpoints.load("claim-1").await.unwrap().unwrap();
    assert_eq!(record.devices[0].cdi_ids, claim.devices[0].cdi_ids);
    // No sharing, no MIG, no VFIO was touched.
    let calls = h.calls.lock().unwrap();
    assert_eq!(calls.cdi_write, 1);
    assert_eq!(calls.ensure, 0);
    assert_eq!(calls.bind, 0);
    assert_eq!(calls.set_time_slice, 0);
}

#[tokio::test]
async fn repeated_prepare_converges_without_redoing_work() {
    let h = harness();
    let ctx = OpContext::background();
    let req = request("claim-1", vec![mig_device("mig-1")]);

    let first = ready(h.service.prepare(&ctx, req.clone()).await.unwrap());
    let second = ready(h.service.prepare(&ctx, req).await.unwrap());
    assert_eq!(first, second);

    let calls = h.calls.lock().unwrap();
    assert_eq!(calls.ensure, 1);
    assert_eq!(calls.cdi_write, 1);
}

#[tokio::test]
async fn mig_transition_in_flight_retries_then_succeeds() {
    let h = harness_with_pending_mig(1);
    let ctx = OpContext::background();
    let req = request("claim-1", vec![mig_device("mig-1")]);

    match h.service.prepare(&ctx, req.clone()).await.unwrap() {
        PrepareOutcome::Retry { step, .. } => assert_eq!(step, "mig"),
        PrepareOutcome::Ready(_) => panic!("expected a retry hint"),
    }
    // Nothing was checkpointed for the half-done claim.
    assert!(h.checkpoints.load("claim-1").await.unwrap().is_none());

    let claim = ready(h.service.prepare(&ctx, req).await.unwrap());
    assert_eq!(claim.devices.len(), 1);
    assert_eq!(h.calls.lock().unwrap().ensure, 2);
}

#[tokio::test]
async fn unprepare_reverses_every_applied_adapter() {
    let h = harness();
    let ctx = OpContext::background();

    // A MIG partition and a time-sliced GPU in one claim.
    let mut req = request("claim-1", vec![mig_device("mig-1"), gpu_device("dev-1")]);
    req.configs = vec![ConfigOverride {
        requests: vec!["gpu".to_string()],
        config: DeviceConfig::TimeSlicing(TimeSlicingConfig {
            interval: TimeSliceInterval::Short,
        }),
        source: ConfigSource::Claim,
    }];
    ready(h.service.prepare(&ctx, req).await.unwrap());
    {
        let calls = h.calls.lock().unwrap();
        assert_eq!(calls.ensure, 1);
        assert_eq!(calls.set_time_slice, 1);
    }

    h.service.unprepare(&ctx, "claim-1").await.unwrap();
    {
        let calls = h.calls.lock().unwrap();
        assert_eq!(calls.cdi_remove, 1);
        assert_eq!(calls.time_slice_clear, 1);
        assert_eq!(calls.dissolve, 1);
        assert_eq!(calls.mps_clear, 0);
    }
    assert!(h.checkpoints.load("claim-1").await.unwrap().is_none());

    // Unpreparing again is a no-op success.
    h.service.unprepare(&ctx, "claim-1").await.unwrap();
    assert_eq!(h.calls.lock().unwrap().cdi_remove, 1);
}

#[tokio::test]
async fn vfio_claims_bind_and_unbind() {
    let h = harness();
    let ctx = OpContext::background();
    let mut req = request("claim-1", vec![gpu_device("dev-1")]);
    req.vfio = true;

    ready(h.service.prepare(&ctx, req).await.unwrap());
    assert_eq!(h.calls.lock().unwrap().bind, 1);

    h.service.unprepare(&ctx, "claim-1").await.unwrap();
    let calls = h.calls.lock().unwrap();
    assert_eq!(calls.unbind, 1);
    assert_eq!(calls.dissolve, 0);
}

#[tokio::test]
async fn mps_sharing_configures_and_clears_the_server() {
    let h = harness();
    let ctx = OpContext::background();
    let mut req = request("claim-1", vec![gpu_device("dev-1")]);
    req.configs = vec![ConfigOverride {
        requests: Vec::new(),
        config: DeviceConfig::Mps(MpsConfig {
            active_thread_percentage: Some(50),
            pinned_device_memory_limit_mib: None,
        }),
        source: ConfigSource::Claim,
    }];

    ready(h.service.prepare(&ctx, req).await.unwrap());
    assert_eq!(h.calls.lock().unwrap().mps_configure, 1);

    h.service.unprepare(&ctx, "claim-1").await.unwrap();
    assert_eq!(h.calls.lock().unwrap().mps_clear, 1);
}

#[tokio::test]
async fn cancelled_context_prepares_nothing() {
    let h = harness();
    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    let ctx = OpContext::with_token(token);
    let err = h
        .service
        .prepare(&ctx, request("claim-1", vec![gpu_device("dev-1")]))
        .await
        .unwrap_err();
    assert!(matches!(err, PrepareError::Cancelled));
    assert_eq!(h.calls.lock().unwrap().cdi_write, 0);
    assert!(h.checkpoints.load("claim-1").await.unwrap().is_none());
}

#[tokio::test]
async fn shared_slots_of_one_device_get_distinct_cdi_ids() {
    let h = harness();
    let ctx = OpContext::background();
    let mut a = gpu_device("dev-1");
    a.share_id = Some("aaaaaaaa-1111-2222-3333-444444444444".to_string());
    let mut b = gpu_device("dev-1");
    b.share_id = Some("bbbbbbbb-1111-2222-3333-444444444444".to_string());
    let mut req = request("claim-1", vec![a, b]);
    req.configs = vec![ConfigOverride {
        requests: Vec::new(),
        config: DeviceConfig::TimeSlicing(TimeSlicingConfig::default()),
        source: ConfigSource::Class,
    }];

    let claim = ready(h.service.prepare(&ctx, req).await.unwrap());
    assert_eq!(claim.devices.len(), 2);
    assert_ne!(claim.devices[0].cdi_ids, claim.devices[1].cdi_ids);
}
