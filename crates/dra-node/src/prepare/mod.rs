//! The prepare pipeline: a linear, reentrant state machine that turns an
//! allocated claim into CDI device IDs on the local node.
//!
//! A pipeline run is a fixed sequence of steps. Every step detects "already
//! done" from observable state and becomes a no-op, so the kubelet may call
//! [`PrepareService::prepare`] for the same claim UID as often as it likes;
//! repeated calls converge on the same CDI IDs and the same checkpoint.
//! Hardware-mutating sections run under the node-wide file lock, checkpoint
//! access additionally under a per-claim mutex.

mod steps;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dra_core::device::{
    AttributeValue, DeviceKind, ATTR_PARENT_UUID, ATTR_PCI_ADDRESS, ATTR_PROFILE, ATTR_TYPE,
    ATTR_UUID, DEVICE_TYPE_GPU, DEVICE_TYPE_MIG,
};
use dra_core::OpContext;
use tracing::{debug, info, instrument, warn};

use crate::adapters::Adapters;
use crate::checkpoint::{CheckpointRecord, CheckpointStore, PreparedDeviceRecord};
use crate::config::{ConfigOverride, DeviceConfig, SharingStrategy};
use crate::error::PrepareError;
use crate::flock::FileLocker;

/// Name of the node-wide lock serializing MIG changes and CDI writes.
const PREPARE_LOCK: &str = "gpu-prepare";

/// One device of a claim, as handed to the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PrepareDevice {
    /// Request the device was allocated for.
    pub request: String,
    /// Pool of the device.
    pub pool: String,
    /// Device name.
    pub device: String,
    /// Share identifier of the allocated slot, for shared devices.
    pub share_id: Option<String>,
    /// Consumed capacity amounts from the allocation.
    pub consumed_capacity: BTreeMap<String, i64>,
    /// Attribute snapshot taken at allocation time.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Explicit per-device config from the allocation; resolved to a
    /// concrete variant by the first pipeline step when absent.
    pub config: Option<DeviceConfig>,
}

impl PrepareDevice {
    fn attr_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(AttributeValue::as_str)
    }

    /// Device kind per the `type` attribute.
    pub fn kind(&self) -> DeviceKind {
        match self.attr_str(ATTR_TYPE) {
            Some(DEVICE_TYPE_GPU) => DeviceKind::Physical,
            Some(DEVICE_TYPE_MIG) => DeviceKind::Mig,
            _ => DeviceKind::Unknown,
        }
    }

    /// Canonical device UUID.
    pub fn uuid(&self) -> Option<&str> {
        self.attr_str(ATTR_UUID)
    }

    /// PCI address of the device or of its MIG parent.
    pub fn pci_address(&self) -> Option<&str> {
        self.attr_str(ATTR_PCI_ADDRESS)
    }

    /// UUID of the MIG parent, for partitions.
    pub fn parent_uuid(&self) -> Option<&str> {
        self.attr_str(ATTR_PARENT_UUID)
    }

    /// Advertised MIG profile, for partitions.
    pub fn profile(&self) -> Option<&str> {
        self.attr_str(ATTR_PROFILE)
    }
}

/// Everything one prepare invocation carries.
#[derive(Clone, Debug, PartialEq)]
pub struct PrepareRequest {
    /// UID of the claim being prepared.
    pub claim_uid: String,
    /// Node the claim was allocated to.
    pub node: String,
    /// Whether VFIO pass-through was requested for the whole claim.
    pub vfio: bool,
    /// Devices to prepare, in allocation order.
    pub devices: Vec<PrepareDevice>,
    /// Claim- and class-level config overrides.
    pub configs: Vec<ConfigOverride>,
}

/// Per-device progress, aligned by index with the request's devices.
#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceState {
    /// Resolved config variant.
    pub config: Option<DeviceConfig>,
    /// Resolved sharing strategy.
    pub strategy: Option<SharingStrategy>,
    /// Qualified CDI IDs of the slot.
    pub cdi_ids: Vec<String>,
    /// Whether this run created the MIG profile on the parent.
    pub mig_created: bool,
}

/// The mutable state a pipeline run threads through its steps.
pub(crate) struct PrepareState {
    pub request: PrepareRequest,
    pub states: Vec<DeviceState>,
    pub adapters: Adapters,
    pub cdi_kind: String,
}

impl PrepareState {
    fn new(request: PrepareRequest, adapters: Adapters, cdi_kind: String) -> Self {
        let states = vec![DeviceState::default(); request.devices.len()];
        PrepareState {
            request,
            states,
            adapters,
            cdi_kind,
        }
    }

    fn checkpoint_record(&self) -> CheckpointRecord {
        let devices = self
            .request
            .devices
            .iter()
            .zip(&self.states)
            .map(|(device, state)| PreparedDeviceRecord {
                request: device.request.clone(),
                pool: device.pool.clone(),
                device: device.device.clone(),
                share_id: device.share_id.clone(),
                strategy: state.strategy.unwrap_or(SharingStrategy::Exclusive),
                cdi_ids: state.cdi_ids.clone(),
                uuid: device.uuid().map(str::to_string),
                pci_address: device.pci_address().map(str::to_string),
                parent_uuid: device.parent_uuid().map(str::to_string),
                vfio: matches!(state.config, Some(DeviceConfig::Vfio(_))),
                mig_created: state.mig_created,
                consumed_capacity: device.consumed_capacity.clone(),
            })
            .collect();
        CheckpointRecord {
            claim_uid: self.request.claim_uid.clone(),
            created: Utc::now(),
            devices,
        }
    }
}

/// What a step tells the framework.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step's effects are in place; move on.
    Done,
    /// Observable state is still converging; re-invoke the pipeline after
    /// the hint.
    Retry(Duration),
}

/// A single idempotent pipeline step.
#[async_trait]
pub(crate) trait PrepareStep: Send + Sync {
    /// Step name used in error wrapping and logs.
    fn name(&self) -> &'static str;

    /// Drives the step to completion or asks for a retry.
    async fn take(&self, ctx: &OpContext, state: &mut PrepareState) -> anyhow::Result<StepOutcome>;
}

/// One prepared slot as reported back to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedDevice {
    /// Request the slot satisfies.
    pub request: String,
    /// Pool of the device.
    pub pool: String,
    /// Device name.
    pub device: String,
    /// Qualified CDI device IDs to hand to the runtime.
    pub cdi_ids: Vec<String>,
}

/// The result of a completed prepare.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedClaim {
    /// UID of the prepared claim.
    pub claim_uid: String,
    /// Prepared slots, in allocation order.
    pub devices: Vec<PreparedDevice>,
}

impl From<&CheckpointRecord> for PreparedClaim {
    fn from(record: &CheckpointRecord) -> Self {
        PreparedClaim {
            claim_uid: record.claim_uid.clone(),
            devices: record
                .devices
                .iter()
                .map(|d| PreparedDevice {
                    request: d.request.clone(),
                    pool: d.pool.clone(),
                    device: d.device.clone(),
                    cdi_ids: d.cdi_ids.clone(),
                })
                .collect(),
        }
    }
}

/// Outcome of one prepare invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum PrepareOutcome {
    /// All steps completed and the checkpoint is on disk.
    Ready(PreparedClaim),
    /// A step is waiting on converging hardware state; call again.
    Retry {
        /// The step that asked for the retry.
        step: &'static str,
        /// Suggested delay before the next attempt.
        after: Duration,
    },
}

/// Orchestrates prepare and unprepare for one node.
pub struct PrepareService {
    driver: String,
    adapters: Adapters,
    checkpoints: Arc<dyn CheckpointStore>,
    locker: Arc<FileLocker>,
    claim_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PrepareService {
    /// A service for the given driver name; CDI descriptors are emitted
    /// under the kind `<driver>/gpu`.
    pub fn new(
        driver: impl Into<String>,
        adapters: Adapters,
        checkpoints: Arc<dyn CheckpointStore>,
        locker: Arc<FileLocker>,
    ) -> Self {
        PrepareService {
            driver: driver.into(),
            adapters,
            checkpoints,
            locker,
            claim_locks: Mutex::new(HashMap::new()),
        }
    }

    fn cdi_kind(&self) -> String {
        format!("{}/gpu", self.driver)
    }

    async fn claim_lock(&self, claim_uid: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.claim_locks.lock().unwrap();
            locks
                .entry(claim_uid.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Prepares every device of the claim and returns their CDI IDs.
    ///
    /// Reentrant: a checkpoint from an earlier run short-circuits to the
    /// recorded result. All step failures come back recoverable so the
    /// kubelet retries; the pipeline never retries across steps itself.
    #[instrument(skip(self, ctx, request), fields(claim_uid = %request.claim_uid))]
    pub async fn prepare(
        &self,
        ctx: &OpContext,
        request: PrepareRequest,
    ) -> Result<PrepareOutcome, PrepareError> {
        validate_request(&request)?;
        let claim_uid = request.claim_uid.clone();
        let _claim_guard = self.claim_lock(&claim_uid).await;

        if let Some(existing) = self.checkpoints.load(&claim_uid).await? {
            debug!("claim already prepared, returning checkpointed result");
            return Ok(PrepareOutcome::Ready(PreparedClaim::from(&existing)));
        }

        if ctx.is_cancelled() {
            return Err(PrepareError::Cancelled);
        }
        let _lock = self
            .locker
            .lock(ctx, PREPARE_LOCK)
            .await
            .map_err(|e| PrepareError::recoverable("lock", e))?;

        let mut state = PrepareState::new(request, self.adapters.clone(), self.cdi_kind());
        for step in steps::pipeline() {
            if ctx.is_cancelled() {
                return Err(PrepareError::Cancelled);
            }
            debug!(step = step.name(), "running prepare step");
            match step.take(ctx, &mut state).await {
                Ok(StepOutcome::Done) => {}
                Ok(StepOutcome::Retry(after)) => {
                    info!(step = step.name(), delay_ms = after.as_millis() as u64, "step waiting on converging state");
                    return Ok(PrepareOutcome::Retry {
                        step: step.name(),
                        after,
                    });
                }
                Err(e) => return Err(PrepareError::recoverable(step.name(), e)),
            }
        }

        let record = state.checkpoint_record();
        self.checkpoints.save(&record).await?;
        info!(devices = record.devices.len(), "claim prepared");
        Ok(PrepareOutcome::Ready(PreparedClaim::from(&record)))
    }

    /// Reverses a prepare: removes the CDI descriptor, resets MPS and
    /// time-slicing, unbinds VFIO, dissolves MIG profiles this claim
    /// created, then deletes the checkpoint.
    ///
    /// A missing checkpoint means nothing was prepared; that is success.
    #[instrument(skip(self, ctx))]
    pub async fn unprepare(&self, ctx: &OpContext, claim_uid: &str) -> Result<(), PrepareError> {
        let _claim_guard = self.claim_lock(claim_uid).await;
        let record = match self.checkpoints.load(claim_uid).await? {
            Some(record) => record,
            None => {
                debug!("no checkpoint, nothing to unprepare");
                return Ok(());
            }
        };
        if ctx.is_cancelled() {
            return Err(PrepareError::Cancelled);
        }
        let _lock = self
            .locker
            .lock(ctx, PREPARE_LOCK)
            .await
            .map_err(|e| PrepareError::recoverable("lock", e))?;

        self.adapters
            .cdi
            .remove(ctx, claim_uid)
            .await
            .map_err(|e| PrepareError::recoverable("cdi", e))?;

        let mps_uuids: Vec<String> = record
            .devices
            .iter()
            .filter(|d| matches!(d.strategy, SharingStrategy::Mps))
            .filter_map(|d| d.uuid.clone())
            .collect();
        if !mps_uuids.is_empty() {
            self.adapters
                .mps
                .clear(ctx, &mps_uuids)
                .await
                .map_err(|e| PrepareError::recoverable("mps", e))?;
        }

        let sliced_uuids: Vec<String> = record
            .devices
            .iter()
            .filter(|d| matches!(d.strategy, SharingStrategy::TimeSliced { .. }))
            .filter_map(|d| d.uuid.clone())
            .collect();
        if !sliced_uuids.is_empty() {
            self.adapters
                .time_slicing
                .clear(ctx, &sliced_uuids)
                .await
                .map_err(|e| PrepareError::recoverable("timeSlicing", e))?;
        }

        for device in record.devices.iter().filter(|d| d.vfio) {
            let pci = match &device.pci_address {
                Some(pci) => pci,
                None => {
                    warn!(device = %device.device, "VFIO device without PCI address in checkpoint");
                    continue;
                }
            };
            self.adapters
                .vfio
                .unbind(ctx, pci)
                .await
                .map_err(|e| PrepareError::recoverable("vfio", e))?;
        }

        // Dissolve in reverse order, and only the profiles this claim put
        // in place. Several partitions may share one parent; dissolve once.
        let mut dissolved = BTreeSet::new();
        for device in record.devices.iter().rev().filter(|d| d.mig_created) {
            let parent = match &device.parent_uuid {
                Some(parent) => parent.clone(),
                None => continue,
            };
            if !dissolved.insert(parent.clone()) {
                continue;
            }
            self.adapters
                .mig
                .dissolve(ctx, &parent)
                .await
                .map_err(|e| PrepareError::recoverable("mig", e))?;
        }

        self.checkpoints.delete(claim_uid).await?;
        info!("claim unprepared");
        Ok(())
    }
}

fn validate_request(request: &PrepareRequest) -> Result<(), PrepareError> {
    if request.claim_uid.is_empty() {
        return Err(PrepareError::Validation(
            "claim UID must not be empty".to_string(),
        ));
    }
    if request.devices.is_empty() {
        return Err(PrepareError::Validation(format!(
            "claim {} carries no devices",
            request.claim_uid
        )));
    }
    let mut seen = BTreeSet::new();
    for device in &request.devices {
        if device.request.is_empty() {
            return Err(PrepareError::Validation(format!(
                "device {} references no request",
                device.device
            )));
        }
        let slot = (device.device.clone(), device.share_id.clone());
        if !seen.insert(slot) {
            return Err(PrepareError::Validation(format!(
                "duplicate device slot {} in claim {}",
                device.device, request.claim_uid
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str) -> PrepareDevice {
        PrepareDevice {
            request: "gpu".to_string(),
            pool: "pool-a".to_string(),
            device: name.to_string(),
            share_id: None,
            consumed_capacity: BTreeMap::new(),
            attributes: BTreeMap::new(),
            config: None,
        }
    }

    fn request(devices: Vec<PrepareDevice>) -> PrepareRequest {
        PrepareRequest {
            claim_uid: "claim-1".to_string(),
            node: "node-1".to_string(),
            vfio: false,
            devices,
            configs: Vec::new(),
        }
    }

    #[test]
    fn empty_claims_fail_validation() {
        let mut bad = request(vec![device("dev-1")]);
        bad.claim_uid = String::new();
        assert!(matches!(
            validate_request(&bad),
            Err(PrepareError::Validation(_))
        ));
        assert!(matches!(
            validate_request(&request(Vec::new())),
            Err(PrepareError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_slots_fail_validation() {
        let dup = request(vec![device("dev-1"), device("dev-1")]);
        assert!(matches!(
            validate_request(&dup),
            Err(PrepareError::Validation(_))
        ));

        // Distinct share IDs on the same device are distinct slots.
        let mut a = device("dev-1");
        a.share_id = Some("share-a".to_string());
        let mut b = device("dev-1");
        b.share_id = Some("share-b".to_string());
        assert!(validate_request(&request(vec![a, b])).is_ok());
    }
}
