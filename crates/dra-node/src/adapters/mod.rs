//! Contracts of the node-local adapters the prepare pipeline drives.
//!
//! Every adapter call must be idempotent: asking for state that already
//! holds is a no-op. Implementations own their hardware handles (NVML,
//! sysfs, the MPS control daemon); the pipeline never touches those
//! directly.

use std::sync::Arc;

use async_trait::async_trait;
use dra_core::device::AllocationResult;
use dra_core::OpContext;
#[cfg(test)]
use mockall::automock;

use crate::cdi::CdiSpec;
use crate::config::{MpsConfig, TimeSliceInterval};

/// Outcome of asking the MIG manager to materialize a profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigTransition {
    /// The requested profile is in place.
    Applied {
        /// Whether this call created the profile, as opposed to finding it
        /// already present. Decides who dissolves it on unprepare.
        created: bool,
    },
    /// The GPU is mid-transition; ask again later.
    InProgress,
}

/// Materializes and dissolves MIG profiles on a physical parent GPU.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MigManager: Send + Sync {
    /// Ensures the parent exposes the given profile. Returns once the
    /// observable MIG layout matches the request, or reports an in-flight
    /// transition.
    async fn ensure(
        &self,
        ctx: &OpContext,
        parent_uuid: &str,
        profile: &str,
    ) -> anyhow::Result<MigTransition>;

    /// Removes the MIG layout from the parent.
    async fn dissolve(&self, ctx: &OpContext, parent_uuid: &str) -> anyhow::Result<()>;
}

/// Binds and unbinds physical devices to the VFIO driver.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VfioManager: Send + Sync {
    /// Binds the PCI device to VFIO.
    async fn bind(&self, ctx: &OpContext, pci_address: &str) -> anyhow::Result<()>;

    /// Returns the PCI device to its native driver.
    async fn unbind(&self, ctx: &OpContext, pci_address: &str) -> anyhow::Result<()>;
}

/// Applies and clears time-slice scheduling on groups of devices.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TimeSlicingManager: Send + Sync {
    /// Applies the interval to every device in the group.
    async fn set_time_slice(
        &self,
        ctx: &OpContext,
        uuids: &[String],
        interval: TimeSliceInterval,
    ) -> anyhow::Result<()>;

    /// Restores default scheduling on the devices.
    async fn clear(&self, ctx: &OpContext, uuids: &[String]) -> anyhow::Result<()>;
}

/// Configures the MPS server state for shared devices.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MpsManager: Send + Sync {
    /// Brings the MPS server for the devices into the requested state.
    async fn configure(
        &self,
        ctx: &OpContext,
        uuids: &[String],
        config: &MpsConfig,
    ) -> anyhow::Result<()>;

    /// Tears the MPS state down for the devices.
    async fn clear(&self, ctx: &OpContext, uuids: &[String]) -> anyhow::Result<()>;
}

/// Health probe over prepared devices. Unavailability is not fatal.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GpuChecker: Send + Sync {
    /// Whether the device looks healthy.
    async fn check(&self, ctx: &OpContext, uuid: &str) -> anyhow::Result<bool>;
}

/// Writes and removes CDI descriptors.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CdiWriter: Send + Sync {
    /// Persists the descriptor and returns the qualified CDI device IDs,
    /// in descriptor order.
    async fn write(&self, ctx: &OpContext, spec: &CdiSpec) -> anyhow::Result<Vec<String>>;

    /// Removes the descriptor written for the claim. Missing is a no-op.
    async fn remove(&self, ctx: &OpContext, claim_uid: &str) -> anyhow::Result<()>;
}

/// Persists an allocation result externally (a claim status update).
/// Implementations must be idempotent.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AllocationWriter: Send + Sync {
    /// Writes the result.
    async fn write(&self, ctx: &OpContext, result: &AllocationResult) -> anyhow::Result<()>;
}

/// The bundle of adapters one prepare pipeline runs against.
#[derive(Clone)]
pub struct Adapters {
    /// MIG manager.
    pub mig: Arc<dyn MigManager>,
    /// VFIO manager.
    pub vfio: Arc<dyn VfioManager>,
    /// Time-slicing manager.
    pub time_slicing: Arc<dyn TimeSlicingManager>,
    /// MPS manager.
    pub mps: Arc<dyn MpsManager>,
    /// Optional health checker; skipped when absent.
    pub checker: Option<Arc<dyn GpuChecker>>,
    /// CDI descriptor writer.
    pub cdi: Arc<dyn CdiWriter>,
}
