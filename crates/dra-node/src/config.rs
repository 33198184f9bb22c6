//! Per-device preparation configs: the tagged variants a claim or class may
//! attach to a device, and the rules for resolving the effective config.

use dra_core::device::DeviceKind;
use serde::{Deserialize, Serialize};

/// Configuration of a whole physical GPU handed out exclusively.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuConfig {}

/// Configuration of a MIG partition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigDeviceConfig {
    /// MIG profile to materialize on the parent; defaults to the profile
    /// the device advertises.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// Configuration binding the device to VFIO for VM pass-through.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VfioConfig {}

/// Requested time-slice interval.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeSliceInterval {
    /// The driver default.
    #[default]
    Default,
    /// Short scheduling interval.
    Short,
    /// Medium scheduling interval.
    Medium,
    /// Long scheduling interval.
    Long,
}

/// Configuration of time-sliced sharing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlicingConfig {
    /// Scheduling interval shared by every device in the group.
    #[serde(default)]
    pub interval: TimeSliceInterval,
}

/// Configuration of MPS sharing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MpsConfig {
    /// Portion of SM threads each client may use, in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_thread_percentage: Option<i64>,
    /// Per-client pinned device memory limit in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_device_memory_limit_mib: Option<i64>,
}

/// The opaque per-device config, discriminated by variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceConfig {
    /// Default config of a whole physical GPU.
    Gpu(GpuConfig),
    /// Default config of a MIG partition.
    MigDevice(MigDeviceConfig),
    /// VFIO pass-through.
    Vfio(VfioConfig),
    /// Time-sliced sharing.
    TimeSlicing(TimeSlicingConfig),
    /// MPS sharing.
    Mps(MpsConfig),
}

impl DeviceConfig {
    /// The default config for a device kind; `None` when the kind is
    /// unknown and no safe default exists.
    pub fn default_for(kind: DeviceKind) -> Option<DeviceConfig> {
        match kind {
            DeviceKind::Physical => Some(DeviceConfig::Gpu(GpuConfig::default())),
            DeviceKind::Mig => Some(DeviceConfig::MigDevice(MigDeviceConfig::default())),
            DeviceKind::Unknown => None,
        }
    }

    /// Whether this config variant may be applied to a device of the given
    /// kind. MPS works on whole GPUs and on MIG partitions; time-slicing
    /// and VFIO only on whole GPUs.
    pub fn compatible_with(&self, kind: DeviceKind) -> bool {
        match self {
            DeviceConfig::Gpu(_) => kind == DeviceKind::Physical,
            DeviceConfig::MigDevice(_) => kind == DeviceKind::Mig,
            DeviceConfig::Vfio(_) => kind == DeviceKind::Physical,
            DeviceConfig::TimeSlicing(_) => kind == DeviceKind::Physical,
            DeviceConfig::Mps(_) => kind == DeviceKind::Physical || kind == DeviceKind::Mig,
        }
    }

    /// The sharing strategy this config resolves to.
    pub fn strategy(&self) -> SharingStrategy {
        match self {
            DeviceConfig::TimeSlicing(cfg) => SharingStrategy::TimeSliced {
                interval: cfg.interval,
            },
            DeviceConfig::Mps(_) => SharingStrategy::Mps,
            _ => SharingStrategy::Exclusive,
        }
    }
}

/// How a prepared device ends up shared, recorded in the checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum SharingStrategy {
    /// One consumer owns the device.
    Exclusive,
    /// Consumers take turns on the given interval.
    TimeSliced {
        /// The shared scheduling interval.
        interval: TimeSliceInterval,
    },
    /// Consumers share through an MPS server.
    Mps,
}

/// Where a config override came from; claim-level overrides win over
/// class-level ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigSource {
    /// Attached to the device class.
    Class,
    /// Attached to the claim itself.
    Claim,
}

/// A config targeted at some of a claim's requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverride {
    /// Request names (or `name/subrequest` prefixes) the config applies
    /// to; empty targets every device of the claim.
    #[serde(default)]
    pub requests: Vec<String>,
    /// The config payload.
    pub config: DeviceConfig,
    /// Claim- or class-level origin.
    pub source: ConfigSource,
}

impl ConfigOverride {
    /// Whether the override targets a device allocated for `request`.
    pub fn applies_to(&self, request: &str) -> bool {
        if self.requests.is_empty() {
            return true;
        }
        self.requests
            .iter()
            .any(|target| target == request || request.starts_with(&format!("{}/", target)))
    }
}
