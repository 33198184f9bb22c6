//! The CDI descriptor model and a filesystem-backed writer.
//!
//! A descriptor names the set of prepared devices a container runtime may
//! mount. The qualified device ID handed back to the kubelet is
//! `<kind>=<device name>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dra_core::OpContext;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapters::CdiWriter;
use crate::fsutil;

/// CDI specification version emitted by the writer.
pub const CDI_VERSION: &str = "0.6.0";

/// A CDI JSON descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    /// Spec version, [`CDI_VERSION`].
    pub cdi_version: String,
    /// Qualified kind, `<vendor>/<class>`, e.g. `gpu.example.com/gpu`.
    pub kind: String,
    /// Devices exposed by this descriptor.
    pub devices: Vec<CdiDevice>,
}

impl CdiSpec {
    /// An empty descriptor of the given kind.
    pub fn new(kind: impl Into<String>) -> Self {
        CdiSpec {
            cdi_version: CDI_VERSION.to_string(),
            kind: kind.into(),
            devices: Vec::new(),
        }
    }

    /// The qualified IDs of the contained devices, in descriptor order.
    pub fn device_ids(&self) -> Vec<String> {
        self.devices
            .iter()
            .map(|d| format!("{}={}", self.kind, d.name))
            .collect()
    }
}

/// One device entry of a descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    /// Device name, unique within the descriptor.
    pub name: String,
    /// Edits the runtime applies to containers using the device.
    pub container_edits: ContainerEdits,
}

/// Runtime edits: environment and device nodes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    /// Environment variables, `NAME=value`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Device nodes mounted into the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_nodes: Vec<DeviceNode>,
}

/// A device node exposed to the container.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    /// Path inside the container.
    pub path: String,
    /// Host path, when it differs from `path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
}

/// Writes one transient descriptor file per claim into a spec directory,
/// atomically, named `<vendor>-<claim uid>.json`.
pub struct FsCdiWriter {
    dir: PathBuf,
    vendor: String,
}

impl FsCdiWriter {
    /// A writer placing descriptors under `dir` for the given vendor
    /// (the part of the kind before the slash).
    pub fn new(dir: impl Into<PathBuf>, vendor: impl Into<String>) -> Self {
        FsCdiWriter {
            dir: dir.into(),
            vendor: vendor.into(),
        }
    }

    fn spec_path(&self, claim_uid: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.json", self.vendor, claim_uid))
    }

    fn claim_uid_of(spec: &CdiSpec) -> anyhow::Result<&str> {
        // Device names are `<claim uid>--<device>`, see `cdi_device_name`.
        spec.devices
            .first()
            .and_then(|d| d.name.split("--").next())
            .ok_or_else(|| anyhow::anyhow!("descriptor contains no devices"))
    }
}

#[async_trait]
impl CdiWriter for FsCdiWriter {
    async fn write(&self, ctx: &OpContext, spec: &CdiSpec) -> anyhow::Result<Vec<String>> {
        ctx.err_if_cancelled()?;
        let claim_uid = Self::claim_uid_of(spec)?.to_string();
        let path = self.spec_path(&claim_uid);
        let bytes = serde_json::to_vec_pretty(spec)?;
        fsutil::write_atomic(&path, &bytes).await?;
        debug!(path = %path.display(), devices = spec.devices.len(), "wrote CDI descriptor");
        Ok(spec.device_ids())
    }

    async fn remove(&self, ctx: &OpContext, claim_uid: &str) -> anyhow::Result<()> {
        ctx.err_if_cancelled()?;
        let path = self.spec_path(claim_uid);
        fsutil::remove_if_exists(&path).await?;
        debug!(path = %path.display(), "removed CDI descriptor");
        Ok(())
    }
}

/// Composes the descriptor-unique device name for one prepared slot:
/// `<claim uid>--<device>` plus the short share suffix for shared slots.
pub fn cdi_device_name(claim_uid: &str, device: &str, share_id: Option<&str>) -> String {
    match share_id {
        Some(share) => {
            let short: String = share.chars().take(8).collect();
            format!("{}--{}-{}", claim_uid, device, short)
        }
        None => format!("{}--{}", claim_uid, device),
    }
}

/// Reads a descriptor back from the spec directory. Used by tests and the
/// checkpoint inspector.
pub async fn read_spec(dir: &Path, vendor: &str, claim_uid: &str) -> anyhow::Result<Option<CdiSpec>> {
    let path = dir.join(format!("{}-{}.json", vendor, claim_uid));
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with(names: &[&str]) -> CdiSpec {
        let mut spec = CdiSpec::new("gpu.example.com/gpu");
        spec.devices = names
            .iter()
            .map(|n| CdiDevice {
                name: n.to_string(),
                container_edits: ContainerEdits::default(),
            })
            .collect();
        spec
    }

    #[test]
    fn device_ids_are_qualified_by_kind() {
        let spec = spec_with(&["claim-1--dev-1"]);
        assert_eq!(spec.device_ids(), vec!["gpu.example.com/gpu=claim-1--dev-1"]);
    }

    #[test]
    fn shared_slots_get_distinct_names() {
        let a = cdi_device_name("claim-1", "dev-1", Some("aaaaaaaa-1111"));
        let b = cdi_device_name("claim-1", "dev-1", Some("bbbbbbbb-2222"));
        let exclusive = cdi_device_name("claim-1", "dev-1", None);
        assert_ne!(a, b);
        assert_eq!(exclusive, "claim-1--dev-1");
    }

    #[tokio::test]
    async fn write_and_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FsCdiWriter::new(dir.path(), "gpu.example.com");
        let ctx = OpContext::background();
        let spec = spec_with(&["claim-1--dev-1", "claim-1--dev-2"]);

        let ids = writer.write(&ctx, &spec).await.unwrap();
        assert_eq!(ids.len(), 2);
        let on_disk = read_spec(dir.path(), "gpu.example.com", "claim-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(on_disk, spec);

        // Rewriting the same descriptor yields the same IDs.
        let again = writer.write(&ctx, &spec).await.unwrap();
        assert_eq!(again, ids);

        writer.remove(&ctx, "claim-1").await.unwrap();
        assert!(read_spec(dir.path(), "gpu.example.com", "claim-1")
            .await
            .unwrap()
            .is_none());
        // Removing twice is fine.
        writer.remove(&ctx, "claim-1").await.unwrap();
    }
}
