//! The durable per-claim record of prepared devices.
//!
//! One file per claim UID, written atomically and guarded by a checksum.
//! The checkpoint is the only persistent state the core owns: it exists
//! exactly while any prepared device for its claim exists, and unprepare
//! deletes it last.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::config::SharingStrategy;
use crate::fsutil;

/// Errors of the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem failure.
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),

    /// The stored record does not parse or its checksum does not match.
    /// Never silently discarded; an operator has to look.
    #[error("checkpoint for claim {claim_uid} is corrupt: {reason}")]
    Corrupt {
        /// Claim the record belongs to.
        claim_uid: String,
        /// What went wrong while decoding.
        reason: String,
    },

    /// The record could not be encoded.
    #[error("checkpoint encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Everything unprepare needs to know about one prepared slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDeviceRecord {
    /// Request the slot satisfies.
    pub request: String,
    /// Pool of the device.
    pub pool: String,
    /// Device name.
    pub device: String,
    /// Share identifier of the slot, for shared allocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    /// Resolved sharing strategy.
    pub strategy: SharingStrategy,
    /// Qualified CDI device IDs handed to the kubelet.
    #[serde(default)]
    pub cdi_ids: Vec<String>,
    /// Device UUID, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// PCI address, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<String>,
    /// UUID of the MIG parent, for partitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_uuid: Option<String>,
    /// Whether the device was bound to VFIO.
    #[serde(default)]
    pub vfio: bool,
    /// Whether preparing this claim created the MIG profile. Only then
    /// does unprepare dissolve it.
    #[serde(default)]
    pub mig_created: bool,
    /// Consumed capacity amounts, carried for inspection.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumed_capacity: BTreeMap<String, i64>,
}

/// The durable record tying a claim UID to its prepared devices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    /// Claim the record belongs to.
    pub claim_uid: String,
    /// When the record was first written.
    pub created: DateTime<Utc>,
    /// Prepared devices, in request order.
    pub devices: Vec<PreparedDeviceRecord>,
}

/// On-disk envelope: the record plus a checksum over its canonical JSON
/// form.
#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    record: serde_json::Value,
}

fn checksum_of(record: &serde_json::Value) -> Result<String, CheckpointError> {
    let canonical = serde_json::to_vec(record)?;
    let digest = Sha256::digest(&canonical);
    Ok(format!("{:x}", digest))
}

/// Durable store of checkpoint records.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the record for a claim; `None` when nothing was prepared.
    async fn load(&self, claim_uid: &str) -> Result<Option<CheckpointRecord>, CheckpointError>;

    /// Persists the record, replacing any previous one atomically.
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    /// Removes the record. Missing is a no-op.
    async fn delete(&self, claim_uid: &str) -> Result<(), CheckpointError>;
}

/// Filesystem-backed store: one `<claim uid>.json` per claim.
pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    /// A store rooted at `dir`; the directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FsCheckpointStore { dir: dir.into() }
    }

    /// The directory the store writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, claim_uid: &str) -> PathBuf {
        self.dir.join(format!("{}.json", claim_uid))
    }

    /// Lists the claim UIDs that currently have a checkpoint.
    pub async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut claims = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(claims),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(claim_uid) = name.strip_suffix(".json") {
                if !claim_uid.starts_with('.') {
                    claims.push(claim_uid.to_string());
                }
            }
        }
        claims.sort();
        Ok(claims)
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn load(&self, claim_uid: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.path_for(claim_uid);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: String| CheckpointError::Corrupt {
            claim_uid: claim_uid.to_string(),
            reason,
        };
        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        let checksum = checksum_of(&envelope.record)?;
        if checksum != envelope.checksum {
            return Err(corrupt(format!(
                "checksum mismatch: stored {} computed {}",
                envelope.checksum, checksum
            )));
        }
        let record: CheckpointRecord =
            serde_json::from_value(envelope.record).map_err(|e| corrupt(e.to_string()))?;
        Ok(Some(record))
    }

    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let value = serde_json::to_value(record)?;
        let envelope = Envelope {
            checksum: checksum_of(&value)?,
            record: value,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        fsutil::write_atomic(&self.path_for(&record.claim_uid), &bytes).await?;
        debug!(claim_uid = %record.claim_uid, devices = record.devices.len(), "saved checkpoint");
        Ok(())
    }

    async fn delete(&self, claim_uid: &str) -> Result<(), CheckpointError> {
        fsutil::remove_if_exists(&self.path_for(claim_uid)).await?;
        debug!(claim_uid, "deleted checkpoint");
        Ok(())
    }
}
