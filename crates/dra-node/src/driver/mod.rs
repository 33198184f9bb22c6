//! The DRA node façade: batch prepare/unprepare over allocated claims.
//!
//! This is the surface the enclosing kubelet-plugin endpoint calls into.
//! Claims are handled independently: one claim failing to prepare never
//! aborts the rest of the batch, and every failure comes back attached to
//! its claim UID.

use std::collections::BTreeMap;
use std::sync::Arc;

use dra_core::device::{AllocationResult, AttributeValue};
use dra_core::OpContext;
use tracing::{instrument, warn};

use crate::config::ConfigOverride;
use crate::error::PrepareError;
use crate::prepare::{PrepareDevice, PrepareOutcome, PrepareRequest, PrepareService};

/// Identity of a claim as the API server knows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClaimRef {
    /// Claim UID; keys the checkpoint.
    pub uid: String,
    /// Claim name.
    pub name: String,
    /// Claim namespace.
    pub namespace: String,
}

/// Everything the façade needs to prepare one allocated claim.
#[derive(Clone, Debug)]
pub struct ClaimPreparation {
    /// The claim being prepared.
    pub claim: ClaimRef,
    /// The immutable allocation result produced by the scheduler.
    pub result: AllocationResult,
    /// Attribute snapshots per device name, taken from the inventory at
    /// allocation time.
    pub attributes: BTreeMap<String, BTreeMap<String, AttributeValue>>,
    /// Claim- and class-level config overrides.
    pub configs: Vec<ConfigOverride>,
    /// Whether the pod requested VFIO pass-through (via annotation).
    pub vfio_requested: bool,
}

/// The node driver façade over one [`PrepareService`].
pub struct NodeDriver {
    node: String,
    service: Arc<PrepareService>,
}

impl NodeDriver {
    /// A driver for the given node.
    pub fn new(node: impl Into<String>, service: Arc<PrepareService>) -> Self {
        NodeDriver {
            node: node.into(),
            service,
        }
    }

    /// Prepares a batch of claims; the result maps each claim UID to its
    /// outcome. Failures are per-claim and recoverable unless marked
    /// otherwise.
    #[instrument(skip(self, ctx, claims), fields(claims = claims.len()))]
    pub async fn prepare_resource_claims(
        &self,
        ctx: &OpContext,
        claims: Vec<ClaimPreparation>,
    ) -> BTreeMap<String, Result<PrepareOutcome, PrepareError>> {
        let mut results = BTreeMap::new();
        for claim in claims {
            let uid = claim.claim.uid.clone();
            let outcome = match self.to_prepare_request(claim) {
                Ok(request) => self.service.prepare(ctx, request).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &outcome {
                warn!(claim_uid = %uid, error = %e, "claim failed to prepare");
            }
            results.insert(uid, outcome);
        }
        results
    }

    /// Unprepares a batch of claims by UID; missing checkpoints are
    /// no-ops. The result maps each claim UID to its outcome.
    #[instrument(skip(self, ctx, claim_uids), fields(claims = claim_uids.len()))]
    pub async fn unprepare_resource_claims(
        &self,
        ctx: &OpContext,
        claim_uids: Vec<String>,
    ) -> BTreeMap<String, Result<(), PrepareError>> {
        let mut results = BTreeMap::new();
        for claim_uid in claim_uids {
            let outcome = self.service.unprepare(ctx, &claim_uid).await;
            if let Err(e) = &outcome {
                warn!(claim_uid = %claim_uid, error = %e, "claim failed to unprepare");
            }
            results.insert(claim_uid, outcome);
        }
        results
    }

    /// Validates one claim and translates its allocation result into a
    /// pipeline request.
    fn to_prepare_request(&self, claim: ClaimPreparation) -> Result<PrepareRequest, PrepareError> {
        if claim.claim.uid.is_empty() {
            return Err(PrepareError::Validation(format!(
                "claim {}/{} has no UID",
                claim.claim.namespace, claim.claim.name
            )));
        }
        if claim.result.node != self.node {
            return Err(PrepareError::Validation(format!(
                "claim {} is allocated to node {}, not to {}",
                claim.claim.uid, claim.result.node, self.node
            )));
        }
        if claim.result.devices.is_empty() {
            return Err(PrepareError::Validation(format!(
                "claim {} was allocated no devices",
                claim.claim.uid
            )));
        }
        let request_names: std::collections::BTreeSet<&str> = claim
            .result
            .devices
            .iter()
            .map(|d| d.request.as_str())
            .collect();
        for over in &claim.configs {
            for target in &over.requests {
                let parent = target.split('/').next().unwrap_or(target);
                if !request_names.contains(parent) {
                    return Err(PrepareError::Validation(format!(
                        "claim {}: config targets unknown request {}",
                        claim.claim.uid, target
                    )));
                }
            }
        }

        // TODO: hold preparation until binding_conditions report true once
        // the scheduler starts publishing bind status for this driver.
        let devices = claim
            .result
            .devices
            .iter()
            .map(|allocated| PrepareDevice {
                request: allocated.request.clone(),
                pool: allocated.pool.clone(),
                device: allocated.device.clone(),
                share_id: allocated.share_id.clone(),
                consumed_capacity: allocated.consumed_capacity.clone(),
                attributes: claim
                    .attributes
                    .get(&allocated.device)
                    .cloned()
                    .unwrap_or_default(),
                config: None,
            })
            .collect();

        Ok(PrepareRequest {
            claim_uid: claim.claim.uid,
            node: claim.result.node,
            vfio: claim.vfio_requested,
            devices,
            configs: claim.configs,
        })
    }
}
