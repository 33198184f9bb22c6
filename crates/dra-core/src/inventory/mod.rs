//! Turns raw pool-slice publications into the set of devices eligible for
//! allocation on each node.
//!
//! A pool publishes its devices as one or more *slices* per generation.
//! Publication is treated as atomic: only the newest generation whose
//! slices have all been observed may influence allocation. Partial
//! generations are dropped without surfacing an error; the pool simply
//! stays invisible until its publication stabilizes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::OpContext;
use crate::device::{CandidateDevice, CounterSet, DeviceKey, DeviceSpec};

/// One device as carried by a slice, with its optional per-device node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SliceDevice {
    /// The published device spec.
    pub spec: DeviceSpec,
    /// Node the device is pinned to, honored only when the slice enables
    /// per-device node selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// One unit of pool publication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSlice {
    /// Slice name; used only for stable ordering within a generation.
    pub name: String,
    /// Driver the pool belongs to.
    pub driver: String,
    /// Pool name.
    pub pool: String,
    /// Generation this slice belongs to.
    pub generation: i64,
    /// Number of slices composing the generation.
    pub slice_count: usize,
    /// Node all devices of this slice live on, when pool-wide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Whether devices carry their own node names.
    #[serde(default)]
    pub per_device_node_selection: bool,
    /// Devices published by this slice.
    #[serde(default)]
    pub devices: Vec<SliceDevice>,
    /// Shared counter sets published by this slice.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counter_sets: Vec<CounterSet>,
}

/// Counter-set inventory keyed by node name, then by set name.
pub type CounterSetInventory = BTreeMap<String, BTreeMap<String, CounterSet>>;

/// A point-in-time view of the resource slices visible to one allocation
/// attempt, as returned by an [`InventoryProvider`].
#[derive(Clone, Debug, Default)]
pub struct NodeInventory {
    /// Name of the node the snapshot was taken on. Empty for cluster-wide
    /// snapshots.
    pub node: String,
    /// Raw slices, unfiltered.
    pub slices: Vec<PoolSlice>,
}

/// Supplies inventory snapshots to the allocator. The production
/// implementation lists ResourceSlices from the API server; tests feed
/// slices directly.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    /// Returns a point-in-time view of the visible resource slices.
    async fn snapshot(&self, ctx: &OpContext) -> anyhow::Result<NodeInventory>;
}

/// Keeps, per pool, only the newest fully-observed generation.
///
/// Within a pool, generations are examined newest first; the first one
/// whose observed slice count equals its declared `slice_count` wins.
/// Generations that are partial, or whose slices disagree on the declared
/// count, are skipped. Kept slices are sorted by slice name.
pub fn filter_pool_slices(slices: Vec<PoolSlice>) -> Vec<PoolSlice> {
    let mut by_pool: BTreeMap<String, Vec<PoolSlice>> = BTreeMap::new();
    for slice in slices {
        by_pool.entry(slice.pool.clone()).or_default().push(slice);
    }

    let mut kept = Vec::new();
    for (pool, pool_slices) in by_pool {
        let mut generations: Vec<i64> = pool_slices.iter().map(|s| s.generation).collect();
        generations.sort_unstable();
        generations.dedup();

        let mut chosen: Option<Vec<PoolSlice>> = None;
        for generation in generations.into_iter().rev() {
            let members: Vec<&PoolSlice> = pool_slices
                .iter()
                .filter(|s| s.generation == generation)
                .collect();
            let declared = members[0].slice_count;
            if members.iter().any(|s| s.slice_count != declared) {
                debug!(
                    pool = %pool,
                    generation,
                    "skipping generation whose slices disagree on the slice count"
                );
                continue;
            }
            if members.len() != declared {
                debug!(
                    pool = %pool,
                    generation,
                    observed = members.len(),
                    declared,
                    "skipping partially observed generation"
                );
                continue;
            }
            let mut members: Vec<PoolSlice> = members.into_iter().cloned().collect();
            members.sort_by(|a, b| a.name.cmp(&b.name));
            chosen = Some(members);
            break;
        }

        match chosen {
            Some(mut members) => kept.append(&mut members),
            None => debug!(pool = %pool, "pool has no complete generation, skipping"),
        }
    }
    kept
}

/// Builds the candidate devices and counter-set inventory for one driver
/// out of a raw slice list.
///
/// Slice generations are filtered first. A device becomes a candidate only
/// when its node is resolvable: the slice carries a pool-wide node, or
/// per-device node selection is on and the device names its own node.
/// Counter sets are collected only from slices with a pool-wide node.
/// Candidates come back sorted by (node, device name).
pub fn build_candidates(
    driver: &str,
    slices: Vec<PoolSlice>,
) -> (Vec<CandidateDevice>, CounterSetInventory) {
    let slices = filter_pool_slices(
        slices
            .into_iter()
            .filter(|s| s.driver == driver)
            .collect(),
    );

    let mut candidates = Vec::new();
    let mut counter_sets: CounterSetInventory = BTreeMap::new();

    for slice in slices {
        if let Some(node) = slice.node.as_deref().filter(|n| !n.is_empty()) {
            let per_node = counter_sets.entry(node.to_string()).or_default();
            for set in &slice.counter_sets {
                per_node.entry(set.name.clone()).or_insert_with(|| set.clone());
            }
        }

        for device in &slice.devices {
            let node = match resolve_node(&slice, device) {
                Some(node) => node,
                None => {
                    debug!(
                        pool = %slice.pool,
                        device = %device.spec.name,
                        "device has no resolvable node, not a candidate"
                    );
                    continue;
                }
            };
            candidates.push(CandidateDevice {
                key: DeviceKey::new(&*slice.driver, &*slice.pool, &*device.spec.name),
                node,
                spec: device.spec.clone(),
            });
        }
    }

    candidates.sort_by(|a, b| (&a.node, &a.key.device).cmp(&(&b.node, &b.key.device)));
    (candidates, counter_sets)
}

fn resolve_node(slice: &PoolSlice, device: &SliceDevice) -> Option<String> {
    if let Some(node) = slice.node.as_deref().filter(|n| !n.is_empty()) {
        return Some(node.to_string());
    }
    if slice.per_device_node_selection {
        if let Some(node) = device.node.as_deref().filter(|n| !n.is_empty()) {
            return Some(node.to_string());
        }
    }
    None
}
