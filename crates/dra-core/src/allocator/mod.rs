//! The constraint-satisfaction engine that binds a claim's requests to
//! concrete devices on a single node.
//!
//! The algorithm is deliberately boring and deterministic: nodes are tried
//! in ascending name order, devices in their (node-sorted) input order,
//! and the first node able to satisfy *every* request wins. There is no
//! scoring, no best-fit and no randomization, so the same input always
//! produces the same result.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::trace;
use uuid::Uuid;

use crate::device::capacity::{consumed_capacity, fits_remaining};
use crate::device::counters::CounterTracker;
use crate::device::{
    AllocatedDevice, AllocatedDeviceInfo, AllocationResult, CandidateDevice, DeviceKey,
    DeviceKind, DeviceSpec,
};
use crate::error::AllocationError;
use crate::inventory::CounterSetInventory;
use crate::selector::{match_all, DeviceSelector};

/// One device request within a claim.
#[derive(Clone)]
pub struct Request {
    /// Request name; devices in the result reference it.
    pub name: String,
    /// How many devices (or shared slots) to allocate. Must be at least 1.
    pub count: usize,
    /// Selectors combined by AND; empty matches everything.
    pub selectors: Vec<Arc<dyn DeviceSelector>>,
    /// Requested amounts per capacity name; omitted capacities follow the
    /// device's policy.
    pub capacity: BTreeMap<String, i64>,
}

impl Request {
    /// A request for `count` devices with no selectors and no capacity
    /// requirements.
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        Request {
            name: name.into(),
            count,
            selectors: Vec::new(),
            capacity: BTreeMap::new(),
        }
    }

    /// Adds a selector.
    pub fn with_selector(mut self, selector: Arc<dyn DeviceSelector>) -> Self {
        self.selectors.push(selector);
        self
    }

    /// Adds a capacity requirement.
    pub fn with_capacity(mut self, name: impl Into<String>, amount: i64) -> Self {
        self.capacity.insert(name.into(), amount);
        self
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("selectors", &self.selectors.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Everything one allocation attempt reads: the claim's requests, the
/// candidate devices, prior allocations and the per-node counter-set
/// inventory.
#[derive(Clone, Debug, Default)]
pub struct AllocationInput {
    /// Requests to satisfy, all of them, on one node.
    pub requests: Vec<Request>,
    /// Candidate devices, sorted by (node, device name).
    pub candidates: Vec<CandidateDevice>,
    /// What earlier claims already took, keyed by device.
    pub allocated: BTreeMap<DeviceKey, AllocatedDeviceInfo>,
    /// Counter-set inventory per node.
    pub counter_sets: CounterSetInventory,
}

/// The allocator. Pure and stateless; safe to share and to call
/// concurrently on disjoint inputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct Allocator;

impl Allocator {
    /// Returns an allocator.
    pub fn new() -> Self {
        Allocator
    }

    /// Attempts to satisfy every request of the input on a single node.
    ///
    /// `Ok(None)` means no node could satisfy all requests; it is a normal
    /// outcome, not an error. Errors are limited to malformed input and
    /// selector evaluation failures.
    pub fn allocate(
        &self,
        input: &AllocationInput,
    ) -> Result<Option<AllocationResult>, AllocationError> {
        validate_requests(&input.requests)?;

        let mut by_node: BTreeMap<&str, Vec<&CandidateDevice>> = BTreeMap::new();
        for candidate in &input.candidates {
            by_node.entry(&candidate.node).or_default().push(candidate);
        }

        for (node, candidates) in by_node {
            match self.try_node(input, node, &candidates)? {
                Some(devices) => {
                    trace!(node, devices = devices.len(), "allocation succeeded");
                    return Ok(Some(AllocationResult::new(node, devices)));
                }
                None => {
                    trace!(node, "node cannot satisfy all requests");
                }
            }
        }
        Ok(None)
    }

    /// Attempts all requests against one node. All-or-nothing: any request
    /// that cannot be fully satisfied discards the whole node.
    fn try_node(
        &self,
        input: &AllocationInput,
        node: &str,
        candidates: &[&CandidateDevice],
    ) -> Result<Option<Vec<AllocatedDevice>>, AllocationError> {
        let meta_by_key: BTreeMap<&DeviceKey, DeviceMeta> = candidates
            .iter()
            .map(|c| (&c.key, DeviceMeta::of(&c.spec)))
            .collect();

        let sets = input
            .counter_sets
            .get(node)
            .map(|per_node| per_node.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        let mut tracker = CounterTracker::new(sets);
        let mut groups: BTreeMap<String, GroupState> = BTreeMap::new();
        let mut used_exclusive: BTreeSet<DeviceKey> = BTreeSet::new();
        let mut consumed_totals: BTreeMap<DeviceKey, BTreeMap<String, i64>> = BTreeMap::new();

        // Seed the attempt with what prior allocations already took from
        // this node.
        for candidate in candidates {
            let info = match input.allocated.get(&candidate.key) {
                Some(info) => info,
                None => continue,
            };
            let meta = &meta_by_key[&candidate.key];
            mark_group(&mut groups, meta);
            if info.exclusive {
                used_exclusive.insert(candidate.key.clone());
            }
            if !info.consumed.is_empty() {
                let totals = consumed_totals.entry(candidate.key.clone()).or_default();
                for (name, amount) in &info.consumed {
                    *totals.entry(name.clone()).or_insert(0) += amount;
                }
            }
            if candidate.spec.consumes.is_empty() {
                continue;
            }
            // A shared allocation that recorded no consumed capacity gives
            // us no way to reconstruct how much it took from the shared
            // counters; the affected sets must not hand out more.
            let reconstructible = info.exclusive || !info.consumed.is_empty();
            if !reconstructible || !tracker.try_consume(&candidate.spec.consumes) {
                for consumption in &candidate.spec.consumes {
                    trace!(
                        device = %candidate.key,
                        counter_set = %consumption.counter_set,
                        "prior consumption not reconstructible, blocking counter set"
                    );
                    tracker.block(&consumption.counter_set);
                }
            }
        }

        let mut result = Vec::new();
        for request in &input.requests {
            let mut remaining = request.count;
            for candidate in candidates {
                if remaining == 0 {
                    break;
                }
                let meta = &meta_by_key[&candidate.key];
                if tracker.any_blocked(&candidate.spec.consumes) {
                    continue;
                }
                if conflicts_with_group(&groups, meta) {
                    continue;
                }
                if !match_all(&request.selectors, &candidate.key.driver, &candidate.spec)? {
                    continue;
                }

                if candidate.spec.allow_multiple_allocations {
                    // Shared path: keep carving slots out of this device
                    // until the request is satisfied or it is full.
                    while remaining > 0 {
                        let consumed =
                            match consumed_capacity(&request.capacity, &candidate.spec.capacity)? {
                                Some(consumed) => consumed,
                                None => break,
                            };
                        let existing = consumed_totals
                            .get(&candidate.key)
                            .cloned()
                            .unwrap_or_default();
                        if !fits_remaining(&consumed, &existing, &candidate.spec.capacity) {
                            break;
                        }
                        if !tracker.try_consume(&candidate.spec.consumes) {
                            break;
                        }
                        let totals = consumed_totals.entry(candidate.key.clone()).or_default();
                        for (name, amount) in &consumed {
                            *totals.entry(name.clone()).or_insert(0) += amount;
                        }
                        mark_group(&mut groups, meta);
                        result.push(allocated_device(
                            request,
                            candidate,
                            consumed,
                            Some(Uuid::new_v4().to_string()),
                        ));
                        remaining -= 1;
                    }
                } else {
                    // Exclusive path: the device must be untouched.
                    if used_exclusive.contains(&candidate.key)
                        || input.allocated.contains_key(&candidate.key)
                    {
                        continue;
                    }
                    let consumed =
                        match consumed_capacity(&request.capacity, &candidate.spec.capacity)? {
                            Some(consumed) => consumed,
                            None => continue,
                        };
                    if !tracker.try_consume(&candidate.spec.consumes) {
                        continue;
                    }
                    used_exclusive.insert(candidate.key.clone());
                    mark_group(&mut groups, meta);
                    result.push(allocated_device(request, candidate, consumed, None));
                    remaining -= 1;
                }
            }
            if remaining > 0 {
                return Ok(None);
            }
        }
        Ok(Some(result))
    }
}

/// Precomputed allocation-relevant facts about one candidate.
#[derive(Clone, Debug)]
struct DeviceMeta {
    /// Devices sharing a group key share a physical PCI device; empty when
    /// the device declares neither counters nor a PCI address.
    group_key: String,
    kind: DeviceKind,
}

impl DeviceMeta {
    fn of(spec: &DeviceSpec) -> Self {
        let group_key = spec
            .consumes
            .first()
            .map(|c| c.counter_set.clone())
            .or_else(|| spec.pci_address().map(|pci| format!("pci-{}", pci)))
            .unwrap_or_default();
        DeviceMeta {
            group_key,
            kind: spec.kind(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct GroupState {
    has_physical: bool,
    has_mig: bool,
}

/// A physical GPU and a MIG partition of the same PCI device exclude each
/// other.
fn conflicts_with_group(groups: &BTreeMap<String, GroupState>, meta: &DeviceMeta) -> bool {
    if meta.group_key.is_empty() {
        return false;
    }
    match groups.get(&meta.group_key) {
        Some(state) => match meta.kind {
            DeviceKind::Physical => state.has_mig,
            DeviceKind::Mig => state.has_physical,
            DeviceKind::Unknown => false,
        },
        None => false,
    }
}

fn mark_group(groups: &mut BTreeMap<String, GroupState>, meta: &DeviceMeta) {
    if meta.group_key.is_empty() {
        return;
    }
    let state = groups.entry(meta.group_key.clone()).or_default();
    match meta.kind {
        DeviceKind::Physical => state.has_physical = true,
        DeviceKind::Mig => state.has_mig = true,
        DeviceKind::Unknown => {}
    }
}

fn allocated_device(
    request: &Request,
    candidate: &CandidateDevice,
    consumed: BTreeMap<String, i64>,
    share_id: Option<String>,
) -> AllocatedDevice {
    AllocatedDevice {
        request: request.name.clone(),
        driver: candidate.key.driver.clone(),
        pool: candidate.key.pool.clone(),
        device: candidate.key.device.clone(),
        consumed_capacity: consumed,
        share_id,
        binding_conditions: candidate.spec.binding_conditions.clone(),
        binding_failure_conditions: candidate.spec.binding_failure_conditions.clone(),
    }
}

fn validate_requests(requests: &[Request]) -> Result<(), AllocationError> {
    if requests.is_empty() {
        return Err(AllocationError::Validation(
            "claim carries no requests".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for request in requests {
        if request.name.is_empty() {
            return Err(AllocationError::Validation(
                "request name must not be empty".to_string(),
            ));
        }
        if request.count == 0 {
            return Err(AllocationError::Validation(format!(
                "request {} asks for zero devices",
                request.name
            )));
        }
        if !seen.insert(&request.name) {
            return Err(AllocationError::Validation(format!(
                "duplicate request name {}",
                request.name
            )));
        }
    }
    Ok(())
}
