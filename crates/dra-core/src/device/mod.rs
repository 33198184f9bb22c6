//! The device model shared by the allocator and the node-side prepare
//! pipeline: device identities, attributes, capacities, shared counters and
//! allocation results.

pub mod capacity;
pub mod counters;

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{NodeSelector, NodeSelectorRequirement, NodeSelectorTerm};
use serde::{Deserialize, Serialize};

use crate::error::AllocationError;

/// Attribute holding the device type, one of [`DEVICE_TYPE_GPU`] or
/// [`DEVICE_TYPE_MIG`].
pub const ATTR_TYPE: &str = "type";
/// Attribute holding the canonical device UUID.
pub const ATTR_UUID: &str = "uuid";
/// Attribute holding the PCI address of the device (for a MIG partition,
/// the address of its physical parent).
pub const ATTR_PCI_ADDRESS: &str = "pciAddress";
/// Attribute holding the UUID of the physical parent of a MIG partition.
pub const ATTR_PARENT_UUID: &str = "parentUuid";
/// Attribute holding the MIG profile of a partition, e.g. `1g.10gb`.
pub const ATTR_PROFILE: &str = "profile";

/// [`ATTR_TYPE`] value marking a whole physical GPU.
pub const DEVICE_TYPE_GPU: &str = "gpu";
/// [`ATTR_TYPE`] value marking a MIG partition.
pub const DEVICE_TYPE_MIG: &str = "mig";

/// The node label every allocation result is pinned to.
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Uniquely identifies a device within an inventory snapshot.
///
/// Ordering is lexicographic over (driver, pool, device), which is what the
/// derived `Ord` on this field order produces.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Name of the driver publishing the device.
    pub driver: String,
    /// Name of the pool the device belongs to.
    pub pool: String,
    /// Device name, unique within its pool.
    pub device: String,
}

impl DeviceKey {
    /// Builds a key from its three components.
    pub fn new(driver: impl Into<String>, pool: impl Into<String>, device: impl Into<String>) -> Self {
        DeviceKey {
            driver: driver.into(),
            pool: pool.into(),
            device: device.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.driver, self.pool, self.device)
    }
}

/// A single typed device attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean attribute.
    Bool(bool),
    /// Integer attribute.
    Int(i64),
    /// String attribute.
    String(String),
}

impl AttributeValue {
    /// The string payload, if this is a string attribute.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The integer payload, if this is an integer attribute.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The boolean payload, if this is a boolean attribute.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Int(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

/// Unit of a capacity value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityUnit {
    /// A plain count of indivisible items.
    #[serde(rename = "count")]
    Count,
    /// Mebibytes of device memory.
    #[serde(rename = "MiB")]
    MiB,
    /// A percentage share of the whole device.
    #[serde(rename = "percent")]
    Percent,
}

/// Unit of a shared counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterUnit {
    /// A plain count of indivisible items.
    #[serde(rename = "count")]
    Count,
    /// Mebibytes of device memory.
    #[serde(rename = "MiB")]
    MiB,
}

/// Constrains how much of a capacity a single allocation may consume.
///
/// A requester that omits the capacity consumes `default`. A requested
/// amount below `min` is bumped to `min`, then rounded up to the next
/// multiple of `step` above `min`. Exceeding `max` disqualifies the device
/// for that request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityPolicy {
    /// Amount consumed when the requester does not name this capacity.
    pub default: i64,
    /// Smallest amount a single allocation may consume.
    pub min: i64,
    /// Largest amount a single allocation may consume.
    pub max: i64,
    /// Granularity of consumption above `min`. Zero means no rounding.
    pub step: i64,
    /// Unit the policy is expressed in; must match the capacity's unit.
    pub unit: CapacityUnit,
}

impl CapacityPolicy {
    /// Checks the internal invariants: `min <= default <= max`, `step >= 0`.
    pub fn validate(&self) -> Result<(), AllocationError> {
        if self.min > self.default || self.default > self.max {
            return Err(AllocationError::Validation(format!(
                "capacity policy requires min <= default <= max, got min={} default={} max={}",
                self.min, self.default, self.max
            )));
        }
        if self.step < 0 {
            return Err(AllocationError::Validation(format!(
                "capacity policy step must not be negative, got {}",
                self.step
            )));
        }
        Ok(())
    }
}

/// A named quantity a device offers, optionally governed by a policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapacityValue {
    /// Total amount the device offers.
    pub amount: i64,
    /// Unit of `amount`.
    pub unit: CapacityUnit,
    /// Consumption policy; absent means all-or-nothing consumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<CapacityPolicy>,
}

impl CapacityValue {
    /// Checks `amount >= 0` and the embedded policy's invariants.
    pub fn validate(&self) -> Result<(), AllocationError> {
        if self.amount < 0 {
            return Err(AllocationError::Validation(format!(
                "capacity amount must not be negative, got {}",
                self.amount
            )));
        }
        if let Some(policy) = &self.policy {
            policy.validate()?;
            if policy.unit != self.unit {
                return Err(AllocationError::Validation(format!(
                    "capacity policy unit {:?} does not match capacity unit {:?}",
                    policy.unit, self.unit
                )));
            }
        }
        Ok(())
    }
}

/// An integer-valued counter inside a [`CounterSet`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterValue {
    /// Amount available, or consumed by one allocation.
    pub amount: i64,
    /// Unit of `amount`.
    pub unit: CounterUnit,
}

/// A node-global named budget of counters, shared across every device that
/// declares consumption against it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterSet {
    /// Name the set is referenced by.
    pub name: String,
    /// Counters keyed by counter name.
    pub counters: BTreeMap<String, CounterValue>,
}

/// What a device takes out of one counter set when it is allocated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterConsumption {
    /// Name of the counter set consumed from.
    pub counter_set: String,
    /// Amount consumed per counter name.
    pub counters: BTreeMap<String, CounterValue>,
}

/// Kind of a candidate device, derived from its [`ATTR_TYPE`] attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// A whole physical GPU.
    Physical,
    /// A MIG partition of a physical GPU.
    Mig,
    /// Anything else; exempt from the physical/MIG exclusion rule.
    Unknown,
}

/// Everything the inventory publishes about one device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSpec {
    /// Device name, unique within its pool.
    pub name: String,
    /// Typed attributes, e.g. `type`, `uuid`, `pciAddress`.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Capacities offered, keyed by capacity name.
    #[serde(default)]
    pub capacity: BTreeMap<String, CapacityValue>,
    /// Shared counters this device consumes when allocated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumes: Vec<CounterConsumption>,
    /// Whether several allocations may share this device.
    #[serde(default)]
    pub allow_multiple_allocations: bool,
    /// Conditions that must become true before binding completes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binding_conditions: Vec<String>,
    /// Conditions that mark binding as failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binding_failure_conditions: Vec<String>,
}

impl DeviceSpec {
    /// A minimal spec with just a name. Handy in tests and builders.
    pub fn named(name: impl Into<String>) -> Self {
        DeviceSpec {
            name: name.into(),
            attributes: BTreeMap::new(),
            capacity: BTreeMap::new(),
            consumes: Vec::new(),
            allow_multiple_allocations: false,
            binding_conditions: Vec::new(),
            binding_failure_conditions: Vec::new(),
        }
    }

    /// The string payload of an attribute, if present and a string.
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(AttributeValue::as_str)
    }

    /// The device kind per the `type` attribute.
    pub fn kind(&self) -> DeviceKind {
        match self.attr_str(ATTR_TYPE) {
            Some(DEVICE_TYPE_GPU) => DeviceKind::Physical,
            Some(DEVICE_TYPE_MIG) => DeviceKind::Mig,
            _ => DeviceKind::Unknown,
        }
    }

    /// The PCI address attribute.
    pub fn pci_address(&self) -> Option<&str> {
        self.attr_str(ATTR_PCI_ADDRESS)
    }

    /// The canonical device UUID attribute.
    pub fn uuid(&self) -> Option<&str> {
        self.attr_str(ATTR_UUID)
    }

    /// The physical parent UUID of a MIG partition.
    pub fn parent_uuid(&self) -> Option<&str> {
        self.attr_str(ATTR_PARENT_UUID)
    }
}

/// A device from a valid pool generation, eligible for allocation on a
/// resolved node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateDevice {
    /// Identity of the device within the snapshot.
    pub key: DeviceKey,
    /// Node the device is usable on.
    pub node: String,
    /// Published device spec.
    pub spec: DeviceSpec,
}

/// What a prior allocation took from a device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocatedDeviceInfo {
    /// Whether the device was taken whole.
    pub exclusive: bool,
    /// Consumed amounts per capacity name, when the allocation was shared.
    #[serde(default)]
    pub consumed: BTreeMap<String, i64>,
}

/// One device granted to a request in an [`AllocationResult`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedDevice {
    /// Name of the request this device satisfies.
    pub request: String,
    /// Driver the device belongs to.
    pub driver: String,
    /// Pool the device belongs to.
    pub pool: String,
    /// Device name within the pool.
    pub device: String,
    /// Consumed amounts per capacity name; empty for devices with no
    /// declared capacities.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumed_capacity: BTreeMap<String, i64>,
    /// Identifier of the shared slot, minted per shared allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_id: Option<String>,
    /// Binding conditions copied from the device spec.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binding_conditions: Vec<String>,
    /// Binding failure conditions copied from the device spec.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binding_failure_conditions: Vec<String>,
}

impl AllocatedDevice {
    /// The key of the allocated device.
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&*self.driver, &*self.pool, &*self.device)
    }
}

/// The outcome of a successful allocation: all devices live on `node` and
/// the node selector pins the claim there.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    /// Node every allocated device lives on.
    pub node: String,
    /// Devices granted, in request order.
    pub devices: Vec<AllocatedDevice>,
    /// Selector binding the result to `node`.
    pub node_selector: NodeSelector,
}

impl AllocationResult {
    /// Builds a result pinned to the given node.
    pub fn new(node: impl Into<String>, devices: Vec<AllocatedDevice>) -> Self {
        let node = node.into();
        let node_selector = node_selector_for(&node);
        AllocationResult {
            node,
            devices,
            node_selector,
        }
    }
}

/// A `kubernetes.io/hostname in [node]` selector.
pub fn node_selector_for(node: &str) -> NodeSelector {
    NodeSelector {
        node_selector_terms: vec![NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: HOSTNAME_LABEL.to_string(),
                operator: "In".to_string(),
                values: Some(vec![node.to_string()]),
            }]),
            ..Default::default()
        }],
    }
}
