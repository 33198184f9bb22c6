//! Scheduler-side core of a Kubernetes GPU DRA driver.
//!
//! This crate owns everything that happens before a claim lands on a node:
//! the device model shared with the node agent, the capacity and counter
//! arithmetic, the resource-slice inventory filter that turns raw pool
//! publications into allocatable candidates, CEL-backed device selectors,
//! and the deterministic [`allocator::Allocator`] that binds a claim's
//! requests to concrete devices on a single node.
//!
//! The allocator is pure: it reads an [`allocator::AllocationInput`]
//! snapshot and either produces an [`device::AllocationResult`] or decides
//! that no node can satisfy the claim. It holds no state of its own and may
//! be invoked concurrently on disjoint inputs.

pub mod allocator;
pub mod context;
pub mod device;
pub mod error;
pub mod inventory;
pub mod selector;

pub use allocator::{AllocationInput, Allocator, Request};
pub use context::OpContext;
pub use error::AllocationError;
