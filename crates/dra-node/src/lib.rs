//! Node-side core of a Kubernetes GPU DRA driver.
//!
//! Once the scheduler has bound a claim to this node, this crate makes the
//! chosen hardware real: the [`prepare::PrepareService`] drives a linear
//! pipeline of idempotent steps (config resolution, MIG partitioning, VFIO
//! binding, time-slicing, MPS, health probing, CDI emission), serialized by
//! the [`flock::FileLocker`] and recorded in the [`checkpoint`] store so
//! repeated invocations converge. The [`driver::NodeDriver`] façade is what
//! the enclosing kubelet-plugin endpoint calls.
//!
//! Hardware is only ever touched through the [`adapters`] contracts; any
//! implementation honoring those contracts plugs in.

pub mod adapters;
pub mod cdi;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod error;
pub mod flock;
mod fsutil;
pub mod prepare;

pub use checkpoint::{CheckpointError, CheckpointStore, FsCheckpointStore};
pub use driver::NodeDriver;
pub use error::PrepareError;
pub use flock::FileLocker;
pub use prepare::{PrepareOutcome, PrepareRequest, PrepareService, PreparedClaim};
