//! Errors surfaced by the allocation core.
//!
//! "Not enough devices" is never an error: the allocator signals it by
//! returning `Ok(None)`. Only malformed input and selector evaluation
//! failures surface to the caller.

use thiserror::Error;

use crate::selector::SelectorError;

/// An error produced while allocating devices for a claim.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// The input was malformed: empty or duplicate request names, a zero
    /// device count, a capacity value violating its own policy, and the
    /// like. These indicate a bug in the caller, not scarcity.
    #[error("invalid allocation input: {0}")]
    Validation(String),

    /// A device selector failed to compile or evaluate.
    #[error(transparent)]
    Selector(#[from] SelectorError),
}
