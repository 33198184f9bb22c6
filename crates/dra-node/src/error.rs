//! Errors surfaced by the node-side prepare pipeline.

use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// An error produced while preparing or unpreparing a claim.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// The request was malformed. Not retryable; the caller built it wrong.
    #[error("invalid prepare request: {0}")]
    Validation(String),

    /// A pipeline step failed against an adapter. Retryable: the kubelet is
    /// expected to call prepare again.
    #[error("step {step}: {source}")]
    Recoverable {
        /// Name of the failing step.
        step: &'static str,
        /// Underlying failure, with device identifiers attached.
        #[source]
        source: anyhow::Error,
    },

    /// The checkpoint store failed. Treated like an adapter failure; a
    /// corrupt checkpoint is never silently discarded.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The caller's context was cancelled. Propagated unchanged.
    #[error("operation cancelled")]
    Cancelled,
}

impl PrepareError {
    /// Wraps a step failure with the step's name.
    pub fn recoverable(step: &'static str, source: anyhow::Error) -> Self {
        PrepareError::Recoverable { step, source }
    }

    /// Whether the kubelet should retry the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PrepareError::Recoverable { .. } | PrepareError::Checkpoint(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors_carry_the_step_name() {
        let err = PrepareError::recoverable("mig", anyhow::anyhow!("device mig-0: nvml timeout"));
        assert!(err.is_recoverable());
        let message = err.to_string();
        assert!(message.contains("step mig"));
        assert!(message.contains("nvml timeout"));
    }

    #[test]
    fn validation_and_cancellation_are_not_retryable() {
        assert!(!PrepareError::Validation("empty claim uid".into()).is_recoverable());
        assert!(!PrepareError::Cancelled.is_recoverable());
    }
}
