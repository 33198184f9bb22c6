//! Cancellation and deadline propagation for calls that may block on
//! adapters or the filesystem.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Carries a cancellation token and an optional deadline through a single
/// logical operation (one allocation attempt, one prepare invocation).
///
/// Long-running adapter calls receive a reference to the context and are
/// expected to abort at their next suspension point once it is cancelled.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// Returns a context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Returns a context driven by the given cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        OpContext {
            token,
            deadline: None,
        }
    }

    /// Sets an absolute deadline after which the context reports itself
    /// cancelled.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    /// The underlying cancellation token, for adapters that want to
    /// `select!` against it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns a child context that is cancelled when this one is, but can
    /// also be cancelled independently.
    pub fn child(&self) -> Self {
        OpContext {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Whether the operation should stop: either the token was cancelled or
    /// the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Errors out if the context is cancelled. Checked between pipeline
    /// steps and before lock acquisition.
    pub fn err_if_cancelled(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            Err(anyhow::anyhow!("operation cancelled"))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_cancelled() {
        let ctx = OpContext::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.err_if_cancelled().is_ok());
    }

    #[test]
    fn cancelling_the_token_cancels_the_context() {
        let token = CancellationToken::new();
        let ctx = OpContext::with_token(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.err_if_cancelled().is_err());
    }

    #[test]
    fn elapsed_deadline_cancels_the_context() {
        let ctx = OpContext::background().with_deadline(Instant::now());
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn child_is_cancelled_with_the_parent() {
        let token = CancellationToken::new();
        let ctx = OpContext::with_token(token.clone());
        let child = ctx.child();
        token.cancel();
        assert!(child.is_cancelled());
    }
}
