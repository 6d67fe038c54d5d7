//! Process-wide shutdown signal

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process-wide shutdown handle.
///
/// Created once at startup and handed to every accept loop and session. Clones
/// share the same state; the transition to "shutting down" happens once and
/// never reverts.
#[derive(Debug, Clone, Default)]
pub struct ShutdownController {
    token: CancellationToken,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the controller to the cancelled state. Repeated calls are no-ops.
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested, closing listeners and sessions");
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Token that fires on shutdown, or earlier if cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// The underlying token, for callers that want to select on it directly.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let shutdown = ShutdownController::new();
        assert!(!shutdown.is_triggered());

        shutdown.trigger();
        shutdown.trigger();

        assert!(shutdown.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), shutdown.cancelled())
            .await
            .expect("cancelled() should resolve after trigger");
    }

    #[tokio::test]
    async fn test_child_token_follows_parent() {
        let shutdown = ShutdownController::new();
        let child = shutdown.child_token();

        shutdown.clone().trigger();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_token_does_not_cancel_parent() {
        let shutdown = ShutdownController::new();
        let child = shutdown.child_token();

        child.cancel();
        assert!(!shutdown.is_triggered());
    }
}
