//! Ambient cancellation scope threaded through every suspension point.
//!
//! Every operation that can block — subprocess execution, file writes —
//! accepts a cancellation signal bounded by a deadline: git subprocesses,
//! init commands and chunked file writes all race their work against a
//! [`Scope`]'s token.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A cancellation token plus the deadline currently in effect.
///
/// Cloning is cheap and shares the same underlying token tree: cancelling a
/// parent scope cancels every scope derived from it via
/// [`Scope::with_timeout`].
#[derive(Debug, Clone)]
pub struct Scope {
    token: CancellationToken,
}

impl Scope {
    /// A fresh root scope, cancelled only by an explicit [`Scope::cancel`]
    /// call (wired to SIGINT at the top of `main`).
    pub fn root() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Derive a child scope bounded by `secs` seconds in addition to
    /// whatever cancellation the parent already carries. `secs == 0` means
    /// "no additional deadline" (the caller relies on the parent alone).
    pub fn with_timeout(&self, secs: u64) -> Self {
        let child = self.token.child_token();
        if secs > 0 {
            let token = child.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => token.cancel(),
                    _ = token.cancelled() => {}
                }
            });
        }
        Self { token: child }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_scope_inherits_parent_cancellation() {
        let parent = Scope::root();
        let child = parent.with_timeout(0);
        assert!(!child.is_cancelled());
        parent.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn timeout_cancels_child_only() {
        let parent = Scope::root();
        let child = parent.with_timeout(1);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
