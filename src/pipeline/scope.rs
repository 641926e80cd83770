use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A cancellation scope: a token inherited from the run plus an optional deadline.
///
/// Child scopes are cancelled with their parent and never outlive the parent's
/// deadline.
#[derive(Debug, Clone)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

/// Returned by [`Scope::run`] when the scope expires before the future completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired;

impl std::fmt::Display for Expired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope expired")
    }
}

impl std::error::Error for Expired {}

impl Scope {
    pub fn root(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A child scope bounded by `timeout` from now and by this scope's own lifetime.
    ///
    /// A timeout too far out to represent leaves only the parent's deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(parent), Some(candidate)) => Some(parent.min(candidate)),
            (parent, None) => parent,
            (None, candidate) => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the token is cancelled or the deadline passes.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Run `fut` until it completes or the scope expires, whichever is first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Expired> {
        if self.is_expired() {
            return Err(Expired);
        }
        tokio::select! {
            output = fut => Ok(output),
            _ = self.expired() => Err(Expired),
        }
    }

    /// Sleep for `duration`, returning early (with `Err`) if the scope expires.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Expired> {
        self.run(tokio::time::sleep(duration)).await
    }
}
