//! Cancellable, deadline-bound context threaded through external calls
use crate::error::{MemoryError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    budget: Option<Duration>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            budget: None,
        }
    }

    /// Context driven by an existing token, e.g. a service shutdown token
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            budget: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().child_with_timeout(timeout)
    }

    /// Child context cancelled together with `self`
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            budget: self.budget,
        }
    }

    /// Child whose deadline is the earlier of the parent's and `timeout` from now
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let (deadline, budget) = match self.deadline {
            Some(existing) if existing <= candidate => (existing, self.budget.unwrap_or(timeout)),
            _ => (candidate, timeout),
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
            budget: Some(budget),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast when the context is already done
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MemoryError::DeadlineExceeded(self.budget.unwrap_or_default()));
            }
        }
        Ok(())
    }

    /// Drive `fut` until it finishes, the context is cancelled, or the deadline passes
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = self.deadline;
        let sleep = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(MemoryError::Cancelled),
            _ = sleep => Err(MemoryError::DeadlineExceeded(self.budget.unwrap_or_default())),
            result = fut => result,
        }
    }
}
