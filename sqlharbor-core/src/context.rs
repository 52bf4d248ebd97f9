//! Per-call context: the caller identity resolved by the authorizer, plus a
//! cancellation token and optional deadline honoured by every operation.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::AccessMode;
use crate::error::ServerError;

/// Role and read-only decision supplied by the authorization component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub role: String,
    pub read_only: bool,
}

impl Caller {
    pub fn new(role: impl Into<String>, read_only: bool) -> Self {
        Self {
            role: role.into(),
            read_only,
        }
    }

    pub fn read_write(role: impl Into<String>) -> Self {
        Self::new(role, false)
    }

    pub fn read_only(role: impl Into<String>) -> Self {
        Self::new(role, true)
    }

    pub fn access_mode(&self) -> AccessMode {
        if self.read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallContext {
    caller: Caller,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn access_mode(&self) -> AccessMode {
        self.caller.access_mode()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Child context sharing the caller and deadline; cancelling the parent
    /// cancels the child but not the other way round.
    pub fn child(&self) -> Self {
        Self {
            caller: self.caller.clone(),
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fails fast when the call was cancelled or ran past its deadline.
    pub fn check(&self) -> Result<(), ServerError> {
        if self.is_done() {
            Err(ServerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the call is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}
