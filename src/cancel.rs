//! Process-wide cancellation.
//!
//! One [`CancellationSource`] is owned by the task manager. Its token is
//! handed to every scheduler loop and every task body.

use tokio_util::sync::CancellationToken;

use crate::rlog_debug;

/// Owner of the shared cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CancellationSource {
    token: CancellationToken,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token observed by schedulers and task bodies.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled together with this source, but cancellable on its own.
    pub fn child(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Request cancellation of everything sharing this source.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            rlog_debug!("CancellationSource::cancel");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
