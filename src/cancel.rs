//! Cooperative cancellation shared by an operation and its reader threads.
//!
//! A [`CancelToken`] is cheap to clone. Children observe their parent's
//! cancellation, never the other way around, so an exchange can stop its own
//! reader without cancelling the caller's operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::OneRngError;

/// Granularity of cancellable waits.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Node {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Arc<Node>>,
}

/// Cancellation signal with optional deadline, derived from an optional parent.
#[derive(Clone)]
pub struct CancelToken {
    node: Arc<Node>,
}

impl CancelToken {
    /// A root token that only fires when [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::with_parts(None, None)
    }

    /// Derive a token that fires when either it or `self` is cancelled.
    pub fn child(&self) -> Self {
        Self::with_parts(Some(self.node.clone()), None)
    }

    /// Derive a token that additionally expires after `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self::with_parts(Some(self.node.clone()), Some(Instant::now() + timeout))
    }

    fn with_parts(parent: Option<Arc<Node>>, deadline: Option<Instant>) -> Self {
        Self {
            node: Arc::new(Node {
                cancelled: AtomicBool::new(false),
                deadline,
                parent,
            }),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.node.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether this token or any ancestor has fired or expired.
    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// `Ok(())` while live, otherwise the reason the token fired.
    pub fn check(&self) -> Result<(), OneRngError> {
        let now = Instant::now();
        let mut node = Some(&self.node);
        while let Some(n) = node {
            if n.cancelled.load(Ordering::SeqCst) {
                return Err(OneRngError::Cancelled);
            }
            if n.deadline.is_some_and(|d| now >= d) {
                return Err(OneRngError::DeadlineExceeded);
            }
            node = n.parent.as_ref();
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early with an error if the token fires.
    pub fn sleep(&self, duration: Duration) -> Result<(), OneRngError> {
        let end = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            std::thread::sleep((end - now).min(POLL_INTERVAL));
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
