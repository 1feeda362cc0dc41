//! Cooperative cancellation token threaded through every suspension point.
//!
//! Modelled as an explicit flag polled at await points rather than raising
//! exceptions across task boundaries, matching the worker's "abort
//! controller" design: external STOP, loss of claim ownership, and engine
//! timeouts all converge on the same [`AbortController`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Owned by whatever drives an execution (the worker); `abort()` is called
/// from the heartbeat loop on claim loss, from command handling on STOP,
/// and from the engine on timeout.
#[derive(Debug, Clone)]
pub struct AbortController {
    aborted: Arc<AtomicBool>,
    reason: Arc<parking_lot::Mutex<Option<String>>>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            aborted: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn abort(&self, reason: impl Into<String>) {
        *self.reason.lock() = Some(reason.into());
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// A cloneable handle an engine or node implementation can hold without
    /// being able to read the abort reason — only signal it.
    pub fn handle(&self) -> AbortHandle {
        AbortHandle { aborted: self.aborted.clone() }
    }

    /// Resolves once aborted. Poll interval is bounded so cancellation is
    /// observed within a small, predictable window at every suspension point.
    pub async fn cancelled(&self) {
        const POLL_INTERVAL: Duration = Duration::from_millis(50);
        loop {
            if self.is_aborted() {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// A handle that can only signal cancellation, not read the reason — given
/// to engine/node code so it can short-circuit without owning the
/// controller's state.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}
