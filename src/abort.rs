//! One-way crawl abort signal.
//!
//! Any hook may ask the run to stop. The first reason wins and is the one logged;
//! later calls are no-ops. The engine watches [`AbortSignal::cancelled`] and stops
//! scheduling new requests while draining the ones in flight.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Why a run was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Every proxy has been evicted.
    NoProxyCapacity,
    /// No item was produced inside the idle window.
    NoItemScraped,
    /// A store stayed unreachable after its reconnect attempt.
    StoreUnavailable(String),
    /// Stopped by the operator or the embedding engine.
    Requested(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::NoProxyCapacity => write!(f, "proxy list empty"),
            AbortReason::NoItemScraped => write!(f, "no item scraped"),
            AbortReason::StoreUnavailable(detail) => write!(f, "store unavailable: {}", detail),
            AbortReason::Requested(reason) => write!(f, "{}", reason),
        }
    }
}

/// Cloneable handle shared by every component of one run.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal. Returns `true` only for the call that actually aborted the run.
    pub fn abort(&self, reason: AbortReason) -> bool {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return false;
            }
            error!("Aborting crawl: {}", reason);
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason recorded by the first `abort` call.
    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.lock().clone()
    }

    /// Resolves once the run has been aborted.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
