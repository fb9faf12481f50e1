use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{DeliveryOutcome, TideTransportError};

/// One generation of in-flight sends.
///
/// Every send task runs inside the scope current at the time it was issued.
/// `stop()` and `purge()` close that scope, which resolves each outstanding
/// send to `Error` instead of letting it hang, then install a fresh one.
#[derive(Debug, Default)]
pub(crate) struct SendScope {
    token: CancellationToken,
    purged: AtomicBool,
}

impl SendScope {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cancel every send of this generation. `purged` picks the cause
    /// reported to them.
    pub fn close(&self, purged: bool) {
        if purged {
            self.purged.store(true, Ordering::Release);
        }
        self.token.cancel();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drive `send` to completion unless the scope closes first.
    pub async fn run<F>(&self, send: F) -> DeliveryOutcome
    where
        F: Future<Output = DeliveryOutcome>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => self.closed_outcome(),
            outcome = send => outcome,
        }
    }

    fn closed_outcome(&self) -> DeliveryOutcome {
        if self.purged.load(Ordering::Acquire) {
            DeliveryOutcome::error(TideTransportError::Purged)
        } else {
            DeliveryOutcome::error(TideTransportError::Shutdown)
        }
    }
}
