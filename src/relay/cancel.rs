//! External cancellation for a running call.
//!
//! The telephony adapter holds the `CallCanceller`; the orchestrator and its
//! ingress task hold `CancelSignal` clones. Cancelling is sticky: a signal
//! cloned after `cancel()` still reports cancelled.

use tokio::sync::watch;

/// Create a linked canceller/signal pair.
pub fn cancel_pair() -> (CallCanceller, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CallCanceller { tx }, CancelSignal { rx })
}

/// Requests cancellation of one call.
#[derive(Debug)]
pub struct CallCanceller {
    tx: watch::Sender<bool>,
}

impl CallCanceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Another signal observing this canceller.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes cancellation of one call.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the call is cancelled.
    ///
    /// If the canceller is dropped without cancelling, this never resolves.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
