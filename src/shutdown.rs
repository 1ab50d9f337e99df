//! Cooperative shutdown propagation.
//!
//! One `ShutdownToken` is threaded through every suspending operation.
//! Blocking calls race against `cancelled()` and unwind with
//! `PipelineError::Cancelled`, which callers must re-raise rather than
//! absorb.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

/// Create a linked (handle, token) pair. Clone the token freely; trigger
/// through the single handle.
pub fn shutdown_pair() -> (ShutdownHandle, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownToken { rx })
}

impl ShutdownHandle {
    /// Signal shutdown to every token clone. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is signalled. Safe to call repeatedly.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without triggering; treat as shutdown so
                // waiters are never stranded.
                return;
            }
        }
    }

    /// A token that never fires, for tests and standalone tools.
    pub fn detached() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open for the process
        // lifetime; detached tokens are constructed a handful of times.
        std::mem::forget(tx);
        ShutdownToken { rx }
    }
}
