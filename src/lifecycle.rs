//! System lifecycle state machine.
//!
//! stopped -> starting -> running -> stopping -> stopped, all transitions
//! under one lock. `start` is idempotent while running; `shutdown` is
//! idempotent everywhere and always lands on stopped, even when individual
//! cleanup tasks fail.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Stopped => "stopped",
            SystemState::Starting => "starting",
            SystemState::Running => "running",
            SystemState::Stopping => "stopping",
        }
    }
}

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Cleanup {
    name: &'static str,
    run: CleanupFn,
}

pub struct Lifecycle {
    state: Mutex<SystemState>,
    cleanups: Mutex<Vec<Cleanup>>,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SystemState::Stopped),
            cleanups: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> SystemState {
        *self.state.lock()
    }

    /// Register a cleanup task executed (once) during shutdown, in
    /// registration order.
    pub fn register_cleanup<F>(&self, name: &'static str, cleanup: F)
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        self.cleanups.lock().push(Cleanup {
            name,
            run: Box::new(cleanup),
        });
    }

    /// Transition stopped -> starting. Idempotent when already running.
    /// Returns false when startup should be skipped.
    pub fn begin_start(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            SystemState::Stopped => {
                *state = SystemState::Starting;
                info!("lifecycle: starting");
                true
            }
            SystemState::Running | SystemState::Starting => false,
            SystemState::Stopping => false,
        }
    }

    /// Transition starting -> running.
    pub fn mark_running(&self) {
        let mut state = self.state.lock();
        if *state == SystemState::Starting {
            *state = SystemState::Running;
            info!("lifecycle: running");
        }
    }

    /// Drive to stopped from any state. Each cleanup runs with its own
    /// error isolation; the final state is stopped no matter what.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == SystemState::Stopped {
                // Idempotent: a second shutdown is a no-op.
                return;
            }
            *state = SystemState::Stopping;
            info!("lifecycle: stopping");
        }

        // Guard plays the role of a finally clause: stopped is guaranteed
        // even if a cleanup future panics.
        struct StopGuard<'a>(&'a Lifecycle);
        impl Drop for StopGuard<'_> {
            fn drop(&mut self) {
                *self.0.state.lock() = SystemState::Stopped;
                info!("lifecycle: stopped");
            }
        }
        let _guard = StopGuard(self);

        let cleanups: Vec<Cleanup> = std::mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups {
            match (cleanup.run)().await {
                Ok(()) => {}
                Err(err) => {
                    // Isolated: one failed cleanup never blocks the rest.
                    error!(task = cleanup.name, %err, "cleanup failed");
                }
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: Mutex::new(SystemState::Stopped),
            cleanups: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn start_is_idempotent_when_running() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_start());
        lifecycle.mark_running();
        assert_eq!(lifecycle.state(), SystemState::Running);
        assert!(!lifecycle.begin_start());
        assert_eq!(lifecycle.state(), SystemState::Running);
    }

    #[tokio::test]
    async fn shutdown_runs_cleanups_in_order_and_stops() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_start();
        lifecycle.mark_running();

        let order = Arc::new(Mutex::new(Vec::new()));
        for (i, name) in [(1u32, "first"), (2, "second")] {
            let order = order.clone();
            lifecycle.register_cleanup(name, move || {
                Box::pin(async move {
                    order.lock().push(i);
                    Ok(())
                })
            });
        }

        lifecycle.shutdown().await;
        assert_eq!(lifecycle.state(), SystemState::Stopped);
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn failed_cleanup_does_not_block_others_or_stop() {
        let lifecycle = Lifecycle::new();
        lifecycle.begin_start();
        lifecycle.mark_running();

        let ran = Arc::new(AtomicU32::new(0));
        lifecycle.register_cleanup("fails", || {
            Box::pin(async { anyhow::bail!("cleanup exploded") })
        });
        {
            let ran = ran.clone();
            lifecycle.register_cleanup("succeeds", move || {
                Box::pin(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
        }

        lifecycle.shutdown().await;
        assert_eq!(lifecycle.state(), SystemState::Stopped);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_from_any_state() {
        let lifecycle = Lifecycle::new();
        // Never started: already stopped, still fine.
        lifecycle.shutdown().await;
        assert_eq!(lifecycle.state(), SystemState::Stopped);

        lifecycle.begin_start();
        lifecycle.shutdown().await;
        assert_eq!(lifecycle.state(), SystemState::Stopped);
        lifecycle.shutdown().await;
        assert_eq!(lifecycle.state(), SystemState::Stopped);
    }
}
