//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM cancel a [`ShutdownToken`] shared by the controller
//! daemon and the helper's accept loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{info, warn};

struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

/// A token that can be shared across tasks to request and await shutdown.
#[derive(Clone)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Request cancellation on this token and every clone of it.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // registered before the flag check so a concurrent cancel is not missed
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Listens for SIGINT/SIGTERM and cancels the token when one arrives.
pub struct ShutdownGuard {
    token: ShutdownToken,
}

impl ShutdownGuard {
    /// Start listening for signals.
    ///
    /// If signal handlers cannot be registered the guard is still created,
    /// but only an explicit `cancel()` stops the daemon.
    pub fn install(token: ShutdownToken) -> Self {
        let signalled = token.clone();

        tokio::spawn(async move {
            let sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGINT handler: {}", e);
                    None
                }
            };

            let sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {}", e);
                    None
                }
            };

            match (sigint, sigterm) {
                (Some(mut int), Some(mut term)) => {
                    tokio::select! {
                        _ = int.recv() => info!("Received SIGINT, shutting down..."),
                        _ = term.recv() => info!("Received SIGTERM, shutting down..."),
                    }
                }
                (Some(mut int), None) => {
                    int.recv().await;
                    info!("Received SIGINT, shutting down...");
                }
                (None, Some(mut term)) => {
                    term.recv().await;
                    info!("Received SIGTERM, shutting down...");
                }
                (None, None) => {
                    warn!("No signal handlers registered - graceful shutdown disabled");
                    return;
                }
            }

            signalled.cancel();
        });

        Self { token }
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }
}
