//! Cooperative cancellation.
//!
//! External interruption (Ctrl-C, SIGTERM) never kills work mid-write:
//! an in-flight LLM call finishes under its own timeout, the stage
//! stops at the next claim/paper/batch boundary, a consistent
//! checkpoint is written, and the process exits 130. Components poll
//! [`CancellationToken::is_cancelled`] at their boundaries; nothing
//! else yields.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared cancellation flag handed to every stage.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("cancellation requested; stopping at the next safe boundary");
        }
    }

    /// Polled at claim/paper/batch boundaries.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Install SIGINT/SIGTERM handlers that flip the token. Returns the
/// token; the listener task lives for the rest of the process.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let for_task = token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                    if ctrl_c.await.is_ok() {
                        for_task.cancel();
                    }
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => for_task.cancel(),
                _ = sigterm.recv() => for_task.cancel(),
            }
        }

        #[cfg(not(unix))]
        {
            if ctrl_c.await.is_ok() {
                for_task.cancel();
            }
        }
    });
    token
}
