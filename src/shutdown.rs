//! Process-wide shutdown signal.
//!
//! A one-shot flag: it starts unset, flips once, and never resets.
//! Observers clone the handle and either poll `is_triggered` or await
//! `triggered`.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Cloneable handle to the one-shot shutdown flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Shutdown { tx: Arc::new(tx) }
    }

    /// Flip the flag. Later calls are no-ops.
    pub fn trigger(&self) {
        self.tx.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        });
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag has been flipped.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Arm the flag on SIGINT or SIGTERM.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm_on_signals(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let shutdown = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!(error = %e, "Failed to listen for interrupt signal");
                            return;
                        }
                        info!("Received interrupt signal");
                    }
                    _ = terminate.recv() => {
                        info!("Received termination signal");
                    }
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for interrupt signal");
                    return;
                }
                info!("Received interrupt signal");
            }

            shutdown.trigger();
        });

        Ok(())
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
