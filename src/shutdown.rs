//! Graceful shutdown coordinator.
//!
//! Listens for SIGINT (Ctrl+C), SIGTERM, and SIGHUP, then cancels a
//! [`tokio_util::sync::CancellationToken`] so the playback loop can quit
//! the renderer and flush persisted state before exiting. A second signal
//! force-exits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Install signal handlers and return a token cancelled on the first
/// SIGINT / SIGTERM / SIGHUP. A second signal exits immediately without
/// waiting for the renderer to shut down.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let signals_seen = Arc::new(AtomicU32::new(0));

    let handler_token = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let (mut sigterm, mut sighup) = {
            use tokio::signal::unix::{signal, SignalKind};
            (
                signal(SignalKind::terminate()).expect("failed to register SIGTERM handler"),
                signal(SignalKind::hangup()).expect("failed to register SIGHUP handler"),
            )
        };

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
                _ = sighup.recv() => {}
            }

            #[cfg(not(unix))]
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for Ctrl+C");

            if signals_seen.fetch_add(1, Ordering::SeqCst) == 0 {
                tracing::info!("Shutdown signal received, stopping playback...");
                handler_token.cancel();
            } else {
                tracing::warn!("Second signal, force exit");
                std::process::exit(130);
            }
        }
    });

    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_tokens_observe_parent_cancel() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    /// Signal delivery can't be exercised safely in a shared test binary;
    /// just verify installation yields a live token.
    #[tokio::test]
    async fn install_returns_live_token() {
        let token = install_signal_handler();
        assert!(!token.is_cancelled());
    }
}
