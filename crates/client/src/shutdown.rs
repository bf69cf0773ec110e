use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Spawns SIGINT/SIGTERM listeners that clear `alive` on the first signal of either kind.
/// The in-flight job is allowed to finish; there is no forced-exit escalation.
pub fn spawn_signal_handlers(alive: Arc<AtomicBool>) {
    let sigint_alive = alive.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, shutting down after the current job");
            sigint_alive.store(false, Ordering::SeqCst);
        }
    });

    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
                tracing::info!("received SIGTERM, shutting down after the current job");
                alive.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
            }
        }
    });
}
