//! Double-signal graceful/forced shutdown (spec.md §6): the first SIGINT or
//! SIGTERM cancels the shared [`CancelToken`] so the scheduler stops
//! consuming results, pools drain, and the sink flushes; a second signal in
//! the same run exits the process immediately, so a hung shutdown chain
//! (a worker stuck on a non-cancelling external call) can't make the
//! process un-killable. Limits the signal-handling surface to this single
//! entry point, per the "Global-mutable signal handler" design note (§9) —
//! everything below reads `CancelToken` alone.

use tracing::{info, warn};

use crate::cancellation::CancelToken;

/// Spawns the signal-watching task. Returns immediately; the task runs for
/// the life of the process.
pub fn install(cancel: CancelToken) {
    tokio::spawn(async move {
        wait_for_first_signal().await;
        info!("received shutdown signal, cancelling");
        cancel.cancel();

        wait_for_first_signal().await;
        warn!("received second shutdown signal, forcing exit");
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn wait_for_first_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_first_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
