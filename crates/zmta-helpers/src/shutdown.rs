use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Resolves once SIGTERM or SIGINT arrives and returns the signal name.
#[cfg(unix)]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(err), _) | (_, Err(err)) => {
                warn!("failed to install unix signal handlers: error={err}");
                return ctrl_c_or_pending().await;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> &'static str {
    ctrl_c_or_pending().await
}

/// Cancels `token` on the first shutdown signal, or returns early if some
/// other task cancelled it first.
pub async fn listen_shutdown(token: CancellationToken) {
    tokio::select! {
        _ = token.cancelled() => {}
        name = wait_for_signal() => {
            warn!("shutdown signal received: {name}");
            token.cancel();
        }
    }
}

async fn ctrl_c_or_pending() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "SIGINT",
        Err(err) => {
            warn!("failed to listen for ctrl-c: error={err}");
            std::future::pending().await
        }
    }
}
