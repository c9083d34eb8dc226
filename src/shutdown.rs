use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Wire SIGTERM and SIGINT to a `CancellationToken`.
///
/// Every subsystem selects on the returned token and drains when it fires,
/// so a signalled replica finishes in-flight RPCs and exits cleanly.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, shutting down");
            }
        }

        trigger.cancel();
    });

    token
}
