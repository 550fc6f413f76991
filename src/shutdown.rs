use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Call `callback` once, on the first SIGTERM or SIGINT.
///
/// The callback receives the signal name. Signal handlers are installed
/// before this returns, so a signal arriving right after is not lost.
pub fn on_termination<F>(callback: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce(&'static str) + Send + 'static,
{
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = name, "Received termination signal");
        callback(name);
    }))
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();
    on_termination(move |_| token_clone.cancel())?;
    Ok(token)
}
