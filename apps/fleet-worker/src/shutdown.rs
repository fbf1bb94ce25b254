//! Signal-driven shutdown trigger.

use std::io;

use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels `shutdown` on the first SIGINT or SIGTERM.
///
/// Handlers are installed before this returns, so a signal delivered right
/// after startup is never lost to the default disposition.
pub fn listen(shutdown: CancellationToken) -> io::Result<JoinHandle<()>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
            _ = shutdown.cancelled() => return,
        };
        info!(signal = name, "shutdown requested");
        shutdown.cancel();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sigterm_cancels_the_token() {
        let token = CancellationToken::new();
        let task = listen(token.clone()).unwrap();

        // SAFETY: signalling our own pid; the handler above is installed.
        let rc = unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
        assert_eq!(rc, 0);

        token.cancelled().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn listener_exits_when_shutdown_starts_elsewhere() {
        let token = CancellationToken::new();
        let task = listen(token.clone()).unwrap();
        token.cancel();
        task.await.unwrap();
    }
}
