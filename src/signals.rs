/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) or SIGTERM cancels the running measurement through its
/// cancellation token. A second signal exits the process immediately.
use crate::cancel::CancellationToken;
use tokio::signal::unix::{signal, SignalKind};

pub fn install(token: CancellationToken) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            received += 1;
            if received > 1 {
                tracing::warn!(signal = name, "second signal, exiting");
                std::process::exit(130);
            }
            tracing::info!(signal = name, "stopping measurement");
            token.cancel();
        }
    });
    Ok(())
}
