use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal cuts the drain short.
const FORCED_EXIT_CODE: i32 = 130;

/// Cancel the returned token on the first SIGTERM or SIGINT.
///
/// The control loops stop at their next tick and queued submissions are
/// allowed to finish. A second signal exits immediately.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        let mut received = 0u32;
        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            received += 1;
            if received == 1 {
                tracing::info!(signal = name, "Stopping control loops, waiting for queued submissions");
                trigger.cancel();
            } else {
                tracing::warn!(signal = name, "Second signal, exiting without draining");
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    });

    token
}
