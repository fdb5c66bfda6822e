use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Returns a token cancelled on the first SIGINT, SIGTERM or SIGQUIT. A second signal exits
/// the process with status 1.
pub(crate) fn shutdown_token() -> io::Result<CancellationToken> {
    let mut signals = Signals {
        interrupt: signal(SignalKind::interrupt())?,
        terminate: signal(SignalKind::terminate())?,
        quit: signal(SignalKind::quit())?,
    };

    let token = CancellationToken::new();
    let shutdown = token.clone();

    tokio::spawn(async move {
        let name = signals.next().await;
        info!(signal = name, "shutting down gracefully, signal again to force exit");
        shutdown.cancel();

        let name = signals.next().await;
        error!(signal = name, "forcing exit");
        std::process::exit(1);
    });

    Ok(token)
}

struct Signals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

impl Signals {
    async fn next(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}
