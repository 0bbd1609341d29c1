//! Two stage shutdown: the first signal cancels the relayer, a second one or an expired grace
//! period forces the process to exit.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long the relayer may take to stop after the first signal.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Why the shutdown was forced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForcedExit {
    /// A second signal was received.
    SecondSignal(&'static str),
    /// The grace period elapsed.
    TimedOut,
}

/// Forward SIGINT and SIGTERM to the returned channel.
///
/// # Errors
/// Returns an error if the signal handlers cannot be installed.
pub fn install_signal_handlers() -> Result<mpsc::UnboundedReceiver<&'static str>> {
    let (tx, rx) = mpsc::unbounded_channel();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => "SIGINT",
                        Err(_) => break,
                    },
                    received = sigterm.recv() => match received {
                        Some(()) => "SIGTERM",
                        None => break,
                    },
                };
                if tx.send(name).is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send("ctrl-c").is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

/// Cancel `cancel` on the first signal, then wait for a second signal or for `grace` to
/// elapse.
///
/// Returns `None` if `cancel` fired without a signal, e.g. because the relayer stopped on its
/// own.
pub async fn supervise(
    cancel: CancellationToken,
    grace: Duration,
    mut signals: mpsc::UnboundedReceiver<&'static str>,
) -> Option<ForcedExit> {
    let signal = tokio::select! {
        () = cancel.cancelled() => return None,
        signal = signals.recv() => signal?,
    };

    tracing::info!(signal, "Shutting down, waiting for running tasks to finish");
    cancel.cancel();

    tokio::select! {
        second = signals.recv() => second.map(ForcedExit::SecondSignal),
        () = tokio::time::sleep(grace) => Some(ForcedExit::TimedOut),
    }
}

/// Supervise the shutdown in the background, exiting the process with status 1 when it is
/// forced.
///
/// # Errors
/// Returns an error if the signal handlers cannot be installed.
pub fn spawn_shutdown_handler(cancel: CancellationToken) -> Result<()> {
    let signals = install_signal_handlers()?;
    tokio::spawn(async move {
        match supervise(cancel, SHUTDOWN_GRACE_PERIOD, signals).await {
            Some(ForcedExit::SecondSignal(signal)) => {
                tracing::error!(signal, "Received a second signal, exiting immediately");
                std::process::exit(1);
            }
            Some(ForcedExit::TimedOut) => {
                tracing::error!(
                    grace_period = ?SHUTDOWN_GRACE_PERIOD,
                    "Running tasks did not finish in time, exiting"
                );
                std::process::exit(1);
            }
            None => {}
        }
    });
    Ok(())
}
