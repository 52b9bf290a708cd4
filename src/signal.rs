use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;

/// Installs the shutdown signal handler and returns the root token every
/// stage watches.
pub fn setup_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            let mut sighup =
                signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
            let mut sigquit =
                signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

            tokio::select! {
                _ = ctrl_c() => {
                    tracing::info!("received shutdown signal (Ctrl-C / SIGINT)");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received shutdown signal (SIGTERM)");
                }
                _ = sighup.recv() => {
                    tracing::info!("received shutdown signal (SIGHUP)");
                }
                _ = sigquit.recv() => {
                    tracing::info!("received shutdown signal (SIGQUIT)");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c().await.ok();
            tracing::info!("received shutdown signal (Ctrl-C)");
        }

        trigger.cancel();
    });

    cancel
}
