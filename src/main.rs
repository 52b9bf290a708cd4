use ratewatch::config::Config;
use ratewatch::errors::RateError;
use ratewatch::hub::{self, Hub};
use ratewatch::storage::postgres::Postgres;
use ratewatch::storage::Storage;
use ratewatch::{domain, poller, rates, server, signal};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ratewatch: {e}");
            std::process::exit(1);
        }
    };

    // Logs mirror to stdout and to the append-only LOG_FILE.
    let log_file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.log_file)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("ratewatch: open {}: {e}", cfg.log_file.display());
            std::process::exit(1);
        }
    };
    let (log_writer, _log_guard) = tracing_appender::non_blocking(log_file);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(log_writer),
        )
        .init();

    tracing::info!("ratewatch starting");

    let db: Arc<dyn Storage> = match Postgres::connect(&cfg.db_url).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!("storage init error: {e}");
            std::process::exit(1);
        }
    };

    let cancel = signal::setup_signal_handler();

    // BTC pipeline: poll -> decode -> process -> hub.
    let (btc_bodies, btc_poll_errs) =
        poller::poll(cancel.clone(), cfg.btc_url.clone(), cfg.btc_interval);
    let (btc_rates, btc_dec_errs) = domain::decode_stream(btc_bodies, domain::json_dec);
    let (updates, btc_proc_errs) = rates::process_btc(db.clone(), btc_rates);

    // Fiat pipeline: poll -> decode -> persist.
    let (fiat_bodies, fiat_poll_errs) =
        poller::poll(cancel.clone(), cfg.fiat_url.clone(), cfg.fiat_interval);
    let (fiat_rates, fiat_dec_errs) = domain::decode_stream(fiat_bodies, domain::xml_dec);
    let fiat_proc_errs = rates::process_fiats(db.clone(), fiat_rates);

    let errors_task = log_errors(vec![
        btc_poll_errs,
        btc_dec_errs,
        btc_proc_errs,
        fiat_poll_errs,
        fiat_dec_errs,
        fiat_proc_errs,
    ]);

    let hub = Hub::new();
    let updater_task = hub::run_updater(hub.clone(), cancel.clone(), updates);

    let rest_task = match serve_rest(&cfg.rest_addr, db.clone(), &cancel).await {
        Ok(task) => task,
        Err(e) => {
            tracing::error!("rest api: {e}");
            std::process::exit(1);
        }
    };
    let ws_task = match serve_ws(&cfg.ws_addr, hub.clone(), &cancel).await {
        Ok(task) => task,
        Err(e) => {
            tracing::error!("websocket api: {e}");
            std::process::exit(1);
        }
    };

    for (name, task) in [
        ("rest api", rest_task),
        ("websocket api", ws_task),
        ("hub updater", updater_task),
        ("error logger", errors_task),
    ] {
        if let Err(e) = task.await {
            tracing::error!("{name} task failed: {e}");
        }
    }

    db.close().await;
    tracing::info!("shutdown complete");
}

async fn serve_rest(
    addr: &str,
    db: Arc<dyn Storage>,
    cancel: &tokio_util::sync::CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("rest api listening on {addr}");

    let shutdown = cancel.clone();
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, server::rest::router(db))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!("rest api server: {e}");
        }
    }))
}

async fn serve_ws(
    addr: &str,
    hub: Arc<Hub>,
    cancel: &tokio_util::sync::CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("websocket api listening on {addr}");

    let shutdown = cancel.clone();
    Ok(tokio::spawn(async move {
        let result = axum::serve(
            listener,
            server::ws::router(hub).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;
        if let Err(e) = result {
            tracing::error!("websocket api server: {e}");
        }
    }))
}

// Drains every stage's error channel. The source logged every error it saw,
// cancellation notices included; keep doing that.
fn log_errors(channels: Vec<mpsc::Receiver<RateError>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut readers = Vec::with_capacity(channels.len());
        for mut errors in channels {
            readers.push(tokio::spawn(async move {
                while let Some(e) = errors.recv().await {
                    tracing::warn!("{e}");
                }
            }));
        }
        for reader in readers {
            let _ = reader.await;
        }
    })
}
