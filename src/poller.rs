use crate::errors::{RateError, RateResult};
use reqwest::Client;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
// Some upstreams 403 the default reqwest agent.
const USER_AGENT: &str = "Mozilla/5.0";

/// Polls `url` once immediately and then every `interval`, emitting response
/// bodies on one channel and failures on the other.
///
/// Fetches are strictly serial. Transport errors are reported and polling
/// continues; cancellation emits exactly one terminal [`RateError::Cancelled`]
/// and closes both channels.
pub fn poll(
    cancel: CancellationToken,
    url: String,
    interval: Duration,
) -> (mpsc::Receiver<Vec<u8>>, mpsc::Receiver<RateError>) {
    let (out_tx, out_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = mpsc::channel(2);

    tokio::spawn(async move {
        let client = match Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                let _ = err_tx
                    .send(RateError::Poll {
                        url,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        loop {
            let fetched = tokio::select! {
                fetched = fetch(&client, &url) => fetched,
                _ = cancel.cancelled() => {
                    let _ = err_tx.send(RateError::Cancelled).await;
                    return;
                }
            };

            match fetched {
                Ok(body) => tokio::select! {
                    sent = out_tx.send(body) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => {
                        let _ = err_tx.send(RateError::Cancelled).await;
                        return;
                    }
                },
                Err(e) => tokio::select! {
                    sent = err_tx.send(e) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => {
                        let _ = err_tx.send(RateError::Cancelled).await;
                        return;
                    }
                },
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    let _ = err_tx.send(RateError::Cancelled).await;
                    return;
                }
            }
        }
    });

    (out_rx, err_rx)
}

// The body is emitted whatever the status code; downstream decoders are the
// ones that reject error pages.
async fn fetch(client: &Client, url: &str) -> RateResult<Vec<u8>> {
    let response = client.get(url).send().await.map_err(|e| RateError::Poll {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let body = response.bytes().await.map_err(|e| RateError::Poll {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn first_fetch_is_immediate() {
        let app = Router::new().route("/", get(|| async { "quote" }));
        let url = serve(app).await;

        let cancel = CancellationToken::new();
        let (mut bodies, _errs) = poll(cancel.clone(), url, Duration::from_secs(3600));

        let body = tokio::time::timeout(Duration::from_secs(2), bodies.recv())
            .await
            .expect("first body must not wait for the interval")
            .expect("body");
        assert_eq!(body, b"quote");
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_emits_one_terminal_error_and_closes() {
        const BODIES: usize = 20;

        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < BODIES {
                        "update".to_string()
                    } else {
                        // Block the 21st fetch until the poller is cancelled.
                        std::future::pending::<String>().await
                    }
                }
            }),
        );
        let url = serve(app).await;

        let cancel = CancellationToken::new();
        let (mut bodies, mut errs) = poll(cancel.clone(), url, Duration::from_millis(1));

        let mut received = 0;
        while received < BODIES {
            let body = tokio::time::timeout(Duration::from_secs(5), bodies.recv())
                .await
                .expect("body within deadline")
                .expect("body");
            assert_eq!(body, b"update");
            received += 1;
        }
        cancel.cancel();

        assert_eq!(received, BODIES);
        let terminal = tokio::time::timeout(Duration::from_secs(5), errs.recv())
            .await
            .expect("terminal error within deadline")
            .expect("terminal error");
        assert!(matches!(terminal, RateError::Cancelled));
        assert!(errs.recv().await.is_none(), "error channel must close");
        assert!(bodies.recv().await.is_none(), "body channel must close");
    }

    #[tokio::test]
    async fn transport_errors_do_not_terminate_polling() {
        // Nothing listens here; every fetch fails.
        let cancel = CancellationToken::new();
        let (_bodies, mut errs) = poll(
            cancel.clone(),
            "http://127.0.0.1:9/".to_string(),
            Duration::from_millis(1),
        );

        for _ in 0..2 {
            let err = tokio::time::timeout(Duration::from_secs(5), errs.recv())
                .await
                .expect("error within deadline")
                .expect("error");
            match err {
                RateError::Poll { url, .. } => assert!(url.contains("127.0.0.1:9")),
                other => panic!("expected a poll error, got {other:?}"),
            }
        }
        cancel.cancel();
    }
}
