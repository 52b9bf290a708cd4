use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const RETRIES: usize = 1000;
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let Ok(addr) = std::env::var("SERVER_URL") else {
        eprintln!("ratewatch-client: environment variable SERVER_URL must be set");
        std::process::exit(1);
    };
    let url = format!("ws://{addr}/");

    let Some(mut client) = connect(&url).await else {
        tracing::error!("connect: number of retries exceeded");
        std::process::exit(1);
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("got interrupt signal, closing");
                let _ = client
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    })))
                    .await;
                break;
            }
            frame = client.next() => match frame {
                Some(Ok(Message::Text(envelope))) => {
                    tracing::info!("recv: {envelope}");
                }
                Some(Ok(Message::Close(close))) => {
                    // A normal closure means the server is done with us;
                    // anything else is worth another dial.
                    if close.as_ref().is_some_and(|c| c.code == CloseCode::Normal) {
                        tracing::info!("server closed the connection");
                        break;
                    }
                    tracing::warn!("abnormal closure: {close:?}, reconnecting");
                    match connect(&url).await {
                        Some(next) => client = next,
                        None => {
                            tracing::error!("connect: number of retries exceeded");
                            std::process::exit(1);
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("read: {e}, reconnecting");
                    match connect(&url).await {
                        Some(next) => client = next,
                        None => {
                            tracing::error!("connect: number of retries exceeded");
                            std::process::exit(1);
                        }
                    }
                }
                None => {
                    tracing::warn!("connection lost, reconnecting");
                    match connect(&url).await {
                        Some(next) => client = next,
                        None => {
                            tracing::error!("connect: number of retries exceeded");
                            std::process::exit(1);
                        }
                    }
                }
            },
        }
    }
}

async fn connect(url: &str) -> Option<WsClient> {
    tracing::info!("connecting to {url}...");

    for attempt in 1..=RETRIES {
        match connect_async(url).await {
            Ok((client, _)) => {
                tracing::info!("connection to {url} established");
                return Some(client);
            }
            Err(e) => {
                tracing::warn!("dial (attempt {attempt}): {e}");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }

    None
}
