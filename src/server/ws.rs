use crate::hub::{Hub, SUBSCRIBER_BUFFER};
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

const CLOSE_REASON: &str = "server closed";

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new().route("/", get(ws_handler)).with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<Hub>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, hub))
}

/// One task forwards the hub's write channel to the peer and answers the hub
/// shutdown signal with a normal-closure frame; another drains and discards
/// whatever the peer sends. Either side ending tears the subscriber down.
async fn handle_socket(socket: WebSocket, addr: SocketAddr, hub: Arc<Hub>) {
    let (mut sender, mut receiver) = socket.split();
    let shutdown = hub.shutdown_signal();

    let (tx, mut rx) = mpsc::channel::<Message>(SUBSCRIBER_BUFFER);
    if !hub.register(addr, tx) {
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: Utf8Bytes::from_static(CLOSE_REASON),
            })))
            .await;
        return;
    }
    tracing::debug!(%addr, "subscriber connected");

    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                // The registry is cleared in the same breath as the signal;
                // take the close frame branch first so the peer sees it.
                biased;
                _ = shutdown.cancelled() => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: Utf8Bytes::from_static(CLOSE_REASON),
                        })))
                        .await;
                    break;
                }
                message = rx.recv() => match message {
                    Some(message) => {
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    // Subscribers are receive-only: inbound payloads are discarded, the read
    // side only signals disconnection.
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.remove(addr);
    tracing::debug!(%addr, "subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::run_updater;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_util::sync::CancellationToken;

    async fn serve(hub: Arc<Hub>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(
                listener,
                router(hub).into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("serve");
        });
        format!("ws://{addr}/")
    }

    #[tokio::test]
    async fn subscribers_receive_every_envelope_in_order() {
        const SUBSCRIBERS: usize = 20;
        const MESSAGES: usize = 20;

        let hub = Hub::new();
        let cancel = CancellationToken::new();
        let (update_tx, update_rx) = mpsc::channel(MESSAGES);
        let updater = run_updater(hub.clone(), cancel.clone(), update_rx);
        let url = serve(hub.clone()).await;

        let mut clients = Vec::new();
        for _ in 0..SUBSCRIBERS {
            let (client, _) = connect_async(&url).await.expect("connect");
            clients.push(client);
        }
        // Registration happens inside the upgraded connection task.
        for _ in 0..100 {
            if hub.len() == SUBSCRIBERS {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.len(), SUBSCRIBERS);

        for i in 0..MESSAGES {
            update_tx.send(format!("update-{i}")).await.expect("send");
        }

        for client in &mut clients {
            for i in 0..MESSAGES {
                let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                    .await
                    .expect("frame within deadline")
                    .expect("stream open")
                    .expect("frame");
                assert_eq!(frame, WsMessage::text(format!("update-{i}")));
            }
        }

        // Shutdown: every subscriber sees a normal closure and the registry
        // ends empty.
        cancel.cancel();
        updater.await.expect("updater exits");

        for client in &mut clients {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                    .await
                    .expect("close within deadline")
                    .expect("stream open")
                    .expect("frame");
                if let WsMessage::Close(close) = frame {
                    let close = close.expect("close frame with body");
                    assert_eq!(close.code, CloseCode::Normal);
                    assert_eq!(close.reason.as_str(), "server closed");
                    break;
                }
            }
        }
        assert_eq!(hub.len(), 0);
    }

    #[tokio::test]
    async fn peer_disconnect_unregisters() {
        let hub = Hub::new();
        let url = serve(hub.clone()).await;

        let (mut client, _) = connect_async(&url).await.expect("connect");
        for _ in 0..100 {
            if hub.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.len(), 1);

        client.close(None).await.expect("close");
        for _ in 0..100 {
            if hub.len() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.len(), 0, "reader loop must unregister on disconnect");
    }
}
