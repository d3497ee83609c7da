use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::router::Relay;

/// WebSocket upgrade handler for the relay path.
pub async fn ws_handler(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> Response {
    let max_frame_bytes = relay.config().max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, relay))
}

/// Drive one client connection.
///
/// - A writer task drains the connection's outbound buffer into the socket,
///   each write bounded by the configured send timeout.
/// - The read loop feeds text frames to the relay until the client leaves,
///   the socket fails, or the relay closes this connection.
async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (mut session, mut rx) = relay.open_session();
    let conn_id = session.conn_id();
    let closer = session.closer();

    let send_timeout = relay.config().send_timeout;
    let writer_closer = closer.clone();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(conn_id, "failed to encode frame: {e}");
                    continue;
                }
            };
            match tokio::time::timeout(send_timeout, ws_sender.send(Message::text(text))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(conn_id, "ws write error: {e}");
                    break;
                }
                Err(_) => {
                    warn!(conn_id, "ws write timed out, closing connection");
                    break;
                }
            }
        }
        writer_closer.cancel();
        let _ = tokio::time::timeout(send_timeout, ws_sender.send(Message::Close(None))).await;
    });

    loop {
        tokio::select! {
            _ = closer.cancelled() => break,
            next = ws_receiver.next() => {
                let msg = match next {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        debug!(conn_id, "ws read error: {e}");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => relay.handle_text(&mut session, text.as_str()).await,
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => relay.handle_text(&mut session, text).await,
                        Err(_) => debug!(conn_id, "ignoring non-utf8 binary frame"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    relay.close_session(&mut session).await;

    // Dropping the session releases the last sender, letting the writer
    // flush what is buffered and exit.
    drop(session);
    let _ = write_task.await;
    debug!(conn_id, "ws connection closed");
}
