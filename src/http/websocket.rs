use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use crate::http::state::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Pushes progress snapshots for one job as they are published to the
/// registry's broadcast channel. The peer may send a `"ping"` text frame at
/// any time; it is answered with `"pong"`. A `"keepalive"` frame is sent on
/// its own timer regardless, so idling proxies do not time the connection
/// out during a long quiet stretch between progress updates.
pub async fn progress_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, job_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, job_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates = state.registry.subscribe(&job_id);
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(progress) => {
                        let Ok(text) = serde_json::to_string(&progress) else { continue };
                        let done = progress.done;
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                        if done {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
            _ = keepalive.tick() => {
                if sender.send(Message::Text("keepalive".into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        if sender.send(Message::Text("pong".into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
