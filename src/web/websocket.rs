use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, State},
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::api::AppState;
use crate::events::Event;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(websocket_handler))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn event_message(event: &Event) -> String {
    json!({
        "type": "event",
        "topic": event.topic(),
        "payload": event,
    })
    .to_string()
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before the snapshot so nothing emitted in between is lost
    let mut event_rx = state.events.subscribe();

    let snapshot = json!({
        "type": "snapshot",
        "payload": state.runner.state().snapshots(),
    });
    if let Err(e) = sender.send(Message::Text(snapshot.to_string())).await {
        error!("Failed to send initial snapshot: {}", e);
        return;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    if sender.send(Message::Text(event_message(&event))).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket client fell behind, events dropped");
                    let msg = json!({ "type": "lagged", "skipped": skipped });
                    if sender.send(Message::Text(msg.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    debug!("Received WebSocket message: {}", text);
                }
                Message::Close(_) => {
                    debug!("WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    debug!("WebSocket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackupId;

    #[test]
    fn events_are_framed_with_their_topic() {
        let msg = event_message(&Event::BackupStateChanged {
            backup_id: BackupId::new(2, 5),
        });
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();

        assert_eq!(value["type"], "event");
        assert_eq!(value["topic"], "backupStateChanged:2-5");
        assert_eq!(value["payload"]["type"], "backupStateChanged");
        assert_eq!(value["payload"]["backupId"]["backupProfileId"], 2);
    }
}
