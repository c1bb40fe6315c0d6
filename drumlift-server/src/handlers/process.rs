use crate::state::AppState;
use axum::{
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use drumlift_core::TaskId;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, error, info};

/// Upgrade to a WebSocket that drives and observes one task's pipeline.
///
/// Connecting is what starts processing: the handler attaches the
/// connection as the task's progress consumer (superseding any earlier
/// one) and then issues an idempotent start, so a reconnect resumes
/// observation without forking a second pipeline run.
pub async fn process_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, task_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, raw_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let id = match raw_id.parse::<TaskId>() {
        Ok(id) => id,
        Err(_) => {
            reject(&mut sender, &raw_id, "Invalid task ID").await;
            return;
        }
    };
    // Attach before starting so no event can slip past the consumer;
    // `subscribe` re-delivers a terminal frame that raced the attach.
    let mut sub = match state.orchestrator.subscribe(id).await {
        Ok(sub) => sub,
        Err(_) => {
            reject(&mut sender, &raw_id, "Task not found").await;
            return;
        }
    };
    // No-op unless the task is sitting in uploading-complete.
    if let Err(e) = state.orchestrator.start(id).await {
        error!("failed to start pipeline for task {id}: {e}");
    }

    info!("websocket attached to task {id}");

    loop {
        tokio::select! {
            event = sub.receiver.recv() => {
                let Some(event) = event else {
                    // Superseded by a newer consumer or the task was
                    // deleted; this connection is done observing.
                    debug!("progress channel for task {id} closed");
                    break;
                };
                let terminal = event.is_terminal();
                let frame = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("failed to encode progress event for task {id}: {e}");
                        break;
                    }
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    debug!("websocket for task {id} went away");
                    break;
                }
                if terminal {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "done".into(),
                        })))
                        .await;
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("client closed websocket for task {id}");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("websocket error for task {id}: {e}");
                        break;
                    }
                    // Inbound frames carry no meaning on this socket.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.channels.detach(&sub);
    info!("websocket detached from task {id}");
}

async fn reject(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    raw_id: &str,
    reason: &str,
) {
    let frame = json!({ "error": reason, "task_id": raw_id }).to_string();
    let _ = sender.send(Message::Text(frame.into())).await;
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "rejected".into(),
        })))
        .await;
}
