//! Upgrade handler and the per-connection read / write tasks.

use super::AppState;
use crate::envelope::{ConnectionId, EditEvent, Envelope, PayloadKind};
use crate::error::FanoutError;
use crate::hub::{CloseReason, LivenessWatch, OutboundQueue};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// How long the write task gets to flush its close frame after the read side ends.
const WRITE_FLUSH_GRACE: Duration = Duration::from_secs(1);

/// `GET /updates/ws/docId/{doc_id}/token/{token}`
///
/// The token is checked before the upgrade is accepted, so a rejected client
/// never reaches the hub.
pub(super) async fn upgrade(
    Path((document_id, token)): Path<(String, String)>,
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match state.auth.authenticate(&token).await {
        Ok(identity) => identity,
        Err(e) => {
            let err = FanoutError::from(e);
            info!(document_id = %document_id, error = %err, "Rejecting upgrade");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Authorization failed" })),
            )
                .into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = FanoutError::Upgrade(rejection.to_string());
            warn!(document_id = %document_id, user_id = %identity.user_id, error = %err, "Upgrade failed");
            return rejection.into_response();
        }
    };

    let failed_doc = document_id.clone();
    ws.on_failed_upgrade(move |e| {
        warn!(document_id = %failed_doc, error = %e, "Upgrade failed after handshake");
    })
    .on_upgrade(move |socket| async move {
        let span = tracing::info_span!(
            "connection",
            document_id = %document_id,
            user_id = %identity.user_id
        );
        handle_socket(socket, state, identity, document_id)
            .instrument(span)
            .await
    })
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    identity: crate::envelope::Identity,
    document_id: String,
) {
    let (connection_id, queue) = match state.hub.open_connection(identity, &document_id).await {
        Ok(registered) => registered,
        Err(e) => {
            debug!(error = %e, "Registration refused");
            let code = if matches!(e, FanoutError::ShuttingDown) {
                close_code::AWAY
            } else {
                close_code::ERROR
            };
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: "registration refused".into(),
                })))
                .await;
            return;
        }
    };
    debug!(connection_id = %connection_id, "Connection open");

    let liveness = queue.liveness();
    let (sink, stream) = socket.split();
    let mut write = tokio::spawn(write_loop(sink, queue).in_current_span());
    let mut read = tokio::spawn(
        read_loop(stream, state.clone(), liveness, connection_id, document_id).in_current_span(),
    );

    tokio::select! {
        _ = &mut write => {
            read.abort();
            state.hub.unregister(connection_id).await;
        }
        _ = &mut read => {
            // Unregister closes the queue; the write task sends the close frame and exits.
            state.hub.unregister(connection_id).await;
            if tokio::time::timeout(WRITE_FLUSH_GRACE, &mut write).await.is_err() {
                write.abort();
            }
        }
    }
    debug!(connection_id = %connection_id, "Connection closed");
}

/// Drain the outbound queue into the socket.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut queue: OutboundQueue) {
    while let Some(envelope) = queue.recv().await {
        if queue.close_reason() == Some(CloseReason::SlowConsumer) {
            break;
        }
        let message = match envelope.payload_kind {
            PayloadKind::Text => match String::from_utf8(envelope.payload.clone()) {
                Ok(text) => Message::Text(text.into()),
                Err(_) => Message::Binary(envelope.payload.clone().into()),
            },
            PayloadKind::Binary => Message::Binary(envelope.payload.clone().into()),
        };
        if let Err(e) = sink.send(message).await {
            debug!(connection_id = %queue.id(), error = %e, "Write failed");
            queue.mark_closed();
            return;
        }
    }

    // No close handshake for a slow consumer: the sink is dropped unclosed
    // and the socket goes down with the read half.
    if let Some(frame) = close_frame(queue.close_reason()) {
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    }
    queue.mark_closed();
}

/// Close frame owed to the client, if any.
fn close_frame(reason: Option<CloseReason>) -> Option<CloseFrame> {
    match reason {
        Some(CloseReason::SlowConsumer) => None,
        Some(CloseReason::ShuttingDown) => Some(CloseFrame {
            code: close_code::AWAY,
            reason: "server shutting down".into(),
        }),
        _ => Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        }),
    }
}

/// Read client frames until the client leaves or the hub drops the connection.
async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: AppState,
    liveness: LivenessWatch,
    connection_id: ConnectionId,
    document_id: String,
) {
    while let Some(frame) = stream.next().await {
        let (payload, kind) = match frame {
            Ok(Message::Text(text)) => (text.as_str().as_bytes().to_vec(), PayloadKind::Text),
            Ok(Message::Binary(bytes)) => (bytes.to_vec(), PayloadKind::Binary),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "Read failed");
                break;
            }
        };

        if !relay_frame(&state, &liveness, connection_id, &document_id, payload, kind).await {
            break;
        }
    }
}

/// Fan one client frame out locally first, then hand it to the durable log.
///
/// Returns `false` once the connection is no longer in its room; frames
/// from an evicted connection reach neither peers nor the log.
async fn relay_frame(
    state: &AppState,
    liveness: &LivenessWatch,
    connection_id: ConnectionId,
    document_id: &str,
    payload: Vec<u8>,
    kind: PayloadKind,
) -> bool {
    if !liveness.is_active() {
        debug!(connection_id = %connection_id, "Connection left its room, ignoring frame");
        return false;
    }

    let envelope = Envelope::new(document_id, connection_id, state.hub.instance_id(), payload, kind);
    let event = EditEvent::from_envelope(&envelope);

    if state.hub.broadcast(envelope).await.is_err() {
        return false;
    }
    // Dropped events are logged and counted by the log
    let _ = state.edits.append(event);
    true
}
