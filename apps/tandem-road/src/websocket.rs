use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::counter;
use tandem_proto::{decode_client_envelope, ClientEnvelope, EnvelopeError, RelayEnvelope};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::router::{Connection, MessageRouter, RouteError};
use crate::AppState;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let max_frame_bytes = state.config.max_frame_bytes;

    let introduction = tokio::time::timeout(
        state.config.intro_timeout,
        await_introduction(&mut sender, &mut receiver, max_frame_bytes),
    )
    .await;
    let display_name = match introduction {
        Ok(Ok(Some(display_name))) => display_name,
        Ok(Ok(None)) => {
            debug!("socket closed before introduction");
            return;
        }
        Ok(Err(err)) => {
            warn!(error = %err, "socket failed before introduction");
            return;
        }
        Err(_) => {
            info!(
                timeout_secs = state.config.intro_timeout.as_secs(),
                "closing socket that never introduced itself"
            );
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel::<RelayEnvelope>();
    let connection = state.router.connect(&display_name, tx);
    let endpoint_id = connection.id().to_string();
    let writer = spawn_writer(sender, rx, endpoint_id.clone());

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = connection.closed() => {
                debug!(endpoint_id = %endpoint_id, "connection closed by relay");
                break;
            }
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => match frame_text(data) {
                Ok(text) => text,
                Err(err) => {
                    reject(&connection, err);
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(endpoint_id = %endpoint_id, error = %err, "websocket receive error");
                break;
            }
        };

        match decode_client_envelope(&text, max_frame_bytes) {
            Ok(envelope) => dispatch(&state.router, &connection, envelope),
            Err(err) => reject(&connection, err),
        }
    }

    drop(connection);
    writer.abort();
    debug!(endpoint_id = %endpoint_id, "websocket handler finished");
}

/// Read frames until a valid `introduction` arrives. Anything else is answered
/// with a validation error and otherwise ignored.
async fn await_introduction(
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    max_frame_bytes: usize,
) -> Result<Option<String>> {
    while let Some(frame) = receiver.next().await {
        let decoded = match frame.context("websocket receive failed")? {
            Message::Text(text) => decode_client_envelope(&text, max_frame_bytes),
            Message::Binary(data) => {
                frame_text(data).and_then(|text| decode_client_envelope(&text, max_frame_bytes))
            }
            Message::Close(_) => return Ok(None),
            _ => continue,
        };
        let err = match decoded {
            Ok(ClientEnvelope::Introduction { display_name }) => {
                return Ok(Some(display_name.trim().to_string()));
            }
            Ok(other) => EnvelopeError::NotIntroduced(other.kind().as_str()),
            Err(err) => err,
        };
        counter!("tandem_road_validation_failures_total", 1);
        debug!(error = %err, "rejecting frame before introduction");
        let reply = serde_json::to_string(&RelayEnvelope::validation_error(err.to_string()))
            .context("failed to encode validation error")?;
        sender
            .send(Message::Text(reply))
            .await
            .context("failed to send validation error")?;
    }
    Ok(None)
}

/// Binary frames carry the same JSON as text frames and must be valid UTF-8.
fn frame_text(data: Vec<u8>) -> Result<String, EnvelopeError> {
    String::from_utf8(data).map_err(|_| EnvelopeError::Malformed("binary frame is not utf-8".into()))
}

fn dispatch(router: &MessageRouter, connection: &Connection, envelope: ClientEnvelope) {
    let kind = envelope.kind();
    debug!(endpoint_id = %connection.id(), kind = %kind, "envelope received");
    if let Err(err) = router.handle(connection.id(), envelope) {
        match &err {
            RouteError::Validation(_) => {
                counter!("tandem_road_validation_failures_total", 1);
            }
            _ => {
                counter!(
                    "tandem_road_route_failures_total",
                    1,
                    "reason" => err.metric_label()
                );
            }
        }
        warn!(endpoint_id = %connection.id(), kind = %kind, error = %err, "envelope not routed");
        connection.send(err.to_envelope());
    }
}

fn reject(connection: &Connection, err: EnvelopeError) {
    counter!("tandem_road_validation_failures_total", 1);
    warn!(
        endpoint_id = %connection.id(),
        reason = err.metric_label(),
        error = %err,
        "rejected envelope"
    );
    connection.send(RelayEnvelope::validation_error(err.to_string()));
}

fn spawn_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<RelayEnvelope>,
    endpoint_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(err) => {
                    warn!(endpoint_id = %endpoint_id, error = %err, "failed to encode envelope");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        debug!(endpoint_id = %endpoint_id, "writer task ended");
    })
}

/// Periodically evict endpoints whose last ping is older than `timeout`.
pub fn spawn_heartbeat_monitor(
    router: MessageRouter,
    timeout: Duration,
    sweep: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep);
        loop {
            interval.tick().await;
            let stale = router.registry().stale(timeout);
            if stale.is_empty() {
                continue;
            }
            info!(count = stale.len(), "evicting stale endpoints");
            for endpoint_id in stale {
                router.evict(&endpoint_id);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn binary_frames_must_be_utf8() {
        let text = frame_text(br#"{"type":"ping"}"#.to_vec()).unwrap();
        assert_eq!(text, r#"{"type":"ping"}"#);

        let mangled = b"{\"type\":\"introduction\",\"displayName\":\"al\xffice\"}".to_vec();
        assert!(matches!(frame_text(mangled), Err(EnvelopeError::Malformed(_))));
    }
}
