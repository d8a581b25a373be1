use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tandem_proto::{
    decode_relay_envelope, ClientEnvelope, EndpointSnapshot, EnvelopeKind, RelayEnvelope,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{error::ProtocolError, Error as WsError, Message};
use tracing::{debug, info, trace, warn};

use crate::capability::{SessionCapability, SignalSink};
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::dispatch::DispatchTable;
use crate::error::NegotiationError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub heartbeat_interval: Duration,
    /// How long to wait for `assign-id` after introducing ourselves.
    pub join_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// Websocket connection to a tandem relay.
///
/// Inbound envelopes are published to [`SignalingClient::dispatch`]; outbound
/// envelopes are queued to a writer task, so sending never blocks.
pub struct SignalingClient {
    local_id: String,
    display_name: String,
    send_tx: mpsc::UnboundedSender<ClientEnvelope>,
    dispatch: Arc<DispatchTable>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect, introduce ourselves as `display_name`, and wait for the relay
    /// to assign an id.
    pub async fn connect(
        url: &str,
        display_name: &str,
        config: ClientConfig,
    ) -> Result<Arc<Self>, NegotiationError> {
        let (ws_stream, _) = connect_async(url).await?;
        debug!(url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let introduction = serde_json::to_string(&ClientEnvelope::Introduction {
            display_name: display_name.to_string(),
        })?;
        ws_write.send(Message::Text(introduction.into())).await?;

        let (local_id, display_name) =
            tokio::time::timeout(config.join_timeout, await_assignment(&mut ws_read))
                .await
                .map_err(|_| {
                    NegotiationError::Handshake("timed out waiting for assign-id".into())
                })??;
        info!(endpoint_id = %local_id, display_name = %display_name, "joined relay");

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientEnvelope>();
        let dispatch = Arc::new(DispatchTable::new());

        let writer_handle = tokio::spawn(async move {
            while let Some(envelope) = send_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(kind = %envelope.kind(), error = %err, "failed to encode envelope");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_dispatch = Arc::clone(&dispatch);
        let reader_handle = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("signaling websocket closed: {err}");
                            }
                            _ => warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                match decode_relay_envelope(&text) {
                    Ok(envelope) => {
                        trace!(kind = %envelope.kind(), "relay envelope received");
                        if let RelayEnvelope::Error { code, message, .. } = &envelope {
                            warn!(?code, %message, "relay reported an error");
                        }
                        reader_dispatch.publish(&envelope);
                    }
                    Err(err) => warn!(error = %err, "dropping undecodable relay frame"),
                }
            }
            reader_dispatch.close();
            debug!("signaling reader finished");
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_interval = config.heartbeat_interval;
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientEnvelope::Ping).is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(Self {
            local_id,
            display_name,
            send_tx,
            dispatch,
            tasks: Mutex::new(vec![writer_handle, reader_handle, heartbeat_handle]),
        }))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    pub fn subscribe(&self, kinds: &[EnvelopeKind]) -> mpsc::UnboundedReceiver<RelayEnvelope> {
        self.dispatch.subscribe(kinds)
    }

    /// Ask the relay to fix roles with us impolite and `callee_id` polite.
    pub fn call(&self, callee_id: &str) -> Result<(), NegotiationError> {
        self.send(ClientEnvelope::Call {
            callee_id: callee_id.to_string(),
        })
    }

    /// Start a coordinator for `remote`, fed from this connection.
    pub fn open_session(
        &self,
        remote: EndpointSnapshot,
        capability: Arc<dyn SessionCapability>,
        config: CoordinatorConfig,
    ) -> Arc<Coordinator> {
        let inbound = self.dispatch.subscribe_from(
            &[
                EnvelopeKind::Description,
                EnvelopeKind::Candidate,
                EnvelopeKind::EndpointDisconnected,
            ],
            &remote.id,
        );
        let coordinator = Coordinator::new(
            self.local_id.clone(),
            remote,
            capability,
            Arc::new(self.send_tx.clone()),
            config,
        );
        let handle = tokio::spawn(Arc::clone(&coordinator).run(inbound));
        self.tasks.lock().push(handle);
        coordinator
    }
}

impl SignalSink for SignalingClient {
    fn send(&self, envelope: ClientEnvelope) -> Result<(), NegotiationError> {
        self.send_tx
            .send(envelope)
            .map_err(|_| NegotiationError::ChannelClosed)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

async fn await_assignment<S>(read: &mut S) -> Result<(String, String), NegotiationError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(frame) = read.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match decode_relay_envelope(text.as_str())? {
            RelayEnvelope::AssignId { id, display_name } => return Ok((id, display_name)),
            RelayEnvelope::Error { message, .. } => {
                return Err(NegotiationError::Handshake(message));
            }
            other => debug!(kind = %other.kind(), "ignoring envelope before assign-id"),
        }
    }
    Err(NegotiationError::Handshake(
        "relay closed before assigning an id".into(),
    ))
}
