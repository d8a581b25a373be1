use std::fmt;

use tandem_proto::EnvelopeError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failure reported by the media stack behind [`crate::SessionCapability`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CapabilityError(pub String);

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Which capability call a negotiation step was making when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationStage {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddCandidate,
}

impl NegotiationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationStage::CreateOffer => "create_offer",
            NegotiationStage::CreateAnswer => "create_answer",
            NegotiationStage::SetLocalDescription => "set_local_description",
            NegotiationStage::SetRemoteDescription => "set_remote_description",
            NegotiationStage::AddCandidate => "add_candidate",
        }
    }
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{stage} failed: {source}")]
    Capability {
        stage: NegotiationStage,
        #[source]
        source: CapabilityError,
    },
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("coordinator closed")]
    Closed,
    #[error("relay handshake failed: {0}")]
    Handshake(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

impl NegotiationError {
    pub fn capability(stage: NegotiationStage, source: CapabilityError) -> Self {
        NegotiationError::Capability { stage, source }
    }
}
