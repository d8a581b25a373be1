use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Read-only copy of a registered endpoint, as carried inside routed envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub polite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl DescriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptionType::Offer => "offer",
            DescriptionType::Answer => "answer",
            DescriptionType::Pranswer => "pranswer",
            DescriptionType::Rollback => "rollback",
        }
    }
}

impl fmt::Display for DescriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque session description produced by the media stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub sdp: String,
    pub description_type: DescriptionType,
}

impl SessionDescription {
    pub fn new(description_type: DescriptionType, sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            description_type,
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(DescriptionType::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(DescriptionType::Answer, sdp)
    }

    pub fn is_offer(&self) -> bool {
        self.description_type == DescriptionType::Offer
    }
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEnvelope {
    /// First message on every connection; the relay answers with `assign-id`.
    #[serde(rename_all = "camelCase")]
    Introduction { display_name: String },
    /// Ask the relay to set up the politeness roles for a call before offering.
    #[serde(rename_all = "camelCase")]
    Call { callee_id: String },
    #[serde(rename_all = "camelCase")]
    Description {
        send_to_id: String,
        data: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Candidate { send_to_id: String, data: Value },
    /// Heartbeat to keep the registration alive
    Ping,
}

impl ClientEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            ClientEnvelope::Introduction { .. } => EnvelopeKind::Introduction,
            ClientEnvelope::Call { .. } => EnvelopeKind::Call,
            ClientEnvelope::Description { .. } => EnvelopeKind::Description,
            ClientEnvelope::Candidate { .. } => EnvelopeKind::Candidate,
            ClientEnvelope::Ping => EnvelopeKind::Ping,
        }
    }

    /// Id of the endpoint this envelope is addressed to, if it is addressed at all.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            ClientEnvelope::Call { callee_id } => Some(callee_id),
            ClientEnvelope::Description { send_to_id, .. }
            | ClientEnvelope::Candidate { send_to_id, .. } => Some(send_to_id),
            ClientEnvelope::Introduction { .. } | ClientEnvelope::Ping => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Validation,
    UnknownRecipient,
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayEnvelope {
    #[serde(rename_all = "camelCase")]
    AssignId { id: String, display_name: String },
    /// The recipient's own snapshot changed (currently only its `polite` role).
    UpdateSelf { endpoint: EndpointSnapshot },
    Call { caller: EndpointSnapshot },
    /// `polite` is the recipient's role toward `from_endpoint`.
    #[serde(rename_all = "camelCase")]
    Description {
        from_endpoint: EndpointSnapshot,
        data: SessionDescription,
        polite: bool,
    },
    #[serde(rename_all = "camelCase")]
    Candidate {
        from_endpoint: EndpointSnapshot,
        data: Value,
        polite: bool,
    },
    EndpointConnected { endpoint: EndpointSnapshot },
    EndpointDisconnected { endpoint: EndpointSnapshot },
    #[serde(rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<String>,
    },
    Pong,
}

impl RelayEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            RelayEnvelope::AssignId { .. } => EnvelopeKind::AssignId,
            RelayEnvelope::UpdateSelf { .. } => EnvelopeKind::UpdateSelf,
            RelayEnvelope::Call { .. } => EnvelopeKind::Call,
            RelayEnvelope::Description { .. } => EnvelopeKind::Description,
            RelayEnvelope::Candidate { .. } => EnvelopeKind::Candidate,
            RelayEnvelope::EndpointConnected { .. } => EnvelopeKind::EndpointConnected,
            RelayEnvelope::EndpointDisconnected { .. } => EnvelopeKind::EndpointDisconnected,
            RelayEnvelope::Error { .. } => EnvelopeKind::Error,
            RelayEnvelope::Pong => EnvelopeKind::Pong,
        }
    }

    /// The endpoint this envelope is about: the sender for routed messages,
    /// the subject for connect/disconnect notifications.
    pub fn subject(&self) -> Option<&EndpointSnapshot> {
        match self {
            RelayEnvelope::Call { caller } => Some(caller),
            RelayEnvelope::Description { from_endpoint, .. }
            | RelayEnvelope::Candidate { from_endpoint, .. } => Some(from_endpoint),
            RelayEnvelope::EndpointConnected { endpoint }
            | RelayEnvelope::EndpointDisconnected { endpoint }
            | RelayEnvelope::UpdateSelf { endpoint } => Some(endpoint),
            RelayEnvelope::AssignId { .. }
            | RelayEnvelope::Error { .. }
            | RelayEnvelope::Pong => None,
        }
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        RelayEnvelope::Error {
            code: ErrorCode::Validation,
            message: message.into(),
            recipient_id: None,
        }
    }

    pub fn unknown_recipient(recipient_id: impl Into<String>) -> Self {
        let recipient_id = recipient_id.into();
        RelayEnvelope::Error {
            code: ErrorCode::UnknownRecipient,
            message: format!("no endpoint with id \"{recipient_id}\" is connected"),
            recipient_id: Some(recipient_id),
        }
    }
}

/// Discriminant shared by both envelope directions; used as a dispatch key
/// and as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Introduction,
    AssignId,
    UpdateSelf,
    Call,
    Description,
    Candidate,
    EndpointConnected,
    EndpointDisconnected,
    Error,
    Ping,
    Pong,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Introduction => "introduction",
            EnvelopeKind::AssignId => "assign-id",
            EnvelopeKind::UpdateSelf => "update-self",
            EnvelopeKind::Call => "call",
            EnvelopeKind::Description => "description",
            EnvelopeKind::Candidate => "candidate",
            EnvelopeKind::EndpointConnected => "endpoint-connected",
            EnvelopeKind::EndpointDisconnected => "endpoint-disconnected",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Pong => "pong",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
