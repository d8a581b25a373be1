use thiserror::Error;

use crate::envelope::{ClientEnvelope, DescriptionType, RelayEnvelope, SessionDescription};

pub const MAX_DISPLAY_NAME_CHARS: usize = 64;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Reasons an inbound envelope is rejected before it reaches the registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("display name must not be empty")]
    EmptyDisplayName,
    #[error("display name exceeds {max} characters")]
    DisplayNameTooLong { max: usize },
    #[error("{field} must not be empty")]
    MissingField { field: &'static str },
    #[error("{0} description requires a non-empty sdp")]
    EmptySdp(DescriptionType),
    #[error("candidate payload must be a JSON object")]
    CandidateNotObject,
    #[error("introduction required before {0}")]
    NotIntroduced(&'static str),
    #[error("endpoint already introduced")]
    AlreadyIntroduced,
    #[error("cannot address an envelope to yourself")]
    SelfAddressed,
}

impl EnvelopeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            EnvelopeError::FrameTooLarge { .. } => "frame_too_large",
            EnvelopeError::Malformed(_) => "malformed",
            EnvelopeError::EmptyDisplayName | EnvelopeError::DisplayNameTooLong { .. } => {
                "display_name"
            }
            EnvelopeError::MissingField { .. } => "missing_field",
            EnvelopeError::EmptySdp(_) => "empty_sdp",
            EnvelopeError::CandidateNotObject => "candidate_payload",
            EnvelopeError::NotIntroduced(_) => "not_introduced",
            EnvelopeError::AlreadyIntroduced => "already_introduced",
            EnvelopeError::SelfAddressed => "self_addressed",
        }
    }
}

impl SessionDescription {
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        // rollback carries no sdp
        if self.description_type != DescriptionType::Rollback && self.sdp.trim().is_empty() {
            return Err(EnvelopeError::EmptySdp(self.description_type));
        }
        Ok(())
    }
}

impl ClientEnvelope {
    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        match self {
            ClientEnvelope::Introduction { display_name } => {
                let trimmed = display_name.trim();
                if trimmed.is_empty() {
                    return Err(EnvelopeError::EmptyDisplayName);
                }
                if trimmed.chars().count() > MAX_DISPLAY_NAME_CHARS {
                    return Err(EnvelopeError::DisplayNameTooLong {
                        max: MAX_DISPLAY_NAME_CHARS,
                    });
                }
            }
            ClientEnvelope::Call { callee_id } => require_id(callee_id, "calleeId")?,
            ClientEnvelope::Description { send_to_id, data } => {
                require_id(send_to_id, "sendToId")?;
                data.validate()?;
            }
            ClientEnvelope::Candidate { send_to_id, data } => {
                require_id(send_to_id, "sendToId")?;
                if !data.is_object() {
                    return Err(EnvelopeError::CandidateNotObject);
                }
            }
            ClientEnvelope::Ping => {}
        }
        Ok(())
    }
}

fn require_id(value: &str, field: &'static str) -> Result<(), EnvelopeError> {
    if value.trim().is_empty() {
        Err(EnvelopeError::MissingField { field })
    } else {
        Ok(())
    }
}

/// Parse and validate one client frame.
pub fn decode_client_envelope(
    text: &str,
    max_frame_bytes: usize,
) -> Result<ClientEnvelope, EnvelopeError> {
    if text.len() > max_frame_bytes {
        return Err(EnvelopeError::FrameTooLarge {
            len: text.len(),
            max: max_frame_bytes,
        });
    }
    let envelope: ClientEnvelope =
        serde_json::from_str(text).map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
    envelope.validate()?;
    Ok(envelope)
}

pub fn decode_relay_envelope(text: &str) -> Result<RelayEnvelope, EnvelopeError> {
    serde_json::from_str(text).map_err(|err| EnvelopeError::Malformed(err.to_string()))
}
