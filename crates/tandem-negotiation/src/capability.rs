use async_trait::async_trait;
use serde_json::Value;
use tandem_proto::{ClientEnvelope, SessionDescription};
use tokio::sync::mpsc;

use crate::error::{CapabilityError, NegotiationError};

/// The media stack a coordinator negotiates on behalf of.
///
/// Every call may be slow and may fail. Applying a remote offer while a local
/// offer is pending must roll the local offer back implicitly.
#[async_trait]
pub trait SessionCapability: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError>;

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError>;

    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), CapabilityError>;
}

/// Outbound half of the transport channel, as seen by a coordinator.
pub trait SignalSink: Send + Sync {
    fn send(&self, envelope: ClientEnvelope) -> Result<(), NegotiationError>;
}

impl SignalSink for mpsc::UnboundedSender<ClientEnvelope> {
    fn send(&self, envelope: ClientEnvelope) -> Result<(), NegotiationError> {
        mpsc::UnboundedSender::send(self, envelope).map_err(|_| NegotiationError::ChannelClosed)
    }
}
