//! Client-side half of tandem signaling.
//!
//! - [`Politeness`] assigns the polite/impolite role for every pair of endpoints
//! - [`Coordinator`] runs perfect negotiation against one remote endpoint
//! - [`DispatchTable`] fans inbound relay envelopes out to subscribers
//! - [`SignalingClient`] is the websocket connection to the relay

pub mod capability;
pub mod client;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod politeness;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use capability::{SessionCapability, SignalSink};
pub use client::{ClientConfig, SignalingClient};
pub use coordinator::{
    CandidateOutcome, Coordinator, CoordinatorConfig, CoordinatorState, DescriptionOutcome,
    OfferOutcome, SignalingPhase,
};
pub use dispatch::DispatchTable;
pub use error::{CapabilityError, NegotiationError, NegotiationStage};
pub use politeness::Politeness;
