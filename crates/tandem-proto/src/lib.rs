//! Wire envelopes exchanged between tandem clients and the relay.
//! Keeping this in a dedicated crate lets the relay and the negotiation
//! client share one schema without pulling in any runtime code.

mod envelope;
mod validate;

pub use envelope::{
    ClientEnvelope, DescriptionType, EndpointSnapshot, EnvelopeKind, ErrorCode, RelayEnvelope,
    SessionDescription,
};
pub use validate::{
    decode_client_envelope, decode_relay_envelope, EnvelopeError, DEFAULT_MAX_FRAME_BYTES,
    MAX_DISPLAY_NAME_CHARS,
};
