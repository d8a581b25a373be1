//! Delivery of client envelopes between registered endpoints.
//!
//! The router is stateless apart from the registry and the politeness table:
//! it stamps every routed description and candidate with the recipient's role
//! toward the sender, so both sides of a pair always agree on who yields.

use std::sync::Arc;

use metrics::{counter, gauge};
use tandem_negotiation::Politeness;
use tandem_proto::{ClientEnvelope, EndpointSnapshot, EnvelopeError, RelayEnvelope};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::{Endpoint, PeerRegistry, RemovalHandle};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no endpoint with id \"{0}\" is connected")]
    UnknownRecipient(String),
    #[error(transparent)]
    Validation(#[from] EnvelopeError),
    #[error("sender {0} is no longer registered")]
    SenderGone(String),
}

impl RouteError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteError::UnknownRecipient(_) => "unknown_recipient",
            RouteError::Validation(_) => "validation",
            RouteError::SenderGone(_) => "sender_gone",
        }
    }

    /// The `error` envelope reported back to the sender.
    pub fn to_envelope(&self) -> RelayEnvelope {
        match self {
            RouteError::UnknownRecipient(id) => RelayEnvelope::unknown_recipient(id.clone()),
            RouteError::Validation(err) => RelayEnvelope::validation_error(err.to_string()),
            RouteError::SenderGone(_) => RelayEnvelope::validation_error(self.to_string()),
        }
    }
}

#[derive(Clone, Default)]
pub struct MessageRouter {
    registry: PeerRegistry,
    politeness: Arc<Politeness>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn politeness(&self) -> &Politeness {
        &self.politeness
    }

    /// Register an introduced endpoint, tell it its id, and announce it to
    /// everyone else. Dropping the returned [`Connection`] disconnects it.
    pub fn connect(
        &self,
        display_name: &str,
        tx: mpsc::UnboundedSender<RelayEnvelope>,
    ) -> Connection {
        let (endpoint, handle) = self.registry.add(display_name, tx);
        counter!("tandem_road_connections_total", 1);
        gauge!("tandem_road_endpoints_active", self.registry.len() as f64);

        endpoint.send(RelayEnvelope::AssignId {
            id: endpoint.id().to_string(),
            display_name: endpoint.display_name().to_string(),
        });
        let notified = self.broadcast(
            &RelayEnvelope::EndpointConnected {
                endpoint: endpoint.snapshot(),
            },
            Some(endpoint.id()),
        );
        info!(
            endpoint_id = %endpoint.id(),
            display_name = %endpoint.display_name(),
            notified,
            "endpoint connected"
        );

        Connection {
            router: self.clone(),
            endpoint,
            handle,
        }
    }

    /// Handle one validated envelope from an introduced endpoint.
    pub fn handle(&self, sender_id: &str, envelope: ClientEnvelope) -> Result<(), RouteError> {
        match envelope {
            ClientEnvelope::Introduction { .. } => {
                Err(RouteError::Validation(EnvelopeError::AlreadyIntroduced))
            }
            ClientEnvelope::Ping => {
                let sender = self.sender(sender_id)?;
                self.registry.touch(sender_id);
                sender.send(RelayEnvelope::Pong);
                Ok(())
            }
            ClientEnvelope::Call { callee_id } => self.call(sender_id, &callee_id),
            ClientEnvelope::Description { send_to_id, data } => {
                self.route_to_one(sender_id, &send_to_id, |from_endpoint, polite| {
                    RelayEnvelope::Description {
                        from_endpoint,
                        data,
                        polite,
                    }
                })
            }
            ClientEnvelope::Candidate { send_to_id, data } => {
                self.route_to_one(sender_id, &send_to_id, |from_endpoint, polite| {
                    RelayEnvelope::Candidate {
                        from_endpoint,
                        data,
                        polite,
                    }
                })
            }
        }
    }

    /// Forward to `recipient_id` with the sender attached and the recipient's
    /// role stamped in. Nothing is mutated when the recipient is unknown.
    pub fn route_to_one<F>(
        &self,
        sender_id: &str,
        recipient_id: &str,
        build: F,
    ) -> Result<(), RouteError>
    where
        F: FnOnce(EndpointSnapshot, bool) -> RelayEnvelope,
    {
        if sender_id == recipient_id {
            return Err(EnvelopeError::SelfAddressed.into());
        }
        let sender = self.sender(sender_id)?;
        let recipient = self
            .registry
            .get(recipient_id)
            .ok_or_else(|| RouteError::UnknownRecipient(recipient_id.to_string()))?;

        let sender_polite = self.politeness.polite_of(sender_id, recipient_id);
        self.registry.set_polite(sender_id, sender_polite);
        self.registry.set_polite(recipient_id, !sender_polite);

        let envelope = build(sender.snapshot(), !sender_polite);
        let kind = envelope.kind();
        if !recipient.send(envelope) {
            return Err(RouteError::UnknownRecipient(recipient_id.to_string()));
        }
        counter!("tandem_road_envelopes_routed_total", 1, "type" => kind.as_str());
        debug!(
            from = %sender_id,
            to = %recipient_id,
            kind = %kind,
            recipient_polite = !sender_polite,
            "routed envelope"
        );
        Ok(())
    }

    /// Fix roles for a call (caller impolite, callee polite unless the pair
    /// already has a record), then notify both sides.
    pub fn call(&self, caller_id: &str, callee_id: &str) -> Result<(), RouteError> {
        if caller_id == callee_id {
            return Err(EnvelopeError::SelfAddressed.into());
        }
        let caller = self.sender(caller_id)?;
        let callee = self
            .registry
            .get(callee_id)
            .ok_or_else(|| RouteError::UnknownRecipient(callee_id.to_string()))?;

        let callee_polite = self.politeness.assign(caller_id, callee_id);
        self.registry.set_polite(caller_id, !callee_polite);
        self.registry.set_polite(callee_id, callee_polite);

        let caller_snapshot = caller.snapshot();
        caller.send(RelayEnvelope::UpdateSelf {
            endpoint: caller_snapshot.clone(),
        });
        if !callee.send(RelayEnvelope::Call {
            caller: caller_snapshot,
        }) {
            return Err(RouteError::UnknownRecipient(callee_id.to_string()));
        }
        counter!("tandem_road_envelopes_routed_total", 1, "type" => "call");
        info!(caller = %caller_id, callee = %callee_id, callee_polite, "call placed");
        Ok(())
    }

    /// Send to every registered endpoint except `excluding`. Returns how many
    /// queues accepted the envelope.
    pub fn broadcast(&self, envelope: &RelayEnvelope, excluding: Option<&str>) -> usize {
        self.registry
            .others(excluding)
            .into_iter()
            .filter(|endpoint| endpoint.send(envelope.clone()))
            .count()
    }

    /// Drop an endpoint that stopped heartbeating and ask its socket to close.
    pub fn evict(&self, endpoint_id: &str) -> bool {
        if let Some(endpoint) = self.registry.get(endpoint_id) {
            endpoint.request_close();
        }
        match self.registry.remove(endpoint_id) {
            Some(snapshot) => {
                warn!(endpoint_id = %endpoint_id, "evicting endpoint after heartbeat timeout");
                self.retire(snapshot);
                true
            }
            None => false,
        }
    }

    fn disconnect(&self, handle: &mut RemovalHandle) {
        if let Some(snapshot) = handle.remove() {
            self.retire(snapshot);
        }
    }

    fn retire(&self, snapshot: EndpointSnapshot) {
        let pairs = self.politeness.retire(&snapshot.id);
        gauge!("tandem_road_endpoints_active", self.registry.len() as f64);
        let notified = self.broadcast(
            &RelayEnvelope::EndpointDisconnected {
                endpoint: snapshot.clone(),
            },
            Some(&snapshot.id),
        );
        info!(
            endpoint_id = %snapshot.id,
            display_name = %snapshot.display_name,
            retired_pairs = pairs,
            notified,
            "endpoint disconnected"
        );
    }

    fn sender(&self, sender_id: &str) -> Result<Arc<Endpoint>, RouteError> {
        self.registry
            .get(sender_id)
            .ok_or_else(|| RouteError::SenderGone(sender_id.to_string()))
    }
}

/// Registration of one live websocket. Dropping it removes the endpoint,
/// retires its politeness records and tells everyone else.
pub struct Connection {
    router: MessageRouter,
    endpoint: Arc<Endpoint>,
    handle: RemovalHandle,
}

impl Connection {
    pub fn id(&self) -> &str {
        self.endpoint.id()
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn send(&self, envelope: RelayEnvelope) -> bool {
        self.endpoint.send(envelope)
    }

    pub async fn closed(&self) {
        self.endpoint.closed().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.router.disconnect(&mut self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_proto::{ErrorCode, SessionDescription};

    struct Peer {
        connection: Connection,
        inbox: mpsc::UnboundedReceiver<RelayEnvelope>,
    }

    impl Peer {
        fn id(&self) -> String {
            self.connection.id().to_string()
        }

        fn drain(&mut self) -> Vec<RelayEnvelope> {
            let mut envelopes = Vec::new();
            while let Ok(envelope) = self.inbox.try_recv() {
                envelopes.push(envelope);
            }
            envelopes
        }
    }

    fn join(router: &MessageRouter, name: &str) -> Peer {
        let (tx, inbox) = mpsc::unbounded_channel();
        let connection = router.connect(name, tx);
        let mut peer = Peer { connection, inbox };
        match peer.inbox.try_recv() {
            Ok(RelayEnvelope::AssignId { id, display_name }) => {
                assert_eq!(id, peer.id());
                assert_eq!(display_name, name);
            }
            other => panic!("expected assign-id, got {other:?}"),
        }
        peer
    }

    fn offer_to(id: &str) -> ClientEnvelope {
        ClientEnvelope::Description {
            send_to_id: id.to_string(),
            data: SessionDescription::offer("v=0"),
        }
    }

    #[test_timeout::timeout]
    fn connect_announces_to_existing_endpoints() {
        let router = MessageRouter::new();
        let mut alice = join(&router, "alice");
        let mut bob = join(&router, "bob");

        match alice.drain().as_slice() {
            [RelayEnvelope::EndpointConnected { endpoint }] => assert_eq!(endpoint.id, bob.id()),
            other => panic!("unexpected envelopes {other:?}"),
        }
        assert!(bob.drain().is_empty());
    }

    #[test_timeout::timeout]
    fn first_sender_is_impolite() {
        let router = MessageRouter::new();
        let alice = join(&router, "alice");
        let mut bob = join(&router, "bob");

        router.handle(&alice.id(), offer_to(&bob.id())).unwrap();
        match bob.drain().as_slice() {
            [RelayEnvelope::Description {
                from_endpoint,
                polite,
                ..
            }] => {
                assert_eq!(from_endpoint.id, alice.id());
                assert!(!from_endpoint.polite);
                assert!(*polite, "recipient of the first offer is polite");
            }
            other => panic!("unexpected envelopes {other:?}"),
        }
        assert!(router.registry().get(&bob.id()).unwrap().snapshot().polite);
    }

    #[test_timeout::timeout]
    fn roles_stay_fixed_in_both_directions() {
        let router = MessageRouter::new();
        let mut alice = join(&router, "alice");
        let mut bob = join(&router, "bob");
        alice.drain();

        router.handle(&alice.id(), offer_to(&bob.id())).unwrap();
        router.handle(&bob.id(), offer_to(&alice.id())).unwrap();
        router
            .handle(
                &bob.id(),
                ClientEnvelope::Candidate {
                    send_to_id: alice.id(),
                    data: json!({ "candidate": "a=1" }),
                },
            )
            .unwrap();

        for envelope in alice.drain() {
            match envelope {
                RelayEnvelope::Description { polite, .. }
                | RelayEnvelope::Candidate { polite, .. } => assert!(!polite),
                other => panic!("unexpected envelope {other:?}"),
            }
        }
        match bob.drain().as_slice() {
            [RelayEnvelope::Description { polite, .. }] => assert!(*polite),
            other => panic!("unexpected envelopes {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn unknown_recipient_mutates_nothing() {
        let router = MessageRouter::new();
        let alice = join(&router, "alice");

        let err = router.handle(&alice.id(), offer_to("ghost")).unwrap_err();
        assert_eq!(err, RouteError::UnknownRecipient("ghost".into()));
        match err.to_envelope() {
            RelayEnvelope::Error {
                code, recipient_id, ..
            } => {
                assert_eq!(code, ErrorCode::UnknownRecipient);
                assert_eq!(recipient_id.as_deref(), Some("ghost"));
            }
            other => panic!("unexpected envelope {other:?}"),
        }
        assert_eq!(router.registry().len(), 1);
        assert!(router.politeness().is_empty());
    }

    #[test_timeout::timeout]
    fn self_addressed_envelopes_are_rejected() {
        let router = MessageRouter::new();
        let alice = join(&router, "alice");
        let err = router.handle(&alice.id(), offer_to(&alice.id())).unwrap_err();
        assert_eq!(err, RouteError::Validation(EnvelopeError::SelfAddressed));
        assert_eq!(err.metric_label(), "validation");
    }

    #[test_timeout::timeout]
    fn repeated_introduction_is_a_validation_error() {
        let router = MessageRouter::new();
        let alice = join(&router, "alice");
        let err = router
            .handle(
                &alice.id(),
                ClientEnvelope::Introduction {
                    display_name: "again".into(),
                },
            )
            .unwrap_err();
        assert_eq!(err, RouteError::Validation(EnvelopeError::AlreadyIntroduced));
    }

    #[test_timeout::timeout]
    fn ping_answers_pong() {
        let router = MessageRouter::new();
        let mut alice = join(&router, "alice");
        router.handle(&alice.id(), ClientEnvelope::Ping).unwrap();
        assert_eq!(alice.drain(), vec![RelayEnvelope::Pong]);
    }

    #[test_timeout::timeout]
    fn call_preassigns_caller_impolite() {
        let router = MessageRouter::new();
        let mut alice = join(&router, "alice");
        let mut bob = join(&router, "bob");
        alice.drain();

        router
            .handle(
                &alice.id(),
                ClientEnvelope::Call {
                    callee_id: bob.id(),
                },
            )
            .unwrap();
        match alice.drain().as_slice() {
            [RelayEnvelope::UpdateSelf { endpoint }] => assert!(!endpoint.polite),
            other => panic!("unexpected envelopes {other:?}"),
        }
        match bob.drain().as_slice() {
            [RelayEnvelope::Call { caller }] => assert_eq!(caller.id, alice.id()),
            other => panic!("unexpected envelopes {other:?}"),
        }

        // bob offering first afterwards does not flip the roles
        router.handle(&bob.id(), offer_to(&alice.id())).unwrap();
        match alice.drain().as_slice() {
            [RelayEnvelope::Description { polite, .. }] => assert!(!polite),
            other => panic!("unexpected envelopes {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn dropping_a_connection_broadcasts_and_retires() {
        let router = MessageRouter::new();
        let alice = join(&router, "alice");
        let mut bob = join(&router, "bob");
        let alice_id = alice.id();
        router.handle(&alice_id, offer_to(&bob.id())).unwrap();
        bob.drain();
        assert_eq!(router.politeness().len(), 1);

        drop(alice);
        match bob.drain().as_slice() {
            [RelayEnvelope::EndpointDisconnected { endpoint }] => assert_eq!(endpoint.id, alice_id),
            other => panic!("unexpected envelopes {other:?}"),
        }
        assert!(router.politeness().is_empty());
        assert_eq!(
            router.handle(&bob.id(), offer_to(&alice_id)).unwrap_err(),
            RouteError::UnknownRecipient(alice_id)
        );
    }

    #[test_timeout::timeout]
    fn evict_is_idempotent_with_connection_drop() {
        let router = MessageRouter::new();
        let alice = join(&router, "alice");
        let mut bob = join(&router, "bob");
        let alice_id = alice.id();

        assert!(router.evict(&alice_id));
        assert!(!router.evict(&alice_id));
        drop(alice);

        let disconnects = bob
            .drain()
            .into_iter()
            .filter(|envelope| matches!(envelope, RelayEnvelope::EndpointDisconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[test_timeout::timeout]
    fn per_pair_role_travels_in_the_envelope() {
        let router = MessageRouter::new();
        let mut alice = join(&router, "alice");
        let bob = join(&router, "bob");
        let carol = join(&router, "carol");

        // alice is polite toward bob but impolite toward carol
        router.handle(&bob.id(), offer_to(&alice.id())).unwrap();
        router.handle(&alice.id(), offer_to(&carol.id())).unwrap();
        alice.drain();

        let candidate = |to: &str| ClientEnvelope::Candidate {
            send_to_id: to.to_string(),
            data: json!({ "candidate": "a=1" }),
        };
        router.handle(&carol.id(), candidate(&alice.id())).unwrap();
        router.handle(&bob.id(), candidate(&alice.id())).unwrap();

        let roles: Vec<(String, bool)> = alice
            .drain()
            .into_iter()
            .filter_map(|envelope| match envelope {
                RelayEnvelope::Candidate {
                    from_endpoint,
                    polite,
                    ..
                } => Some((from_endpoint.display_name, polite)),
                _ => None,
            })
            .collect();
        assert_eq!(roles, vec![("carol".to_string(), false), ("bob".to_string(), true)]);

        // the snapshot only holds the role from the last routed pair
        let snapshot = router.registry().get(&alice.id()).unwrap().snapshot();
        assert!(snapshot.polite);
    }
}
