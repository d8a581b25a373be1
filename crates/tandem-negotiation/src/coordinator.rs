//! Perfect negotiation against a single remote endpoint.
//!
//! Both sides run the same code. When offers collide, the side the relay
//! marked polite rolls its own offer back and answers; the impolite side
//! ignores the remote offer and waits for the answer to its own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tandem_proto::{
    ClientEnvelope, DescriptionType, EndpointSnapshot, RelayEnvelope, SessionDescription,
};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capability::{SessionCapability, SignalSink};
use crate::error::{CapabilityError, NegotiationError, NegotiationStage};

#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Reset a negotiation that has not settled within this long.
    /// `None` disables the watchdog.
    pub negotiation_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Externally observable state, combining the phase with the in-flight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Stable,
    MakingOffer,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Offer applied locally and handed to the sink.
    Sent,
    /// Not stable, or another offer already in flight.
    Skipped,
    /// A remote offer won the collision while ours was being prepared.
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionOutcome {
    /// Remote answer (or rollback) applied.
    Applied,
    /// Remote offer applied and an answer sent back.
    Answered,
    /// Colliding offer dropped because this side is impolite.
    IgnoredCollision,
    /// Answer arrived with no local offer outstanding.
    StaleAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Added,
    /// Belonged to an ignored offer.
    Discarded,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    attempt: u64,
    started_at: Instant,
}

#[derive(Debug)]
struct NegotiationState {
    in_flight: Option<InFlight>,
    next_attempt: u64,
    ignore_offer: bool,
    phase: SignalingPhase,
    phase_since: Instant,
    closed: bool,
}

impl NegotiationState {
    fn new() -> Self {
        Self {
            in_flight: None,
            next_attempt: 0,
            ignore_offer: false,
            phase: SignalingPhase::Stable,
            phase_since: Instant::now(),
            closed: false,
        }
    }

    fn set_phase(&mut self, phase: SignalingPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.phase_since = Instant::now();
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        !self.closed && self.in_flight.is_some_and(|slot| slot.attempt == attempt)
    }
}

/// Releases the in-flight slot when the offer task ends, however it ends.
struct InFlightSlot<'a> {
    state: &'a Mutex<NegotiationState>,
    attempt: u64,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.in_flight.is_some_and(|slot| slot.attempt == self.attempt) {
            state.in_flight = None;
        }
    }
}

pub struct Coordinator {
    local_id: String,
    remote: EndpointSnapshot,
    capability: Arc<dyn SessionCapability>,
    sink: Arc<dyn SignalSink>,
    config: CoordinatorConfig,
    state: Mutex<NegotiationState>,
}

impl Coordinator {
    pub fn new(
        local_id: impl Into<String>,
        remote: EndpointSnapshot,
        capability: Arc<dyn SessionCapability>,
        sink: Arc<dyn SignalSink>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.into(),
            remote,
            capability,
            sink,
            config,
            state: Mutex::new(NegotiationState::new()),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote(&self) -> &EndpointSnapshot {
        &self.remote
    }

    pub fn state(&self) -> CoordinatorState {
        let state = self.state.lock();
        if state.closed {
            CoordinatorState::Closed
        } else if state.in_flight.is_some() {
            CoordinatorState::MakingOffer
        } else {
            match state.phase {
                SignalingPhase::Stable => CoordinatorState::Stable,
                SignalingPhase::HaveLocalOffer => CoordinatorState::HaveLocalOffer,
                SignalingPhase::HaveRemoteOffer => CoordinatorState::HaveRemoteOffer,
            }
        }
    }

    pub fn phase(&self) -> SignalingPhase {
        self.state.lock().phase
    }

    /// Whether the last remote offer was dropped as an impolite collision.
    pub fn ignoring_offer(&self) -> bool {
        self.state.lock().ignore_offer
    }

    /// Start a local offer if the session is idle.
    pub async fn negotiation_needed(&self) -> Result<OfferOutcome, NegotiationError> {
        let attempt = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }
            if state.phase != SignalingPhase::Stable || state.in_flight.is_some() {
                debug!(
                    remote_id = %self.remote.id,
                    phase = ?state.phase,
                    "negotiation already in progress; skipping offer"
                );
                return Ok(OfferOutcome::Skipped);
            }
            state.next_attempt += 1;
            let attempt = state.next_attempt;
            state.in_flight = Some(InFlight {
                attempt,
                started_at: Instant::now(),
            });
            attempt
        };
        let _slot = InFlightSlot {
            state: &self.state,
            attempt,
        };

        let offer = match self.capability.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return Err(self.offer_failed(attempt, NegotiationStage::CreateOffer, err)),
        };
        if !self.is_current(attempt) {
            debug!(remote_id = %self.remote.id, attempt, "offer superseded before apply");
            return Ok(OfferOutcome::Superseded);
        }

        if let Err(err) = self.capability.set_local_description(offer.clone()).await {
            return Err(self.offer_failed(attempt, NegotiationStage::SetLocalDescription, err));
        }
        {
            let mut state = self.state.lock();
            if !state.is_current(attempt) {
                debug!(remote_id = %self.remote.id, attempt, "offer superseded after apply");
                return Ok(OfferOutcome::Superseded);
            }
            state.set_phase(SignalingPhase::HaveLocalOffer);
        }

        self.send_description(offer)?;
        info!(remote_id = %self.remote.id, attempt, "sent offer");
        Ok(OfferOutcome::Sent)
    }

    /// Apply a description received from the remote endpoint. `polite` is this
    /// side's role toward the sender, as stamped by the relay.
    pub async fn handle_description(
        &self,
        description: SessionDescription,
        polite: bool,
    ) -> Result<DescriptionOutcome, NegotiationError> {
        let description_type = description.description_type;
        let is_offer = description.is_offer();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }
            let making_offer = state.in_flight.is_some();
            let collision =
                is_offer && (making_offer || state.phase != SignalingPhase::Stable);
            state.ignore_offer = collision && !polite;
            if state.ignore_offer {
                info!(
                    remote_id = %self.remote.id,
                    phase = ?state.phase,
                    making_offer,
                    "ignoring colliding offer (impolite)"
                );
                counter!("tandem_negotiation_ignored_collisions_total", 1);
                return Ok(DescriptionOutcome::IgnoredCollision);
            }

            match description_type {
                DescriptionType::Answer | DescriptionType::Pranswer
                    if state.phase != SignalingPhase::HaveLocalOffer =>
                {
                    debug!(
                        remote_id = %self.remote.id,
                        phase = ?state.phase,
                        "dropping answer with no local offer outstanding"
                    );
                    return Ok(DescriptionOutcome::StaleAnswer);
                }
                _ => {}
            }

            if collision {
                info!(remote_id = %self.remote.id, "offer collision; rolling back local offer");
                state.in_flight = None;
            }
            if is_offer {
                state.set_phase(SignalingPhase::HaveRemoteOffer);
            }
        }

        if let Err(err) = self.capability.set_remote_description(description).await {
            return Err(self.failed(NegotiationStage::SetRemoteDescription, err));
        }

        if !is_offer {
            if description_type != DescriptionType::Pranswer {
                self.state.lock().set_phase(SignalingPhase::Stable);
            }
            debug!(remote_id = %self.remote.id, kind = %description_type, "applied remote description");
            return Ok(DescriptionOutcome::Applied);
        }

        let answer = match self.capability.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return Err(self.failed(NegotiationStage::CreateAnswer, err)),
        };
        if let Err(err) = self.capability.set_local_description(answer.clone()).await {
            return Err(self.failed(NegotiationStage::SetLocalDescription, err));
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }
            state.set_phase(SignalingPhase::Stable);
        }

        self.send_description(answer)?;
        info!(remote_id = %self.remote.id, "answered remote offer");
        Ok(DescriptionOutcome::Answered)
    }

    pub async fn handle_candidate(
        &self,
        candidate: Value,
    ) -> Result<CandidateOutcome, NegotiationError> {
        if self.state.lock().closed {
            return Err(NegotiationError::Closed);
        }
        match self.capability.add_remote_candidate(candidate).await {
            Ok(()) => Ok(CandidateOutcome::Added),
            Err(err) if self.ignoring_offer() => {
                debug!(
                    remote_id = %self.remote.id,
                    error = %err,
                    "discarding candidate for ignored offer"
                );
                Ok(CandidateOutcome::Discarded)
            }
            Err(err) => {
                let stage = NegotiationStage::AddCandidate;
                warn!(remote_id = %self.remote.id, stage = %stage, error = %err, "failed to add remote candidate");
                counter!(
                    "tandem_negotiation_capability_failures_total",
                    1,
                    "stage" => stage.as_str()
                );
                Err(NegotiationError::capability(stage, err))
            }
        }
    }

    /// Reset a negotiation that has been unsettled for longer than `max_age`.
    /// Returns whether anything was reset.
    pub fn reap_stuck(&self, max_age: Duration) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        let offer_stuck = state
            .in_flight
            .is_some_and(|slot| slot.started_at.elapsed() >= max_age);
        let phase_stuck =
            state.phase != SignalingPhase::Stable && state.phase_since.elapsed() >= max_age;
        if !offer_stuck && !phase_stuck {
            return false;
        }
        warn!(
            remote_id = %self.remote.id,
            phase = ?state.phase,
            making_offer = state.in_flight.is_some(),
            max_age_ms = max_age.as_millis() as u64,
            "negotiation stuck; resetting to stable"
        );
        state.in_flight = None;
        state.ignore_offer = false;
        state.set_phase(SignalingPhase::Stable);
        true
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.in_flight = None;
        state.ignore_offer = false;
        state.set_phase(SignalingPhase::Stable);
        info!(remote_id = %self.remote.id, "negotiation closed");
    }

    /// Drive the coordinator from the envelopes the relay sends about its
    /// remote endpoint. Returns once the remote disconnects or `inbound` closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<RelayEnvelope>) {
        let mut watchdog = self.config.negotiation_timeout.map(|timeout| {
            let period = (timeout / 2).max(Duration::from_millis(10));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            (timeout, interval)
        });

        loop {
            let envelope = tokio::select! {
                envelope = inbound.recv() => envelope,
                timeout = next_sweep(&mut watchdog) => {
                    self.reap_stuck(timeout);
                    continue;
                }
            };
            let Some(envelope) = envelope else {
                debug!(remote_id = %self.remote.id, "inbound channel closed");
                break;
            };
            if envelope.subject().map(|subject| subject.id.as_str()) != Some(self.remote.id.as_str())
            {
                continue;
            }

            match envelope {
                RelayEnvelope::Description { data, polite, .. } => {
                    match self.handle_description(data, polite).await {
                        Ok(outcome) => debug!(remote_id = %self.remote.id, ?outcome, "handled description"),
                        Err(NegotiationError::Closed) => break,
                        Err(err) => warn!(remote_id = %self.remote.id, error = %err, "description failed"),
                    }
                }
                RelayEnvelope::Candidate { data, .. } => match self.handle_candidate(data).await {
                    Ok(outcome) => debug!(remote_id = %self.remote.id, ?outcome, "handled candidate"),
                    Err(NegotiationError::Closed) => break,
                    Err(err) => warn!(remote_id = %self.remote.id, error = %err, "candidate failed"),
                },
                RelayEnvelope::EndpointDisconnected { .. } => {
                    info!(remote_id = %self.remote.id, "remote endpoint disconnected");
                    break;
                }
                other => debug!(remote_id = %self.remote.id, kind = %other.kind(), "ignoring envelope"),
            }
        }
        self.close();
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.state.lock().is_current(attempt)
    }

    fn send_description(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        self.sink.send(ClientEnvelope::Description {
            send_to_id: self.remote.id.clone(),
            data: description,
        })
    }

    fn offer_failed(
        &self,
        attempt: u64,
        stage: NegotiationStage,
        err: CapabilityError,
    ) -> NegotiationError {
        // a superseded attempt no longer owns the phase
        if !self.is_current(attempt) {
            debug!(remote_id = %self.remote.id, stage = %stage, error = %err, "superseded offer failed");
            return NegotiationError::capability(stage, err);
        }
        self.failed(stage, err)
    }

    fn failed(&self, stage: NegotiationStage, err: CapabilityError) -> NegotiationError {
        warn!(remote_id = %self.remote.id, stage = %stage, error = %err, "negotiation step failed");
        counter!(
            "tandem_negotiation_capability_failures_total",
            1,
            "stage" => stage.as_str()
        );
        {
            let mut state = self.state.lock();
            state.in_flight = None;
            state.set_phase(SignalingPhase::Stable);
        }
        NegotiationError::capability(stage, err)
    }
}

async fn next_sweep(watchdog: &mut Option<(Duration, Interval)>) -> Duration {
    match watchdog {
        Some((timeout, interval)) => {
            interval.tick().await;
            *timeout
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCapability;
    use serde_json::json;
    use tokio::sync::Barrier;

    struct Side {
        coordinator: Arc<Coordinator>,
        capability: Arc<ScriptedCapability>,
        outbound: mpsc::UnboundedReceiver<ClientEnvelope>,
    }

    fn snapshot(id: &str, name: &str) -> EndpointSnapshot {
        EndpointSnapshot {
            id: id.into(),
            display_name: name.into(),
            polite: false,
        }
    }

    fn side(local: &str, remote: EndpointSnapshot, capability: ScriptedCapability) -> Side {
        let capability = Arc::new(capability);
        let (tx, outbound) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            local,
            remote,
            capability.clone(),
            Arc::new(tx),
            CoordinatorConfig::default(),
        );
        Side {
            coordinator,
            capability,
            outbound,
        }
    }

    fn alice_and_bob() -> (Side, Side) {
        (
            side("p1", snapshot("p2", "bob"), ScriptedCapability::new("alice")),
            side("p2", snapshot("p1", "alice"), ScriptedCapability::new("bob")),
        )
    }

    fn next_description(outbound: &mut mpsc::UnboundedReceiver<ClientEnvelope>) -> SessionDescription {
        match outbound.try_recv() {
            Ok(ClientEnvelope::Description { data, .. }) => data,
            other => panic!("expected outbound description, got {other:?}"),
        }
    }

    async fn wait_for_state(coordinator: &Coordinator, expected: CoordinatorState) {
        while coordinator.state() != expected {
            tokio::task::yield_now().await;
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn simple_offer_answer() {
        let (mut alice, mut bob) = alice_and_bob();

        assert_eq!(alice.coordinator.negotiation_needed().await.unwrap(), OfferOutcome::Sent);
        assert_eq!(alice.coordinator.state(), CoordinatorState::HaveLocalOffer);
        let offer = next_description(&mut alice.outbound);
        assert_eq!(offer.description_type, DescriptionType::Offer);

        assert_eq!(
            bob.coordinator.handle_description(offer, true).await.unwrap(),
            DescriptionOutcome::Answered
        );
        assert_eq!(bob.coordinator.state(), CoordinatorState::Stable);
        let answer = next_description(&mut bob.outbound);
        assert_eq!(answer.description_type, DescriptionType::Answer);

        assert_eq!(
            alice.coordinator.handle_description(answer, false).await.unwrap(),
            DescriptionOutcome::Applied
        );
        assert_eq!(alice.coordinator.state(), CoordinatorState::Stable);
        assert_eq!(bob.capability.rollbacks(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn simultaneous_offers_resolve_to_one_negotiation() {
        // alice (p1) is impolite toward bob, bob (p2) is polite
        let (mut alice, mut bob) = alice_and_bob();

        let (alice_offer, bob_offer) = tokio::join!(
            alice.coordinator.negotiation_needed(),
            bob.coordinator.negotiation_needed()
        );
        assert_eq!(alice_offer.unwrap(), OfferOutcome::Sent);
        assert_eq!(bob_offer.unwrap(), OfferOutcome::Sent);
        let alice_offer = next_description(&mut alice.outbound);
        let bob_offer = next_description(&mut bob.outbound);

        assert_eq!(
            alice.coordinator.handle_description(bob_offer, false).await.unwrap(),
            DescriptionOutcome::IgnoredCollision
        );
        assert!(alice.coordinator.ignoring_offer());
        assert!(alice.outbound.try_recv().is_err());

        assert_eq!(
            bob.coordinator.handle_description(alice_offer, true).await.unwrap(),
            DescriptionOutcome::Answered
        );
        assert_eq!(bob.capability.rollbacks(), 1);
        let answer = next_description(&mut bob.outbound);

        assert_eq!(
            alice.coordinator.handle_description(answer, false).await.unwrap(),
            DescriptionOutcome::Applied
        );
        assert_eq!(alice.coordinator.state(), CoordinatorState::Stable);
        assert_eq!(bob.coordinator.state(), CoordinatorState::Stable);
        assert!(!alice.coordinator.ignoring_offer());
        assert_eq!(alice.capability.remote_descriptions().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn polite_collision_supersedes_offer_in_flight() {
        let gate = Arc::new(Barrier::new(2));
        let mut alice = side("p1", snapshot("p2", "bob"), ScriptedCapability::new("alice"));
        let mut bob = side(
            "p2",
            snapshot("p1", "alice"),
            ScriptedCapability::new("bob").with_offer_gate(gate.clone()),
        );

        let pending = {
            let coordinator = bob.coordinator.clone();
            tokio::spawn(async move { coordinator.negotiation_needed().await })
        };
        wait_for_state(&bob.coordinator, CoordinatorState::MakingOffer).await;

        alice.coordinator.negotiation_needed().await.unwrap();
        let alice_offer = next_description(&mut alice.outbound);
        assert_eq!(
            bob.coordinator.handle_description(alice_offer, true).await.unwrap(),
            DescriptionOutcome::Answered
        );

        gate.wait().await;
        assert_eq!(pending.await.unwrap().unwrap(), OfferOutcome::Superseded);

        // only the answer went out; the stale offer was dropped
        let answer = next_description(&mut bob.outbound);
        assert_eq!(answer.description_type, DescriptionType::Answer);
        assert!(bob.outbound.try_recv().is_err());
        assert_eq!(bob.coordinator.state(), CoordinatorState::Stable);
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_is_skipped_unless_stable() {
        let (mut alice, _bob) = alice_and_bob();
        alice.coordinator.negotiation_needed().await.unwrap();
        let _ = next_description(&mut alice.outbound);

        assert_eq!(
            alice.coordinator.negotiation_needed().await.unwrap(),
            OfferOutcome::Skipped
        );
        assert!(alice.outbound.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_answer_is_dropped() {
        let (alice, _bob) = alice_and_bob();
        let outcome = alice
            .coordinator
            .handle_description(SessionDescription::answer("v=0 late"), false)
            .await
            .unwrap();
        assert_eq!(outcome, DescriptionOutcome::StaleAnswer);
        assert!(alice.capability.remote_descriptions().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn capability_failure_resets_to_stable() {
        let (mut alice, _bob) = alice_and_bob();
        alice.capability.fail_on(NegotiationStage::SetLocalDescription);

        let err = alice.coordinator.negotiation_needed().await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Capability {
                stage: NegotiationStage::SetLocalDescription,
                ..
            }
        ));
        assert_eq!(alice.coordinator.state(), CoordinatorState::Stable);
        assert!(alice.outbound.try_recv().is_err());

        alice.capability.clear_failures();
        assert_eq!(alice.coordinator.negotiation_needed().await.unwrap(), OfferOutcome::Sent);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_answer_leaves_no_remote_offer_behind() {
        let (_alice, bob) = alice_and_bob();
        bob.capability.fail_on(NegotiationStage::CreateAnswer);

        let err = bob
            .coordinator
            .handle_description(SessionDescription::offer("v=0 alice"), true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Capability {
                stage: NegotiationStage::CreateAnswer,
                ..
            }
        ));
        assert_eq!(bob.coordinator.state(), CoordinatorState::Stable);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_for_ignored_offers_are_discarded() {
        let (mut alice, _bob) = alice_and_bob();
        alice.coordinator.negotiation_needed().await.unwrap();
        let _ = next_description(&mut alice.outbound);
        alice
            .coordinator
            .handle_description(SessionDescription::offer("v=0 bob"), false)
            .await
            .unwrap();

        alice.capability.fail_on(NegotiationStage::AddCandidate);
        let outcome = alice
            .coordinator
            .handle_candidate(json!({ "candidate": "a=bob" }))
            .await
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::Discarded);
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidate_failure_without_collision_is_an_error() {
        let (alice, _bob) = alice_and_bob();
        assert_eq!(
            alice
                .coordinator
                .handle_candidate(json!({ "candidate": "a=1" }))
                .await
                .unwrap(),
            CandidateOutcome::Added
        );
        assert_eq!(alice.capability.candidates().len(), 1);

        alice.capability.fail_on(NegotiationStage::AddCandidate);
        let err = alice
            .coordinator
            .handle_candidate(json!({ "candidate": "a=2" }))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Capability {
                stage: NegotiationStage::AddCandidate,
                ..
            }
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn watchdog_resets_stuck_offer() {
        let gate = Arc::new(Barrier::new(2));
        let alice = side(
            "p1",
            snapshot("p2", "bob"),
            ScriptedCapability::new("alice").with_offer_gate(gate.clone()),
        );

        let pending = {
            let coordinator = alice.coordinator.clone();
            tokio::spawn(async move { coordinator.negotiation_needed().await })
        };
        wait_for_state(&alice.coordinator, CoordinatorState::MakingOffer).await;

        assert!(!alice.coordinator.reap_stuck(Duration::from_secs(60)));
        assert!(alice.coordinator.reap_stuck(Duration::ZERO));
        assert_eq!(alice.coordinator.state(), CoordinatorState::Stable);

        gate.wait().await;
        assert_eq!(pending.await.unwrap().unwrap(), OfferOutcome::Superseded);
    }

    #[test_timeout::tokio_timeout_test]
    async fn watchdog_resets_unanswered_offer() {
        let (mut alice, _bob) = alice_and_bob();
        alice.coordinator.negotiation_needed().await.unwrap();
        let _ = next_description(&mut alice.outbound);
        assert_eq!(alice.coordinator.state(), CoordinatorState::HaveLocalOffer);

        assert!(alice.coordinator.reap_stuck(Duration::ZERO));
        assert_eq!(alice.coordinator.state(), CoordinatorState::Stable);
        assert!(!alice.coordinator.reap_stuck(Duration::ZERO));
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_coordinator_rejects_work() {
        let (alice, _bob) = alice_and_bob();
        alice.coordinator.close();
        assert_eq!(alice.coordinator.state(), CoordinatorState::Closed);
        assert!(matches!(
            alice.coordinator.negotiation_needed().await,
            Err(NegotiationError::Closed)
        ));
        assert!(matches!(
            alice.coordinator.handle_candidate(json!({})).await,
            Err(NegotiationError::Closed)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn run_answers_offers_until_remote_disconnects() {
        let (_alice, mut bob) = alice_and_bob();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(bob.coordinator.clone().run(inbound_rx));

        let alice = snapshot("p1", "alice");
        inbound_tx
            .send(RelayEnvelope::Description {
                from_endpoint: alice.clone(),
                data: SessionDescription::offer("v=0 alice"),
                polite: true,
            })
            .unwrap();
        inbound_tx
            .send(RelayEnvelope::Candidate {
                from_endpoint: alice.clone(),
                data: json!({ "candidate": "a=alice" }),
                polite: true,
            })
            .unwrap();
        // not ours
        inbound_tx
            .send(RelayEnvelope::Candidate {
                from_endpoint: snapshot("p9", "mallory"),
                data: json!({ "candidate": "a=mallory" }),
                polite: true,
            })
            .unwrap();
        inbound_tx
            .send(RelayEnvelope::EndpointDisconnected { endpoint: alice })
            .unwrap();

        driver.await.unwrap();
        let answer = next_description(&mut bob.outbound);
        assert_eq!(answer.description_type, DescriptionType::Answer);
        assert_eq!(bob.capability.candidates(), vec![json!({ "candidate": "a=alice" })]);
        assert_eq!(bob.coordinator.state(), CoordinatorState::Closed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn run_resets_unanswered_offer_on_timeout() {
        let capability = Arc::new(ScriptedCapability::new("alice"));
        let (tx, mut outbound) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            "p1",
            snapshot("p2", "bob"),
            capability,
            Arc::new(tx),
            CoordinatorConfig {
                negotiation_timeout: Some(Duration::from_millis(100)),
            },
        );
        let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(coordinator.clone().run(inbound_rx));

        assert_eq!(coordinator.negotiation_needed().await.unwrap(), OfferOutcome::Sent);
        assert_eq!(coordinator.state(), CoordinatorState::HaveLocalOffer);
        let _offer = next_description(&mut outbound);

        // bob never answers
        while coordinator.state() != CoordinatorState::Stable {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(coordinator.negotiation_needed().await.unwrap(), OfferOutcome::Sent);

        driver.abort();
    }

    #[test_timeout::tokio_timeout_test]
    async fn run_closes_when_inbound_channel_closes() {
        let (_alice, bob) = alice_and_bob();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(bob.coordinator.clone().run(inbound_rx));

        drop(inbound_tx);
        driver.await.unwrap();
        assert_eq!(bob.coordinator.state(), CoordinatorState::Closed);
    }
}
