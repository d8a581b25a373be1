//! Scripted [`SessionCapability`] for exercising coordinators without a media stack.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tandem_proto::{DescriptionType, SessionDescription};
use tokio::sync::Barrier;

use crate::capability::SessionCapability;
use crate::error::{CapabilityError, NegotiationStage};

#[derive(Debug, Default)]
struct Recorded {
    local_offer_pending: bool,
    rollbacks: usize,
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    candidates: Vec<Value>,
}

/// Produces descriptions like `"{label} offer 1"` and records what it was asked
/// to apply. A remote offer applied over a pending local offer counts as a
/// rollback.
pub struct ScriptedCapability {
    label: String,
    sequence: AtomicU64,
    offer_gate: Option<Arc<Barrier>>,
    failures: Mutex<HashSet<NegotiationStage>>,
    recorded: Mutex<Recorded>,
}

impl ScriptedCapability {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            sequence: AtomicU64::new(0),
            offer_gate: None,
            failures: Mutex::new(HashSet::new()),
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// Every `create_offer` waits on `gate` before returning.
    pub fn with_offer_gate(mut self, gate: Arc<Barrier>) -> Self {
        self.offer_gate = Some(gate);
        self
    }

    pub fn fail_on(&self, stage: NegotiationStage) {
        self.failures.lock().insert(stage);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn rollbacks(&self) -> usize {
        self.recorded.lock().rollbacks
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.recorded.lock().local.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.recorded.lock().remote.clone()
    }

    pub fn candidates(&self) -> Vec<Value> {
        self.recorded.lock().candidates.clone()
    }

    fn check(&self, stage: NegotiationStage) -> Result<(), CapabilityError> {
        if self.failures.lock().contains(&stage) {
            Err(CapabilityError::new(format!("{} refused {stage}", self.label)))
        } else {
            Ok(())
        }
    }

    fn describe(&self, description_type: DescriptionType) -> SessionDescription {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        SessionDescription::new(
            description_type,
            format!("{} {} {n}", self.label, description_type),
        )
    }
}

#[async_trait]
impl SessionCapability for ScriptedCapability {
    async fn create_offer(&self) -> Result<SessionDescription, CapabilityError> {
        if let Some(gate) = &self.offer_gate {
            gate.wait().await;
        }
        self.check(NegotiationStage::CreateOffer)?;
        Ok(self.describe(DescriptionType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CapabilityError> {
        self.check(NegotiationStage::CreateAnswer)?;
        Ok(self.describe(DescriptionType::Answer))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        self.check(NegotiationStage::SetLocalDescription)?;
        let mut recorded = self.recorded.lock();
        match description.description_type {
            DescriptionType::Offer => recorded.local_offer_pending = true,
            DescriptionType::Rollback => {
                recorded.local_offer_pending = false;
                recorded.rollbacks += 1;
            }
            DescriptionType::Answer | DescriptionType::Pranswer => {}
        }
        recorded.local.push(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CapabilityError> {
        self.check(NegotiationStage::SetRemoteDescription)?;
        let mut recorded = self.recorded.lock();
        match description.description_type {
            DescriptionType::Offer if recorded.local_offer_pending => {
                recorded.local_offer_pending = false;
                recorded.rollbacks += 1;
            }
            DescriptionType::Answer => recorded.local_offer_pending = false,
            _ => {}
        }
        recorded.remote.push(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), CapabilityError> {
        self.check(NegotiationStage::AddCandidate)?;
        self.recorded.lock().candidates.push(candidate);
        Ok(())
    }
}
