use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tandem_proto::{EnvelopeKind, RelayEnvelope};
use tokio::sync::mpsc;
use tracing::trace;

struct Subscriber {
    /// Only deliver envelopes whose subject has this endpoint id.
    from: Option<String>,
    tx: mpsc::UnboundedSender<RelayEnvelope>,
}

impl Subscriber {
    fn wants(&self, envelope: &RelayEnvelope) -> bool {
        match &self.from {
            None => true,
            Some(id) => envelope.subject().is_some_and(|subject| &subject.id == id),
        }
    }
}

/// Routes inbound relay envelopes to subscribers by envelope kind.
///
/// Each subscription gets its own unbounded queue. Subscriptions whose receiver
/// has been dropped are pruned on the next publish of a matching kind.
/// After [`close`](Self::close) every receiver sees the end of its queue.
#[derive(Default)]
pub struct DispatchTable {
    routes: RwLock<HashMap<EnvelopeKind, Vec<Subscriber>>>,
    closed: AtomicBool,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kinds: &[EnvelopeKind]) -> mpsc::UnboundedReceiver<RelayEnvelope> {
        self.register(kinds, None)
    }

    /// Like [`subscribe`](Self::subscribe), but only for envelopes about `endpoint_id`.
    pub fn subscribe_from(
        &self,
        kinds: &[EnvelopeKind],
        endpoint_id: &str,
    ) -> mpsc::UnboundedReceiver<RelayEnvelope> {
        self.register(kinds, Some(endpoint_id.to_string()))
    }

    fn register(
        &self,
        kinds: &[EnvelopeKind],
        from: Option<String>,
    ) -> mpsc::UnboundedReceiver<RelayEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.write();
        if self.closed.load(Ordering::Acquire) {
            // tx dropped here, so the receiver is already finished
            return rx;
        }
        for kind in kinds {
            routes.entry(*kind).or_default().push(Subscriber {
                from: from.clone(),
                tx: tx.clone(),
            });
        }
        rx
    }

    /// Deliver `envelope` to every interested subscriber. Returns the number of
    /// queues it was delivered to.
    pub fn publish(&self, envelope: &RelayEnvelope) -> usize {
        let kind = envelope.kind();
        let mut routes = self.routes.write();
        let Some(subscribers) = routes.get_mut(&kind) else {
            trace!(kind = %kind, "no subscribers for envelope");
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|subscriber| {
            if subscriber.tx.is_closed() {
                return false;
            }
            if !subscriber.wants(envelope) {
                return true;
            }
            match subscriber.tx.send(envelope.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        if subscribers.is_empty() {
            routes.remove(&kind);
        }
        delivered
    }

    /// Drop every subscription and refuse new ones. Called when the relay
    /// connection ends.
    pub fn close(&self) {
        let mut routes = self.routes.write();
        self.closed.store(true, Ordering::Release);
        let dropped: usize = routes.drain().map(|(_, subscribers)| subscribers.len()).sum();
        trace!(dropped, "dispatch table closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self, kind: EnvelopeKind) -> usize {
        self.routes.read().get(&kind).map_or(0, Vec::len)
    }
}
