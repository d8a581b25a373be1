use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use tandem_proto::{EndpointSnapshot, RelayEnvelope};
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use uuid::Uuid;

/// A connected endpoint and the outbound queue of its websocket.
///
/// `polite` is the role from the most recently routed pair only. An endpoint
/// talking to several peers holds a different role toward each; the role for
/// a given pair travels in the `polite` field of the routed `description` /
/// `candidate` envelope, not in this snapshot.
pub struct Endpoint {
    id: String,
    display_name: String,
    polite: AtomicBool,
    tx: mpsc::UnboundedSender<RelayEnvelope>,
    last_heartbeat: Mutex<Instant>,
    connected_at: DateTime<Utc>,
    close: Notify,
}

impl Endpoint {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            polite: self.polite.load(Ordering::SeqCst),
        }
    }

    /// Queue an envelope for this endpoint. Returns `false` if its socket is gone.
    pub fn send(&self, envelope: RelayEnvelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Ask the connection task to shut down.
    pub fn request_close(&self) {
        self.close.notify_one();
    }

    pub async fn closed(&self) {
        self.close.notified().await;
    }
}

/// Concurrent index of connected endpoints, keyed by relay-assigned id.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    endpoints: Arc<DashMap<String, Arc<Endpoint>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        display_name: &str,
        tx: mpsc::UnboundedSender<RelayEnvelope>,
    ) -> (Arc<Endpoint>, RemovalHandle) {
        let endpoint = loop {
            let id = Uuid::new_v4().to_string();
            match self.endpoints.entry(id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    let endpoint = Arc::new(Endpoint {
                        id,
                        display_name: display_name.to_string(),
                        polite: AtomicBool::new(false),
                        tx,
                        last_heartbeat: Mutex::new(Instant::now()),
                        connected_at: Utc::now(),
                        close: Notify::new(),
                    });
                    entry.insert(Arc::clone(&endpoint));
                    break endpoint;
                }
            }
        };
        debug!(endpoint_id = %endpoint.id, display_name = %endpoint.display_name, "endpoint registered");
        let handle = RemovalHandle {
            registry: self.clone(),
            id: endpoint.id.clone(),
            removed: false,
        };
        (endpoint, handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.endpoints.contains_key(id)
    }

    /// Snapshots of every endpoint except `excluding`, in no particular order.
    pub fn list(&self, excluding: Option<&str>) -> Vec<EndpointSnapshot> {
        self.endpoints
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != excluding)
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// All live endpoints except `excluding`.
    pub fn others(&self, excluding: Option<&str>) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != excluding)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn set_polite(&self, id: &str, polite: bool) -> Option<EndpointSnapshot> {
        let endpoint = self.get(id)?;
        endpoint.polite.store(polite, Ordering::SeqCst);
        Some(endpoint.snapshot())
    }

    /// Record a heartbeat. Returns `false` for unknown ids.
    pub fn touch(&self, id: &str) -> bool {
        match self.get(id) {
            Some(endpoint) => {
                *endpoint.last_heartbeat.lock() = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Ids whose last heartbeat is at least `max_idle` old.
    pub fn stale(&self, max_idle: Duration) -> Vec<String> {
        // collect first so no shard guard is held while callers mutate the map
        let endpoints: Vec<Arc<Endpoint>> = self
            .endpoints
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        endpoints
            .into_iter()
            .filter(|endpoint| endpoint.idle_for() >= max_idle)
            .map(|endpoint| endpoint.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub(crate) fn remove(&self, id: &str) -> Option<EndpointSnapshot> {
        self.endpoints
            .remove(id)
            .map(|(_, endpoint)| endpoint.snapshot())
    }
}

/// Owns the registration of one endpoint. Removing twice is a no-op, and
/// dropping the handle removes the endpoint if that has not happened yet.
pub struct RemovalHandle {
    registry: PeerRegistry,
    id: String,
    removed: bool,
}

impl RemovalHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the removed snapshot the first time only.
    pub fn remove(&mut self) -> Option<EndpointSnapshot> {
        if self.removed {
            return None;
        }
        self.removed = true;
        self.registry.remove(&self.id)
    }
}

impl Drop for RemovalHandle {
    fn drop(&mut self) {
        self.remove();
    }
}
