use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Unordered pair of endpoint ids, stored sorted so `{a, b}` and `{b, a}`
/// share one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PairKey {
    low: String,
    high: String,
}

impl PairKey {
    fn new(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low: low.to_string(),
            high: high.to_string(),
        }
    }

    fn mentions(&self, id: &str) -> bool {
        self.low == id || self.high == id
    }
}

/// Persistent tie-break for offer collisions.
///
/// The first side to ask about a pair is recorded as impolite and the other
/// side as polite. The record never flips while it exists; it is dropped only
/// when one of the ids is retired.
#[derive(Debug, Default)]
pub struct Politeness {
    /// pair -> id of the polite side
    pairs: DashMap<PairKey, String>,
}

impl Politeness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `local` is the polite side toward `other`.
    pub fn polite_of(&self, local: &str, other: &str) -> bool {
        if local == other {
            warn!(endpoint_id = %local, "politeness queried for an endpoint against itself");
            return false;
        }
        let record = self
            .pairs
            .entry(PairKey::new(local, other))
            .or_insert_with(|| {
                debug!(impolite = %local, polite = %other, "recorded politeness for pair");
                other.to_string()
            });
        record.value() == local
    }

    /// Pre-assign roles ahead of the first offer, as call initiation does.
    /// An existing record wins; returns whether `polite` ends up polite.
    pub fn assign(&self, impolite: &str, polite: &str) -> bool {
        if impolite == polite {
            warn!(endpoint_id = %polite, "politeness assignment for an endpoint against itself");
            return false;
        }
        match self.pairs.entry(PairKey::new(impolite, polite)) {
            Entry::Occupied(entry) => {
                let in_force = entry.get() == polite;
                if !in_force {
                    debug!(
                        requested_polite = %polite,
                        recorded_polite = %entry.get(),
                        "keeping existing politeness record"
                    );
                }
                in_force
            }
            Entry::Vacant(entry) => {
                debug!(impolite = %impolite, polite = %polite, "pre-assigned politeness for call");
                entry.insert(polite.to_string());
                true
            }
        }
    }

    /// Forget every pair that mentions `id`. Returns how many records were dropped.
    pub fn retire(&self, id: &str) -> usize {
        let before = self.pairs.len();
        self.pairs.retain(|key, _| !key.mentions(id));
        before.saturating_sub(self.pairs.len())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
