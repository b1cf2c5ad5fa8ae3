//! Projection cursor (checkpoint) tracking.
//!
//! Cursors record the last processed `sequence_number` per
//! `(site, aggregate, projection)` stream. They give projections:
//! - idempotency (replays at or below the cursor are skipped)
//! - resume after crash (continue from the last offset)
//! - deterministic rebuilds (clear cursors, replay from scratch)

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sudspoint_core::{AggregateId, SiteId};

use super::ProjectionError;

/// Pluggable cursor persistence for projections that must survive a restart.
pub trait ProjectionCursorStore: Send + Sync {
    /// Last processed sequence_number for a (site, aggregate, projection) stream.
    fn get_cursor(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        projection_name: &str,
    ) -> Option<u64>;

    /// Move the cursor to a new sequence_number.
    fn update_cursor(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        projection_name: &str,
        sequence_number: u64,
    );

    /// Clear all cursors for a site + projection (for rebuilds).
    fn clear_cursors(&self, site_id: SiteId, projection_name: &str);
}

/// Map-backed cursor store.
///
/// Process-local: cursors do not survive a restart, which matches the
/// in-memory read models they guard (both rebuild from the event log).
#[derive(Debug, Default)]
pub struct InMemoryCursorStore {
    cursors: RwLock<HashMap<(SiteId, AggregateId, String), u64>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProjectionCursorStore for InMemoryCursorStore {
    fn get_cursor(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        projection_name: &str,
    ) -> Option<u64> {
        let map = self.cursors.read().ok()?;
        map.get(&(site_id, aggregate_id, projection_name.to_string()))
            .copied()
    }

    fn update_cursor(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        projection_name: &str,
        sequence_number: u64,
    ) {
        if let Ok(mut map) = self.cursors.write() {
            map.insert(
                (site_id, aggregate_id, projection_name.to_string()),
                sequence_number,
            );
        }
    }

    fn clear_cursors(&self, site_id: SiteId, projection_name: &str) {
        if let Ok(mut map) = self.cursors.write() {
            map.retain(|(s, _, name), _| !(*s == site_id && name == projection_name));
        }
    }
}

/// Per-stream cursor state shared by every projection.
///
/// Keeps a fast local map and optionally mirrors into a
/// [`ProjectionCursorStore`] for durability. The local map is authoritative
/// within the process; the store is consulted only when present.
#[derive(Debug)]
pub struct ProjectionCursors<C = InMemoryCursorStore> {
    name: String,
    local: RwLock<HashMap<(SiteId, AggregateId), u64>>,
    persistent: Option<Arc<C>>,
}

impl ProjectionCursors {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: RwLock::new(HashMap::new()),
            persistent: None,
        }
    }
}

impl<C> ProjectionCursors<C>
where
    C: ProjectionCursorStore,
{
    pub fn with_store(name: impl Into<String>, store: Arc<C>) -> Self {
        Self {
            name: name.into(),
            local: RwLock::new(HashMap::new()),
            persistent: Some(store),
        }
    }

    pub fn get(&self, site_id: SiteId, aggregate_id: AggregateId) -> u64 {
        if let Some(ref store) = self.persistent {
            return store
                .get_cursor(site_id, aggregate_id, &self.name)
                .unwrap_or(0);
        }
        match self.local.read() {
            Ok(map) => *map.get(&(site_id, aggregate_id)).unwrap_or(&0),
            Err(_) => 0,
        }
    }

    /// Gate an incoming sequence number for at-least-once delivery.
    ///
    /// `Ok(true)`: new, apply it. `Ok(false)`: replay at or below the
    /// cursor, skip without error. `Err`: zero or gapped sequence number;
    /// the stream is unusable for this consumer until rebuilt.
    pub fn admit(
        &self,
        site_id: SiteId,
        aggregate_id: AggregateId,
        sequence_number: u64,
    ) -> Result<bool, ProjectionError> {
        let last = self.get(site_id, aggregate_id);
        if sequence_number == 0 {
            return Err(ProjectionError::NonMonotonicSequence {
                last,
                found: sequence_number,
            });
        }
        if sequence_number <= last {
            return Ok(false);
        }
        if last != 0 && sequence_number != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence {
                last,
                found: sequence_number,
            });
        }
        Ok(true)
    }

    pub fn advance(&self, site_id: SiteId, aggregate_id: AggregateId, sequence_number: u64) {
        if let Ok(mut map) = self.local.write() {
            map.insert((site_id, aggregate_id), sequence_number);
        }
        if let Some(ref store) = self.persistent {
            store.update_cursor(site_id, aggregate_id, &self.name, sequence_number);
        }
    }

    pub fn clear_site(&self, site_id: SiteId) {
        if let Ok(mut map) = self.local.write() {
            map.retain(|(s, _), _| *s != site_id);
        }
        if let Some(ref store) = self.persistent {
            store.clear_cursors(site_id, &self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_skips_replays_and_rejects_gaps() {
        let cursors: ProjectionCursors = ProjectionCursors::new("test");
        let site_id = SiteId::new();
        let aggregate_id = AggregateId::new();

        assert!(cursors.admit(site_id, aggregate_id, 1).unwrap());
        cursors.advance(site_id, aggregate_id, 1);

        // Replay of an already processed sequence number is a silent skip.
        assert!(!cursors.admit(site_id, aggregate_id, 1).unwrap());

        // A gap is an error, not a skip.
        assert!(cursors.admit(site_id, aggregate_id, 3).is_err());

        assert!(cursors.admit(site_id, aggregate_id, 2).unwrap());
    }

    #[test]
    fn clear_site_resets_cursors_for_rebuild() {
        let cursors: ProjectionCursors = ProjectionCursors::new("test");
        let site_id = SiteId::new();
        let aggregate_id = AggregateId::new();

        cursors.advance(site_id, aggregate_id, 5);
        cursors.clear_site(site_id);
        assert_eq!(cursors.get(site_id, aggregate_id), 0);
    }

    #[test]
    fn persistent_store_is_consulted_when_present() {
        let store = Arc::new(InMemoryCursorStore::new());
        let cursors = ProjectionCursors::with_store("test", store.clone());
        let site_id = SiteId::new();
        let aggregate_id = AggregateId::new();

        cursors.advance(site_id, aggregate_id, 7);
        assert_eq!(store.get_cursor(site_id, aggregate_id, "test"), Some(7));
        assert_eq!(cursors.get(site_id, aggregate_id), 7);
    }
}
