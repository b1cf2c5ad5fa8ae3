use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use sudspoint_core::SiteId;

/// Site-isolated key/value store for disposable read models.
///
/// Read models are projections of the event log and can always be rebuilt,
/// so this interface stays deliberately small: no deletes of single records,
/// only a per-site clear for rebuilds.
pub trait SiteStore<K, V>: Send + Sync {
    fn get(&self, site_id: SiteId, key: &K) -> Option<V>;
    fn upsert(&self, site_id: SiteId, key: K, value: V);
    fn list(&self, site_id: SiteId) -> Vec<V>;
    /// Clear all read-model records for a site (rebuild support).
    fn clear_site(&self, site_id: SiteId);
}

impl<K, V, S> SiteStore<K, V> for Arc<S>
where
    S: SiteStore<K, V> + ?Sized,
{
    fn get(&self, site_id: SiteId, key: &K) -> Option<V> {
        (**self).get(site_id, key)
    }

    fn upsert(&self, site_id: SiteId, key: K, value: V) {
        (**self).upsert(site_id, key, value)
    }

    fn list(&self, site_id: SiteId) -> Vec<V> {
        (**self).list(site_id)
    }

    fn clear_site(&self, site_id: SiteId) {
        (**self).clear_site(site_id)
    }
}

/// In-memory site-isolated store for tests/dev.
#[derive(Debug)]
pub struct InMemorySiteStore<K, V> {
    inner: RwLock<HashMap<(SiteId, K), V>>,
}

impl<K, V> InMemorySiteStore<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemorySiteStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SiteStore<K, V> for InMemorySiteStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, site_id: SiteId, key: &K) -> Option<V> {
        let map = self.inner.read().ok()?;
        map.get(&(site_id, key.clone())).cloned()
    }

    fn upsert(&self, site_id: SiteId, key: K, value: V) {
        if let Ok(mut map) = self.inner.write() {
            map.insert((site_id, key), value);
        }
    }

    fn list(&self, site_id: SiteId) -> Vec<V> {
        let map = match self.inner.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };

        map.iter()
            .filter_map(|((s, _k), v)| if *s == site_id { Some(v.clone()) } else { None })
            .collect()
    }

    fn clear_site(&self, site_id: SiteId) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|(s, _k), _v| *s != site_id);
        }
    }
}
