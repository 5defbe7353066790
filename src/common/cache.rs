//! In-memory cache for derived, immutable metadata.
//!
//! Uses moka's concurrent cache implementation.

use moka::sync::Cache;

/// Thread-safe in-memory cache with configurable capacity.
///
/// Used by the schema mapper to hold one `TableSpec` per entity type for the
/// process lifetime. Values must be pure functions of their key, so an
/// evicted entry is simply derived again with an identical result.
#[derive(Clone)]
pub struct MemCache<K, V> {
    entries: Cache<K, V>,
}

impl<K, V> MemCache<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Allocate a new [`MemCache`].
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Cache::new(capacity as u64),
        }
    }

    pub fn get(
        &self,
        key: &K,
    ) -> Option<V> {
        self.entries.get(key)
    }

    /// Returns the cached value for `key`, deriving and caching it on a miss.
    ///
    /// Derivation errors are returned to the caller and nothing is cached.
    pub fn get_or_try_insert<E>(
        &self,
        key: K,
        derive: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = derive()?;
        self.entries.insert(key, value.clone());
        Ok(value)
    }
}
