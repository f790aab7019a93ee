//! Per-pass memo of relation existence
//!
//! Existence checks are the expensive part of resolution. One cache lives
//! for one resolution pass, so every relation is asked about at most once;
//! it is never reused across invocations because execution changes what
//! exists.

use slimstate_catalog::{CatalogError, ExistenceOracle, Relation};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Existence answers keyed by relation fqn
///
/// Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct ExistenceCache {
    entries: Arc<RwLock<HashMap<String, bool>>>,
    hits: Arc<AtomicUsize>,
    misses: Arc<AtomicUsize>,
}

impl ExistenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached answer, if any
    pub fn get(&self, relation: &Relation) -> Option<bool> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&relation.fqn()).copied())
    }

    pub fn insert(&self, relation: &Relation, exists: bool) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(relation.fqn(), exists);
        }
    }

    /// Answer from the cache, asking the oracle on a miss
    ///
    /// Errors are not cached; they abort the pass anyway.
    pub async fn check(&self, oracle: &dyn ExistenceOracle, relation: &Relation) -> Result<bool, CatalogError> {
        if let Some(exists) = self.get(relation) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(exists);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let exists = oracle.relation_exists(relation).await?;
        self.insert(relation, exists);

        tracing::debug!(relation = %relation.fqn(), exists, oracle = oracle.name(), "existence check");
        Ok(exists)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Returns (entries, hits, oracle calls)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.len(),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slimstate_catalog::MockWarehouseBuilder;

    #[tokio::test]
    async fn oracle_is_asked_once_per_relation() {
        let warehouse = MockWarehouseBuilder::new().with_relation("dbt", "prod", "seed").build();
        let cache = ExistenceCache::new();
        let seed = Relation::new("dbt", "prod", "seed");
        let missing = Relation::new("dbt", "prod", "view_model");

        for _ in 0..3 {
            assert!(cache.check(&warehouse, &seed).await.unwrap());
            assert!(!cache.check(&warehouse, &missing).await.unwrap());
        }

        assert_eq!(warehouse.existence_checks(&seed).await, 1);
        assert_eq!(warehouse.existence_checks(&missing).await, 1);
        assert_eq!(cache.stats(), (2, 4, 2));
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let warehouse = MockWarehouseBuilder::new().with_connection_failure().build();
        let cache = ExistenceCache::new();
        let seed = Relation::new("dbt", "prod", "seed");

        assert!(cache.check(&warehouse, &seed).await.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.get(&seed), None);
    }

    #[test]
    fn clones_share_entries() {
        let cache = ExistenceCache::new();
        let handle = cache.clone();
        cache.insert(&Relation::new("dbt", "prod", "seed"), false);

        assert_eq!(handle.get(&Relation::new("dbt", "prod", "seed")), Some(false));
        handle.clear();
        assert!(cache.is_empty());
    }
}
