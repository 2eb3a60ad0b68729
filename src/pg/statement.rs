//! Per-link prepared statement cache.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::protocol::FieldDescription;
use super::types::Oid;

/// Column descriptions shared between a cached statement and every result built from it.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// Prefix of server-side statement names created by this crate.
pub const STATEMENT_PREFIX: &str = "pgs_";

const DEFAULT_CAPACITY: usize = 100;

/// A statement parsed by the server under `name`.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: String,
    pub query: String,
    /// Parameter types from ParameterDescription
    pub param_types: Vec<Oid>,
    pub columns: SharedColumns,
}

impl PreparedStatement {
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            param_types: Vec::new(),
            columns: Arc::new(Vec::new()),
        }
    }

    pub fn with_description(mut self, param_types: Vec<Oid>, columns: Vec<FieldDescription>) -> Self {
        self.param_types = param_types;
        self.columns = Arc::new(columns);
        self
    }

    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// LRU cache keyed by query text.
///
/// A capacity of zero disables caching: every lookup misses and callers
/// should fall back to the unnamed statement.
pub struct StatementCache {
    cache: Option<LruCache<String, Arc<PreparedStatement>>>,
    next_id: u32,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(LruCache::new),
            next_id: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.as_mut()?.get(query).map(Arc::clone)
    }

    /// Insert a statement, returning the name of the statement evicted to
    /// make room so the caller can Close it on the server.
    pub fn insert(&mut self, statement: PreparedStatement) -> Option<String> {
        let cache = self.cache.as_mut()?;
        let key = statement.query.clone();
        match cache.push(key.clone(), Arc::new(statement)) {
            // push returns the old value on a key update; that is not an eviction
            Some((old_key, old)) if old_key != key => Some(old.name.clone()),
            _ => None,
        }
    }

    pub fn remove(&mut self, query: &str) -> Option<Arc<PreparedStatement>> {
        self.cache.as_mut()?.pop(query)
    }

    pub fn next_statement_name(&mut self) -> String {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        format!("{STATEMENT_PREFIX}{id}")
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every statement without closing it on the server.
    pub fn clear(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(name: &str, query: &str) -> PreparedStatement {
        PreparedStatement::new(name.to_string(), query.to_string())
    }

    #[test]
    fn test_lookup_and_description() {
        let mut cache = StatementCache::new(10);
        assert!(cache.is_empty());

        cache.insert(stmt("s1", "SELECT $1").with_description(vec![Oid::INT4], vec![]));
        let found = cache.get("SELECT $1").unwrap();
        assert_eq!(found.name, "s1");
        assert_eq!(found.param_types, vec![Oid::INT4]);
        assert!(!found.returns_rows());
        assert!(cache.get("SELECT 2").is_none());
    }

    #[test]
    fn test_eviction_reports_lru_name() {
        let mut cache = StatementCache::new(2);
        assert_eq!(cache.insert(stmt("s1", "q1")), None);
        assert_eq!(cache.insert(stmt("s2", "q2")), None);

        cache.get("q1");

        assert_eq!(cache.insert(stmt("s3", "q3")), Some("s2".to_string()));
        assert!(cache.get("q1").is_some());
        assert!(cache.get("q2").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_reinsert_same_query_is_not_eviction() {
        let mut cache = StatementCache::new(1);
        cache.insert(stmt("s1", "q1"));
        assert_eq!(cache.insert(stmt("s2", "q1")), None);
        assert_eq!(cache.get("q1").unwrap().name, "s2");
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let mut cache = StatementCache::new(0);
        assert!(!cache.is_enabled());
        assert_eq!(cache.insert(stmt("s1", "q1")), None);
        assert!(cache.get("q1").is_none());
        assert!(cache.remove("q1").is_none());
    }

    #[test]
    fn test_statement_names_are_unique() {
        let mut cache = StatementCache::default();
        let names: std::collections::HashSet<_> =
            (0..10).map(|_| cache.next_statement_name()).collect();
        assert_eq!(names.len(), 10);
        assert!(names.iter().all(|n| n.starts_with(STATEMENT_PREFIX)));
    }
}
