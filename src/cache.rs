//! Short-lived cache of search results in front of the client.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::directory::{DirectoryEntry, Scope, SearchRequest};
use crate::dn::is_within;


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct CacheKey {
    base_dn: String,
    scope: Scope,
    filter: String,
    attributes: Vec<String>,
}
impl CacheKey {
    fn new(request: &SearchRequest) -> Self {
        let mut attributes: Vec<String> = request.attributes
            .iter()
            .map(|a| a.to_lowercase())
            .collect();
        attributes.sort();
        attributes.dedup();
        Self {
            base_dn: request.base_dn.to_lowercase(),
            scope: request.scope,
            filter: request.filter.clone(),
            attributes,
        }
    }
}

struct CachedResult {
    base_dn: String,
    entries: Vec<DirectoryEntry>,
    cached_at: Instant,
}


pub struct SearchCache {
    results: Mutex<HashMap<CacheKey, CachedResult>>,
    ttl: Duration,
}
impl SearchCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, request: &SearchRequest) -> Option<Vec<DirectoryEntry>> {
        let mut results = self.results.lock();
        let key = CacheKey::new(request);
        let cached = results.get(&key)?;
        if cached.cached_at.elapsed() < self.ttl {
            return Some(cached.entries.clone());
        }
        results.remove(&key);
        None
    }

    pub fn insert(&self, request: &SearchRequest, entries: Vec<DirectoryEntry>) {
        self.results.lock().insert(
            CacheKey::new(request),
            CachedResult {
                base_dn: request.base_dn.clone(),
                entries,
                cached_at: Instant::now(),
            },
        );
    }

    /// Forgets every result a change to `dn` could have affected: searches
    /// based at or above it, and searches based inside its subtree.
    pub fn invalidate(&self, dn: &str) {
        let mut results = self.results.lock();
        let before = results.len();
        results.retain(|_, cached| !is_within(dn, &cached.base_dn) && !is_within(&cached.base_dn, dn));
        let dropped = before - results.len();
        if dropped > 0 {
            debug!(dn, dropped, "invalidated cached search results");
        }
    }

    pub fn clear(&self) {
        self.results.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::Attributes;

    fn entry(dn: &str) -> DirectoryEntry {
        DirectoryEntry::new(dn, Attributes::new())
    }

    #[test]
    fn test_hit_ignores_case_and_attribute_order() {
        let cache = SearchCache::new(Duration::from_secs(60));
        let request = SearchRequest::new("OU=People,DC=x", "(cn=*)").attributes(["cn", "mail"]);
        cache.insert(&request, vec![entry("CN=a,OU=People,DC=x")]);

        let same = SearchRequest::new("ou=people,dc=x", "(cn=*)").attributes(["MAIL", "cn"]);
        assert_eq!(cache.get(&same).map(|e| e.len()), Some(1));

        let other_filter = SearchRequest::new("OU=People,DC=x", "(sn=*)").attributes(["cn", "mail"]);
        assert!(cache.get(&other_filter).is_none());
    }

    #[test]
    fn test_expired_results_are_dropped() {
        let cache = SearchCache::new(Duration::ZERO);
        let request = SearchRequest::new("DC=x", "(cn=*)");
        cache.insert(&request, Vec::new());
        assert!(cache.get(&request).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_by_containment() {
        let cache = SearchCache::new(Duration::from_secs(60));
        let people = SearchRequest::new("OU=People,DC=x", "(cn=*)");
        let groups = SearchRequest::new("OU=Groups,DC=x", "(cn=*)");
        let bob = SearchRequest::new("CN=bob,OU=People,DC=x", "(objectClass=*)");
        let root = SearchRequest::new("DC=x", "(objectClass=*)");
        for request in [&people, &groups, &bob, &root] {
            cache.insert(request, Vec::new());
        }

        cache.invalidate("CN=bob,OU=People,DC=x");
        assert!(cache.get(&people).is_none());
        assert!(cache.get(&bob).is_none());
        assert!(cache.get(&root).is_none());
        assert!(cache.get(&groups).is_some());
    }
}
