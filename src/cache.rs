//! Listing cache owned by a [`Syncer`](crate::Syncer).
//!
//! Nothing here is process-global: each syncer holds its own cache and the
//! caller decides when entries expire or are dropped.

use crate::types::RemoteObject;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CachedListing {
    objects: Vec<RemoteObject>,
    fetched_at: Instant,
}

/// Recent listings keyed by prefix, valid for a fixed time-to-live.
#[derive(Debug, Clone)]
pub struct ListingCache {
    ttl: Duration,
    entries: HashMap<String, CachedListing>,
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Returns the listing for `prefix` if it is younger than the TTL.
    pub fn get(&self, prefix: &str) -> Option<&[RemoteObject]> {
        self.entries
            .get(prefix)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.objects.as_slice())
    }

    pub fn insert(&mut self, prefix: &str, objects: Vec<RemoteObject>) {
        self.entries.insert(
            prefix.to_string(),
            CachedListing {
                objects,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drops the listing for `prefix`.
    pub fn invalidate(&mut self, prefix: &str) {
        self.entries.remove(prefix);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn objects() -> Vec<RemoteObject> {
        vec![RemoteObject {
            key: "a".to_string(),
            etag: "e1".to_string(),
            last_modified: Utc::now(),
            size: Some(1),
        }]
    }

    #[test]
    fn test_fresh_entry_is_served() {
        let mut cache = ListingCache::new(Duration::from_secs(60));
        cache.insert("", objects());
        assert_eq!(cache.get("").map(|o| o.len()), Some(1));
        assert!(cache.get("other/").is_none());
    }

    #[test]
    fn test_expired_entry_is_not_served() {
        let mut cache = ListingCache::new(Duration::ZERO);
        cache.insert("", objects());
        assert!(cache.get("").is_none());
    }

    #[test]
    fn test_invalidate() {
        let mut cache = ListingCache::new(Duration::from_secs(60));
        cache.insert("", objects());
        cache.invalidate("");
        assert!(cache.get("").is_none());

        cache.insert("x/", objects());
        cache.clear();
        assert!(cache.get("x/").is_none());
    }
}
