use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use sha2::{Digest as _, Sha256};

use crate::provider::AuthInfo;

/// Cap on how long a verified token stays cached regardless of its `exp`.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_millis(300_000);

/// Entry bound; the oldest insertion is evicted when full.
pub const MAX_CACHE_SIZE: usize = 1000;

struct CacheEntry {
    info: Arc<AuthInfo>,
    expires_at: Instant,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    // Insertion order for FIFO eviction.
    order: VecDeque<String>,
}

/// Bounded TTL cache from token digest to verified [`AuthInfo`].
///
/// Keys are the SHA-256 of the raw token, lowercase hex; the raw token is
/// never stored. Insertion and the size check happen under one lock so the
/// bound holds under concurrent verifies.
pub struct TokenCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    default_ttl: Duration,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::with_limits(MAX_CACHE_SIZE, DEFAULT_TOKEN_TTL)
    }

    pub fn with_limits(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_size,
            default_ttl,
        }
    }

    /// Cache key for a raw token.
    pub fn key_for(token: &str) -> String {
        let digest = Sha256::digest(token.as_bytes());
        crate::signing::bytes_to_hex(&digest)
    }

    pub fn get(&self, key: &str) -> Option<Arc<AuthInfo>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.info.clone()),
            Some(_) => {
                inner.entries.remove(key);
                inner.order.retain(|k| k != key);
                None
            }
            None => None,
        }
    }

    /// Insert with TTL `min(exp − now, default_ttl)`; entries whose computed
    /// TTL is not positive are skipped.
    pub fn insert(&self, key: String, info: Arc<AuthInfo>) {
        let ttl = match info.expires_at {
            Some(exp) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO)
                    .as_secs();
                if exp <= now {
                    return;
                }
                Duration::from_secs(exp - now).min(self.default_ttl)
            }
            None => self.default_ttl,
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.remove(&key).is_some() {
            inner.order.retain(|k| k != &key);
        }
        while inner.entries.len() >= self.max_size {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                info,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(subject: &str, exp: Option<u64>) -> Arc<AuthInfo> {
        Arc::new(AuthInfo {
            subject: subject.to_string(),
            client_id: None,
            scopes: vec![],
            claims: serde_json::json!({}),
            expires_at: exp,
        })
    }

    fn far_future() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_secs()
            + 3600
    }

    #[test]
    fn key_is_sha256_hex_not_raw_token() {
        let key = TokenCache::key_for("secret-token");
        assert_eq!(key.len(), 64);
        assert!(!key.contains("secret"));
        assert_eq!(key, TokenCache::key_for("secret-token"));
    }

    #[test]
    fn hit_within_ttl() {
        let cache = TokenCache::new();
        cache.insert("k1".to_string(), info("alice", Some(far_future())));
        assert_eq!(cache.get("k1").expect("hit").subject, "alice");
    }

    #[test]
    fn expired_token_is_never_inserted() {
        let cache = TokenCache::new();
        cache.insert("k1".to_string(), info("alice", Some(1)));
        assert!(cache.get("k1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn fifo_eviction_at_capacity() {
        let cache = TokenCache::with_limits(2, DEFAULT_TOKEN_TTL);
        cache.insert("a".to_string(), info("a", None));
        cache.insert("b".to_string(), info("b", None));
        cache.insert("c".to_string(), info("c", None));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn reinsert_does_not_duplicate_order_entry() {
        let cache = TokenCache::with_limits(2, DEFAULT_TOKEN_TTL);
        cache.insert("a".to_string(), info("a1", None));
        cache.insert("a".to_string(), info("a2", None));
        cache.insert("b".to_string(), info("b", None));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").expect("a").subject, "a2");
    }
}
