//! In-Memory Cache Tier
//!
//! A bounded LRU over one value class. Eviction triggers on entry count or
//! total payload bytes, whichever bound is hit first; expiry is per-entry
//! TTL, checked on read.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

// ============================================================================
// VALUE TRAIT
// ============================================================================

/// A value storable in a memory tier; reports its payload size for byte
/// accounting
pub trait CacheValue: Clone {
    /// Approximate payload size in bytes
    fn byte_size(&self) -> usize;
}

impl CacheValue for Vec<f32> {
    fn byte_size(&self) -> usize {
        self.len() * std::mem::size_of::<f32>()
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Bounds and default TTL for one tier
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum total payload bytes
    pub max_bytes: usize,
    /// Default time-to-live for entries without an explicit TTL
    pub default_ttl: Duration,
}

impl TierConfig {
    pub fn new(max_entries: usize, max_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            max_entries,
            max_bytes,
            default_ttl,
        }
    }
}

// ============================================================================
// ENTRY
// ============================================================================

/// A cached entry with bookkeeping
#[derive(Debug, Clone)]
pub struct TierEntry<V> {
    /// The cached value
    pub value: V,
    /// When the entry was created
    pub created_at: Instant,
    /// When the entry expires
    pub expires_at: Instant,
    /// Read count
    pub hits: u64,
    /// Last read time
    pub last_access: Instant,
    /// Embedding used for semantic near-hit matching (query class only)
    pub embedding: Option<Vec<f32>>,
    /// Payload bytes charged against the tier budget
    bytes: usize,
}

impl<V> TierEntry<V> {
    fn expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

// ============================================================================
// TIER
// ============================================================================

struct TierInner<V> {
    lru: LruCache<String, TierEntry<V>>,
    total_bytes: usize,
}

/// A bounded in-memory LRU tier for one value class
pub struct MemoryTier<V: CacheValue> {
    config: TierConfig,
    inner: Mutex<TierInner<V>>,
}

impl<V: CacheValue> MemoryTier<V> {
    /// Create a tier with the given bounds
    pub fn new(config: TierConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            config,
            inner: Mutex::new(TierInner {
                lru: LruCache::new(cap),
                total_bytes: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TierInner<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read a value, updating recency and hit count. Expired entries are
    /// dropped and reported as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = match inner.lru.get_mut(key) {
            Some(entry) if entry.expired(now) => true,
            Some(entry) => {
                entry.hits += 1;
                entry.last_access = now;
                return Some(entry.value.clone());
            }
            None => return None,
        };

        if expired {
            if let Some(entry) = inner.lru.pop(key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
            }
        }
        None
    }

    /// Insert a value; returns how many entries were evicted to make room
    pub fn put(&self, key: &str, value: V, ttl: Option<Duration>, embedding: Option<Vec<f32>>) -> usize {
        let now = Instant::now();
        let bytes = value.byte_size() + embedding.as_ref().map_or(0, |e| e.byte_size());
        let entry = TierEntry {
            value,
            created_at: now,
            expires_at: now + ttl.unwrap_or(self.config.default_ttl),
            hits: 0,
            last_access: now,
            embedding,
            bytes,
        };

        let mut inner = self.lock();
        let mut evicted = 0;

        // push() surfaces whatever fell out: the old value under the same
        // key, or the LRU pair evicted by the count bound
        if let Some((old_key, old_entry)) = inner.lru.push(key.to_string(), entry) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old_entry.bytes);
            if old_key != key {
                evicted += 1;
            }
        }
        inner.total_bytes += bytes;

        // Byte-bound eviction, strictly LRU
        while inner.total_bytes > self.config.max_bytes && inner.lru.len() > 1 {
            if let Some((_, dropped)) = inner.lru.pop_lru() {
                inner.total_bytes = inner.total_bytes.saturating_sub(dropped.bytes);
                evicted += 1;
            } else {
                break;
            }
        }

        evicted
    }

    /// Remove a key; returns whether it was present
    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.lock();
        if let Some(entry) = inner.lru.pop(key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
            true
        } else {
            false
        }
    }

    /// Read a value without touching recency (used by the flush job)
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let inner = self.lock();
        inner
            .lru
            .peek(key)
            .filter(|e| !e.expired(now))
            .map(|e| e.value.clone())
    }

    /// Peek the embedding attached to an entry
    pub fn peek_embedding(&self, key: &str) -> Option<Vec<f32>> {
        let inner = self.lock();
        inner.lru.peek(key).and_then(|e| e.embedding.clone())
    }

    /// Best semantic match against entries that carry an embedding.
    ///
    /// Returns `(key, value, similarity)` for the single best non-expired
    /// entry at or above `threshold`. Does not touch recency.
    pub fn best_semantic_match(
        &self,
        query_embedding: &[f32],
        threshold: f32,
    ) -> Option<(String, V, f32)> {
        let now = Instant::now();
        let inner = self.lock();

        let mut best: Option<(String, V, f32)> = None;
        for (key, entry) in inner.lru.iter() {
            if entry.expired(now) {
                continue;
            }
            let Some(embedding) = &entry.embedding else {
                continue;
            };
            let similarity = crate::embeddings::cosine_similarity(query_embedding, embedding);
            if similarity >= threshold
                && best.as_ref().is_none_or(|(_, _, s)| similarity > *s)
            {
                best = Some((key.clone(), entry.value.clone(), similarity));
            }
        }
        best
    }

    /// Most-recently-used keys, newest first, capped at `limit`
    pub fn recent_keys(&self, limit: usize) -> Vec<String> {
        let inner = self.lock();
        inner.lru.iter().take(limit).map(|(k, _)| k.clone()).collect()
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired: Vec<String> = inner
            .lru
            .iter()
            .filter(|(_, e)| e.expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = inner.lru.pop(key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
            }
        }
        expired.len()
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.lru.clear();
        inner.total_bytes = 0;
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    /// Whether the tier is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current payload byte total
    pub fn total_bytes(&self) -> usize {
        self.lock().total_bytes
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(max_entries: usize, max_bytes: usize) -> MemoryTier<Vec<f32>> {
        MemoryTier::new(TierConfig::new(
            max_entries,
            max_bytes,
            Duration::from_secs(60),
        ))
    }

    #[test]
    fn test_put_get() {
        let t = tier(10, 1 << 20);
        t.put("k1", vec![1.0, 2.0], None, None);
        assert_eq!(t.get("k1"), Some(vec![1.0, 2.0]));
        assert_eq!(t.get("k2"), None);
    }

    #[test]
    fn test_count_bound_evicts_lru() {
        let t = tier(2, 1 << 20);
        t.put("a", vec![1.0], None, None);
        t.put("b", vec![2.0], None, None);
        // touch "a" so "b" is the LRU
        t.get("a");
        t.put("c", vec![3.0], None, None);

        assert!(t.get("a").is_some());
        assert!(t.get("b").is_none());
        assert!(t.get("c").is_some());
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_byte_bound_evicts() {
        // 3 floats = 12 bytes per entry; budget fits two entries
        let t = tier(100, 30);
        t.put("a", vec![1.0, 1.0, 1.0], None, None);
        t.put("b", vec![2.0, 2.0, 2.0], None, None);
        let evicted = t.put("c", vec![3.0, 3.0, 3.0], None, None);

        assert!(evicted >= 1);
        assert!(t.total_bytes() <= 30);
        assert!(t.get("c").is_some());
        assert!(t.get("a").is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let t = tier(10, 1 << 20);
        t.put("short", vec![1.0], Some(Duration::from_millis(0)), None);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(t.get("short"), None);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_overwrite_reaccounts_bytes() {
        let t = tier(10, 1 << 20);
        t.put("k", vec![1.0; 100], None, None);
        let before = t.total_bytes();
        t.put("k", vec![1.0; 10], None, None);
        assert!(t.total_bytes() < before);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_best_semantic_match_threshold() {
        let t = tier(10, 1 << 20);
        t.put("close", vec![1.0], None, Some(vec![1.0, 0.0, 0.0]));
        t.put("far", vec![2.0], None, Some(vec![0.0, 1.0, 0.0]));

        // Similarity 1.0 against "close", 0.0 against "far"
        let hit = t.best_semantic_match(&[1.0, 0.0, 0.0], 0.95);
        assert_eq!(hit.map(|(k, _, _)| k).as_deref(), Some("close"));

        // cos = 0.94 must miss at a 0.95 threshold
        let a = 0.94_f32;
        let b = (1.0 - a * a).sqrt();
        let probe = vec![a, b, 0.0];
        assert!(t.best_semantic_match(&probe, 0.95).is_none());
    }

    #[test]
    fn test_entries_without_embedding_never_near_hit() {
        let t = tier(10, 1 << 20);
        t.put("plain", vec![1.0], None, None);
        assert!(t.best_semantic_match(&[1.0, 0.0], 0.0).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let t = tier(10, 1 << 20);
        t.put("stale", vec![1.0], Some(Duration::from_millis(0)), None);
        t.put("fresh", vec![2.0], None, None);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(t.purge_expired(), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_clear() {
        let t = tier(10, 1 << 20);
        t.put("a", vec![1.0], None, None);
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.total_bytes(), 0);
    }
}
