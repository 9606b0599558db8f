//! LRU+TTL caching (§4.5) for action decisions, policy results, and rate
//! limit outcomes.
//!
//! A single `Mutex<Inner>` guards insertion order and entries together,
//! matching the teacher's preference for a coarse per-resource lock
//! (`Mutex<HashMap<...>>`) over a lock-free structure wherever eviction
//! order must be exact.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mediator_core::model::Decision;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    hits: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

/// Point-in-time counters for a single [`LruCache`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub maxsize: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub expired_entries: usize,
}

/// An LRU cache with an optional default per-entry TTL.
pub struct LruCache<V> {
    maxsize: usize,
    default_ttl: Option<Duration>,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> LruCache<V> {
    /// Construct a cache bounded to `maxsize` entries; `default_ttl` applies
    /// to entries inserted via [`LruCache::set`] without an explicit TTL.
    #[must_use]
    pub fn new(maxsize: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            maxsize,
            default_ttl,
            inner: Mutex::new(Inner { entries: HashMap::new(), order: VecDeque::new(), hits: 0, misses: 0 }),
        }
    }

    /// Return the cached value for `key`, or `None` if absent or expired.
    /// Bumps LRU recency and the entry's hit counter on a hit.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(entry) = inner.entries.get(key) {
            if entry.is_expired() {
                inner.entries.remove(key);
                inner.order.retain(|k| k != key);
                inner.misses += 1;
                return None;
            }
        } else {
            inner.misses += 1;
            return None;
        }
        inner.order.retain(|k| k != key);
        inner.order.push_back(key.to_string());
        inner.hits += 1;
        let entry = inner.entries.get_mut(key).expect("just checked present");
        entry.hits += 1;
        Some(entry.value.clone())
    }

    /// Insert or replace `key`, using `ttl` if given, else the cache's
    /// default TTL, else no expiration. Evicts the least-recently-used
    /// entry when the cache is full and `key` is new.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let expires_at = ttl.or(self.default_ttl).map(|d| Instant::now() + d);
        let is_new = !inner.entries.contains_key(key);
        if is_new && inner.entries.len() >= self.maxsize {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(key.to_string(), Entry { value, expires_at, hits: 0 });
        inner.order.retain(|k| k != key);
        inner.order.push_back(key.to_string());
    }

    /// Remove `key` if present.
    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
    }

    /// Remove every key for which `predicate` returns true, returning the
    /// count removed.
    pub fn delete_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let doomed: Vec<String> = inner.entries.keys().filter(|k| predicate(k)).cloned().collect();
        for key in &doomed {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
        }
        doomed.len()
    }

    /// Snapshot of current hit/miss/size counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let total = inner.hits + inner.misses;
        let expired = inner.entries.values().filter(|e| e.is_expired()).count();
        CacheStats {
            size: inner.entries.len(),
            maxsize: self.maxsize,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total > 0 { inner.hits as f64 / total as f64 } else { 0.0 },
            expired_entries: expired,
        }
    }

    /// Drop all entries and reset hit/miss counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
        inner.order.clear();
        inner.hits = 0;
        inner.misses = 0;
    }
}

/// Aggregate stats across the three distinguished caches.
#[derive(Debug, Clone, Copy)]
pub struct PolicyCacheStats {
    pub action_cache: CacheStats,
    pub policy_cache: CacheStats,
    pub rate_limit_cache: CacheStats,
    pub total_size: usize,
}

/// The three distinguished caches the runtime facade consults on the hot
/// path, per §4.5's sizing table.
pub struct PolicyCache {
    action_cache: LruCache<Decision>,
    policy_cache: LruCache<bool>,
    rate_limit_cache: LruCache<(bool, f64)>,
}

impl Default for PolicyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyCache {
    /// Construct the three caches with their fixed sizes and TTLs:
    /// action-decision (10 000/300s), policy-result (1 000/600s),
    /// rate-limit (5 000/60s).
    #[must_use]
    pub fn new() -> Self {
        Self {
            action_cache: LruCache::new(10_000, Some(Duration::from_secs(300))),
            policy_cache: LruCache::new(1_000, Some(Duration::from_secs(600))),
            rate_limit_cache: LruCache::new(5_000, Some(Duration::from_secs(60))),
        }
    }

    /// As [`Self::new`], but with the action-decision cache's size and TTL
    /// overridden (§6 `decision_cache_size`/`decision_cache_ttl`); the
    /// policy-result and rate-limit caches keep their fixed defaults.
    #[must_use]
    pub fn new_sized(action_cache_size: usize, action_cache_ttl_secs: u64) -> Self {
        Self {
            action_cache: LruCache::new(action_cache_size, Some(Duration::from_secs(action_cache_ttl_secs))),
            policy_cache: LruCache::new(1_000, Some(Duration::from_secs(600))),
            rate_limit_cache: LruCache::new(5_000, Some(Duration::from_secs(60))),
        }
    }

    fn decision_key(agent_id: &str, action_type: &str, target: &str, action_hash: &str) -> String {
        format!("decision:{agent_id}:{action_type}:{target}:{action_hash}")
    }

    /// Look up a previously cached decision, full shape (`allow`,
    /// `policy_id`, `explanation`, `ciaa_violations`) intact.
    pub fn get_action_decision(
        &self,
        agent_id: &str,
        action_type: &str,
        target: &str,
        action_hash: &str,
    ) -> Option<Decision> {
        self.action_cache.get(&Self::decision_key(agent_id, action_type, target, action_hash))
    }

    /// Cache a decision in full: `allow`, `policy_id`, `explanation`, and
    /// `ciaa_violations` all survive a cache-hit replay, so a cached
    /// policy- or CIAA-denial doesn't come back lossy.
    pub fn set_action_decision(
        &self,
        agent_id: &str,
        action_type: &str,
        target: &str,
        action_hash: &str,
        decision: &Decision,
    ) {
        self.action_cache.set(
            &Self::decision_key(agent_id, action_type, target, action_hash),
            decision.clone(),
            None,
        );
    }

    /// Look up a previously cached single-rule evaluation result.
    pub fn get_policy_result(&self, policy_id: &str, action_hash: &str) -> Option<bool> {
        self.policy_cache.get(&format!("policy:{policy_id}:{action_hash}"))
    }

    /// Cache a single-rule evaluation result.
    pub fn set_policy_result(&self, policy_id: &str, action_hash: &str, result: bool) {
        self.policy_cache.set(&format!("policy:{policy_id}:{action_hash}"), result, None);
    }

    /// Look up a previously cached rate-limit outcome.
    pub fn get_rate_limit(&self, key: &str) -> Option<(bool, f64)> {
        self.rate_limit_cache.get(key)
    }

    /// Cache a rate-limit outcome.
    pub fn set_rate_limit(&self, key: &str, allowed: bool, wait_time: f64) {
        self.rate_limit_cache.set(key, (allowed, wait_time), None);
    }

    /// Drop every action-decision entry belonging to `agent_id`.
    pub fn invalidate_agent(&self, agent_id: &str) {
        let needle = format!(":{agent_id}:");
        let removed = self.action_cache.delete_matching(|k| k.contains(&needle));
        tracing::debug!(agent_id, removed, "invalidated agent cache entries");
    }

    /// Stats across all three caches.
    pub fn stats(&self) -> PolicyCacheStats {
        let action_cache = self.action_cache.stats();
        let policy_cache = self.policy_cache.stats();
        let rate_limit_cache = self.rate_limit_cache.stats();
        PolicyCacheStats {
            action_cache,
            policy_cache,
            rate_limit_cache,
            total_size: action_cache.size + policy_cache.size + rate_limit_cache.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_miss_then_hit() {
        let cache: LruCache<i32> = LruCache::new(10, None);
        assert_eq!(cache.get("k"), None);
        cache.set("k", 42, None);
        assert_eq!(cache.get("k"), Some(42));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn eviction_drops_least_recently_used() {
        let cache: LruCache<i32> = LruCache::new(2, None);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.get("a");
        cache.set("c", 3, None);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn ttl_expires_entries() {
        let cache: LruCache<i32> = LruCache::new(10, None);
        cache.set("k", 1, Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn policy_cache_round_trips_action_decision() {
        let cache = PolicyCache::new();
        assert!(cache.get_action_decision("a1", "tool_call", "t", "h1").is_none());
        let decision = Decision::deny_policy("act-1", "p1", "denied by p1");
        cache.set_action_decision("a1", "tool_call", "t", "h1", &decision);
        let cached = cache.get_action_decision("a1", "tool_call", "t", "h1").unwrap();
        assert!(!cached.allow);
        assert_eq!(cached.policy_id, "p1");
        assert_eq!(cached.explanation, "denied by p1");
    }

    #[test]
    fn invalidate_agent_clears_only_that_agent() {
        let cache = PolicyCache::new();
        let decision = Decision::allow("act-1", "ok");
        cache.set_action_decision("a1", "tool_call", "t", "h1", &decision);
        cache.set_action_decision("a2", "tool_call", "t", "h1", &decision);
        cache.invalidate_agent("a1");
        assert!(cache.get_action_decision("a1", "tool_call", "t", "h1").is_none());
        assert!(cache.get_action_decision("a2", "tool_call", "t", "h1").is_some());
    }
}
