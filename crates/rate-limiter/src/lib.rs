//! Multi-dimensional rate limiter (§4.3): token-bucket and sliding-window
//! algorithms, checked across four named dimensions, with per-agent
//! history for statistics.
//!
//! Limiters are created lazily per `(dimension, identifier)` key and stored
//! in a `DashMap`, mirroring the teacher's use of `dashmap::DashMap` for
//! concurrent per-key state (`orchestrator::RunIndex`).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use dashmap::DashMap;
use mediator_core::model::ActionType;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const SENSITIVE_TERMS: &[&str] = &[
    "password", "secret", "token", "key", "delete", "drop", "truncate", "format", "execute",
    "sudo", "admin",
];

/// Returns true if `target` contains a case-insensitive sensitive substring
/// from the built-in list.
pub fn is_sensitive(target: &str) -> bool {
    let lower = target.to_ascii_lowercase();
    SENSITIVE_TERMS.iter().any(|term| lower.contains(term))
}

/// As [`is_sensitive`], but also checking a caller-supplied `extra_terms`
/// list (§6 `sensitive_terms` config knob), on top of the built-in set.
pub fn is_sensitive_with(target: &str, extra_terms: &[String]) -> bool {
    let lower = target.to_ascii_lowercase();
    SENSITIVE_TERMS.iter().any(|term| lower.contains(term))
        || extra_terms.iter().any(|term| lower.contains(term.to_ascii_lowercase().as_str()))
}

/// The four rate-limiting dimensions, checked in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Global,
    PerAgent,
    PerAction,
    Sensitive,
}

impl Dimension {
    fn as_str(self) -> &'static str {
        match self {
            Dimension::Global => "global",
            Dimension::PerAgent => "per_agent",
            Dimension::PerAction => "per_action",
            Dimension::Sensitive => "sensitive",
        }
    }

    /// Default `(rate_per_sec, burst_capacity)` per §4.3's table.
    fn default_rate_capacity(self) -> (f64, u64) {
        match self {
            Dimension::Global => (100.0, 200),
            Dimension::PerAgent => (20.0, 50),
            Dimension::PerAction => (5.0, 10),
            Dimension::Sensitive => (1.0, 3),
        }
    }
}

/// Token-bucket state: refills continuously, drains on `consume`.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(rate: f64, capacity: u64) -> Self {
        Self { rate, capacity: capacity as f64, tokens: capacity as f64, last_update: Instant::now() }
    }

    fn consume(&mut self, n: f64) -> (bool, f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
        if self.tokens >= n {
            self.tokens -= n;
            (true, 0.0)
        } else {
            let deficit = n - self.tokens;
            (false, deficit / self.rate)
        }
    }
}

/// Sliding-window state: a deque of accepted-request timestamps.
#[derive(Debug)]
struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    requests: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(max_requests: u64, window: Duration) -> Self {
        Self { max_requests: max_requests as usize, window, requests: VecDeque::new() }
    }

    fn add_request(&mut self) -> (bool, f64) {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        while let Some(&front) = self.requests.front() {
            if front < cutoff {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        if self.requests.len() < self.max_requests {
            self.requests.push_back(now);
            (true, 0.0)
        } else {
            let oldest = *self.requests.front().unwrap();
            let wait = (oldest + self.window).saturating_duration_since(now).as_secs_f64();
            (false, wait.max(0.0))
        }
    }
}

/// Which algorithm backs a limiter. Both are implemented; the default per
/// dimension is `TokenBucket`, matching the source's `default_configs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
}

enum LimiterState {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindow),
}

impl LimiterState {
    fn check(&mut self) -> (bool, f64) {
        match self {
            LimiterState::TokenBucket(b) => b.consume(1.0),
            LimiterState::SlidingWindow(w) => w.add_request(),
        }
    }
}

/// A single recorded check, retained for `get_agent_rate_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub ts_ms: u64,
    pub action_type: String,
    pub target: String,
    pub allowed: bool,
}

const HISTORY_CAP: usize = 1000;

/// Outcome of `RateLimiter::check`.
#[derive(Debug, Clone)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    /// Maximum wait time, in seconds, across all denied dimensions.
    pub max_wait_time: f64,
}

/// Per-agent statistics over the retained history (last 1000 checks).
#[derive(Debug, Clone, Serialize)]
pub struct AgentRateStats {
    pub agent_id: String,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub block_rate: f64,
    pub requests_per_minute: f64,
    pub recent_history: Vec<HistoryEntry>,
}

/// Multi-dimensional gate. One instance is shared (behind `Arc`) by every
/// caller of `Runtime::intercept`.
pub struct RateLimiter {
    limiters: DashMap<String, LimiterState>,
    algorithm: Algorithm,
    history: DashMap<String, VecDeque<HistoryEntry>>,
    extra_sensitive_terms: Vec<String>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Algorithm::TokenBucket)
    }
}

impl RateLimiter {
    /// Construct a limiter; `algorithm` selects token-bucket or
    /// sliding-window for every lazily-created limiter.
    #[must_use]
    pub fn new(algorithm: Algorithm) -> Self {
        Self { limiters: DashMap::new(), algorithm, history: DashMap::new(), extra_sensitive_terms: Vec::new() }
    }

    /// As [`Self::new`], extending the built-in sensitive-term list with
    /// `extra_terms` (§6 `sensitive_terms` config knob).
    #[must_use]
    pub fn with_sensitive_terms(algorithm: Algorithm, extra_terms: Vec<String>) -> Self {
        Self { limiters: DashMap::new(), algorithm, history: DashMap::new(), extra_sensitive_terms: extra_terms }
    }

    fn limiter_key(dimension: Dimension, identifier: &str) -> String {
        format!("{}:{}", dimension.as_str(), identifier)
    }

    fn new_state(&self, dimension: Dimension) -> LimiterState {
        let (rate, capacity) = dimension.default_rate_capacity();
        match self.algorithm {
            Algorithm::TokenBucket => LimiterState::TokenBucket(TokenBucket::new(rate, capacity)),
            Algorithm::SlidingWindow => {
                LimiterState::SlidingWindow(SlidingWindow::new(capacity, Duration::from_secs(1)))
            }
        }
    }

    /// Check `(agent_id, action_type, target)` across all applicable
    /// dimensions; a request is allowed only if every dimension admits it.
    #[tracing::instrument(skip(self), fields(%agent_id, target))]
    pub fn check(&self, agent_id: &str, action_type: ActionType, target: &str) -> RateLimitOutcome {
        let mut dims: Vec<(Dimension, String)> = vec![
            (Dimension::Global, "all".to_string()),
            (Dimension::PerAgent, agent_id.to_string()),
            (Dimension::PerAction, action_type.as_str().to_string()),
        ];
        if is_sensitive_with(target, &self.extra_sensitive_terms) {
            dims.push((Dimension::Sensitive, target.to_string()));
        }

        let mut allowed = true;
        let mut max_wait = 0.0f64;
        for (dimension, identifier) in dims {
            let key = Self::limiter_key(dimension, &identifier);
            let mut entry = self.limiters.entry(key).or_insert_with(|| self.new_state(dimension));
            let (ok, wait) = entry.check();
            if !ok {
                allowed = false;
                max_wait = max_wait.max(wait);
                tracing::warn!(dimension = dimension.as_str(), identifier, "rate limit dimension denied");
            }
        }

        self.record_history(agent_id, action_type, target, allowed);
        RateLimitOutcome { allowed, max_wait_time: max_wait }
    }

    fn record_history(&self, agent_id: &str, action_type: ActionType, target: &str, allowed: bool) {
        let mut hist = self.history.entry(agent_id.to_string()).or_default();
        hist.push_back(HistoryEntry {
            ts_ms: mediator_core::ids::now_ms(),
            action_type: action_type.as_str().to_string(),
            target: target.to_string(),
            allowed,
        });
        while hist.len() > HISTORY_CAP {
            hist.pop_front();
        }
    }

    /// Statistics over the retained history for `agent_id`, or `None` if no
    /// history has been recorded.
    pub fn get_agent_rate_stats(&self, agent_id: &str) -> Option<AgentRateStats> {
        let hist = self.history.get(agent_id)?;
        let recent: Vec<HistoryEntry> = hist.iter().rev().take(100).rev().cloned().collect();
        let total = recent.len() as u64;
        let blocked = recent.iter().filter(|h| !h.allowed).count() as u64;
        let allowed = total - blocked;
        let rpm = if recent.len() >= 2 {
            let span_ms = recent.last().unwrap().ts_ms.saturating_sub(recent.first().unwrap().ts_ms);
            let span_min = span_ms as f64 / 60_000.0;
            if span_min > 0.0 {
                recent.len() as f64 / span_min
            } else {
                recent.len() as f64
            }
        } else {
            0.0
        };
        Some(AgentRateStats {
            agent_id: agent_id.to_string(),
            total_requests: total,
            allowed_requests: allowed,
            blocked_requests: blocked,
            block_rate: if total > 0 { blocked as f64 / total as f64 } else { 0.0 },
            requests_per_minute: rpm,
            recent_history: recent.into_iter().rev().take(10).rev().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_terms_are_case_insensitive() {
        assert!(is_sensitive("DROP TABLE users"));
        assert!(is_sensitive("get_secret_value"));
        assert!(!is_sensitive("list_files"));
    }

    #[test]
    fn token_bucket_allows_burst_then_throttles() {
        let limiter = RateLimiter::new(Algorithm::TokenBucket);
        // Sensitive dimension: rate=1/s, burst=3.
        for _ in 0..3 {
            let outcome = limiter.check("agent-1", ActionType::ToolCall, "delete_all");
            assert!(outcome.allowed);
        }
        let outcome = limiter.check("agent-1", ActionType::ToolCall, "delete_all");
        assert!(!outcome.allowed);
        assert!(outcome.max_wait_time > 0.0);
    }

    #[test]
    fn per_agent_dimension_isolates_agents() {
        let limiter = RateLimiter::new(Algorithm::TokenBucket);
        // Cycle through 5 action types (per_action burst 10 each) so only
        // the per_agent bucket (burst 50) is exhausted, not per_action.
        let action_types = [
            ActionType::ToolCall,
            ActionType::ApiCall,
            ActionType::NetworkRequest,
            ActionType::DatabaseQuery,
            ActionType::FileRead,
        ];
        for i in 0..50 {
            let action_type = action_types[i % action_types.len()];
            assert!(limiter.check("agent-a", action_type, "read").allowed);
        }
        // agent-a's per_agent bucket (burst 50) is now exhausted. Use a
        // sixth action type so per_action (shared across agents) doesn't
        // also deny this check.
        assert!(!limiter.check("agent-a", ActionType::MemoryRead, "read").allowed);
        // ...but agent-b has its own per_agent bucket.
        assert!(limiter.check("agent-b", ActionType::MemoryRead, "read").allowed);
    }

    #[test]
    fn sliding_window_rejects_the_nth_plus_one_request() {
        let mut window = SlidingWindow::new(3, Duration::from_secs(60));
        assert!(window.add_request().0);
        assert!(window.add_request().0);
        assert!(window.add_request().0);
        assert!(!window.add_request().0);
    }

    #[test]
    fn history_is_trimmed_and_stats_reported() {
        let limiter = RateLimiter::new(Algorithm::TokenBucket);
        for _ in 0..5 {
            limiter.check("agent-c", ActionType::ApiCall, "svc");
        }
        let stats = limiter.get_agent_rate_stats("agent-c").unwrap();
        assert_eq!(stats.total_requests, 5);
        assert!(stats.recent_history.len() <= 10);
    }

    #[test]
    fn unknown_agent_has_no_stats() {
        let limiter = RateLimiter::new(Algorithm::TokenBucket);
        assert!(limiter.get_agent_rate_stats("ghost").is_none());
    }

    #[test]
    fn custom_sensitive_terms_trigger_the_sensitive_dimension() {
        let limiter =
            RateLimiter::with_sensitive_terms(Algorithm::TokenBucket, vec!["wombat".to_string()]);
        for _ in 0..3 {
            assert!(limiter.check("agent-1", ActionType::ToolCall, "wombat_export").allowed);
        }
        assert!(!limiter.check("agent-1", ActionType::ToolCall, "wombat_export").allowed);
    }
}
