//! Declarative policy store and evaluator.
//!
//! Policies are loaded from a YAML file (`PolicyFile`), sorted ascending by
//! `priority` (lower binds first), and evaluated against an `ActionRequest`.
//! The first matching `DENY` wins; matching `ALLOW`/`REVIEW` rules are noted
//! but evaluation continues so a later, higher-priority `DENY` is never
//! missed. A single malformed rule (bad regex, unknown field) is skipped
//! with a warning rather than disabling the whole policy set.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod condition;

pub use condition::{Condition, ParamSpec, RateLimitKey, RateLimitSpec, TargetSpec};
pub use mediator_core::model::{ActionType, AnyMarker, AppliesTo, PolicyDecision};

use mediator_core::model::ActionRequest;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::sync::{Mutex, RwLock};
use thiserror::Error;

/// Failure modes for loading or evaluating a policy set.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The policy file could not be opened.
    #[error("failed to open policy file {path}: {source}")]
    Io {
        /// Path that failed to open.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The policy file was not valid YAML or failed schema validation.
    #[error("malformed policy file {path}: {reason}")]
    Malformed {
        /// Path of the offending file.
        path: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Top-level YAML shape: `policies: [PolicyRule, ...]` (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyFile {
    /// The declarative rule list, evaluated in priority order.
    #[serde(default)]
    pub policies: Vec<RawPolicyRule>,
}

/// A policy rule as written in YAML, before condition compilation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPolicyRule {
    /// Unique rule id.
    pub id: String,
    /// `"*"` or an explicit list of action types this rule applies to.
    pub applies_to: AppliesTo,
    /// The predicate tree; absent means "matches everything".
    #[serde(default)]
    pub condition: Condition,
    /// `ALLOW | DENY | REVIEW`.
    pub decision: PolicyDecision,
    /// Human-readable explanation surfaced on the `Decision`.
    #[serde(default)]
    pub reason: String,
    /// Lower numbers bind first.
    pub priority: i64,
}

/// A rule with its condition tree's regexes pre-compiled, ready for the hot
/// path.
#[derive(Debug, Clone)]
struct CompiledRule {
    id: String,
    applies_to: AppliesTo,
    condition: condition::Compiled,
    decision: PolicyDecision,
    reason: String,
    priority: i64,
    load_order: usize,
}

/// Deterministic, fail-open-on-policy (CIAA still enforces) policy
/// evaluator.
pub struct Engine {
    rules: RwLock<Vec<CompiledRule>>,
    /// Observation windows for in-condition `rate_limit` predicates, keyed
    /// `"rl:{key_kind}:{value}"`, one `VecDeque` of millisecond timestamps
    /// per key. Grounded on `PolicyEngine._match_rate_limit`.
    rate_observations: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Construct an evaluator with no policies loaded (degrades open: every
    /// action passes the policy step until `load_from_yaml_path` succeeds).
    #[must_use]
    pub fn new() -> Self {
        Self { rules: RwLock::new(Vec::new()), rate_observations: Mutex::new(HashMap::new()) }
    }

    /// Load (or reload) the policy set from a YAML file. A missing or
    /// malformed file leaves the evaluator with an empty policy set and is
    /// reported via the returned error; the caller is expected to log it as
    /// a warning and continue (§4.2 failure modes) rather than treat it as
    /// fatal.
    pub fn load_from_yaml_path<P: AsRef<std::path::Path>>(
        &self,
        path: P,
    ) -> Result<(), PolicyError> {
        let path_str = path.as_ref().display().to_string();
        let file = File::open(&path).map_err(|e| PolicyError::Io { path: path_str.clone(), source: e })?;
        let reader = BufReader::new(file);
        let parsed: PolicyFile = serde_yaml::from_reader(reader)
            .map_err(|e| PolicyError::Malformed { path: path_str.clone(), reason: e.to_string() })?;
        self.load_rules(parsed.policies);
        Ok(())
    }

    /// Load an already-parsed rule set (used by the learner's export
    /// round-trip and by tests that build policies in-process).
    pub fn load_rules(&self, raw: Vec<RawPolicyRule>) {
        let mut compiled: Vec<CompiledRule> = Vec::with_capacity(raw.len());
        for (idx, rule) in raw.into_iter().enumerate() {
            match condition::compile(&rule.condition) {
                Ok(c) => compiled.push(CompiledRule {
                    id: rule.id,
                    applies_to: rule.applies_to,
                    condition: c,
                    decision: rule.decision,
                    reason: rule.reason,
                    priority: rule.priority,
                    load_order: idx,
                }),
                Err(err) => {
                    tracing::warn!(rule_id = %rule.id, error = %err, "skipping rule with invalid regex");
                }
            }
        }
        // Ascending priority (lower binds first); stable sort preserves
        // load order as the tie-break (§4.2, §8 property 7).
        compiled.sort_by_key(|r| (r.priority, r.load_order));
        *self.rules.write().expect("policy rules lock poisoned") = compiled;
    }

    /// Returns `true` once at least one rule has been loaded.
    pub fn is_loaded(&self) -> bool {
        !self.rules.read().expect("policy rules lock poisoned").is_empty()
    }

    /// Evaluate `action` against the loaded policy snapshot. Returns
    /// `Some((policy_id, reason))` for the first matching `DENY`/`REVIEW`
    /// rule in priority order, or `None` if every rule either doesn't apply
    /// or resolves to `ALLOW`.
    #[tracing::instrument(skip(self, action), fields(agent_id = %action.agent_id, target = %action.target))]
    pub fn evaluate(&self, action: &ActionRequest) -> Option<(String, String)> {
        let rules = self.rules.read().expect("policy rules lock poisoned");
        for rule in rules.iter() {
            if !rule.applies_to.matches(action.action_type) {
                continue;
            }
            if !self.condition_matches(&rule.condition, action) {
                continue;
            }
            match rule.decision {
                PolicyDecision::Deny | PolicyDecision::Review => {
                    tracing::info!(policy_id = %rule.id, "policy matched, denying action");
                    return Some((rule.id.clone(), rule.reason.clone()));
                }
                PolicyDecision::Allow => {
                    tracing::debug!(policy_id = %rule.id, "policy allowed, continuing evaluation");
                }
            }
        }
        None
    }

    fn condition_matches(&self, c: &condition::Compiled, action: &ActionRequest) -> bool {
        match c {
            condition::Compiled::Empty => true,
            condition::Compiled::Target(t) => t.matches(&action.target),
            condition::Compiled::Parameters(params) => {
                params.iter().all(|(k, spec)| match action.parameters.get(k) {
                    Some(v) => spec.matches(v),
                    None => false,
                })
            }
            condition::Compiled::Pattern(re) => re.is_match(&action.target),
            condition::Compiled::RateLimit(rl) => self.rate_limit_matches(rl, action),
            condition::Compiled::And(children) => {
                children.iter().all(|c| self.condition_matches(c, action))
            }
            condition::Compiled::Or(children) => {
                children.iter().any(|c| self.condition_matches(c, action))
            }
        }
    }

    fn rate_limit_matches(&self, rl: &RateLimitSpec, action: &ActionRequest) -> bool {
        let key_value = match rl.key {
            RateLimitKey::AgentId => format!("rl:agent:{}", action.agent_id),
            RateLimitKey::Target => format!("rl:target:{}", action.target),
            RateLimitKey::ActionId => format!("rl:action:{}", action.action_id),
        };
        let now = mediator_core::ids::now_ms();
        let window_ms = rl.window_seconds.saturating_mul(1000);
        let mut observations = self.rate_observations.lock().expect("rate observation lock poisoned");
        let deque = observations.entry(key_value).or_default();
        while let Some(&front) = deque.front() {
            if now.saturating_sub(front) > window_ms {
                deque.pop_front();
            } else {
                break;
            }
        }
        deque.push_back(now);
        deque.len() as u64 >= rl.max_per_minute
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_core::model::ActionType;
    use std::collections::BTreeMap;

    fn action(agent: &str, action_type: ActionType, target: &str) -> ActionRequest {
        ActionRequest::new(agent, action_type, target)
    }

    #[test]
    fn empty_engine_allows_everything() {
        let engine = Engine::new();
        assert!(!engine.is_loaded());
        assert!(engine.evaluate(&action("a1", ActionType::ToolCall, "echo")).is_none());
    }

    #[test]
    fn deny_wins_over_lower_priority_allow() {
        let engine = Engine::new();
        engine.load_rules(vec![
            RawPolicyRule {
                id: "allow_all".into(),
                applies_to: AppliesTo::Any(AnyMarker("*".into())),
                condition: Condition::Empty,
                decision: PolicyDecision::Allow,
                reason: String::new(),
                priority: 100,
            },
            RawPolicyRule {
                id: "deny_http".into(),
                applies_to: AppliesTo::Types(vec![ActionType::ToolCall]),
                condition: Condition::Pattern("https?://.*".into()),
                decision: PolicyDecision::Deny,
                reason: "blocked".into(),
                priority: 10,
            },
        ]);
        let result = engine.evaluate(&action("a1", ActionType::ToolCall, "https://example.com/x"));
        assert_eq!(result, Some(("deny_http".into(), "blocked".into())));
    }

    #[test]
    fn allow_continues_past_lower_priority_deny_that_is_checked_first() {
        // Priority ascending: deny at 5 is checked before allow at 50, and
        // since it's DENY it wins outright regardless of the later ALLOW.
        let engine = Engine::new();
        engine.load_rules(vec![
            RawPolicyRule {
                id: "deny_low_priority_number".into(),
                applies_to: AppliesTo::Any(AnyMarker("*".into())),
                condition: Condition::Empty,
                decision: PolicyDecision::Deny,
                reason: "early deny".into(),
                priority: 5,
            },
            RawPolicyRule {
                id: "allow_high_priority_number".into(),
                applies_to: AppliesTo::Any(AnyMarker("*".into())),
                condition: Condition::Empty,
                decision: PolicyDecision::Allow,
                reason: String::new(),
                priority: 50,
            },
        ]);
        let result = engine.evaluate(&action("a1", ActionType::ToolCall, "echo"));
        assert_eq!(result, Some(("deny_low_priority_number".into(), "early deny".into())));
    }

    #[test]
    fn ties_broken_by_file_order() {
        let engine = Engine::new();
        engine.load_rules(vec![
            RawPolicyRule {
                id: "first".into(),
                applies_to: AppliesTo::Any(AnyMarker("*".into())),
                condition: Condition::Empty,
                decision: PolicyDecision::Deny,
                reason: "first".into(),
                priority: 7,
            },
            RawPolicyRule {
                id: "second".into(),
                applies_to: AppliesTo::Any(AnyMarker("*".into())),
                condition: Condition::Empty,
                decision: PolicyDecision::Deny,
                reason: "second".into(),
                priority: 7,
            },
        ]);
        let result = engine.evaluate(&action("a1", ActionType::ToolCall, "echo"));
        assert_eq!(result.unwrap().0, "first");
    }

    #[test]
    fn applies_to_filters_unrelated_action_types() {
        let engine = Engine::new();
        engine.load_rules(vec![RawPolicyRule {
            id: "deny_file_write".into(),
            applies_to: AppliesTo::Types(vec![ActionType::FileWrite]),
            condition: Condition::Empty,
            decision: PolicyDecision::Deny,
            reason: "no writes".into(),
            priority: 1,
        }]);
        assert!(engine.evaluate(&action("a1", ActionType::ToolCall, "echo")).is_none());
        assert!(engine.evaluate(&action("a1", ActionType::FileWrite, "/tmp/x")).is_some());
    }

    #[test]
    fn parameters_condition_requires_all_listed_keys() {
        let engine = Engine::new();
        let mut params = BTreeMap::new();
        params.insert(
            "url".to_string(),
            ParamSpec::Pattern { pattern: "https?://.*".into() },
        );
        engine.load_rules(vec![RawPolicyRule {
            id: "deny_external_url_param".into(),
            applies_to: AppliesTo::Any(AnyMarker("*".into())),
            condition: Condition::Parameters(params),
            decision: PolicyDecision::Deny,
            reason: "external url param".into(),
            priority: 1,
        }]);
        let mut req = action("a1", ActionType::ToolCall, "http_request");
        req.parameters.insert("url".into(), serde_json::json!("https://evil.example"));
        assert!(engine.evaluate(&req).is_some());

        let req_missing = action("a1", ActionType::ToolCall, "http_request");
        assert!(engine.evaluate(&req_missing).is_none());
    }

    #[test]
    fn malformed_regex_skips_only_that_rule() {
        let engine = Engine::new();
        engine.load_rules(vec![
            RawPolicyRule {
                id: "bad_regex".into(),
                applies_to: AppliesTo::Any(AnyMarker("*".into())),
                condition: Condition::Pattern("(".into()),
                decision: PolicyDecision::Deny,
                reason: "bad".into(),
                priority: 1,
            },
            RawPolicyRule {
                id: "good_rule".into(),
                applies_to: AppliesTo::Any(AnyMarker("*".into())),
                condition: Condition::Empty,
                decision: PolicyDecision::Deny,
                reason: "caught by fallback".into(),
                priority: 2,
            },
        ]);
        let result = engine.evaluate(&action("a1", ActionType::ToolCall, "echo"));
        assert_eq!(result.unwrap().0, "good_rule");
    }

    #[test]
    fn rate_limit_condition_fires_at_threshold() {
        let engine = Engine::new();
        engine.load_rules(vec![RawPolicyRule {
            id: "throttle_agent".into(),
            applies_to: AppliesTo::Any(AnyMarker("*".into())),
            condition: Condition::RateLimit(RateLimitSpec {
                max_per_minute: 3,
                window_seconds: 60,
                key: RateLimitKey::AgentId,
            }),
            decision: PolicyDecision::Deny,
            reason: "too many requests".into(),
            priority: 1,
        }]);
        let act = || action("agent-x", ActionType::ApiCall, "svc");
        assert!(engine.evaluate(&act()).is_none());
        assert!(engine.evaluate(&act()).is_none());
        assert!(engine.evaluate(&act()).is_some());
    }

    #[test]
    fn empty_target_pattern_never_matches_nonempty_target() {
        let compiled = condition::compile(&Condition::Pattern(String::new())).unwrap();
        match compiled {
            condition::Compiled::Pattern(re) => assert!(!re.is_match("anything")),
            _ => panic!("expected pattern"),
        }
    }
}
