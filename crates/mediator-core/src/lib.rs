//! Core data model shared by every mediator crate: action/decision/policy
//! types, id and timestamp helpers, and canonical JSON hashing.

#![deny(unsafe_code)]

pub mod ids {
    //! ID and timestamp utilities.

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate a new monotonic identifier (starts at 1).
    pub fn next_monotonic_id() -> u64 {
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Milliseconds since UNIX epoch (for timestamps).
    pub fn now_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
    }

    /// Opaque action identifier, unique per process.
    pub fn new_action_id() -> String {
        format!("act-{}", next_monotonic_id())
    }

}

pub mod model {
    //! `ActionRequest`, `Decision`, `PolicyRule`, `AuditEvent` and their
    //! invariants (§3).

    use super::ids::{new_action_id, now_ms};
    use serde::{Deserialize, Serialize};
    use serde_json::Value as JsonValue;
    use std::collections::BTreeMap;

    /// The eight action types an agent may attempt.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[serde(rename_all = "snake_case")]
    pub enum ActionType {
        ToolCall,
        ApiCall,
        NetworkRequest,
        DatabaseQuery,
        FileRead,
        FileWrite,
        MemoryRead,
        MemoryWrite,
    }

    impl ActionType {
        /// Wire/name form, used in `applies_to` matching and cache keys.
        pub fn as_str(&self) -> &'static str {
            match self {
                ActionType::ToolCall => "tool_call",
                ActionType::ApiCall => "api_call",
                ActionType::NetworkRequest => "network_request",
                ActionType::DatabaseQuery => "database_query",
                ActionType::FileRead => "file_read",
                ActionType::FileWrite => "file_write",
                ActionType::MemoryRead => "memory_read",
                ActionType::MemoryWrite => "memory_write",
            }
        }
    }

    /// What an agent proposes to do.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ActionRequest {
        pub action_id: String,
        pub agent_id: String,
        pub action_type: ActionType,
        pub target: String,
        #[serde(default)]
        pub parameters: BTreeMap<String, JsonValue>,
        #[serde(default)]
        pub declared_goal: String,
        pub timestamp: u64,
        #[serde(default)]
        pub context: BTreeMap<String, JsonValue>,
    }

    impl ActionRequest {
        /// Build a request, assigning `action_id`/`timestamp` if absent.
        ///
        /// # Panics
        /// Panics if `agent_id` or `target` is empty — these are caller
        /// programmer errors, not decisions (§7: "only programmer errors
        /// propagate").
        pub fn new(
            agent_id: impl Into<String>,
            action_type: ActionType,
            target: impl Into<String>,
        ) -> Self {
            let agent_id = agent_id.into();
            let target = target.into();
            assert!(!agent_id.is_empty(), "agent_id must not be empty");
            assert!(!target.is_empty(), "target must not be empty");
            Self {
                action_id: new_action_id(),
                agent_id,
                action_type,
                target,
                parameters: BTreeMap::new(),
                declared_goal: String::new(),
                timestamp: now_ms(),
                context: BTreeMap::new(),
            }
        }

        pub fn with_parameters(mut self, parameters: BTreeMap<String, JsonValue>) -> Self {
            self.parameters = parameters;
            self
        }

        pub fn with_declared_goal(mut self, goal: impl Into<String>) -> Self {
            self.declared_goal = goal.into();
            self
        }

        /// Fingerprint used for decision-cache keys: `agent|type|target|hash(params)`.
        pub fn fingerprint(&self) -> String {
            let params_hash = super::hash::canonical_json_sha256(
                &serde_json::to_value(&self.parameters).unwrap_or(JsonValue::Null),
                "",
            );
            format!(
                "{}|{}|{}|{}",
                self.agent_id,
                self.action_type.as_str(),
                self.target,
                params_hash
            )
        }
    }

    /// The four safety axes.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub enum CiaaAxis {
        #[serde(rename = "C")]
        Confidentiality,
        #[serde(rename = "I")]
        Integrity,
        #[serde(rename = "A")]
        Availability,
        #[serde(rename = "Acc")]
        Accountability,
    }

    /// Outcome of policy evaluation: `ALLOW | DENY | REVIEW`.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum PolicyDecision {
        Allow,
        Deny,
        Review,
    }

    /// The verdict returned by the interceptor.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Decision {
        pub allow: bool,
        #[serde(default)]
        pub policy_id: String,
        pub explanation: String,
        #[serde(default)]
        pub ciaa_violations: BTreeMap<CiaaAxis, String>,
        pub action_id: String,
        pub decided_at: u64,
    }

    impl Decision {
        pub fn allow(action_id: impl Into<String>, explanation: impl Into<String>) -> Self {
            Self {
                allow: true,
                policy_id: String::new(),
                explanation: explanation.into(),
                ciaa_violations: BTreeMap::new(),
                action_id: action_id.into(),
                decided_at: now_ms(),
            }
        }

        pub fn deny_policy(
            action_id: impl Into<String>,
            policy_id: impl Into<String>,
            reason: impl Into<String>,
        ) -> Self {
            Self {
                allow: false,
                policy_id: policy_id.into(),
                explanation: reason.into(),
                ciaa_violations: BTreeMap::new(),
                action_id: action_id.into(),
                decided_at: now_ms(),
            }
        }

        pub fn deny_ciaa(
            action_id: impl Into<String>,
            violations: BTreeMap<CiaaAxis, String>,
        ) -> Self {
            let axes: Vec<&str> = violations
                .keys()
                .map(|a| match a {
                    CiaaAxis::Confidentiality => "C",
                    CiaaAxis::Integrity => "I",
                    CiaaAxis::Availability => "A",
                    CiaaAxis::Accountability => "Acc",
                })
                .collect();
            Self {
                allow: false,
                policy_id: String::new(),
                explanation: format!("CIAA violation on axes: {}", axes.join(",")),
                ciaa_violations: violations,
                action_id: action_id.into(),
                decided_at: now_ms(),
            }
        }

        /// Invariant check per §8.1: `allow ⇒ policy_id empty && ciaa_violations empty`.
        pub fn is_well_formed(&self) -> bool {
            if self.allow {
                self.policy_id.is_empty() && self.ciaa_violations.is_empty()
            } else {
                !self.policy_id.is_empty() || !self.ciaa_violations.is_empty()
            }
        }
    }

    /// A single declarative policy rule. The predicate tree (`condition`)
    /// is owned by the `policy` crate, which re-exports this type together
    /// with `Condition`.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PolicyRuleMeta {
        pub id: String,
        pub applies_to: AppliesTo,
        pub decision: PolicyDecision,
        #[serde(default)]
        pub reason: String,
        pub priority: i64,
    }

    /// `"*"` or an explicit set of action types.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum AppliesTo {
        Any(AnyMarker),
        Types(Vec<ActionType>),
    }

    /// Marker matched against the literal string `"*"`.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct AnyMarker(pub String);

    impl AppliesTo {
        pub fn matches(&self, action_type: ActionType) -> bool {
            match self {
                AppliesTo::Any(m) => m.0 == "*",
                AppliesTo::Types(types) => types.contains(&action_type),
            }
        }
    }

    /// Record in the hash chain (§3, §4.6). `hash`/`previous_hash` are
    /// filled in by the audit log on append.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AuditEvent {
        pub hash: String,
        pub previous_hash: String,
        pub action_request: ActionRequest,
        pub decision: Decision,
        pub ciaa_evaluation: BTreeMap<CiaaAxis, String>,
        pub timestamp: u64,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn action_request_invariants() {
            let req = ActionRequest::new("agent-1", ActionType::ToolCall, "echo");
            assert!(!req.agent_id.is_empty());
            assert!(!req.action_id.is_empty());
        }

        #[test]
        #[should_panic(expected = "agent_id")]
        fn empty_agent_id_panics() {
            ActionRequest::new("", ActionType::ToolCall, "echo");
        }

        #[test]
        fn allow_decision_is_well_formed() {
            let d = Decision::allow("a1", "ok");
            assert!(d.is_well_formed());
        }

        #[test]
        fn deny_decision_without_cause_is_malformed() {
            let d = Decision {
                allow: false,
                policy_id: String::new(),
                explanation: "bad".into(),
                ciaa_violations: BTreeMap::new(),
                action_id: "a1".into(),
                decided_at: 0,
            };
            assert!(!d.is_well_formed());
        }

        #[test]
        fn applies_to_wildcard() {
            let any = AppliesTo::Any(AnyMarker("*".into()));
            assert!(any.matches(ActionType::FileWrite));
        }

        #[test]
        fn applies_to_explicit_set() {
            let set = AppliesTo::Types(vec![ActionType::ToolCall, ActionType::ApiCall]);
            assert!(set.matches(ActionType::ToolCall));
            assert!(!set.matches(ActionType::FileWrite));
        }
    }
}

pub mod hash {
    //! Canonical JSON serialization and SHA-256 chaining, shared by the
    //! audit log and the decision-cache fingerprint.

    use serde_json::Value as JsonValue;
    use sha2::{Digest, Sha256};

    /// Render `value` as canonical JSON: object keys sorted, compact
    /// separators, no NaN/Inf (serde_json already rejects those at
    /// construction time).
    pub fn canonical_json(value: &JsonValue) -> String {
        sort_value(value).to_string()
    }

    fn sort_value(value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::Object(map) => {
                let mut sorted = serde_json::Map::new();
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for k in keys {
                    sorted.insert(k.clone(), sort_value(&map[k]));
                }
                JsonValue::Object(sorted)
            }
            JsonValue::Array(items) => JsonValue::Array(items.iter().map(sort_value).collect()),
            other => other.clone(),
        }
    }

    /// `SHA-256(canonical_json(payload) || previous_hash)`, hex-encoded.
    pub fn canonical_json_sha256(payload: &JsonValue, previous_hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(payload).as_bytes());
        hasher.update(previous_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// 64 ASCII zeros: the genesis `previous_hash`.
    pub fn genesis_hash() -> String {
        "0".repeat(64)
    }

}
