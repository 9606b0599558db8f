//! CIAA safety evaluator (§4.4): confidentiality, integrity, availability,
//! accountability.
//!
//! Confidentiality/integrity checks are pure pattern matching; availability
//! keeps a per-`(agent, action_type, target)` rolling window of recent
//! timestamps, mutex-guarded, independent of the `rate-limiter` crate's
//! dimensions (§4.4: "complements, but is not replaced by" the rate
//! limiter). Accountability is not computed on the hot path; `flag_goal`
//! is offered for callers (the runtime facade, the audit log) that want to
//! surface an empty `declared_goal`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mediator_core::model::{ActionRequest, ActionType, CiaaAxis};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

static CREDENTIAL_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(password|secret|api[_-]?key|token|credential)\b").unwrap()
});
static PHONE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").unwrap());
static EMAIL_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[\w.+-]+@[\w-]+\.[A-Za-z]{2,}\b").unwrap());

const CONFIDENTIALITY_TOOL_TARGETS: &[&str] = &["http_request", "send_email", "upload_file"];
const CRITICAL_PATHS: &[&str] = &["/etc/", "/bin/", "/usr/bin/", "/system/", "config.yaml"];
const DANGEROUS_TOOLS: &[&str] = &["execute_command", "install_package", "modify_system"];

/// Per-minute availability caps, keyed by `action_type`; anything not
/// listed uses `default`.
fn availability_limit(action_type: ActionType) -> u64 {
    match action_type {
        ActionType::DatabaseQuery => 50,
        ActionType::MemoryRead => 100,
        ActionType::ApiCall => 30,
        ActionType::NetworkRequest => 10,
        _ => 100,
    }
}

fn is_internal_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "localhost" || host == "127.0.0.1" || host.contains("internal")
}

/// Evaluates the CIAA axes for a single action. Holds the availability
/// counters; safe to share across threads behind an `Arc`.
pub struct Evaluator {
    availability_windows: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    /// Construct an evaluator with empty availability counters.
    #[must_use]
    pub fn new() -> Self {
        Self { availability_windows: Mutex::new(HashMap::new()) }
    }

    /// Evaluate all CIAA axes for `action`, returning the (possibly empty)
    /// violation map.
    #[tracing::instrument(skip(self, action), fields(agent_id = %action.agent_id))]
    pub fn evaluate(&self, action: &ActionRequest) -> BTreeMap<CiaaAxis, String> {
        let mut violations = BTreeMap::new();
        if let Some(reason) = self.violates_confidentiality(action) {
            violations.insert(CiaaAxis::Confidentiality, reason);
        }
        if let Some(reason) = self.violates_integrity(action) {
            violations.insert(CiaaAxis::Integrity, reason);
        }
        if let Some(reason) = self.violates_availability(action) {
            violations.insert(CiaaAxis::Availability, reason);
        }
        if !violations.is_empty() {
            tracing::warn!(axes = ?violations.keys().collect::<Vec<_>>(), "CIAA violation");
        }
        violations
    }

    fn violates_confidentiality(&self, action: &ActionRequest) -> Option<String> {
        let params_text = serde_json::to_string(&action.parameters).unwrap_or_default().to_lowercase();
        if CREDENTIAL_TERMS.is_match(&params_text) {
            return Some("parameters contain a credential-like term".to_string());
        }
        if PHONE_NUMBER.is_match(&params_text) {
            return Some("parameters contain a phone number".to_string());
        }
        if EMAIL_ADDRESS.is_match(&params_text) {
            return Some("parameters contain an email address".to_string());
        }
        if action.action_type == ActionType::ToolCall
            && CONFIDENTIALITY_TOOL_TARGETS.contains(&action.target.as_str())
        {
            if let Some(url) = action.parameters.get("url").and_then(|v| v.as_str()) {
                if let Some(host) = extract_host(url) {
                    if !is_internal_host(&host) {
                        return Some(format!("external host '{host}' in url parameter"));
                    }
                }
            }
        }
        None
    }

    fn violates_integrity(&self, action: &ActionRequest) -> Option<String> {
        let target_lower = action.target.to_ascii_lowercase();
        if matches!(action.action_type, ActionType::FileWrite | ActionType::MemoryWrite)
            && CRITICAL_PATHS.iter().any(|p| target_lower.contains(p))
        {
            return Some(format!("target '{}' touches a critical path", action.target));
        }
        if action.action_type == ActionType::ToolCall && DANGEROUS_TOOLS.contains(&action.target.as_str())
        {
            return Some(format!("tool '{}' is in the dangerous-tools list", action.target));
        }
        None
    }

    fn violates_availability(&self, action: &ActionRequest) -> Option<String> {
        let key = format!("{}:{}:{}", action.agent_id, action.action_type.as_str(), action.target);
        let limit = availability_limit(action.action_type);
        let now = mediator_core::ids::now_ms();
        let window_ms = 60_000u64;
        let mut windows = self.availability_windows.lock().expect("availability lock poisoned");
        let deque = windows.entry(key).or_default();
        while let Some(&front) = deque.front() {
            if now.saturating_sub(front) > window_ms {
                deque.pop_front();
            } else {
                break;
            }
        }
        deque.push_back(now);
        if deque.len() as u64 > limit {
            Some(format!("availability cap ({limit}/min) exceeded for {:?}", action.action_type))
        } else {
            None
        }
    }
}

/// Accountability is not computed in the hot path (§4.4); callers may flag
/// an empty `declared_goal` explicitly, e.g. when writing the audit record.
pub fn flag_missing_goal(action: &ActionRequest) -> Option<String> {
    if action.declared_goal.trim().is_empty() {
        Some("no declared_goal supplied".to_string())
    } else {
        None
    }
}

fn extract_host(url: &str) -> Option<String> {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host_port = without_scheme.split('/').next()?;
    let host = host_port.split(':').next()?;
    Some(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_core::model::ActionRequest;

    #[test]
    fn integrity_violation_on_etc_passwd() {
        let evaluator = Evaluator::new();
        let req = ActionRequest::new("a1", ActionType::FileWrite, "/etc/passwd");
        let violations = evaluator.evaluate(&req);
        assert!(violations.contains_key(&CiaaAxis::Integrity));
    }

    #[test]
    fn dangerous_tool_violates_integrity() {
        let evaluator = Evaluator::new();
        let req = ActionRequest::new("a1", ActionType::ToolCall, "execute_command");
        let violations = evaluator.evaluate(&req);
        assert!(violations.contains_key(&CiaaAxis::Integrity));
    }

    #[test]
    fn external_url_violates_confidentiality() {
        let evaluator = Evaluator::new();
        let mut req = ActionRequest::new("a1", ActionType::ToolCall, "http_request");
        req.parameters.insert("url".into(), serde_json::json!("https://evil.example/exfil"));
        let violations = evaluator.evaluate(&req);
        assert!(violations.contains_key(&CiaaAxis::Confidentiality));
    }

    #[test]
    fn localhost_url_is_safe() {
        let evaluator = Evaluator::new();
        let mut req = ActionRequest::new("a1", ActionType::ToolCall, "http_request");
        req.parameters.insert("url".into(), serde_json::json!("http://localhost/ping"));
        let violations = evaluator.evaluate(&req);
        assert!(!violations.contains_key(&CiaaAxis::Confidentiality));
    }

    #[test]
    fn credential_term_in_parameters_violates_confidentiality() {
        let evaluator = Evaluator::new();
        let mut req = ActionRequest::new("a1", ActionType::ApiCall, "svc");
        req.parameters.insert("body".into(), serde_json::json!("password=hunter2"));
        let violations = evaluator.evaluate(&req);
        assert!(violations.contains_key(&CiaaAxis::Confidentiality));
    }

    #[test]
    fn availability_cap_trips_after_limit() {
        let evaluator = Evaluator::new();
        for _ in 0..10 {
            let req = ActionRequest::new("a1", ActionType::NetworkRequest, "svc");
            let _ = evaluator.evaluate(&req);
        }
        let req = ActionRequest::new("a1", ActionType::NetworkRequest, "svc");
        let violations = evaluator.evaluate(&req);
        assert!(violations.contains_key(&CiaaAxis::Availability));
    }

    #[test]
    fn clean_action_has_no_violations() {
        let evaluator = Evaluator::new();
        let req = ActionRequest::new("a1", ActionType::ToolCall, "echo");
        assert!(evaluator.evaluate(&req).is_empty());
    }

    #[test]
    fn missing_goal_can_be_flagged() {
        let req = ActionRequest::new("a1", ActionType::ToolCall, "echo");
        assert!(flag_missing_goal(&req).is_some());
        let req2 = req.with_declared_goal("investigate ticket 42");
        assert!(flag_missing_goal(&req2).is_none());
    }
}
