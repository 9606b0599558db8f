//! Runtime facade (§4.1): the single entry point an embedding application
//! calls to intercept an agent's proposed action. Unlike the gRPC service
//! this crate's predecessor exposed, `Runtime` never opens a network port —
//! it is an in-process library boundary, consulted on every action an agent
//! attempts.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use audit_log::{AuditLog, AuditLogError, AuditEvent};
use ciaa::Evaluator as CiaaEvaluator;
use decision_cache::PolicyCache;
use mediator_core::hash::canonical_json_sha256;
use mediator_core::ids::{new_action_id, now_ms};
use mediator_core::model::{ActionRequest, Decision};
use policy::{Engine as PolicyEngine, PolicyError};
use policy_learner::{Learner, LearnerError, PolicySuggestion};
use rate_limiter::{Algorithm, RateLimiter};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// All configuration knobs enumerated in §6, with defaults matching the
/// spec's component defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    /// YAML policy file to load at construction (§6). `None` starts with an
    /// empty, degrade-open policy set.
    pub policy_file_path: Option<String>,
    /// Directory audit log files are written under.
    pub audit_log_dir: String,
    /// Max entries in the action-decision cache (§4.5 default 10 000).
    pub decision_cache_size: usize,
    /// TTL, in seconds, for cached decisions (§4.5 default 300).
    pub decision_cache_ttl_secs: u64,
    /// Rate-limiter algorithm: `"token_bucket"` or `"sliding_window"`.
    pub rate_limit_algorithm: RateLimitAlgorithmConfig,
    /// Bounded FIFO window size for the policy learner (§4.7 default 1000).
    pub learner_window: usize,
    /// Extra case-insensitive substrings that mark a target as sensitive,
    /// added on top of the built-in list (§4.3).
    pub sensitive_terms: Vec<String>,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            policy_file_path: None,
            audit_log_dir: "audit_logs".to_string(),
            decision_cache_size: 10_000,
            decision_cache_ttl_secs: 300,
            rate_limit_algorithm: RateLimitAlgorithmConfig::TokenBucket,
            learner_window: 1000,
            sensitive_terms: Vec::new(),
        }
    }
}

impl MediatorConfig {
    /// Load a config from a YAML file, falling back to field defaults for
    /// anything the file omits.
    pub fn load_from_yaml_path(path: impl AsRef<Path>) -> Result<Self, MediatorError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|source| MediatorError::Config { path: path.as_ref().display().to_string(), source })?;
        serde_yaml::from_str(&contents)
            .map_err(|e| MediatorError::ConfigParse { path: path.as_ref().display().to_string(), reason: e.to_string() })
    }
}

/// Serde-friendly mirror of [`rate_limiter::Algorithm`] (the latter has no
/// `Deserialize` impl since it is an internal implementation choice, not a
/// wire type).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithmConfig {
    TokenBucket,
    SlidingWindow,
}

impl From<RateLimitAlgorithmConfig> for Algorithm {
    fn from(cfg: RateLimitAlgorithmConfig) -> Self {
        match cfg {
            RateLimitAlgorithmConfig::TokenBucket => Algorithm::TokenBucket,
            RateLimitAlgorithmConfig::SlidingWindow => Algorithm::SlidingWindow,
        }
    }
}

/// Aggregated error type at the facade boundary (§7): policy/CIAA/rate-limit
/// outcomes are never errors (they're encoded in the returned `Decision`).
/// Only construction-time and resource failures propagate here.
#[derive(Debug, Error)]
pub enum MediatorError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Config {
        /// Path that failed to open.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Config file was not valid YAML.
    #[error("malformed config file {path}: {reason}")]
    ConfigParse {
        /// Path of the offending file.
        path: String,
        /// Human-readable reason.
        reason: String,
    },
    /// Policy load/reload failed.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),
    /// Audit log open/append/verify failed.
    #[error("audit log error: {0}")]
    Audit(#[from] AuditLogError),
    /// Learner export failed.
    #[error("policy learner error: {0}")]
    Learner(#[from] LearnerError),
}

/// Orchestrates the interception pipeline (§4.1). Safe for concurrent
/// callers: every field is internally synchronized by its own crate.
pub struct Runtime {
    config: MediatorConfig,
    policy: PolicyEngine,
    ciaa: CiaaEvaluator,
    rate_limiter: RateLimiter,
    cache: PolicyCache,
    audit: AuditLog,
    learner: Arc<Learner>,
    learner_tx: mpsc::UnboundedSender<(ActionRequest, Decision)>,
}

impl Runtime {
    /// Construct a `Runtime` from `config`: loads policies (if
    /// `policy_file_path` is set; a missing/malformed file degrades open
    /// and is logged, per §4.2), opens the audit log, and spawns the
    /// policy-learner's background mining task (§4.7, §9 "offload mining
    /// to a separate cooperative task").
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime (the learner-notification
    /// task is spawned via [`tokio::spawn`]), matching the teacher's
    /// async task/channel idiom.
    pub fn new(config: MediatorConfig) -> Result<Self, MediatorError> {
        let policy = PolicyEngine::new();
        if let Some(path) = &config.policy_file_path {
            if let Err(err) = policy.load_from_yaml_path(path) {
                tracing::warn!(path, error = %err, "failed to load policy file, degrading open");
            }
        }

        let audit_path = PathBuf::from(&config.audit_log_dir)
            .join(format!("audit_{}.log", today_stamp()));
        let audit = AuditLog::open(audit_path)?;

        let rate_limiter =
            RateLimiter::with_sensitive_terms(config.rate_limit_algorithm.into(), config.sensitive_terms.clone());

        let learner = Arc::new(Learner::new(config.learner_window));
        let (learner_tx, mut learner_rx) = mpsc::unbounded_channel::<(ActionRequest, Decision)>();
        let learner_task = Arc::clone(&learner);
        tokio::spawn(async move {
            while let Some((action, decision)) = learner_rx.recv().await {
                learner_task.add_blocked_action(action, decision);
            }
        });

        Ok(Self {
            cache: PolicyCache::new_sized(config.decision_cache_size, config.decision_cache_ttl_secs),
            policy,
            ciaa: CiaaEvaluator::new(),
            rate_limiter,
            audit,
            learner,
            learner_tx,
            config,
        })
    }

    /// Intercept one proposed action, returning the verdict (§4.1, steps
    /// 1-9). The hot path performs no I/O except the synchronous audit
    /// append in step 8.
    #[tracing::instrument(skip(self, action), fields(agent_id = %action.agent_id, action_type = ?action.action_type, target = %action.target))]
    pub fn intercept(&self, mut action: ActionRequest) -> Decision {
        if action.action_id.is_empty() {
            action.action_id = new_action_id();
        }
        if action.timestamp == 0 {
            action.timestamp = now_ms();
        }

        let action_hash = canonical_json_sha256(
            &serde_json::to_value(&action.parameters).unwrap_or(serde_json::Value::Null),
            "",
        );

        if let Some(mut decision) = self.cache.get_action_decision(
            &action.agent_id,
            action.action_type.as_str(),
            &action.target,
            &action_hash,
        ) {
            tracing::debug!("decision cache hit");
            decision.action_id = action.action_id.clone();
            decision.decided_at = now_ms();
            self.finish(&action, decision.clone());
            return decision;
        }

        let rate_outcome = self.rate_limiter.check(&action.agent_id, action.action_type, &action.target);
        if !rate_outcome.allowed {
            tracing::warn!(wait_s = rate_outcome.max_wait_time, "rate limit exceeded");
            let decision = Decision::deny_policy(action.action_id.clone(), String::new(), "rate limit exceeded");
            self.cache.set_action_decision(
                &action.agent_id,
                action.action_type.as_str(),
                &action.target,
                &action_hash,
                &decision,
            );
            self.finish(&action, decision.clone());
            return decision;
        }

        if let Some((policy_id, reason)) = self.policy.evaluate(&action) {
            tracing::info!(policy_id = %policy_id, "denied by policy");
            let decision = Decision::deny_policy(action.action_id.clone(), policy_id, reason);
            self.cache.set_action_decision(
                &action.agent_id,
                action.action_type.as_str(),
                &action.target,
                &action_hash,
                &decision,
            );
            self.finish(&action, decision.clone());
            return decision;
        }

        let violations = self.ciaa.evaluate(&action);
        let decision = if violations.is_empty() {
            Decision::allow(action.action_id.clone(), "no policy or CIAA violation")
        } else {
            tracing::warn!(axes = violations.len(), "denied by CIAA evaluation");
            Decision::deny_ciaa(action.action_id.clone(), violations)
        };

        self.cache.set_action_decision(
            &action.agent_id,
            action.action_type.as_str(),
            &action.target,
            &action_hash,
            &decision,
        );
        self.finish(&action, decision.clone());
        decision
    }

    /// Step 8-9: append the audit record synchronously, then notify the
    /// policy learner fire-and-forget (§9). A closed learner channel (the
    /// mining task panicked) is logged, not propagated — the caller already
    /// has their decision.
    fn finish(&self, action: &ActionRequest, decision: Decision) {
        let ciaa_snapshot = if decision.allow {
            std::collections::BTreeMap::new()
        } else {
            decision.ciaa_violations.clone()
        };
        if let Err(err) = self.audit.append(action, &decision, &ciaa_snapshot) {
            tracing::error!(error = %err, "audit-failure: decision was not recorded");
        }
        if !decision.allow && self.learner_tx.send((action.clone(), decision)).is_err() {
            tracing::error!("policy learner channel closed, dropping suggestion input");
        }
    }

    /// Reload the policy set from `policy_file_path` (§6 `reload_policies`).
    /// A missing/malformed file degrades the evaluator to an empty set
    /// rather than failing the whole runtime.
    pub fn reload_policies(&self) -> Result<(), MediatorError> {
        let Some(path) = &self.config.policy_file_path else {
            return Ok(());
        };
        self.policy.load_from_yaml_path(path)?;
        Ok(())
    }

    /// `audit.verify_chain() → bool` (§6).
    pub fn verify_audit_chain(&self) -> bool {
        self.audit.verify_chain().is_ok()
    }

    /// `audit.get_recent_events(limit) → [AuditEvent]` (§6), newest first.
    pub fn recent_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>, MediatorError> {
        Ok(self.audit.get_recent_events(limit)?)
    }

    /// `learner.get_suggestions(min_confidence) → [Suggestion]` (§6).
    pub fn learner_suggestions(&self, min_confidence: f64) -> Vec<PolicySuggestion> {
        self.learner.get_suggestions(min_confidence)
    }

    /// `learner.export_suggestions(path, min_confidence)` (§6): writes a
    /// declarative YAML policy file an operator can fold into
    /// `policy_file_path`.
    pub fn export_learner_suggestions(
        &self,
        path: impl AsRef<Path>,
        min_confidence: f64,
    ) -> Result<usize, MediatorError> {
        Ok(self.learner.export_suggestions(path, min_confidence)?)
    }

    /// `rate_limiter.get_agent_rate_stats(agent_id) → stats` (§6).
    pub fn agent_rate_stats(&self, agent_id: &str) -> Option<rate_limiter::AgentRateStats> {
        self.rate_limiter.get_agent_rate_stats(agent_id)
    }
}

fn today_stamp() -> String {
    let days = now_ms() / 86_400_000;
    // Proleptic Gregorian civil-from-days (Howard Hinnant's algorithm),
    // avoiding a `chrono` dependency for this crate just to format a date.
    let z = days as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{y:04}-{m:02}-{d:02}")
}
