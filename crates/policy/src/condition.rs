//! The condition predicate tree (§4.2, §9 "dynamic condition tree").
//!
//! `Condition` is the form deserialized straight from YAML; `Compiled` is
//! the same tree with every regex pre-compiled once at load time so the hot
//! path never pays compilation cost. The split mirrors the teacher's
//! pattern of validating/compiling at `load_from_yaml_path` time and storing
//! only the validated form (`policy::Engine::load_from_yaml_path`).

use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Raw, YAML-facing condition tree.
#[derive(Debug, Clone, Default)]
pub enum Condition {
    /// Matches everything.
    #[default]
    Empty,
    /// Predicate on `ActionRequest::target`.
    Target(TargetSpec),
    /// Predicate requiring every listed parameter to be present and match.
    Parameters(BTreeMap<String, ParamSpec>),
    /// Shorthand for `target: { pattern: ... }`.
    Pattern(String),
    /// True when recent observations for `key` reach `max_per_minute`.
    RateLimit(RateLimitSpec),
    /// All sub-conditions must match.
    And(Vec<Condition>),
    /// Any sub-condition must match.
    Or(Vec<Condition>),
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize, Default)]
        struct Raw {
            target: Option<TargetSpec>,
            parameters: Option<BTreeMap<String, ParamSpec>>,
            pattern: Option<String>,
            rate_limit: Option<RateLimitSpec>,
            and: Option<Vec<Condition>>,
            or: Option<Vec<Condition>>,
        }
        let raw = Raw::deserialize(deserializer)?;
        if let Some(v) = raw.and {
            return Ok(Condition::And(v));
        }
        if let Some(v) = raw.or {
            return Ok(Condition::Or(v));
        }
        if let Some(v) = raw.rate_limit {
            return Ok(Condition::RateLimit(v));
        }
        if let Some(p) = raw.pattern {
            return Ok(Condition::Pattern(p));
        }
        if let Some(t) = raw.target {
            return Ok(Condition::Target(t));
        }
        if let Some(p) = raw.parameters {
            return Ok(Condition::Parameters(p));
        }
        Ok(Condition::Empty)
    }
}

/// `target`: a literal string, a membership list, `{in: [...]}`, or
/// `{pattern: <regex>}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    /// `{ pattern: "..." }`
    Pattern {
        /// Regex source, anchored at the start of `target`.
        pattern: String,
    },
    /// `{ in: [...] }`
    In {
        /// Membership set.
        #[serde(rename = "in")]
        set: Vec<String>,
    },
    /// A bare YAML list: membership shorthand.
    List(Vec<String>),
    /// A bare YAML string: exact equality.
    Literal(String),
}

/// `parameters.<name>`: a literal value, `{pattern: ...}`, or `{in: [...]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ParamSpec {
    /// `{ pattern: "..." }`, matched against the parameter's string form.
    Pattern {
        /// Regex source.
        pattern: String,
    },
    /// `{ in: [...] }`
    In {
        /// Membership set of JSON values.
        #[serde(rename = "in")]
        set: Vec<JsonValue>,
    },
    /// Exact equality against the JSON value.
    Literal(JsonValue),
}

/// `key` field of a `rate_limit` condition.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    AgentId,
    Target,
    ActionId,
}

/// `rate_limit: { max_per_minute, window_seconds, key }`.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSpec {
    pub max_per_minute: u64,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    pub key: RateLimitKey,
}

fn default_window_seconds() -> u64 {
    60
}

/// `Condition`, with every pattern pre-compiled.
#[derive(Debug, Clone)]
pub enum Compiled {
    Empty,
    Target(CompiledTarget),
    Parameters(BTreeMap<String, CompiledParam>),
    Pattern(AnchoredPattern),
    RateLimit(RateLimitSpec),
    And(Vec<Compiled>),
    Or(Vec<Compiled>),
}

/// A regex anchored at the start of the input. An empty pattern source
/// never matches a non-empty input (§8 boundary case), overriding the
/// otherwise-trivial empty-regex match.
#[derive(Debug, Clone)]
pub struct AnchoredPattern {
    source_is_empty: bool,
    regex: Regex,
}

impl AnchoredPattern {
    fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let anchored = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^{pattern}")
        };
        Ok(Self { source_is_empty: pattern.is_empty(), regex: Regex::new(&anchored)? })
    }

    pub fn is_match(&self, input: &str) -> bool {
        if self.source_is_empty {
            return false;
        }
        self.regex.is_match(input)
    }
}

#[derive(Debug, Clone)]
pub enum CompiledTarget {
    Pattern(AnchoredPattern),
    In(Vec<String>),
    List(Vec<String>),
    Literal(String),
}

impl CompiledTarget {
    pub fn matches(&self, target: &str) -> bool {
        match self {
            CompiledTarget::Pattern(p) => p.is_match(target),
            CompiledTarget::In(set) | CompiledTarget::List(set) => {
                set.iter().any(|s| s == target)
            }
            CompiledTarget::Literal(s) => s == target,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CompiledParam {
    Pattern(AnchoredPattern),
    In(Vec<JsonValue>),
    Literal(JsonValue),
}

impl CompiledParam {
    pub fn matches(&self, value: &JsonValue) -> bool {
        match self {
            CompiledParam::Pattern(p) => {
                let as_str = match value {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                };
                p.is_match(&as_str)
            }
            CompiledParam::In(set) => set.contains(value),
            CompiledParam::Literal(expected) => expected == value,
        }
    }
}

/// Compile a `Condition` tree, failing on the first invalid regex
/// encountered. Callers (see `Engine::load_rules`) skip the whole rule on
/// error rather than propagate a crash into evaluation (§4.2 failure modes).
pub fn compile(condition: &Condition) -> Result<Compiled, regex::Error> {
    Ok(match condition {
        Condition::Empty => Compiled::Empty,
        Condition::Target(t) => Compiled::Target(match t {
            TargetSpec::Pattern { pattern } => CompiledTarget::Pattern(AnchoredPattern::compile(pattern)?),
            TargetSpec::In { set } => CompiledTarget::In(set.clone()),
            TargetSpec::List(list) => CompiledTarget::List(list.clone()),
            TargetSpec::Literal(s) => CompiledTarget::Literal(s.clone()),
        }),
        Condition::Parameters(params) => {
            let mut compiled = BTreeMap::new();
            for (k, spec) in params {
                let c = match spec {
                    ParamSpec::Pattern { pattern } => {
                        CompiledParam::Pattern(AnchoredPattern::compile(pattern)?)
                    }
                    ParamSpec::In { set } => CompiledParam::In(set.clone()),
                    ParamSpec::Literal(v) => CompiledParam::Literal(v.clone()),
                };
                compiled.insert(k.clone(), c);
            }
            Compiled::Parameters(compiled)
        }
        Condition::Pattern(p) => Compiled::Pattern(AnchoredPattern::compile(p)?),
        Condition::RateLimit(rl) => Compiled::RateLimit(rl.clone()),
        Condition::And(children) => {
            let mut compiled = Vec::with_capacity(children.len());
            for c in children {
                compiled.push(compile(c)?);
            }
            Compiled::And(compiled)
        }
        Condition::Or(children) => {
            let mut compiled = Vec::with_capacity(children.len());
            for c in children {
                compiled.push(compile(c)?);
            }
            Compiled::Or(compiled)
        }
    })
}
