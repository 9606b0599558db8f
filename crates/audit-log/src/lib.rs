//! Hash-chained, append-only audit log (§4.6): every intercepted action is
//! recorded as one canonicalized JSON line, chained to the previous line's
//! hash so tampering with or reordering any entry is detectable.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mediator_core::hash::{canonical_json, canonical_json_sha256, genesis_hash};
pub use mediator_core::model::AuditEvent;
use mediator_core::model::{ActionRequest, CiaaAxis, Decision};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Errors emitted by the audit log.
#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("hash chain broken at line {line}: {reason}")]
    ChainBroken { line: usize, reason: String },
}

#[derive(Serialize)]
struct Payload<'a> {
    action_request: &'a ActionRequest,
    decision: &'a Decision,
    ciaa_evaluation: &'a BTreeMap<CiaaAxis, String>,
    timestamp: u64,
}

/// Append-only, hash-chained, date-partitioned audit log. `append` takes a
/// writer lock; reads (`get_recent_events`, `verify_chain`) take a shared
/// lock so writers are never starved behind a long scan.
pub struct AuditLog {
    path: PathBuf,
    previous_hash: RwLock<String>,
}

impl AuditLog {
    /// Open (or create) the log file at `path`, recovering `previous_hash`
    /// from the last line if the file already has content.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AuditLogError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        }
        let previous_hash = Self::load_last_hash(&path)?;
        Ok(Self { path, previous_hash: RwLock::new(previous_hash) })
    }

    fn load_last_hash(path: &Path) -> Result<String, AuditLogError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut last = None;
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(&line)?;
            last = Some(event.hash);
        }
        Ok(last.unwrap_or_else(genesis_hash))
    }

    /// Append one audit event for `(action, decision, ciaa_evaluation)`,
    /// chaining it to the previous entry's hash.
    #[tracing::instrument(skip(self, action, decision, ciaa_evaluation), fields(action_id = %action.action_id))]
    pub fn append(
        &self,
        action: &ActionRequest,
        decision: &Decision,
        ciaa_evaluation: &BTreeMap<CiaaAxis, String>,
    ) -> Result<String, AuditLogError> {
        let mut previous_hash = self.previous_hash.write().expect("audit log lock poisoned");
        let timestamp = mediator_core::ids::now_ms();
        let payload = Payload { action_request: action, decision, ciaa_evaluation, timestamp };
        let payload_json = serde_json::to_value(&payload)?;
        let hash = canonical_json_sha256(&payload_json, &previous_hash);

        let event = AuditEvent {
            hash: hash.clone(),
            previous_hash: previous_hash.clone(),
            action_request: action.clone(),
            decision: decision.clone(),
            ciaa_evaluation: ciaa_evaluation.clone(),
            timestamp,
        };

        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let event_json = serde_json::to_value(&event)?;
        let line = canonical_json(&event_json);
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        tracing::info!(action_id = %action.action_id, allow = decision.allow, "audit event recorded");
        *previous_hash = hash.clone();
        Ok(hash)
    }

    /// Walk the log from genesis, recomputing each hash and checking
    /// previous-hash continuity. Returns the first break found, if any.
    pub fn verify_chain(&self) -> Result<(), AuditLogError> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut expected_previous = genesis_hash();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(&line)?;
            if event.previous_hash != expected_previous {
                return Err(AuditLogError::ChainBroken {
                    line: idx,
                    reason: "previous_hash does not match prior entry".to_string(),
                });
            }
            let payload = Payload {
                action_request: &event.action_request,
                decision: &event.decision,
                ciaa_evaluation: &event.ciaa_evaluation,
                timestamp: event.timestamp,
            };
            let payload_json = serde_json::to_value(&payload)?;
            let recomputed = canonical_json_sha256(&payload_json, &event.previous_hash);
            if recomputed != event.hash {
                return Err(AuditLogError::ChainBroken {
                    line: idx,
                    reason: "recomputed hash does not match stored hash".to_string(),
                });
            }
            expected_previous = event.hash;
        }
        Ok(())
    }

    /// The most recent `limit` events, newest first.
    pub fn get_recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>, AuditLogError> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut all = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            all.push(serde_json::from_str(&line)?);
        }
        let start = all.len().saturating_sub(limit);
        all.drain(..start);
        all.reverse();
        Ok(all)
    }
}
