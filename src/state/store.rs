//! State document store
//!
//! A single JSON document holds the high-churn, low-cardinality state:
//! capped decision/execution/evaluation histories, the runtime autonomy
//! level, error-retry counters, conversation memory, and a version counter.
//! Writes are atomic (write-to-temp + rename). Append-heavy data lives in
//! the embedded database, not here.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{
    AutonomyLevel, ConversationEntry, DecisionRecord, EvaluationRecord, ExecutionRecord,
};

const DECISION_CAP: usize = 50;
const EXECUTION_CAP: usize = 100;
const EVALUATION_CAP: usize = 100;
const CONVERSATION_CAP: usize = 200;
const CONVERSATION_TTL_DAYS: i64 = 7;

/// State persistence failure
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write state: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The state document
///
/// Every field defaults so documents written by older builds load cleanly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    /// Monotonic counter bumped on every mutation
    pub state_version: u64,

    /// Runtime autonomy level; changed only by operator command
    pub autonomy_level: Option<AutonomyLevel>,

    /// Runtime AI toggle; None means "follow config"
    pub ai_enabled: Option<bool>,

    /// Most recent think-cycle results (cap 50)
    pub decisions: Vec<DecisionRecord>,

    /// Most recent side-effect attempts (cap 100)
    pub executions: Vec<ExecutionRecord>,

    /// Most recent session assessments (cap 100)
    pub evaluations: Vec<EvaluationRecord>,

    /// Consecutive failed-start counters per project
    pub error_retries: HashMap<String, u32>,

    /// Recent operator exchanges (cap 200, 7-day TTL)
    pub conversation: Vec<ConversationEntry>,
}

/// Thread-safe store over the state document
pub struct Store {
    path: PathBuf,
    state: Mutex<State>,
}

impl Store {
    /// Materialize the document, with defaults for anything missing
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let content = fs::read_to_string(&path).map_err(StateError::Read)?;
            match serde_json::from_str::<State>(&content) {
                Ok(state) => state,
                Err(e) => {
                    // A corrupt document is not fatal: start fresh rather
                    // than refuse to boot, but keep the bad file around.
                    warn!(error = %e, path = %path.display(), "State document unreadable, starting fresh");
                    let backup = path.with_extension("json.corrupt");
                    let _ = fs::rename(&path, &backup);
                    State::default()
                }
            }
        } else {
            debug!(path = %path.display(), "No state document, starting with defaults");
            State::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Write the document atomically
    ///
    /// If the file on disk carries a version at or past ours, another
    /// writer got there first; the write is retried once on top of the
    /// observed version.
    fn save_locked(&self, state: &mut State) -> Result<(), StateError> {
        for attempt in 0..2 {
            let disk_version = self.disk_version();
            if disk_version >= state.state_version {
                if attempt == 0 {
                    debug!(
                        disk_version,
                        ours = state.state_version,
                        "State version conflict, retrying over disk version"
                    );
                    state.state_version = disk_version + 1;
                    continue;
                }
                // Second conflict in a row: accept the lost event
                debug!("State version conflict persisted after retry");
            }

            let json = serde_json::to_string_pretty(state)?;
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).map_err(StateError::Write)?;
            }
            let tmp = self.path.with_extension("json.tmp");
            fs::write(&tmp, json).map_err(StateError::Write)?;
            fs::rename(&tmp, &self.path).map_err(StateError::Write)?;
            return Ok(());
        }
        Ok(())
    }

    fn disk_version(&self) -> u64 {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str::<State>(&s).ok())
            .map(|s| s.state_version)
            .unwrap_or(0)
    }

    /// Run a mutation and persist; on save failure the in-memory state
    /// keeps the mutation and the error is surfaced to the caller.
    fn mutate<R>(&self, f: impl FnOnce(&mut State) -> R) -> Result<R, StateError> {
        let mut state = self.state.lock().unwrap();
        let result = f(&mut state);
        state.state_version += 1;
        self.save_locked(&mut state)?;
        Ok(result)
    }

    /// Read a value out of the current state
    pub fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let state = self.state.lock().unwrap();
        f(&state)
    }

    /// Snapshot the whole document (for context assembly, status)
    pub fn snapshot(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    /// Current document version
    pub fn version(&self) -> u64 {
        self.read(|s| s.state_version)
    }

    // === Histories ===

    /// Append a think-cycle result (cap 50, oldest dropped)
    pub fn log_decision(&self, record: DecisionRecord) -> Result<(), StateError> {
        self.mutate(|state| {
            state.decisions.push(record);
            cap_front(&mut state.decisions, DECISION_CAP);
        })
    }

    /// Append a side-effect attempt (cap 100)
    pub fn log_execution(&self, record: ExecutionRecord) -> Result<(), StateError> {
        self.mutate(|state| {
            state.executions.push(record);
            cap_front(&mut state.executions, EXECUTION_CAP);
        })
    }

    /// Append a session assessment (cap 100)
    pub fn log_evaluation(&self, record: EvaluationRecord) -> Result<(), StateError> {
        self.mutate(|state| {
            state.evaluations.push(record);
            cap_front(&mut state.evaluations, EVALUATION_CAP);
        })
    }

    // === Error-retry counters ===

    pub fn record_error_retry(&self, project: &str) -> Result<u32, StateError> {
        self.mutate(|state| {
            let counter = state.error_retries.entry(project.to_string()).or_insert(0);
            *counter += 1;
            *counter
        })
    }

    pub fn error_retry_count(&self, project: &str) -> u32 {
        self.read(|s| s.error_retries.get(project).copied().unwrap_or(0))
    }

    pub fn reset_error_retry(&self, project: &str) -> Result<(), StateError> {
        self.mutate(|state| {
            state.error_retries.remove(project);
        })
    }

    // === Runtime autonomy level ===

    /// The effective runtime level, falling back to the boot default
    pub fn autonomy_level(&self, boot_default: AutonomyLevel) -> AutonomyLevel {
        self.read(|s| s.autonomy_level).unwrap_or(boot_default)
    }

    /// Persist an operator-commanded level change
    pub fn set_autonomy_level(&self, level: AutonomyLevel) -> Result<(), StateError> {
        self.mutate(|state| {
            state.autonomy_level = Some(level);
        })
    }

    // === Runtime AI toggle ===

    pub fn ai_enabled(&self, boot_default: bool) -> bool {
        self.read(|s| s.ai_enabled).unwrap_or(boot_default)
    }

    pub fn set_ai_enabled(&self, enabled: bool) -> Result<(), StateError> {
        self.mutate(|state| {
            state.ai_enabled = Some(enabled);
        })
    }

    // === Conversation memory ===

    /// Append an exchange, redacting credential-bearing substrings and
    /// pruning by cap and TTL
    pub fn append_conversation(&self, role: &str, text: &str, now: DateTime<Utc>) -> Result<(), StateError> {
        let redacted = redact(text);
        self.mutate(|state| {
            state.conversation.push(ConversationEntry {
                role: role.to_string(),
                text: redacted,
                ts: now,
            });
            let cutoff = now - Duration::days(CONVERSATION_TTL_DAYS);
            state.conversation.retain(|e| e.ts >= cutoff);
            cap_front(&mut state.conversation, CONVERSATION_CAP);
        })
    }
}

/// Keep the most recent `cap` entries
fn cap_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

/// Mask credential-bearing substrings before persistence
fn redact(text: &str) -> String {
    // Compiled per call; conversation appends are rare (operator cadence)
    let patterns = [
        r"sk-[A-Za-z0-9_-]{8,}",
        r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{8,}",
        r"(?i)\b(api[-_]?key|token|secret|password)\s*[=:]\s*\S+",
    ];
    let mut out = text.to_string();
    for pattern in patterns {
        if let Ok(re) = Regex::new(pattern) {
            out = re.replace_all(&out, "[redacted]").to_string();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, ExecutionResult};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Store {
        Store::load(dir.path().join("state.json")).unwrap()
    }

    fn execution(project: &str) -> ExecutionRecord {
        ExecutionRecord {
            ts: Utc::now(),
            action: Action::Start,
            project: project.to_string(),
            result: ExecutionResult::Ok,
            error: None,
            autonomy_level: AutonomyLevel::Cautious,
            state_version: 0,
        }
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert_eq!(store.version(), 0);
        assert_eq!(store.autonomy_level(AutonomyLevel::Observe), AutonomyLevel::Observe);
        assert!(store.read(|s| s.executions.is_empty()));
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = Store::load(&path).unwrap();
            store.set_autonomy_level(AutonomyLevel::Moderate).unwrap();
            store.log_execution(execution("alpha")).unwrap();
        }

        let reloaded = Store::load(&path).unwrap();
        assert_eq!(reloaded.autonomy_level(AutonomyLevel::Observe), AutonomyLevel::Moderate);
        assert_eq!(reloaded.read(|s| s.executions.len()), 1);
        assert!(reloaded.version() >= 2);
    }

    #[test]
    fn test_execution_history_capped_at_100() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        for i in 0..110 {
            store.log_execution(execution(&format!("p{}", i))).unwrap();
        }

        store.read(|s| {
            assert_eq!(s.executions.len(), 100);
            // Oldest dropped, newest kept
            assert_eq!(s.executions.last().unwrap().project, "p109");
            assert_eq!(s.executions.first().unwrap().project, "p10");
        });
    }

    #[test]
    fn test_error_retry_counters() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert_eq!(store.error_retry_count("alpha"), 0);
        assert_eq!(store.record_error_retry("alpha").unwrap(), 1);
        assert_eq!(store.record_error_retry("alpha").unwrap(), 2);
        assert_eq!(store.error_retry_count("alpha"), 2);
        assert_eq!(store.error_retry_count("beta"), 0);

        store.reset_error_retry("alpha").unwrap();
        assert_eq!(store.error_retry_count("alpha"), 0);
    }

    #[test]
    fn test_version_increments_on_every_mutation() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let v0 = store.version();
        store.record_error_retry("alpha").unwrap();
        let v1 = store.version();
        store.set_autonomy_level(AutonomyLevel::Full).unwrap();
        let v2 = store.version();

        assert!(v1 > v0);
        assert!(v2 > v1);
    }

    #[test]
    fn test_corrupt_document_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();

        let store = Store::load(&path).unwrap();
        assert_eq!(store.version(), 0);
        // The bad file is preserved for inspection
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[test]
    fn test_conversation_redacts_credentials() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store
            .append_conversation("user", "my key is sk-abc123def456ghi and token=hunter2secret", Utc::now())
            .unwrap();

        store.read(|s| {
            let text = &s.conversation[0].text;
            assert!(!text.contains("sk-abc123def456ghi"), "api key leaked: {}", text);
            assert!(!text.contains("hunter2secret"), "token leaked: {}", text);
            assert!(text.contains("[redacted]"));
        });
    }

    #[test]
    fn test_conversation_ttl_prunes_old_entries() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let now = Utc::now();

        store
            .append_conversation("user", "old message", now - Duration::days(10))
            .unwrap();
        store.append_conversation("user", "fresh message", now).unwrap();

        store.read(|s| {
            assert_eq!(s.conversation.len(), 1);
            assert_eq!(s.conversation[0].text, "fresh message");
        });
    }
}
