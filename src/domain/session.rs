//! Session metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a coding session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Window is up and working
    Running,
    /// Stopped by explicit stop or timeout
    Stopped,
    /// Window disappeared or the session wrote its completion marker
    Ended,
}

/// A detached terminal-multiplexer coding session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique per session; the multiplexer name repeats across sessions
    /// of the same project
    #[serde(default)]
    pub id: String,

    pub project_name: String,

    /// Unique multiplexer session name (supervisor owns the `orch-` prefix)
    pub session_name: String,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,

    /// Commit hash at start; None for directories without git
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_before: Option<String>,

    /// Seed prompt, truncated for storage
    pub prompt: String,

    pub status: SessionStatus,
}

impl Session {
    /// Minutes the session has been (or was) alive
    pub fn duration_minutes(&self, now: DateTime<Utc>) -> i64 {
        let end = self.stopped_at.unwrap_or(now);
        (end - self.started_at).num_minutes()
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}
