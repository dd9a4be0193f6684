//! Session lifecycle
//!
//! A session is a detached terminal-multiplexer window running the coding
//! CLI inside a project directory. The manager owns the running-session
//! registry, writes the per-project `session.json` signal file, and
//! detects natural ends (window gone or completion marker written).

pub mod evaluator;
pub mod git;
pub mod tmux;

pub use evaluator::SessionEvaluator;
pub use git::GitTracker;
pub use tmux::Tmux;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use eyre::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::shell_quote;
use crate::clock::Clock;
use crate::domain::{Session, SessionStatus};

/// Per-project signal directory
pub const SIGNAL_DIR: &str = ".orchestrator";

/// Stored prompt cap
const PROMPT_STORE_CHARS: usize = 500;

/// A running session together with its project directory
#[derive(Debug, Clone)]
pub struct RunningSession {
    pub session: Session,
    pub path: PathBuf,
}

/// Owns session start/stop and the running registry
pub struct SessionManager {
    tmux: Arc<Tmux>,
    git: Arc<GitTracker>,
    clock: Arc<dyn Clock>,
    /// Coding CLI launched inside each session
    session_command: String,
    running: Mutex<HashMap<String, RunningSession>>,
}

impl SessionManager {
    pub fn new(tmux: Arc<Tmux>, git: Arc<GitTracker>, clock: Arc<dyn Clock>, session_command: String) -> Self {
        Self {
            tmux,
            git,
            clock,
            session_command,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session for `project` in `path` seeded with `prompt`
    pub async fn start(&self, project: &str, path: &Path, prompt: &str) -> Result<Session> {
        let session_name = Tmux::session_name(project);
        let head_before = self.git.head(path).await;
        let now = self.clock.now();

        let stored_prompt: String = prompt.chars().take(PROMPT_STORE_CHARS).collect();
        let session = Session {
            id: Uuid::now_v7().to_string(),
            project_name: project.to_string(),
            session_name: session_name.clone(),
            started_at: now,
            stopped_at: None,
            head_before,
            prompt: stored_prompt,
            status: SessionStatus::Running,
        };

        // tmux runs the command through sh, so the prompt must be quoted
        let mut command = format!("{} {}", self.session_command, shell_quote(prompt));
        let mcp_config = path.join(SIGNAL_DIR).join("mcp-config.json");
        if mcp_config.exists() {
            command = format!(
                "{} --mcp-config {}",
                command,
                shell_quote(&mcp_config.display().to_string())
            );
        }

        self.tmux.new_session(&session_name, path, &command).await?;
        write_signal_file(path, &session).context("Failed to write session signal file")?;

        self.running.lock().await.insert(
            project.to_string(),
            RunningSession {
                session: session.clone(),
                path: path.to_path_buf(),
            },
        );

        info!(project, session_name, "session started");
        Ok(session)
    }

    /// Stop a running session; returns the closed session record
    pub async fn stop(&self, project: &str) -> Result<Session> {
        let mut running = self.running.lock().await;
        let entry = running
            .remove(project)
            .ok_or_else(|| eyre::eyre!("No running session for {}", project))?;
        drop(running);

        self.tmux.kill_session(&entry.session.session_name).await?;

        let mut session = entry.session;
        session.stopped_at = Some(self.clock.now());
        session.status = SessionStatus::Stopped;
        if let Err(e) = write_signal_file(&entry.path, &session) {
            warn!(project, error = %e, "failed to update session signal file");
        }

        info!(project, "session stopped");
        Ok(session)
    }

    /// Sessions that outlived the duration cap
    pub async fn timed_out(&self, max_duration: Duration) -> Vec<RunningSession> {
        let now = self.clock.now();
        let running = self.running.lock().await;
        running
            .values()
            .filter(|entry| now - entry.session.started_at > max_duration)
            .cloned()
            .collect()
    }

    /// Detect naturally-ended sessions: the window disappeared or the
    /// session wrote its completion marker. Removes them from the
    /// registry and returns them for evaluation.
    pub async fn detect_ended(&self) -> Vec<RunningSession> {
        let candidates: Vec<RunningSession> = {
            let running = self.running.lock().await;
            running.values().cloned().collect()
        };

        let mut ended = Vec::new();
        for entry in candidates {
            let marker = entry.path.join(SIGNAL_DIR).join("complete");
            let window_gone = !self.tmux.has_session(&entry.session.session_name).await;
            if !window_gone && !marker.exists() {
                continue;
            }

            let mut running = self.running.lock().await;
            if running.remove(&entry.session.project_name).is_none() {
                continue; // raced with an explicit stop
            }
            drop(running);

            if marker.exists() {
                let _ = std::fs::remove_file(&marker);
            }
            if window_gone {
                debug!(project = %entry.session.project_name, "session window gone");
            } else {
                // Marker written but window still up: close it out
                let _ = self.tmux.kill_session(&entry.session.session_name).await;
            }

            let mut session = entry.session.clone();
            session.stopped_at = Some(self.clock.now());
            session.status = SessionStatus::Ended;
            if let Err(e) = write_signal_file(&entry.path, &session) {
                warn!(error = %e, "failed to update session signal file");
            }

            ended.push(RunningSession {
                session,
                path: entry.path,
            });
        }

        ended
    }

    /// Rebuild the registry after a restart from signal files on disk
    ///
    /// Only sessions whose window still exists are considered running;
    /// the rest are left for natural-end handling by the next scan.
    pub async fn recover(&self, projects: &[(String, PathBuf)]) -> usize {
        let mut recovered = 0;
        for (project, path) in projects {
            let Some(session) = read_signal_file(path) else {
                continue;
            };
            if session.status != SessionStatus::Running {
                continue;
            }
            if !self.tmux.has_session(&session.session_name).await {
                continue;
            }

            self.running.lock().await.insert(
                project.clone(),
                RunningSession {
                    session,
                    path: path.clone(),
                },
            );
            recovered += 1;
        }

        if recovered > 0 {
            info!(recovered, "recovered running sessions from signal files");
        }
        recovered
    }

    pub async fn is_running(&self, project: &str) -> bool {
        self.running.lock().await.contains_key(project)
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    pub async fn running_sessions(&self) -> Vec<RunningSession> {
        self.running.lock().await.values().cloned().collect()
    }

    /// Capture the tail of a session's scrollback, best effort
    pub async fn capture_output(&self, session: &Session, lines: u32) -> Option<String> {
        self.tmux.capture_tail(&session.session_name, lines).await
    }
}

/// Write `session.json` under the project's signal directory
pub fn write_signal_file(project_path: &Path, session: &Session) -> Result<()> {
    let dir = project_path.join(SIGNAL_DIR);
    std::fs::create_dir_all(&dir).context("Failed to create signal directory")?;
    let json = serde_json::to_string_pretty(session)?;
    std::fs::write(dir.join("session.json"), json).context("Failed to write session.json")?;
    Ok(())
}

/// Read `session.json` if present and parseable
pub fn read_signal_file(project_path: &Path) -> Option<Session> {
    let path = project_path.join(SIGNAL_DIR).join("session.json");
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    #[test]
    fn test_signal_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let session = Session {
            id: "s-1".into(),
            project_name: "alpha".into(),
            session_name: "orch-alpha".into(),
            started_at: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
            stopped_at: None,
            head_before: Some("abc123".into()),
            prompt: "fix the tests".into(),
            status: SessionStatus::Running,
        };

        write_signal_file(dir.path(), &session).unwrap();
        let read = read_signal_file(dir.path()).unwrap();

        assert_eq!(read.project_name, "alpha");
        assert_eq!(read.head_before.as_deref(), Some("abc123"));
        assert_eq!(read.status, SessionStatus::Running);
    }

    #[test]
    fn test_read_signal_file_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_signal_file(dir.path()).is_none());
    }

    #[tokio::test]
    async fn test_timed_out_filters_by_duration() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()));
        let broker = Arc::new(crate::broker::SubprocessBroker::new("true"));
        let manager = SessionManager::new(
            Arc::new(Tmux::new(broker.clone())),
            Arc::new(GitTracker::new(broker)),
            clock.clone(),
            "true".into(),
        );

        // Insert a running session directly; tmux is not involved here
        manager.running.lock().await.insert(
            "alpha".into(),
            RunningSession {
                session: Session {
                    id: "s-2".into(),
                    project_name: "alpha".into(),
                    session_name: "orch-alpha".into(),
                    started_at: clock.now(),
                    stopped_at: None,
                    head_before: None,
                    prompt: String::new(),
                    status: SessionStatus::Running,
                },
                path: PathBuf::from("/tmp/alpha"),
            },
        );

        assert!(manager.timed_out(Duration::minutes(45)).await.is_empty());

        clock.advance(Duration::minutes(50));
        let timed_out = manager.timed_out(Duration::minutes(45)).await;
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].session.project_name, "alpha");
    }
}
