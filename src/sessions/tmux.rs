//! Terminal multiplexer wrapper
//!
//! All tmux invocations go through the broker with short timeouts. The
//! supervisor owns the `orch-` session-name prefix; nothing outside it is
//! ever touched.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tracing::{debug, warn};

use crate::broker::SubprocessBroker;

/// Session-name prefix owned by the supervisor
pub const SESSION_PREFIX: &str = "orch-";

const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

/// Thin tmux CLI wrapper
pub struct Tmux {
    broker: Arc<SubprocessBroker>,
    binary: String,
}

impl Tmux {
    pub fn new(broker: Arc<SubprocessBroker>) -> Self {
        Self {
            broker,
            binary: "tmux".to_string(),
        }
    }

    /// Override the tmux binary (tests substitute a stub)
    pub fn with_binary(broker: Arc<SubprocessBroker>, binary: impl Into<String>) -> Self {
        Self {
            broker,
            binary: binary.into(),
        }
    }

    /// The multiplexer session name for a project
    pub fn session_name(project: &str) -> String {
        // tmux treats '.' and ':' as pane addressing; strip them from names
        let safe: String = project
            .chars()
            .map(|c| if c == '.' || c == ':' || c.is_whitespace() { '-' } else { c })
            .collect();
        format!("{}{}", SESSION_PREFIX, safe)
    }

    /// Create a detached session running `command` in `cwd`
    pub async fn new_session(&self, name: &str, cwd: &Path, command: &str) -> Result<()> {
        let cwd_str = cwd.display().to_string();
        self.broker
            .run_checked(
                &self.binary,
                &["new-session", "-d", "-s", name, "-c", &cwd_str, command],
                TMUX_TIMEOUT,
            )
            .await?;
        debug!(name, "tmux session created");
        Ok(())
    }

    /// Whether a session with this exact name exists
    pub async fn has_session(&self, name: &str) -> bool {
        match self
            .broker
            .run(&self.binary, &["has-session", "-t", name], TMUX_TIMEOUT, None)
            .await
        {
            Ok(output) => output.exit_code == 0,
            Err(e) => {
                warn!(name, error = %e, "tmux has-session failed");
                false
            }
        }
    }

    /// Kill a session; missing sessions are not an error
    pub async fn kill_session(&self, name: &str) -> Result<()> {
        let output = self
            .broker
            .run(&self.binary, &["kill-session", "-t", name], TMUX_TIMEOUT, None)
            .await?;
        if output.exit_code != 0 && !output.stderr.contains("can't find session") {
            warn!(name, stderr = %output.stderr.trim(), "tmux kill-session failed");
        }
        Ok(())
    }

    /// Capture the last `lines` of scrollback, best effort
    pub async fn capture_tail(&self, name: &str, lines: u32) -> Option<String> {
        let start = format!("-{}", lines);
        let output = self
            .broker
            .run(
                &self.binary,
                &["capture-pane", "-p", "-t", name, "-S", &start],
                TMUX_TIMEOUT,
                None,
            )
            .await
            .ok()?;
        if output.exit_code != 0 {
            return None;
        }
        Some(output.stdout)
    }

    /// List supervisor-owned session names
    pub async fn list_sessions(&self) -> Vec<String> {
        let output = match self
            .broker
            .run(
                &self.binary,
                &["list-sessions", "-F", "#{session_name}"],
                TMUX_TIMEOUT,
                None,
            )
            .await
        {
            Ok(output) if output.exit_code == 0 => output,
            // No server running or tmux missing: no sessions
            _ => return Vec::new(),
        };

        output
            .stdout
            .lines()
            .filter(|line| line.starts_with(SESSION_PREFIX))
            .map(|line| line.trim().to_string())
            .collect()
    }
}
