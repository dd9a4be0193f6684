//! Subprocess broker
//!
//! Single chokepoint for every external process the supervisor runs: shell
//! probes, git, the terminal multiplexer, and the LLM CLI. Arguments are
//! always passed as argv arrays, never through a shell, so no escaping is
//! needed at call sites.
//!
//! LLM invocations are serialized through a semaphore with capacity 2.
//! Operator-initiated calls may bypass a full queue through a one-permit
//! priority lane, so at most one preemption is in flight at a time.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// LLM invocations running concurrently across the whole process
const LLM_CONCURRENCY: usize = 2;

/// Typed subprocess failure
///
/// The broker has no recovery policy; each failure is reported distinctly
/// and the caller decides what it means.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("process timed out after {0:?}")]
    Timeout(Duration),

    #[error("process exited with code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Captured streams from a finished process
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Scheduling class for LLM invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmPriority {
    /// Think cycles, evaluations, digests
    Background,
    /// Calls on the operator command path
    Operator,
}

/// Parameters for one LLM CLI invocation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub model: String,
    pub prompt: String,
    /// Constrained-decoding JSON schema for the response
    pub schema: Option<serde_json::Value>,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub timeout: Duration,
}

/// Broker over all subprocess invocations
pub struct SubprocessBroker {
    /// Print-mode LLM CLI binary
    llm_command: String,

    /// Background LLM slots
    llm_slots: Arc<Semaphore>,

    /// Operator bypass lane; one permit caps preemption at one in flight
    operator_lane: Arc<Semaphore>,
}

impl SubprocessBroker {
    pub fn new(llm_command: impl Into<String>) -> Self {
        Self {
            llm_command: llm_command.into(),
            llm_slots: Arc::new(Semaphore::new(LLM_CONCURRENCY)),
            operator_lane: Arc::new(Semaphore::new(1)),
        }
    }

    /// Run a plain subprocess with captured streams and a hard timeout
    ///
    /// On timeout the whole process group is killed so child trees (tmux
    /// spawns shells, git spawns pagers) do not linger.
    pub async fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
        stdin: Option<&str>,
    ) -> Result<ShellOutput, BrokerError> {
        debug!(program, ?args, ?timeout, "broker: running subprocess");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;

        if let Some(input) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle.write_all(input.as_bytes()).await?;
                drop(handle);
            }
        }

        let pid = child.id();
        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;

        let output = match waited {
            Ok(result) => result?,
            Err(_) => {
                kill_process_group(pid);
                warn!(program, ?timeout, "broker: subprocess timed out");
                return Err(BrokerError::Timeout(timeout));
            }
        };

        let shell_output = ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        debug!(program, exit_code = shell_output.exit_code, "broker: subprocess finished");
        Ok(shell_output)
    }

    /// Like [`run`](Self::run), but a non-zero exit is an error
    pub async fn run_checked(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<ShellOutput, BrokerError> {
        let output = self.run(program, args, timeout, None).await?;
        if output.exit_code != 0 {
            return Err(BrokerError::NonZeroExit {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Invoke the LLM CLI, piping the prompt through stdin
    ///
    /// Background callers wait for one of the two slots. Operator callers
    /// take a free slot when one exists, otherwise bypass through the
    /// one-permit operator lane rather than queueing behind think cycles.
    pub async fn invoke_llm(&self, request: LlmRequest, priority: LlmPriority) -> Result<String, BrokerError> {
        let _permit;
        let _lane_permit;

        match priority {
            LlmPriority::Background => {
                _permit = Some(self.llm_slots.clone().acquire_owned().await.expect("semaphore not closed"));
                _lane_permit = None;
            }
            LlmPriority::Operator => match self.llm_slots.clone().try_acquire_owned() {
                Ok(permit) => {
                    _permit = Some(permit);
                    _lane_permit = None;
                }
                Err(_) => {
                    debug!("broker: LLM slots full, operator call using bypass lane");
                    _permit = None;
                    _lane_permit =
                        Some(self.operator_lane.clone().acquire_owned().await.expect("semaphore not closed"));
                }
            },
        }

        let schema_string = request.schema.as_ref().map(|s| s.to_string());
        let max_turns_string = request.max_turns.map(|n| n.to_string());
        let tools_string = request.allowed_tools.join(",");

        let mut args: Vec<&str> = vec!["-p", "--model", &request.model, "--output-format", "json"];
        if let Some(schema) = schema_string.as_deref() {
            args.push("--json-schema");
            args.push(schema);
        }
        if !request.allowed_tools.is_empty() {
            args.push("--allowed-tools");
            args.push(&tools_string);
        }
        if let Some(turns) = max_turns_string.as_deref() {
            args.push("--max-turns");
            args.push(turns);
        }

        let command = self.llm_command.clone();
        let output = self.run(&command, &args, request.timeout, Some(&request.prompt)).await?;

        if output.exit_code != 0 {
            return Err(BrokerError::NonZeroExit {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(output.stdout)
    }

    /// Free LLM slots right now (for status reporting)
    pub fn llm_slots_available(&self) -> usize {
        self.llm_slots.available_permits()
    }
}

/// Parse a structured LLM response out of raw CLI stdout
///
/// The print-mode CLI may emit the object bare, wrapped in a
/// `{"result": "..."}` envelope, or surrounded by stray text. Constrained
/// decoding makes the inner object reliable; this peels the wrapping.
pub fn parse_llm_json<T: serde::de::DeserializeOwned>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();

    // Bare object
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Some(value);
    }

    // CLI envelope with the object serialized into a "result" string
    if let Ok(envelope) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(result) = envelope.get("result") {
            if let Some(s) = result.as_str() {
                if let Some(parsed) = parse_llm_json(s) {
                    return Some(parsed);
                }
            } else if let Ok(parsed) = serde_json::from_value::<T>(result.clone()) {
                return Some(parsed);
            }
        }
    }

    // Stray prose around the object: take the outermost braces
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        serde_json::from_str(&trimmed[start..=end]).ok()
    } else {
        None
    }
}

/// Quote a string for embedding in a `sh`-interpreted command line
///
/// Needed only where a collaborator insists on a single command string
/// (tmux runs its command through the shell); everywhere else the broker
/// passes argv arrays and no quoting happens at all.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Kill an entire process group, best effort
fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "broker: killpg failed (process may have exited)");
        }
    }

    #[cfg(not(unix))]
    let _ = pid;
}
