//! Session evaluation
//!
//! Turns a just-ended session into an EvaluationRecord: capture the
//! scrollback tail, gather git evidence, ask the LLM to score against the
//! rubric, fall back to a commit-count heuristic when the LLM is
//! unavailable, and fan the result out to the artifact file, the state
//! history, and the session-learner table.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{RunningSession, SIGNAL_DIR, git::GitTracker, tmux::Tmux};
use crate::broker::{LlmPriority, LlmRequest, SubprocessBroker, parse_llm_json};
use crate::clock::Clock;
use crate::domain::{EvalRecommendation, EvaluationRecord, GitProgress, Session};
use crate::notify::{Notifier, Tier};
use crate::prompts;
use crate::state::Store;
use crate::trackers::SessionLearner;

/// Scrollback lines captured from the multiplexer
const CAPTURE_LINES: u32 = 200;

/// Output cap handed to the LLM
const OUTPUT_CHARS: usize = 2000;

/// Original-prompt cap inside the evaluation prompt
const PROMPT_CHARS: usize = 500;

/// LLM response shape for an evaluation
#[derive(Debug, Deserialize)]
struct EvalVerdict {
    score: u8,
    recommendation: String,
    #[serde(default)]
    accomplishments: Vec<String>,
    #[serde(default)]
    failures: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

/// Produces EvaluationRecords for ended sessions
pub struct SessionEvaluator {
    tmux: Arc<Tmux>,
    git: Arc<GitTracker>,
    broker: Arc<SubprocessBroker>,
    store: Arc<Store>,
    learner: Arc<SessionLearner>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    model: String,
    timeout: Duration,
}

impl SessionEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tmux: Arc<Tmux>,
        git: Arc<GitTracker>,
        broker: Arc<SubprocessBroker>,
        store: Arc<Store>,
        learner: Arc<SessionLearner>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        model: String,
        timeout: Duration,
    ) -> Self {
        Self {
            tmux,
            git,
            broker,
            store,
            learner,
            notifier,
            clock,
            model,
            timeout,
        }
    }

    /// Evaluate an ended session
    ///
    /// Returns None when the session was already evaluated (the artifact
    /// on disk postdates the session start).
    pub async fn evaluate(&self, ended: &RunningSession) -> Result<Option<EvaluationRecord>> {
        let session = &ended.session;

        if let Some(existing) = read_artifact(&ended.path) {
            if existing.evaluated_at > session.started_at {
                debug!(project = %session.project_name, "session already evaluated, skipping");
                return Ok(None);
            }
        }

        let now = self.clock.now();
        let stopped_at = session.stopped_at.unwrap_or(now);

        // 1. Captured output, ANSI-stripped and tail-capped
        let raw_output = self
            .tmux
            .capture_tail(&session.session_name, CAPTURE_LINES)
            .await
            .unwrap_or_default();
        let output = tail_chars(&strip_ansi(&raw_output), OUTPUT_CHARS);

        // 2. Git evidence over the session window: the start-of-session
        // commit hash bounds it exactly when we captured one, otherwise
        // fall back to time-based selection
        let git_progress = match session.head_before.as_deref() {
            Some(head_before) => self.git.progress_between(&ended.path, head_before).await,
            None => {
                if self.git.head(&ended.path).await.is_none() {
                    GitProgress::none()
                } else {
                    self.git.progress_since(&ended.path, session.started_at).await
                }
            }
        };

        // 3-5. LLM verdict with heuristic fallback
        let verdict = match self.llm_verdict(session, &git_progress, &output, stopped_at).await {
            Some(verdict) => verdict,
            None => {
                debug!(project = %session.project_name, "LLM evaluation unavailable, using heuristic");
                heuristic_verdict(&git_progress)
            }
        };

        let record = EvaluationRecord {
            session_id: session.id.clone(),
            project_name: session.project_name.clone(),
            started_at: session.started_at,
            stopped_at,
            duration_minutes: (stopped_at - session.started_at).num_minutes(),
            git_progress,
            score: verdict.score.clamp(1, 5),
            recommendation: EvalRecommendation::parse(&verdict.recommendation).unwrap_or(EvalRecommendation::Continue),
            accomplishments: verdict.accomplishments,
            failures: verdict.failures,
            reasoning: verdict.reasoning,
            evaluated_at: now,
        };

        // 6. Per-project artifact + capped history
        if let Err(e) = write_artifact(&ended.path, &record) {
            warn!(project = %record.project_name, error = %e, "failed to write evaluation artifact");
        }
        if let Err(e) = self.store.log_evaluation(record.clone()) {
            warn!(error = %e, "failed to persist evaluation history");
            let _ = self
                .notifier
                .notify(Tier::Action, &format!("State write failed after evaluating {}", record.project_name))
                .await;
        }

        // 7. Relational dual-write; a failure here never fails the evaluation
        if let Err(e) = self.learner.record(&record, &session.prompt) {
            debug!(error = %e, "session-learner write failed");
        }

        // 8. Low scores reach the operator
        if record.score <= 2 {
            let text = format!(
                "Session {} on {} scored {}/5: {}",
                record.session_id,
                record.project_name,
                record.score,
                truncate(&record.reasoning, 200)
            );
            let _ = self.notifier.notify(Tier::Action, &text).await;
        }

        info!(
            project = %record.project_name,
            score = record.score,
            commits = record.git_progress.commit_count,
            "session evaluated"
        );
        Ok(Some(record))
    }

    async fn llm_verdict(
        &self,
        session: &Session,
        git: &GitProgress,
        output: &str,
        stopped_at: chrono::DateTime<chrono::Utc>,
    ) -> Option<EvalVerdict> {
        let prompt = build_eval_prompt(session, git, output, stopped_at);
        let request = LlmRequest {
            model: self.model.clone(),
            prompt,
            schema: Some(prompts::eval_response_schema()),
            allowed_tools: Vec::new(),
            max_turns: Some(1),
            timeout: self.timeout,
        };

        match self.broker.invoke_llm(request, LlmPriority::Background).await {
            Ok(raw) => parse_llm_json(&raw),
            Err(e) => {
                warn!(project = %session.project_name, error = %e, "evaluation LLM call failed");
                None
            }
        }
    }
}

/// Build the evaluation prompt from rubric + objective evidence
fn build_eval_prompt(
    session: &Session,
    git: &GitProgress,
    output: &str,
    stopped_at: chrono::DateTime<chrono::Utc>,
) -> String {
    let duration_min = (stopped_at - session.started_at).num_minutes();

    let evidence = if git.no_git {
        "No git repository; judge on output alone.".to_string()
    } else {
        format!(
            "Commits: {}, +{} -{} across {} files. Last commit: {}",
            git.commit_count,
            git.insertions,
            git.deletions,
            git.files_changed,
            git.last_commit_subject.as_deref().unwrap_or("(none)")
        )
    };

    format!(
        "{}\n---\nProject: {}\nDuration: {} min\n{}\n---\nOriginal prompt:\n{}\n---\nCaptured output (tail):\n{}",
        prompts::EVAL_RUBRIC,
        session.project_name,
        duration_min,
        evidence,
        truncate(&session.prompt, PROMPT_CHARS),
        output
    )
}

/// Commit-count heuristic used when the LLM is unavailable
fn heuristic_verdict(git: &GitProgress) -> EvalVerdict {
    let score = match git.commit_count {
        0 => 1,
        1..=2 => 3,
        _ => 4,
    };
    EvalVerdict {
        score,
        recommendation: "continue".to_string(),
        accomplishments: Vec::new(),
        failures: Vec::new(),
        reasoning: format!("Heuristic score from {} commits (LLM unavailable)", git.commit_count),
    }
}

/// Remove ANSI escape sequences from captured scrollback
fn strip_ansi(s: &str) -> String {
    // CSI and OSC sequences; compiled per evaluation, which is rare
    let re = Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)").unwrap();
    re.replace_all(s, "").to_string()
}

/// Last `cap` characters of a string
fn tail_chars(s: &str, cap: usize) -> String {
    let count = s.chars().count();
    if count <= cap {
        s.to_string()
    } else {
        s.chars().skip(count - cap).collect()
    }
}

fn truncate(s: &str, cap: usize) -> String {
    s.chars().take(cap).collect()
}

/// Read the per-project `evaluation.json` artifact
pub fn read_artifact(project_path: &Path) -> Option<EvaluationRecord> {
    let path = project_path.join(SIGNAL_DIR).join("evaluation.json");
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Write the per-project `evaluation.json` artifact
fn write_artifact(project_path: &Path, record: &EvaluationRecord) -> Result<()> {
    let dir = project_path.join(SIGNAL_DIR);
    std::fs::create_dir_all(&dir).context("Failed to create signal directory")?;
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(dir.join("evaluation.json"), json).context("Failed to write evaluation.json")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_strip_ansi_removes_color_codes() {
        let colored = "\x1b[31merror\x1b[0m: something \x1b[1;32mgreen\x1b[0m";
        assert_eq!(strip_ansi(colored), "error: something green");
    }

    #[test]
    fn test_strip_ansi_removes_osc_titles() {
        let titled = "\x1b]0;window title\x07actual output";
        assert_eq!(strip_ansi(titled), "actual output");
    }

    #[test]
    fn test_tail_chars_keeps_recent_output() {
        let s = "abcdefgh";
        assert_eq!(tail_chars(s, 3), "fgh");
        assert_eq!(tail_chars(s, 100), "abcdefgh");
    }

    #[test]
    fn test_heuristic_scores() {
        let none = GitProgress::default();
        assert_eq!(heuristic_verdict(&none).score, 1);

        let some = GitProgress {
            commit_count: 2,
            ..Default::default()
        };
        assert_eq!(heuristic_verdict(&some).score, 3);

        let many = GitProgress {
            commit_count: 5,
            ..Default::default()
        };
        assert_eq!(heuristic_verdict(&many).score, 4);
        assert_eq!(heuristic_verdict(&many).recommendation, "continue");
    }

    #[test]
    fn test_eval_prompt_no_git_judges_output_only() {
        let session = Session {
            id: "s-1".into(),
            project_name: "alpha".into(),
            session_name: "orch-alpha".into(),
            started_at: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
            stopped_at: None,
            head_before: None,
            prompt: "explore the codebase".into(),
            status: crate::domain::SessionStatus::Ended,
        };
        let prompt = build_eval_prompt(
            &session,
            &GitProgress::none(),
            "some output",
            session.started_at + chrono::Duration::minutes(20),
        );

        assert!(prompt.contains("No git repository"));
        assert!(prompt.contains("Duration: 20 min"));
        assert!(prompt.contains("explore the codebase"));
    }
}
