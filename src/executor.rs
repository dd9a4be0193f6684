//! Decision executor
//!
//! Dispatches allowed recommendations to side effects. Preconditions are
//! checked just-in-time (the world may have changed since evaluation),
//! executions within one batch run sequentially so cooldown accounting
//! stays trivial, and every attempt lands in the execution history.

use std::sync::Arc;

use eyre::Result;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::domain::{Action, EvaluatedRecommendation, ExecutionRecord, ExecutionResult};
use crate::notify::{Notifier, Tier, recommendation_key};
use crate::policy::Policy;
use crate::projects::Projects;
use crate::resources::ResourceMonitor;
use crate::sessions::SessionManager;
use crate::state::Store;

/// Prompt used when the LLM recommends a start without one
const DEFAULT_SESSION_PROMPT: &str = "Resume work on this project. Review recent progress first, then continue the most valuable open task. Commit as you go.";

pub struct Executor {
    store: Arc<Store>,
    policy: Arc<Policy>,
    sessions: Arc<SessionManager>,
    projects: Arc<Projects>,
    resources: Arc<ResourceMonitor>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    max_concurrent_sessions: usize,
    min_free_memory_mb: u64,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        policy: Arc<Policy>,
        sessions: Arc<SessionManager>,
        projects: Arc<Projects>,
        resources: Arc<ResourceMonitor>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        max_concurrent_sessions: usize,
        min_free_memory_mb: u64,
    ) -> Self {
        Self {
            store,
            policy,
            sessions,
            projects,
            resources,
            notifier,
            clock,
            max_concurrent_sessions,
            min_free_memory_mb,
        }
    }

    /// Execute one evaluated recommendation
    ///
    /// Only runs entries with `allowed=true, observe_only=false`; anything
    /// else returns None without side effects. `skip` is a deliberate
    /// no-op and produces no record.
    pub async fn execute(&self, entry: &EvaluatedRecommendation) -> Result<Option<ExecutionRecord>> {
        if !entry.executable() {
            return Ok(None);
        }

        let rec = &entry.recommendation;
        let Some(action) = rec.parsed_action() else {
            return Ok(None); // evaluation already rejected this
        };

        match action {
            Action::Skip => Ok(None),
            Action::Notify => {
                let tier = rec.notification_tier.map(Tier::from_number).unwrap_or(Tier::Summary);
                let text = if rec.project.is_empty() {
                    rec.reason.clone()
                } else {
                    format!("{}: {}", rec.project, rec.reason)
                };
                self.notifier
                    .notify_keyed(tier, &text, &recommendation_key(&rec.project, &rec.action, &rec.reason))
                    .await?;
                Ok(None)
            }
            Action::Start | Action::Stop | Action::Restart => self.execute_session_action(action, entry).await.map(Some),
        }
    }

    async fn execute_session_action(
        &self,
        action: Action,
        entry: &EvaluatedRecommendation,
    ) -> Result<ExecutionRecord> {
        let rec = &entry.recommendation;
        let project = rec.project.clone();

        // Just-in-time preconditions; evaluation-time state is stale by now
        if let Some(blocked_reason) = self.check_preconditions(action, &project).await {
            let record = self.record(action, &project, ExecutionResult::Blocked, Some(blocked_reason.clone()));
            let _ = self
                .notifier
                .notify(Tier::Summary, &format!("{} {} blocked: {}", action, project, blocked_reason))
                .await;
            return Ok(record);
        }

        let outcome = self.dispatch(action, &project, rec.prompt.as_deref()).await;

        match outcome {
            Ok(()) => {
                self.policy.record_cooldown(&project, action);
                if action == Action::Start {
                    let _ = self.store.reset_error_retry(&project);
                }
                let record = self.record(action, &project, ExecutionResult::Ok, None);
                let _ = self
                    .notifier
                    .notify(Tier::Action, &format!("{} {} succeeded", action, project))
                    .await;
                info!(%action, project, "execution succeeded");
                Ok(record)
            }
            Err(e) => {
                let error = e.to_string();
                if action == Action::Start {
                    let _ = self.store.record_error_retry(&project);
                }
                let record = self.record(action, &project, ExecutionResult::Failed, Some(error.clone()));
                let _ = self
                    .notifier
                    .notify(Tier::Action, &format!("{} {} failed: {}", action, project, error))
                    .await;
                warn!(%action, project, %error, "execution failed");
                Ok(record)
            }
        }
    }

    /// Precondition check at execution time; Some(reason) means blocked
    async fn check_preconditions(&self, action: Action, project: &str) -> Option<String> {
        match action {
            Action::Start => {
                if self.sessions.is_running(project).await {
                    return Some("session already running".to_string());
                }
                if self.sessions.running_count().await >= self.max_concurrent_sessions {
                    return Some(format!("concurrent session cap ({}) reached", self.max_concurrent_sessions));
                }
                let free = self.resources.free_memory_mb();
                if free < self.min_free_memory_mb {
                    return Some(format!("free memory {}MB below {}MB floor", free, self.min_free_memory_mb));
                }
                None
            }
            Action::Stop | Action::Restart => {
                if !self.sessions.is_running(project).await {
                    return Some("no session running".to_string());
                }
                None
            }
            Action::Notify | Action::Skip => None,
        }
    }

    async fn dispatch(&self, action: Action, project: &str, prompt: Option<&str>) -> Result<()> {
        let path = self
            .projects
            .path_of(project)
            .ok_or_else(|| eyre::eyre!("project directory missing for {}", project))?;
        let prompt = prompt.unwrap_or(DEFAULT_SESSION_PROMPT);

        match action {
            Action::Start => {
                self.sessions.start(project, &path, prompt).await?;
            }
            Action::Stop => {
                self.sessions.stop(project).await?;
            }
            Action::Restart => {
                self.sessions.stop(project).await?;
                self.sessions.start(project, &path, prompt).await?;
            }
            Action::Notify | Action::Skip => unreachable!("handled by execute"),
        }
        Ok(())
    }

    /// Append an execution record; a failed state write must not lose the
    /// attempt, so the record is returned regardless
    fn record(
        &self,
        action: Action,
        project: &str,
        result: ExecutionResult,
        error: Option<String>,
    ) -> ExecutionRecord {
        let record = ExecutionRecord {
            ts: self.clock.now(),
            action,
            project: project.to_string(),
            result,
            error,
            autonomy_level: self.policy.runtime_level(),
            state_version: self.store.version() + 1,
        };

        if let Err(e) = self.store.log_execution(record.clone()) {
            warn!(error = %e, "failed to persist execution record");
        }
        record
    }

    /// Stop a timed-out session outside the think pipeline (scan loop)
    ///
    /// Returns the closed session alongside the execution record so the
    /// caller can hand it to the evaluator.
    pub async fn stop_for_timeout(&self, project: &str) -> (ExecutionRecord, Option<crate::domain::Session>) {
        match self.sessions.stop(project).await {
            Ok(session) => {
                self.policy.record_cooldown(project, Action::Stop);
                let record = self.record(Action::Stop, project, ExecutionResult::Ok, None);
                (record, Some(session))
            }
            Err(e) => {
                let record = self.record(Action::Stop, project, ExecutionResult::Failed, Some(e.to_string()));
                (record, None)
            }
        }
    }
}

// Executor behavior is covered end-to-end in tests/integration_test.rs,
// where the session manager runs against a real (stubbed) tmux boundary.
