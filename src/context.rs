//! Context assembly
//!
//! Builds the single plain-text prompt for a think cycle: fixed section
//! order, `---` delimiters, optional sections omitted when empty, bounded
//! total length. Rendering is pure; gathering talks to the live
//! components.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::clock::Clock;
use crate::config::Config;
use crate::domain::AutonomyLevel;
use crate::notify::Notifier;
use crate::projects::{ProjectInfo, Projects};
use crate::prompts;
use crate::resources::ResourceMonitor;
use crate::sessions::SessionManager;
use crate::state::Store;
use crate::trackers::{RevenueTracker, SessionLearner, TrustTracker};

/// Sessions this close to the duration cap get the TIMEOUT IMMINENT marker
const TIMEOUT_IMMINENT_MINUTES: i64 = 5;

/// Everything the renderer needs, already gathered
#[derive(Debug, Default)]
pub struct ContextInputs {
    pub level: Option<AutonomyLevel>,
    pub now_local: String,
    pub quiet_hours: bool,
    pub resource_line: String,
    pub health_line: String,
    pub revenue: String,
    pub trust: String,
    pub insights: String,
    /// (role, text), oldest first
    pub conversation: Vec<(String, String)>,
    pub priorities: String,
    /// (session name, minutes running, timeout imminent)
    pub sessions: Vec<(String, i64, bool)>,
    pub projects: Vec<ProjectLine>,
    /// (project, score, hours ago)
    pub eval_digest: Vec<(String, u8, i64)>,
    pub decision_summaries: Vec<String>,
}

/// One project's rendered facts
#[derive(Debug, Clone)]
pub struct ProjectLine {
    pub name: String,
    pub status: Option<String>,
    pub idle_days: Option<i64>,
    pub stale: bool,
    pub error: Option<String>,
    pub retry_count: u32,
    pub focus: bool,
    pub needs_attention: bool,
}

/// Gathers live state and renders the think prompt
pub struct ContextAssembler {
    store: Arc<Store>,
    projects: Arc<Projects>,
    sessions: Arc<SessionManager>,
    resources: Arc<ResourceMonitor>,
    revenue: Arc<RevenueTracker>,
    trust: Arc<TrustTracker>,
    learner: Arc<SessionLearner>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    config: Config,
    tz: Tz,
}

impl ContextAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        projects: Arc<Projects>,
        sessions: Arc<SessionManager>,
        resources: Arc<ResourceMonitor>,
        revenue: Arc<RevenueTracker>,
        trust: Arc<TrustTracker>,
        learner: Arc<SessionLearner>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        let tz = config.timezone();
        Self {
            store,
            projects,
            sessions,
            resources,
            revenue,
            trust,
            learner,
            notifier,
            clock,
            config,
            tz,
        }
    }

    /// Assemble the full prompt, bounded by `max-prompt-length`
    pub async fn assemble(&self) -> String {
        let inputs = self.gather().await;
        let prompt = render(&inputs, self.config.ai.max_prompt_length);
        debug!(chars = prompt.len(), "context assembled");
        prompt
    }

    async fn gather(&self) -> ContextInputs {
        let now = self.clock.now();
        let level = self.store.autonomy_level(self.config.ai.autonomy_level);
        let state = self.store.snapshot();

        let resource = self.resources.snapshot().await;
        let health_line = health_summary(&resource, self.config.ai.resource_limits.min_free_memory_mb);

        let max_minutes = (self.config.ai.max_session_duration_ms / 60_000) as i64;
        let sessions = {
            let mut lines = Vec::new();
            for entry in self.sessions.running_sessions().await {
                let minutes = entry.session.duration_minutes(now);
                let imminent = max_minutes - minutes <= TIMEOUT_IMMINENT_MINUTES;
                lines.push((entry.session.session_name.clone(), minutes, imminent));
            }
            lines
        };

        let active_projects: std::collections::HashSet<String> = self
            .sessions
            .running_sessions()
            .await
            .into_iter()
            .map(|e| e.session.project_name)
            .collect();

        let projects = self
            .projects
            .scan()
            .into_iter()
            .filter(|p| !self.config.priorities.skip.contains(&p.name))
            .filter(|p| p.has_state || active_projects.contains(&p.name))
            .map(|p| self.project_line(p, now))
            .collect();

        let eval_digest = state
            .evaluations
            .iter()
            .rev()
            .filter(|e| now - e.evaluated_at <= Duration::hours(24))
            .take(10)
            .map(|e| (e.project_name.clone(), e.score, (now - e.evaluated_at).num_hours()))
            .collect();

        let decision_summaries = state
            .decisions
            .iter()
            .rev()
            .take(5)
            .map(|d| d.summary.clone())
            .collect();

        let conversation = state
            .conversation
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|e| (e.role.clone(), e.text.clone()))
            .collect();

        ContextInputs {
            level: Some(level),
            now_local: now.with_timezone(&self.tz).format("%Y-%m-%d %H:%M %Z").to_string(),
            quiet_hours: self.notifier.in_quiet_hours(now),
            resource_line: resource.format_line(),
            health_line,
            revenue: if self.config.revenue.enabled {
                self.revenue.format_for_context().unwrap_or_default()
            } else {
                String::new()
            },
            trust: self.trust.format_for_context().unwrap_or_default(),
            insights: self
                .learner
                .analyze_patterns()
                .ok()
                .flatten()
                .map(|r| r.format_for_context())
                .unwrap_or_default(),
            conversation,
            priorities: self.priorities_section(),
            sessions,
            projects,
            eval_digest,
            decision_summaries,
        }
    }

    fn project_line(&self, p: ProjectInfo, now: DateTime<Utc>) -> ProjectLine {
        let idle_days = p.idle_days(now);
        let complete = p.status.as_deref() == Some("complete");
        let stale = !complete && idle_days.map(|d| d >= self.config.ai.staleness_days).unwrap_or(false);

        ProjectLine {
            retry_count: self.store.error_retry_count(&p.name),
            focus: self.config.priorities.focus.contains(&p.name),
            stale,
            idle_days,
            name: p.name,
            status: p.status,
            error: p.error,
            needs_attention: p.needs_attention,
        }
    }

    fn priorities_section(&self) -> String {
        let p = &self.config.priorities;
        let mut parts = Vec::new();
        if !p.focus.is_empty() {
            parts.push(format!("focus: {}", p.focus.join(", ")));
        }
        if !p.skip.is_empty() {
            parts.push(format!("skip: {}", p.skip.join(", ")));
        }
        if !p.block.is_empty() {
            parts.push(format!("never act on: {}", p.block.join(", ")));
        }
        if !p.notes.is_empty() {
            parts.push(format!("notes: {}", p.notes));
        }
        parts.join("\n")
    }
}

/// Render the prompt from gathered inputs (pure)
pub fn render(inputs: &ContextInputs, max_chars: usize) -> String {
    let mut sections: Vec<String> = Vec::new();

    // 1. Preamble
    let mut preamble = prompts::THINK_PREAMBLE.to_string();
    if let Some(level) = inputs.level {
        preamble.push_str("\n\n");
        preamble.push_str(prompts::autonomy_instructions(level));
    }
    sections.push(preamble);

    // 2. Time
    sections.push(format!(
        "Time: {} (quiet hours {})",
        inputs.now_local,
        if inputs.quiet_hours { "active" } else { "inactive" }
    ));

    // 3-4. Resources and health
    if !inputs.resource_line.is_empty() {
        sections.push(format!("Resources: {}", inputs.resource_line));
    }
    if !inputs.health_line.is_empty() {
        sections.push(format!("Health: {}", inputs.health_line));
    }

    // 5. Revenue
    if !inputs.revenue.is_empty() {
        sections.push(format!("Revenue:\n{}", inputs.revenue));
    }

    // 6. Trust
    if !inputs.trust.is_empty() {
        sections.push(format!("Trust: {}", inputs.trust));
    }

    // 7. Learner insights
    if !inputs.insights.is_empty() {
        sections.push(format!("Session insights: {}", inputs.insights));
    }

    // 8. Conversation memory
    if !inputs.conversation.is_empty() {
        let lines: Vec<String> = inputs
            .conversation
            .iter()
            .map(|(role, text)| format!("{}: {}", role, text))
            .collect();
        sections.push(format!("Recent conversation:\n{}", lines.join("\n")));
    }

    // 9. Priorities
    if !inputs.priorities.is_empty() {
        sections.push(format!("Priorities:\n{}", inputs.priorities));
    }

    // 10. Active sessions
    if !inputs.sessions.is_empty() {
        let lines: Vec<String> = inputs
            .sessions
            .iter()
            .map(|(name, minutes, imminent)| {
                let marker = if *imminent { " TIMEOUT IMMINENT" } else { "" };
                format!("{} running {}m{}", name, minutes, marker)
            })
            .collect();
        sections.push(format!("Active sessions:\n{}", lines.join("\n")));
    }

    // 11. Projects
    if !inputs.projects.is_empty() {
        let mut projects = inputs.projects.clone();
        projects.sort_by(|a, b| {
            b.focus
                .cmp(&a.focus)
                .then(b.needs_attention.cmp(&a.needs_attention))
                .then(a.name.cmp(&b.name))
        });

        let lines: Vec<String> = projects.iter().map(format_project_line).collect();
        sections.push(format!("Projects:\n{}", lines.join("\n")));
    }

    // 12. Evaluation digest (last 24h)
    if !inputs.eval_digest.is_empty() {
        let lines: Vec<String> = inputs
            .eval_digest
            .iter()
            .map(|(project, score, hours)| format!("{}: {}/5 ({}h ago)", project, score, hours))
            .collect();
        sections.push(format!("Recent evaluations:\n{}", lines.join("\n")));
    }

    // 13. Decision history
    if !inputs.decision_summaries.is_empty() {
        sections.push(format!("Recent decisions:\n{}", inputs.decision_summaries.join("\n")));
    }

    // 14. Response format
    sections.push(prompts::RESPONSE_FORMAT.to_string());

    let prompt = sections.join("\n---\n");
    if prompt.chars().count() > max_chars {
        let mut truncated: String = prompt.chars().take(max_chars.saturating_sub(12)).collect();
        truncated.push_str("\n[truncated]");
        truncated
    } else {
        prompt
    }
}

fn format_project_line(p: &ProjectLine) -> String {
    let mut line = format!("- {}", p.name);
    if let Some(status) = &p.status {
        line.push_str(&format!(" [{}]", status));
    }
    if let Some(days) = p.idle_days {
        line.push_str(&format!(" idle {}d", days));
    }
    if p.stale {
        line.push_str(&format!(" STALE ({} days idle)", p.idle_days.unwrap_or(0)));
    }
    if let Some(error) = &p.error {
        line.push_str(&format!(" ERROR: {}", error));
    }
    if p.retry_count > 0 {
        line.push_str(&format!(" retries: {}", p.retry_count));
    }
    line
}

/// Derive a one-line health assessment from the resource snapshot
fn health_summary(resource: &crate::resources::ResourceSnapshot, min_free_mb: u64) -> String {
    let mut warnings = Vec::new();
    if resource.free_memory_mb < min_free_mb {
        warnings.push(format!("memory low ({}MB free)", resource.free_memory_mb));
    }
    if resource.load_one > 8.0 {
        warnings.push(format!("load high ({:.1})", resource.load_one));
    }
    if let Some(disk) = resource.disk_used_percent {
        if disk >= 90 {
            warnings.push(format!("disk {}% full", disk));
        }
    }

    if warnings.is_empty() {
        "nominal".to_string()
    } else {
        warnings.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> ContextInputs {
        ContextInputs {
            level: Some(AutonomyLevel::Cautious),
            now_local: "2025-06-02 12:00 UTC".to_string(),
            quiet_hours: false,
            resource_line: "load 0.5, mem 4096/8192 MB free, disk 40% used, up 12h".to_string(),
            health_line: "nominal".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_sections_in_fixed_order() {
        let mut inputs = base_inputs();
        inputs.revenue = "pool: $1.00 (5m ago)".to_string();
        inputs.trust = "level cautious, 3 days tenure".to_string();

        let prompt = render(&inputs, 8000);

        let time_pos = prompt.find("Time:").unwrap();
        let resource_pos = prompt.find("Resources:").unwrap();
        let revenue_pos = prompt.find("Revenue:").unwrap();
        let trust_pos = prompt.find("Trust:").unwrap();
        let format_pos = prompt.find("Respond with JSON").unwrap();

        assert!(time_pos < resource_pos);
        assert!(resource_pos < revenue_pos);
        assert!(revenue_pos < trust_pos);
        assert!(trust_pos < format_pos);
        assert!(prompt.contains("\n---\n"));
    }

    #[test]
    fn test_empty_optional_sections_omitted() {
        let prompt = render(&base_inputs(), 8000);

        assert!(!prompt.contains("Revenue:"));
        assert!(!prompt.contains("Session insights:"));
        assert!(!prompt.contains("Projects:"));
        assert!(!prompt.contains("Recent conversation:"));
    }

    #[test]
    fn test_project_sort_focus_then_attention_then_alpha() {
        let mut inputs = base_inputs();
        let line = |name: &str, focus: bool, attention: bool| ProjectLine {
            name: name.to_string(),
            status: None,
            idle_days: None,
            stale: false,
            error: None,
            retry_count: 0,
            focus,
            needs_attention: attention,
        };
        inputs.projects = vec![
            line("zeta", false, false),
            line("mike", false, true),
            line("alpha", false, false),
            line("focus-proj", true, false),
        ];

        let prompt = render(&inputs, 8000);
        let pos = |name: &str| prompt.find(&format!("- {}", name)).unwrap();

        assert!(pos("focus-proj") < pos("mike"));
        assert!(pos("mike") < pos("alpha"));
        assert!(pos("alpha") < pos("zeta"));
    }

    #[test]
    fn test_stale_and_error_markers() {
        let mut inputs = base_inputs();
        inputs.projects = vec![ProjectLine {
            name: "old".to_string(),
            status: Some("active".to_string()),
            idle_days: Some(12),
            stale: true,
            error: Some("tests failing".to_string()),
            retry_count: 2,
            focus: false,
            needs_attention: true,
        }];

        let prompt = render(&inputs, 8000);
        assert!(prompt.contains("STALE (12 days idle)"));
        assert!(prompt.contains("ERROR: tests failing"));
        assert!(prompt.contains("retries: 2"));
    }

    #[test]
    fn test_timeout_imminent_marker() {
        let mut inputs = base_inputs();
        inputs.sessions = vec![
            ("orch-fresh".to_string(), 10, false),
            ("orch-old".to_string(), 42, true),
        ];

        let prompt = render(&inputs, 8000);
        assert!(prompt.contains("orch-old running 42m TIMEOUT IMMINENT"));
        assert!(!prompt.contains("orch-fresh running 10m TIMEOUT"));
    }

    #[test]
    fn test_truncation_with_marker() {
        let mut inputs = base_inputs();
        inputs.priorities = "x".repeat(20_000);

        let prompt = render(&inputs, 8000);
        assert!(prompt.chars().count() <= 8000);
        assert!(prompt.ends_with("[truncated]"));
    }

    #[test]
    fn test_health_summary_warnings() {
        let snapshot = crate::resources::ResourceSnapshot {
            load_one: 12.0,
            free_memory_mb: 100,
            total_memory_mb: 8192,
            disk_used_percent: Some(95),
            uptime_secs: 3600,
        };
        let health = health_summary(&snapshot, 512);

        assert!(health.contains("memory low"));
        assert!(health.contains("load high"));
        assert!(health.contains("disk 95% full"));

        let healthy = crate::resources::ResourceSnapshot {
            load_one: 0.2,
            free_memory_mb: 4096,
            total_memory_mb: 8192,
            disk_used_percent: Some(40),
            uptime_secs: 3600,
        };
        assert_eq!(health_summary(&healthy, 512), "nominal");
    }
}
