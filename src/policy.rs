//! Autonomy policy
//!
//! Validates LLM recommendations against the autonomy matrix, the
//! protected-projects list, cooldown windows, and the per-project retry
//! cap. The LLM is untrusted input; this layer and the executor's
//! just-in-time preconditions are the hard gate between a recommendation
//! and a side effect.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::clock::Clock;
use crate::config::AiConfig;
use crate::domain::{Action, AutonomyLevel, BlockedReason, EvaluatedRecommendation, Recommendation};
use crate::state::Store;

/// In-memory cooldown timestamps
///
/// Owned by the policy alone; lost on restart, which at worst re-permits
/// one action early.
#[derive(Default)]
struct Cooldowns {
    per_project: HashMap<String, DateTime<Utc>>,
    per_action: HashMap<(String, Action), DateTime<Utc>>,
}

pub struct Policy {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    protected: HashSet<String>,
    same_project_window: Duration,
    same_action_window: Duration,
    max_error_retries: u32,
    boot_level: AutonomyLevel,
    cooldowns: Mutex<Cooldowns>,
}

impl Policy {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, config: &AiConfig, extra_blocked: &[String]) -> Self {
        let mut protected: HashSet<String> = config.protected_projects.iter().cloned().collect();
        protected.extend(extra_blocked.iter().cloned());

        Self {
            store,
            clock,
            protected,
            same_project_window: Duration::milliseconds(config.cooldowns.same_project_ms as i64),
            same_action_window: Duration::milliseconds(config.cooldowns.same_action_ms as i64),
            max_error_retries: config.max_error_retries,
            boot_level: config.autonomy_level,
            cooldowns: Mutex::new(Cooldowns::default()),
        }
    }

    /// The effective runtime level, read fresh so operator overrides take
    /// effect immediately
    pub fn runtime_level(&self) -> AutonomyLevel {
        self.store.autonomy_level(self.boot_level)
    }

    /// Evaluate a batch of recommendations in order
    pub fn evaluate(&self, recommendations: &[Recommendation], known_projects: &HashSet<String>) -> Vec<EvaluatedRecommendation> {
        let level = self.runtime_level();
        let now = self.clock.now();

        recommendations
            .iter()
            .map(|rec| self.evaluate_one(rec, known_projects, level, now))
            .collect()
    }

    fn evaluate_one(
        &self,
        rec: &Recommendation,
        known_projects: &HashSet<String>,
        level: AutonomyLevel,
        now: DateTime<Utc>,
    ) -> EvaluatedRecommendation {
        let observe_only = level == AutonomyLevel::Observe;
        let blocked = |reason: BlockedReason| EvaluatedRecommendation {
            recommendation: rec.clone(),
            allowed: false,
            blocked_reason: Some(reason),
            observe_only,
            decided_at: now,
        };

        // 1. Resolve the project (free-form notify may omit it)
        let action = rec.parsed_action();
        let needs_project = action != Some(Action::Notify) || !rec.project.is_empty();
        if needs_project && (rec.project.is_empty() || !known_projects.contains(&rec.project)) {
            debug!(project = %rec.project, "recommendation rejected: unknown project");
            return blocked(BlockedReason::UnknownProject);
        }

        // 2. Action allowlist
        let Some(action) = action else {
            debug!(action = %rec.action, "recommendation rejected: unknown action");
            return blocked(BlockedReason::UnknownAction);
        };

        // 3. Protected projects, before any further checks
        if self.protected.contains(&rec.project) {
            return blocked(BlockedReason::Protected);
        }

        // 4. Cooldowns (session actions only; notify and skip are free)
        if action.is_session_action() && self.cooldown_active(&rec.project, action, now) {
            return blocked(BlockedReason::Cooldown);
        }

        // 5. Retry cap
        if action.is_session_action() && self.store.error_retry_count(&rec.project) >= self.max_error_retries {
            return blocked(BlockedReason::RetryCap);
        }

        // 6. Autonomy matrix
        if !level.permits(action) {
            return blocked(BlockedReason::Autonomy);
        }

        // 7. Observe flag
        EvaluatedRecommendation {
            recommendation: rec.clone(),
            allowed: true,
            blocked_reason: None,
            observe_only,
            decided_at: now,
        }
    }

    /// Whether a window has not yet elapsed for this project or action
    pub fn cooldown_active(&self, project: &str, action: Action, now: DateTime<Utc>) -> bool {
        let cooldowns = self.cooldowns.lock().unwrap();

        if let Some(&last) = cooldowns.per_project.get(project) {
            if now - last < self.same_project_window {
                return true;
            }
        }
        if let Some(&last) = cooldowns.per_action.get(&(project.to_string(), action)) {
            if now - last < self.same_action_window {
                return true;
            }
        }
        false
    }

    /// Record cooldown timestamps after a successful execution
    pub fn record_cooldown(&self, project: &str, action: Action) {
        let now = self.clock.now();
        let mut cooldowns = self.cooldowns.lock().unwrap();
        cooldowns.per_project.insert(project.to_string(), now);
        cooldowns.per_action.insert((project.to_string(), action), now);
    }

    /// Cooldown map size (tests and status)
    pub fn cooldown_entries(&self) -> usize {
        let cooldowns = self.cooldowns.lock().unwrap();
        cooldowns.per_project.len() + cooldowns.per_action.len()
    }
}
