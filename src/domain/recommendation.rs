//! LLM recommendations and their evaluated form

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::autonomy::Action;

/// A proposed action from the LLM
///
/// Untrusted input: the policy layer validates every field before anything
/// executes. `project` must resolve against the known set for all actions
/// except a free-form `notify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Target project name
    #[serde(default)]
    pub project: String,

    /// Requested action (validated against the allowlist)
    pub action: String,

    /// Short justification from the LLM
    #[serde(default)]
    pub reason: String,

    /// Optional seed prompt for a session start/restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    /// Optional model confidence in [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Optional requested notification tier (1-4)
    #[serde(default, rename = "notificationTier", skip_serializing_if = "Option::is_none")]
    pub notification_tier: Option<u8>,
}

impl Recommendation {
    /// The parsed action, if it is on the allowlist
    pub fn parsed_action(&self) -> Option<Action> {
        Action::parse(&self.action)
    }
}

/// Why a recommendation was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockedReason {
    Autonomy,
    Cooldown,
    Precondition,
    Protected,
    RetryCap,
    Duplicate,
    UnknownAction,
    UnknownProject,
}

impl std::fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockedReason::Autonomy => "autonomy",
            BlockedReason::Cooldown => "cooldown",
            BlockedReason::Precondition => "precondition",
            BlockedReason::Protected => "protected",
            BlockedReason::RetryCap => "retry-cap",
            BlockedReason::Duplicate => "duplicate",
            BlockedReason::UnknownAction => "unknown-action",
            BlockedReason::UnknownProject => "unknown-project",
        };
        write!(f, "{}", s)
    }
}

/// A recommendation after the policy pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatedRecommendation {
    /// The original proposal
    pub recommendation: Recommendation,

    /// Whether execution may proceed
    pub allowed: bool,

    /// Set when `allowed` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockedReason>,

    /// True iff the runtime level was `observe` at decision time
    pub observe_only: bool,

    /// When the policy decision was made
    pub decided_at: DateTime<Utc>,
}

impl EvaluatedRecommendation {
    /// Whether the executor should attempt this entry
    pub fn executable(&self) -> bool {
        self.allowed && !self.observe_only
    }
}
