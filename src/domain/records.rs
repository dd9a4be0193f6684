//! Durable record types held by the state store and the database

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::autonomy::{Action, AutonomyLevel};
use super::recommendation::{EvaluatedRecommendation, Recommendation};

/// One think-cycle result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// When the cycle completed
    pub ts: DateTime<Utc>,

    /// The LLM's one-line summary of the situation
    pub summary: String,

    /// Raw recommendations as returned by the LLM
    pub recommendations: Vec<Recommendation>,

    /// Recommendations after the policy pass
    pub evaluated: Vec<EvaluatedRecommendation>,

    /// Wall time for the whole cycle
    pub duration_ms: u64,

    /// LLM-requested delay until the next cycle (already clamped)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_think_in_sec: Option<u64>,

    /// Set when the cycle failed (LLM error, parse failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one side-effect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionResult {
    Ok,
    Failed,
    Blocked,
}

/// One side-effect attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub ts: DateTime<Utc>,
    pub action: Action,
    pub project: String,
    pub result: ExecutionResult,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Runtime level at the moment of execution
    pub autonomy_level: AutonomyLevel,

    /// State document version after the attempt was recorded
    pub state_version: u64,
}

/// Git evidence gathered over a session window
///
/// `no_git` marks directories without a repository; all counters are zero
/// there and evaluation falls back to output-only judging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitProgress {
    pub commit_count: u32,
    pub insertions: u32,
    pub deletions: u32,
    pub files_changed: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit_subject: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit_at: Option<DateTime<Utc>>,

    pub no_git: bool,
}

impl GitProgress {
    /// The "no git data" value every git failure coerces to
    pub fn none() -> Self {
        Self {
            no_git: true,
            ..Default::default()
        }
    }
}

/// Evaluator verdict on what the session should lead to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalRecommendation {
    Continue,
    Retry,
    Escalate,
    Complete,
}

impl EvalRecommendation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "continue" => Some(Self::Continue),
            "retry" => Some(Self::Retry),
            "escalate" => Some(Self::Escalate),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// A completed session's assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub session_id: String,
    pub project_name: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub git_progress: GitProgress,

    /// Quality score, 1 (nothing useful) to 5 (excellent)
    pub score: u8,
    pub recommendation: EvalRecommendation,
    pub accomplishments: Vec<String>,
    pub failures: Vec<String>,
    pub reasoning: String,
    pub evaluated_at: DateTime<Utc>,
}

/// One conversation exchange kept as LLM memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    /// "user" or "assistant"
    pub role: String,
    /// Text with credential-bearing substrings redacted before persistence
    pub text: String,
    pub ts: DateTime<Utc>,
}

/// A scheduled operator reminder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: i64,
    pub text: String,
    pub fire_at: DateTime<Utc>,
    pub source_message: String,
    pub fired: bool,
}

/// One revenue observation for a single source
///
/// NULL metric means "source unreachable or field missing"; numeric zero
/// means the source responded with zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevenueSnapshot {
    pub source: String,
    pub collected_at: DateTime<Utc>,
    pub balance_atomic: Option<i64>,
    pub hashrate: Option<f64>,
    pub price_usd: Option<f64>,
    pub requests_served: Option<i64>,
}

impl RevenueSnapshot {
    /// Snapshot recording a failed fetch: every metric NULL
    pub fn unreachable(source: &str, collected_at: DateTime<Utc>) -> Self {
        Self {
            source: source.to_string(),
            collected_at,
            balance_atomic: None,
            hashrate: None,
            price_usd: None,
            requests_served: None,
        }
    }
}

/// Trust evidence accumulated for one autonomy level
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustSummary {
    pub total_sessions: u64,
    pub total_evaluations: u64,
    pub sum_eval_scores: f64,
    pub first_entered_at: Option<DateTime<Utc>>,
    pub last_entered_at: Option<DateTime<Utc>>,
    pub total_days: f64,
    pub promotion_sent_at: Option<DateTime<Utc>>,
}

impl TrustSummary {
    /// Mean evaluation score, when any evaluations were recorded
    pub fn avg_score(&self) -> Option<f64> {
        if self.total_evaluations > 0 {
            Some(self.sum_eval_scores / self.total_evaluations as f64)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_progress_none_is_no_git() {
        let progress = GitProgress::none();
        assert!(progress.no_git);
        assert_eq!(progress.commit_count, 0);
        assert!(progress.last_commit_hash.is_none());
    }

    #[test]
    fn test_trust_summary_avg() {
        let mut summary = TrustSummary::default();
        assert_eq!(summary.avg_score(), None);

        summary.total_evaluations = 4;
        summary.sum_eval_scores = 14.0;
        assert_eq!(summary.avg_score(), Some(3.5));
    }

    #[test]
    fn test_eval_recommendation_parse() {
        assert_eq!(EvalRecommendation::parse("continue"), Some(EvalRecommendation::Continue));
        assert_eq!(EvalRecommendation::parse("ESCALATE"), Some(EvalRecommendation::Escalate));
        assert_eq!(EvalRecommendation::parse("ship-it"), None);
    }
}
