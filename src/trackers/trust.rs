//! Trust accrual and promotion recommendations
//!
//! Four fixed rows, one per autonomy level, accumulate evidence: sessions
//! started, evaluation scores, and days spent at the level. A daily check
//! compares the current level against its promotion threshold and returns
//! a human-readable recommendation at most once per sojourn in the level.
//!
//! This tracker recommends; it never changes the runtime level. Raising
//! autonomy is the operator's decision alone.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use rusqlite::params;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{PromotionThreshold, TrustConfig};
use crate::db::Database;
use crate::domain::{Action, AutonomyLevel, ExecutionResult, TrustSummary};
use crate::state::Store;

pub struct TrustTracker {
    db: Database,
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    config: TrustConfig,
    boot_level: AutonomyLevel,
}

impl TrustTracker {
    pub fn new(
        db: Database,
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        config: TrustConfig,
        boot_level: AutonomyLevel,
    ) -> Result<Self> {
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS trust_summary (
                     level TEXT PRIMARY KEY,
                     total_sessions INTEGER NOT NULL DEFAULT 0,
                     total_evaluations INTEGER NOT NULL DEFAULT 0,
                     sum_eval_scores REAL NOT NULL DEFAULT 0,
                     first_entered_at TEXT,
                     last_entered_at TEXT,
                     total_days REAL NOT NULL DEFAULT 0,
                     promotion_sent_at TEXT,
                     last_updated_at TEXT
                 );",
            )?;
            for level in AutonomyLevel::ALL {
                conn.execute(
                    "INSERT OR IGNORE INTO trust_summary (level) VALUES (?1)",
                    params![level.to_string()],
                )?;
            }
            Ok(())
        })
        .context("Failed to create trust_summary table")?;

        let tracker = Self {
            db,
            store,
            clock,
            config,
            boot_level,
        };

        // First boot: stamp entry into the initial level
        let level = tracker.current_level();
        let now = tracker.clock.now();
        tracker.db.with_conn(|conn| {
            conn.execute(
                "UPDATE trust_summary
                 SET first_entered_at = COALESCE(first_entered_at, ?2),
                     last_entered_at = COALESCE(last_entered_at, ?2)
                 WHERE level = ?1",
                params![level.to_string(), now.to_rfc3339()],
            )
        })?;

        Ok(tracker)
    }

    fn current_level(&self) -> AutonomyLevel {
        self.store.autonomy_level(self.boot_level)
    }

    /// Accrue evidence for the current level from recent history
    ///
    /// Called every scan tick; the per-row watermark bounds the window so
    /// each record is counted once.
    pub fn update(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let level = self.current_level();
        let now = self.clock.now();
        let row = self.load_row(level)?;
        let watermark = row.0;

        let (new_sessions, new_evals, new_score_sum) = self.store.read(|state| {
            let since = |ts: DateTime<Utc>| watermark.map(|w| ts > w).unwrap_or(true);

            let sessions = state
                .executions
                .iter()
                .filter(|e| {
                    since(e.ts)
                        && e.autonomy_level == level
                        && e.action == Action::Start
                        && e.result == ExecutionResult::Ok
                })
                .count() as u64;

            let evals: Vec<u8> = state
                .evaluations
                .iter()
                .filter(|e| since(e.evaluated_at))
                .map(|e| e.score)
                .collect();

            let sum: f64 = evals.iter().map(|&s| s as f64).sum();
            (sessions, evals.len() as u64, sum)
        });

        // Days accrue from the previous update (or level entry) to now
        let accrue_from = watermark.or(row.1.last_entered_at);
        let day_delta = accrue_from
            .map(|from| (now - from).num_seconds().max(0) as f64 / 86_400.0)
            .unwrap_or(0.0);

        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE trust_summary
                 SET total_sessions = total_sessions + ?2,
                     total_evaluations = total_evaluations + ?3,
                     sum_eval_scores = sum_eval_scores + ?4,
                     total_days = total_days + ?5,
                     last_updated_at = ?6
                 WHERE level = ?1",
                params![
                    level.to_string(),
                    new_sessions as i64,
                    new_evals as i64,
                    new_score_sum,
                    day_delta,
                    now.to_rfc3339()
                ],
            )
        })?;

        if new_sessions > 0 || new_evals > 0 {
            debug!(%level, new_sessions, new_evals, "trust updated");
        }
        Ok(())
    }

    /// Check the current level against its promotion threshold
    ///
    /// Returns a recommendation string at most once per sojourn in the
    /// level. `observe` never auto-recommends (the first step up is the
    /// operator's to take) and `full` has no next level.
    pub fn check_promotion(&self) -> Result<Option<String>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let level = self.current_level();
        let threshold = match level {
            AutonomyLevel::Observe | AutonomyLevel::Full => return Ok(None),
            AutonomyLevel::Cautious => &self.config.cautious_to_moderate,
            AutonomyLevel::Moderate => &self.config.moderate_to_full,
        };
        let target = level.next().expect("cautious and moderate have a next level");

        let (_, summary) = self.load_row(level)?;
        if summary.promotion_sent_at.is_some() {
            return Ok(None);
        }
        if !meets_threshold(&summary, threshold) {
            return Ok(None);
        }

        let now = self.clock.now();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE trust_summary SET promotion_sent_at = ?2 WHERE level = ?1",
                params![level.to_string(), now.to_rfc3339()],
            )
        })?;

        let avg = summary.avg_score().unwrap_or(0.0);
        let message = format!(
            "Trust check: {} sessions at {} with avg score {:.1} over {:.0} days. Consider promoting to {} (reply: autonomy {})",
            summary.total_sessions, level, avg, summary.total_days, target, target
        );
        info!(%level, %target, "promotion recommendation");
        Ok(Some(message))
    }

    /// Record an operator level change: stamp entry into the new level
    /// and clear its promotion flag so the next sojourn can recommend
    /// again.
    pub fn note_level_change(&self, new_level: AutonomyLevel) -> Result<()> {
        let now = self.clock.now();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE trust_summary
                 SET first_entered_at = COALESCE(first_entered_at, ?2),
                     last_entered_at = ?2,
                     promotion_sent_at = NULL,
                     last_updated_at = ?2
                 WHERE level = ?1",
                params![new_level.to_string(), now.to_rfc3339()],
            )
        })?;
        Ok(())
    }

    /// Summary row for a level (context assembly, status)
    pub fn summary(&self, level: AutonomyLevel) -> Result<TrustSummary> {
        Ok(self.load_row(level)?.1)
    }

    /// One-line trust rendering for the context prompt
    pub fn format_for_context(&self) -> Result<String> {
        let level = self.current_level();
        let summary = self.summary(level)?;
        let avg = summary
            .avg_score()
            .map(|a| format!("{:.1}", a))
            .unwrap_or_else(|| "-".to_string());

        let progress = match level {
            AutonomyLevel::Cautious => progress_percent(&summary, &self.config.cautious_to_moderate),
            AutonomyLevel::Moderate => progress_percent(&summary, &self.config.moderate_to_full),
            _ => None,
        };
        let progress = progress
            .map(|p| format!(", promotion progress {}%", p))
            .unwrap_or_default();

        Ok(format!(
            "level {}, {:.0} days tenure, {} sessions, avg score {}{}",
            level, summary.total_days, summary.total_sessions, avg, progress
        ))
    }

    fn load_row(&self, level: AutonomyLevel) -> Result<(Option<DateTime<Utc>>, TrustSummary)> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT total_sessions, total_evaluations, sum_eval_scores,
                        first_entered_at, last_entered_at, total_days,
                        promotion_sent_at, last_updated_at
                 FROM trust_summary WHERE level = ?1",
                params![level.to_string()],
                |row| {
                    Ok((
                        parse_ts(row.get::<_, Option<String>>(7)?),
                        TrustSummary {
                            total_sessions: row.get::<_, i64>(0)? as u64,
                            total_evaluations: row.get::<_, i64>(1)? as u64,
                            sum_eval_scores: row.get(2)?,
                            first_entered_at: parse_ts(row.get::<_, Option<String>>(3)?),
                            last_entered_at: parse_ts(row.get::<_, Option<String>>(4)?),
                            total_days: row.get(5)?,
                            promotion_sent_at: parse_ts(row.get::<_, Option<String>>(6)?),
                        },
                    ))
                },
            )
        })?;
        Ok(row)
    }
}

fn meets_threshold(summary: &TrustSummary, threshold: &PromotionThreshold) -> bool {
    let avg_ok = summary.avg_score().map(|a| a >= threshold.min_avg_score).unwrap_or(false);
    summary.total_sessions >= threshold.min_sessions && avg_ok && summary.total_days >= threshold.min_days
}

fn progress_percent(summary: &TrustSummary, threshold: &PromotionThreshold) -> Option<u32> {
    if threshold.min_sessions == 0 {
        return None;
    }
    let sessions = summary.total_sessions as f64 / threshold.min_sessions as f64;
    let days = if threshold.min_days > 0.0 {
        summary.total_days / threshold.min_days
    } else {
        1.0
    };
    Some((sessions.min(days).min(1.0) * 100.0) as u32)
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn fixture(
        level: AutonomyLevel,
        threshold: PromotionThreshold,
    ) -> (TrustTracker, Arc<Store>, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::load(dir.path().join("state.json")).unwrap());
        store.set_autonomy_level(level).unwrap();

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()));
        let config = TrustConfig {
            cautious_to_moderate: threshold.clone(),
            moderate_to_full: threshold,
            ..Default::default()
        };
        let tracker = TrustTracker::new(
            Database::open_in_memory().unwrap(),
            store.clone(),
            clock.clone(),
            config,
            AutonomyLevel::Observe,
        )
        .unwrap();
        (tracker, store, clock, dir)
    }

    fn record_start(store: &Store, level: AutonomyLevel, ts: DateTime<Utc>) {
        store
            .log_execution(crate::domain::ExecutionRecord {
                ts,
                action: Action::Start,
                project: "alpha".into(),
                result: ExecutionResult::Ok,
                error: None,
                autonomy_level: level,
                state_version: 0,
            })
            .unwrap();
    }

    fn record_eval(store: &Store, score: u8, ts: DateTime<Utc>) {
        store
            .log_evaluation(crate::domain::EvaluationRecord {
                session_id: "orch-alpha".into(),
                project_name: "alpha".into(),
                started_at: ts - Duration::minutes(30),
                stopped_at: ts,
                duration_minutes: 30,
                git_progress: Default::default(),
                score,
                recommendation: crate::domain::EvalRecommendation::Continue,
                accomplishments: vec![],
                failures: vec![],
                reasoning: String::new(),
                evaluated_at: ts,
            })
            .unwrap();
    }

    fn loose_threshold() -> PromotionThreshold {
        PromotionThreshold {
            min_sessions: 2,
            min_avg_score: 3.5,
            min_days: 0.0,
        }
    }

    #[tokio::test]
    async fn test_promotion_recommendation_idempotent_per_sojourn() {
        let (tracker, store, clock, _dir) = fixture(AutonomyLevel::Cautious, loose_threshold());

        record_start(&store, AutonomyLevel::Cautious, clock.now());
        record_start(&store, AutonomyLevel::Cautious, clock.now());
        record_eval(&store, 4, clock.now());
        record_eval(&store, 4, clock.now());
        clock.advance(Duration::minutes(1));
        tracker.update().unwrap();

        let first = tracker.check_promotion().unwrap();
        assert!(first.is_some());
        assert!(first.unwrap().contains("moderate"));

        // Same sojourn: no repeat
        assert!(tracker.check_promotion().unwrap().is_none());

        // Re-entering the level clears the flag
        tracker.note_level_change(AutonomyLevel::Cautious).unwrap();
        assert!(tracker.check_promotion().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_promotion_below_threshold() {
        let (tracker, store, clock, _dir) = fixture(AutonomyLevel::Cautious, loose_threshold());

        record_start(&store, AutonomyLevel::Cautious, clock.now());
        record_eval(&store, 2, clock.now());
        clock.advance(Duration::minutes(1));
        tracker.update().unwrap();

        // One session and a 2.0 average miss 2-sessions/3.5-avg
        assert!(tracker.check_promotion().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_observe_and_full_never_recommend() {
        for level in [AutonomyLevel::Observe, AutonomyLevel::Full] {
            let (tracker, store, clock, _dir) = fixture(
                level,
                PromotionThreshold {
                    min_sessions: 0,
                    min_avg_score: 0.0,
                    min_days: 0.0,
                },
            );

            record_start(&store, level, clock.now());
            record_eval(&store, 5, clock.now());
            clock.advance(Duration::minutes(1));
            tracker.update().unwrap();

            assert!(tracker.check_promotion().unwrap().is_none(), "{} must not recommend", level);
        }
    }

    #[tokio::test]
    async fn test_update_counts_each_record_once() {
        let (tracker, store, clock, _dir) = fixture(AutonomyLevel::Cautious, loose_threshold());

        record_start(&store, AutonomyLevel::Cautious, clock.now());
        clock.advance(Duration::minutes(1));
        tracker.update().unwrap();
        tracker.update().unwrap();
        tracker.update().unwrap();

        let summary = tracker.summary(AutonomyLevel::Cautious).unwrap();
        assert_eq!(summary.total_sessions, 1);
    }

    #[tokio::test]
    async fn test_failed_starts_do_not_count_as_sessions() {
        let (tracker, store, clock, _dir) = fixture(AutonomyLevel::Cautious, loose_threshold());

        store
            .log_execution(crate::domain::ExecutionRecord {
                ts: clock.now(),
                action: Action::Start,
                project: "alpha".into(),
                result: ExecutionResult::Failed,
                error: Some("spawn failed".into()),
                autonomy_level: AutonomyLevel::Cautious,
                state_version: 0,
            })
            .unwrap();
        clock.advance(Duration::minutes(1));
        tracker.update().unwrap();

        assert_eq!(tracker.summary(AutonomyLevel::Cautious).unwrap().total_sessions, 0);
    }

    /// The tracker recommends promotions; it must never apply them. Scan
    /// this module's source for a call to the store's level setter.
    #[test]
    fn test_tracker_never_mutates_autonomy_level() {
        let source = include_str!("trust.rs");
        let forbidden = format!("set_autonomy{}", "_level(");
        assert!(
            !source.contains(&forbidden),
            "trust tracker must not call the autonomy level setter"
        );
    }
}
