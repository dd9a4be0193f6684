//! Session learning
//!
//! Append-only evaluation rows keyed by project, prompt style, duration,
//! and time of day. Pattern analysis is gated until enough rows exist and
//! cached between invalidation intervals.

use std::sync::Mutex;

use chrono::{DateTime, Timelike, Utc};
use eyre::{Context, Result};
use regex::Regex;
use rusqlite::params;
use tracing::debug;

use crate::config::LearningConfig;
use crate::db::Database;
use crate::domain::EvaluationRecord;

/// Prompt-snippet cap stored per row
const SNIPPET_CHARS: usize = 200;

/// Aggregated findings over the evaluation history
#[derive(Debug, Clone)]
pub struct PatternReport {
    /// (project, avg score, rows) for projects with >= 3 rows
    pub by_project: Vec<(String, f64, i64)>,
    /// (style, avg score, rows) for styles with >= 5 rows
    pub by_style: Vec<(String, f64, i64)>,
    /// Duration bucket (minutes lo..hi) whose avg score is >= 4
    pub best_duration: Option<(i64, i64, f64)>,
    /// (4-hour bucket start, avg score) per time-of-day bucket
    pub by_time_bucket: Vec<(u8, f64)>,
}

impl PatternReport {
    /// Short rendering for the context prompt
    pub fn format_for_context(&self) -> String {
        let mut lines = Vec::new();

        if let Some((project, avg, _)) = self
            .by_project
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            lines.push(format!("best project: {} (avg {:.1})", project, avg));
        }
        if let Some((style, avg, _)) = self
            .by_style
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            lines.push(format!("best prompt style: {} (avg {:.1})", style, avg));
        }
        if let Some((lo, hi, avg)) = self.best_duration {
            lines.push(format!("best duration: {}-{} min (avg {:.1})", lo, hi, avg));
        }
        if let Some((bucket, avg)) = self
            .by_time_bucket
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        {
            lines.push(format!("best hours: {:02}:00-{:02}:00 (avg {:.1})", bucket, bucket + 4, avg));
        }

        lines.join("; ")
    }
}

pub struct SessionLearner {
    db: Database,
    config: LearningConfig,
    /// (row count at analysis time, report)
    cache: Mutex<Option<(u64, PatternReport)>>,
}

impl SessionLearner {
    pub fn new(db: Database, config: LearningConfig) -> Result<Self> {
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS session_evaluations (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     session_id TEXT NOT NULL,
                     project_name TEXT NOT NULL,
                     started_at TEXT NOT NULL,
                     stopped_at TEXT NOT NULL,
                     duration_minutes INTEGER NOT NULL,
                     commit_count INTEGER NOT NULL,
                     insertions INTEGER NOT NULL,
                     deletions INTEGER NOT NULL,
                     files_changed INTEGER NOT NULL,
                     score INTEGER NOT NULL,
                     recommendation TEXT NOT NULL,
                     prompt_snippet TEXT NOT NULL,
                     prompt_style TEXT NOT NULL,
                     evaluated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_session_evals_project
                     ON session_evaluations (project_name);
                 CREATE INDEX IF NOT EXISTS idx_session_evals_score
                     ON session_evaluations (score);",
            )
        })
        .context("Failed to create session_evaluations table")?;

        Ok(Self {
            db,
            config,
            cache: Mutex::new(None),
        })
    }

    /// Append one evaluation row
    pub fn record(&self, record: &EvaluationRecord, prompt: &str) -> Result<()> {
        let snippet: String = prompt.chars().take(SNIPPET_CHARS).collect();
        let style = classify_prompt(prompt);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO session_evaluations
                     (session_id, project_name, started_at, stopped_at, duration_minutes,
                      commit_count, insertions, deletions, files_changed, score,
                      recommendation, prompt_snippet, prompt_style, evaluated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    record.session_id,
                    record.project_name,
                    record.started_at.to_rfc3339(),
                    record.stopped_at.to_rfc3339(),
                    record.duration_minutes,
                    record.git_progress.commit_count,
                    record.git_progress.insertions,
                    record.git_progress.deletions,
                    record.git_progress.files_changed,
                    record.score,
                    format!("{:?}", record.recommendation).to_lowercase(),
                    snippet,
                    style,
                    record.evaluated_at.to_rfc3339(),
                ],
            )
        })?;
        Ok(())
    }

    /// Total evaluation rows
    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .db
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM session_evaluations", [], |row| row.get(0)))?;
        Ok(count as u64)
    }

    /// Aggregate patterns over the history
    ///
    /// Returns None below the row gate. The report is cached and only
    /// recomputed after `analysis_interval` new rows land.
    pub fn analyze_patterns(&self) -> Result<Option<PatternReport>> {
        let rows = self.count()?;
        if rows < self.config.min_evaluations {
            return Ok(None);
        }

        {
            let cache = self.cache.lock().unwrap();
            if let Some((cached_at, report)) = cache.as_ref() {
                if rows < cached_at + self.config.analysis_interval {
                    return Ok(Some(report.clone()));
                }
            }
        }

        let report = self.compute_report()?;
        debug!(rows, "session-learner patterns recomputed");
        *self.cache.lock().unwrap() = Some((rows, report.clone()));
        Ok(Some(report))
    }

    fn compute_report(&self) -> Result<PatternReport> {
        let by_project = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT project_name, AVG(score), COUNT(*)
                 FROM session_evaluations
                 GROUP BY project_name HAVING COUNT(*) >= 3
                 ORDER BY AVG(score) DESC",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<rusqlite::Result<Vec<(String, f64, i64)>>>()
        })?;

        let by_style = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT prompt_style, AVG(score), COUNT(*)
                 FROM session_evaluations
                 GROUP BY prompt_style HAVING COUNT(*) >= 5
                 ORDER BY AVG(score) DESC",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<rusqlite::Result<Vec<(String, f64, i64)>>>()
        })?;

        // 15-minute duration buckets; report the best one averaging >= 4
        let durations = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT (duration_minutes / 15) * 15, AVG(score), COUNT(*)
                 FROM session_evaluations
                 GROUP BY duration_minutes / 15
                 ORDER BY AVG(score) DESC",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<rusqlite::Result<Vec<(i64, f64, i64)>>>()
        })?;
        let best_duration = durations
            .into_iter()
            .find(|(_, avg, count)| *avg >= 4.0 && *count >= 3)
            .map(|(lo, avg, _)| (lo, lo + 15, avg));

        let by_time_bucket = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT started_at, score FROM session_evaluations",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<(String, i64)>>>()
        })?;
        let by_time_bucket = bucket_by_time(&by_time_bucket);

        Ok(PatternReport {
            by_project,
            by_style,
            best_duration,
            by_time_bucket,
        })
    }
}

/// Average scores per 4-hour time-of-day bucket
fn bucket_by_time(rows: &[(String, i64)]) -> Vec<(u8, f64)> {
    let mut sums = [(0i64, 0i64); 6];
    for (started_at, score) in rows {
        let Ok(ts) = DateTime::parse_from_rfc3339(started_at) else {
            continue;
        };
        let bucket = (ts.with_timezone(&Utc).hour() / 4) as usize;
        sums[bucket].0 += score;
        sums[bucket].1 += 1;
    }

    sums.iter()
        .enumerate()
        .filter(|(_, (_, count))| *count > 0)
        .map(|(i, (sum, count))| ((i * 4) as u8, *sum as f64 / *count as f64))
        .collect()
}

/// Classify a session prompt by keyword into one of the known styles
pub fn classify_prompt(prompt: &str) -> &'static str {
    // English keywords only; multilingual operators are unsupported
    let rules: [(&str, &str); 4] = [
        (r"(?i)\b(fix|bug|error|broken|fail)\w*", "fix"),
        (r"(?i)\b(implement|add|build|create|write)\w*", "implement"),
        (r"(?i)\b(explore|investigate|research|understand|analy[sz]e)\w*", "explore"),
        (r"(?i)\b(resume|continue|keep going|pick up)\w*", "resume"),
    ];

    for (pattern, style) in rules {
        if Regex::new(pattern).map(|re| re.is_match(prompt)).unwrap_or(false) {
            return style;
        }
    }
    "custom"
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn learner(min_evaluations: u64) -> SessionLearner {
        SessionLearner::new(
            Database::open_in_memory().unwrap(),
            LearningConfig {
                min_evaluations,
                analysis_interval: 10,
            },
        )
        .unwrap()
    }

    fn record(project: &str, score: u8, duration_minutes: i64, hour: u32) -> EvaluationRecord {
        let started = Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap();
        EvaluationRecord {
            session_id: format!("orch-{}", project),
            project_name: project.to_string(),
            started_at: started,
            stopped_at: started + chrono::Duration::minutes(duration_minutes),
            duration_minutes,
            git_progress: Default::default(),
            score,
            recommendation: crate::domain::EvalRecommendation::Continue,
            accomplishments: vec![],
            failures: vec![],
            reasoning: String::new(),
            evaluated_at: started,
        }
    }

    #[test]
    fn test_classify_prompt_styles() {
        assert_eq!(classify_prompt("Fix the failing auth test"), "fix");
        assert_eq!(classify_prompt("implement pagination for the API"), "implement");
        assert_eq!(classify_prompt("Explore how the cache layer works"), "explore");
        assert_eq!(classify_prompt("resume where the last session left off"), "resume");
        assert_eq!(classify_prompt("do the thing we discussed"), "custom");
    }

    #[test]
    fn test_classify_prompt_first_rule_wins() {
        // "fix" outranks "implement" when both appear
        assert_eq!(classify_prompt("implement a fix for the bug"), "fix");
    }

    #[test]
    fn test_analyze_gated_below_minimum() {
        let learner = learner(50);
        for i in 0..10 {
            learner.record(&record("alpha", 4, 30, 10), &format!("fix bug {}", i)).unwrap();
        }
        assert!(learner.analyze_patterns().unwrap().is_none());
    }

    #[test]
    fn test_analyze_aggregates_by_project_and_style() {
        let learner = learner(10);

        for i in 0..6 {
            learner.record(&record("good", 5, 30, 10), &format!("fix thing {}", i)).unwrap();
        }
        for i in 0..6 {
            learner.record(&record("bad", 2, 30, 10), &format!("explore thing {}", i)).unwrap();
        }

        let report = learner.analyze_patterns().unwrap().unwrap();

        let good = report.by_project.iter().find(|(p, _, _)| p == "good").unwrap();
        assert!(good.1 > 4.9);
        let bad = report.by_project.iter().find(|(p, _, _)| p == "bad").unwrap();
        assert!(bad.1 < 2.1);

        let fix = report.by_style.iter().find(|(s, _, _)| s == "fix").unwrap();
        assert_eq!(fix.2, 6);
    }

    #[test]
    fn test_analyze_cache_invalidation_interval() {
        let learner = learner(5);
        for i in 0..6 {
            learner.record(&record("alpha", 3, 30, 10), &format!("fix {}", i)).unwrap();
        }

        let first = learner.analyze_patterns().unwrap().unwrap();
        assert!(first.by_project[0].1 < 3.5);

        // A few new rows inside the interval: cached report returned
        for i in 0..5 {
            learner.record(&record("alpha", 5, 30, 10), &format!("fix more {}", i)).unwrap();
        }
        let cached = learner.analyze_patterns().unwrap().unwrap();
        assert!((cached.by_project[0].1 - first.by_project[0].1).abs() < 1e-9);

        // Past the interval: recomputed with the new rows
        for i in 0..6 {
            learner.record(&record("alpha", 5, 30, 10), &format!("fix again {}", i)).unwrap();
        }
        let fresh = learner.analyze_patterns().unwrap().unwrap();
        assert!(fresh.by_project[0].1 > first.by_project[0].1);
    }

    #[test]
    fn test_time_buckets() {
        let rows = vec![
            ("2025-06-01T09:00:00+00:00".to_string(), 4i64),
            ("2025-06-01T10:30:00+00:00".to_string(), 2),
            ("2025-06-01T22:00:00+00:00".to_string(), 5),
        ];
        let buckets = bucket_by_time(&rows);

        // 09:00 and 10:30 share the 08:00 bucket
        let morning = buckets.iter().find(|(b, _)| *b == 8).unwrap();
        assert!((morning.1 - 3.0).abs() < 1e-9);
        let night = buckets.iter().find(|(b, _)| *b == 20).unwrap();
        assert!((night.1 - 5.0).abs() < 1e-9);
    }
}
