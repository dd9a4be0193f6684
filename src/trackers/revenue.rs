//! Revenue snapshot collection
//!
//! Sources (mining pool, price oracle, local inference endpoint) are
//! external adapters behind the `RevenueSource` trait. The tracker owns
//! the append-only snapshot table and its semantics: a NULL metric means
//! the source was unreachable or omitted the field, a zero means the
//! source answered zero.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use eyre::{Context, Result};
use rusqlite::params;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::db::Database;
use crate::domain::RevenueSnapshot;

/// Staleness threshold for the context line
const STALE_MINUTES: i64 = 60;

/// One revenue data source
#[async_trait]
pub trait RevenueSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the current snapshot; an Err is recorded as all-NULL
    async fn fetch(&self) -> Result<RevenueSnapshot>;
}

pub struct RevenueTracker {
    db: Database,
    clock: Arc<dyn Clock>,
    sources: Vec<Arc<dyn RevenueSource>>,
    retention_days: i64,
}

impl RevenueTracker {
    pub fn new(
        db: Database,
        clock: Arc<dyn Clock>,
        sources: Vec<Arc<dyn RevenueSource>>,
        retention_days: i64,
    ) -> Result<Self> {
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS revenue_snapshots (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     source TEXT NOT NULL,
                     collected_at TEXT NOT NULL,
                     balance_atomic INTEGER,
                     hashrate REAL,
                     price_usd REAL,
                     requests_served INTEGER
                 );
                 CREATE INDEX IF NOT EXISTS idx_revenue_source_time
                     ON revenue_snapshots (source, collected_at);",
            )
        })
        .context("Failed to create revenue_snapshots table")?;

        Ok(Self {
            db,
            clock,
            sources,
            retention_days,
        })
    }

    /// Collect one snapshot per source
    ///
    /// Fetch failures are stored as all-NULL rows, never surfaced to the
    /// operator; the stale marker accumulates in context instead.
    pub async fn collect(&self) -> Result<()> {
        let now = self.clock.now();
        for source in &self.sources {
            let snapshot = match source.fetch().await {
                Ok(mut snapshot) => {
                    snapshot.source = source.name().to_string();
                    snapshot.collected_at = now;
                    snapshot
                }
                Err(e) => {
                    debug!(source = source.name(), error = %e, "revenue fetch failed");
                    RevenueSnapshot::unreachable(source.name(), now)
                }
            };
            if let Err(e) = self.insert(&snapshot) {
                warn!(source = %snapshot.source, error = %e, "failed to store revenue snapshot");
            }
        }
        Ok(())
    }

    /// Append one snapshot row
    pub fn insert(&self, snapshot: &RevenueSnapshot) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO revenue_snapshots
                     (source, collected_at, balance_atomic, hashrate, price_usd, requests_served)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    snapshot.source,
                    snapshot.collected_at.to_rfc3339(),
                    snapshot.balance_atomic,
                    snapshot.hashrate,
                    snapshot.price_usd,
                    snapshot.requests_served,
                ],
            )
        })?;
        Ok(())
    }

    /// Most recent snapshot for a source, with its age in minutes
    pub fn get_latest(&self, source: &str) -> Result<Option<(RevenueSnapshot, i64)>> {
        let row = self
            .db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT source, collected_at, balance_atomic, hashrate, price_usd, requests_served
                     FROM revenue_snapshots WHERE source = ?1
                     ORDER BY collected_at DESC LIMIT 1",
                    params![source],
                    row_to_snapshot,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
            })?;

        Ok(row.map(|snapshot| {
            let age = (self.clock.now() - snapshot.collected_at).num_minutes();
            (snapshot, age)
        }))
    }

    /// One line per source for the context prompt
    pub fn format_for_context(&self) -> Result<String> {
        let mut lines = Vec::new();
        for source in &self.sources {
            let line = match self.get_latest(source.name())? {
                Some((snapshot, age)) => {
                    let value = match snapshot.balance_atomic {
                        Some(cents) => format!("${:.2}", cents as f64 / 100.0),
                        None => "data unavailable".to_string(),
                    };
                    let stale = if age > STALE_MINUTES { " STALE" } else { "" };
                    format!("{}: {} ({}m ago){}", source.name(), value, age, stale)
                }
                None => format!("{}: no data", source.name()),
            };
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    /// Compare this week's earnings to the prior week's, per source
    ///
    /// Balance counters are monotonic but reset on payout; a decrease is
    /// treated as a restart (delta resumes from the new observation).
    pub fn weekly_trend(&self) -> Result<String> {
        let now = self.clock.now();
        let week_ago = now - Duration::days(7);
        let two_weeks_ago = now - Duration::days(14);

        let mut lines = Vec::new();
        for source in &self.sources {
            let this_week = self.counter_delta(source.name(), week_ago, now)?;
            let last_week = self.counter_delta(source.name(), two_weeks_ago, week_ago)?;

            let line = match (this_week, last_week) {
                (Some(cur), Some(prev)) => {
                    let sign = if cur >= prev { "+" } else { "-" };
                    format!(
                        "{}: ${:.2} this week vs ${:.2} last ({}{:.2})",
                        source.name(),
                        cur as f64 / 100.0,
                        prev as f64 / 100.0,
                        sign,
                        (cur - prev).abs() as f64 / 100.0
                    )
                }
                (Some(cur), None) => format!("{}: ${:.2} this week (no prior data)", source.name(), cur as f64 / 100.0),
                _ => format!("{}: no data", source.name()),
            };
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    /// Sum of positive balance movements across a window, reset-aware
    fn counter_delta(&self, source: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Option<i64>> {
        let values: Vec<i64> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT balance_atomic FROM revenue_snapshots
                 WHERE source = ?1 AND collected_at >= ?2 AND collected_at < ?3
                       AND balance_atomic IS NOT NULL
                 ORDER BY collected_at",
            )?;
            let rows = stmt.query_map(params![source, from.to_rfc3339(), to.to_rfc3339()], |row| row.get(0))?;
            rows.collect()
        })?;

        if values.len() < 2 {
            return Ok(None);
        }

        let mut delta = 0i64;
        for pair in values.windows(2) {
            let (prev, cur) = (pair[0], pair[1]);
            if cur >= prev {
                delta += cur - prev;
            } else {
                // Counter reset: the new observation is fresh accumulation
                delta += cur;
            }
        }
        Ok(Some(delta))
    }

    /// Drop snapshots past the retention window
    pub fn prune(&self) -> Result<usize> {
        let cutoff = (self.clock.now() - Duration::days(self.retention_days)).to_rfc3339();
        let removed = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM revenue_snapshots WHERE collected_at < ?1", params![cutoff]))?;
        if removed > 0 {
            debug!(removed, "pruned revenue snapshots");
        }
        Ok(removed)
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<RevenueSnapshot> {
    let collected_at: String = row.get(1)?;
    Ok(RevenueSnapshot {
        source: row.get(0)?,
        collected_at: DateTime::parse_from_rfc3339(&collected_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
        balance_atomic: row.get(2)?,
        hashrate: row.get(3)?,
        price_usd: row.get(4)?,
        requests_served: row.get(5)?,
    })
}
