//! Operator reminders
//!
//! Reminders fire as tier-1 notifications. The fired flag is flipped only
//! after a successful send, so a transport outage leaves the row unfired
//! and the next scan tick retries; once fired, a row is never delivered
//! again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use rusqlite::params;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::Database;
use crate::domain::Reminder;
use crate::notify::{Notifier, Tier};

pub struct ReminderTracker {
    db: Database,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
}

impl ReminderTracker {
    pub fn new(db: Database, notifier: Arc<Notifier>, clock: Arc<dyn Clock>) -> Result<Self> {
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS reminders (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     text TEXT NOT NULL,
                     fire_at TEXT NOT NULL,
                     source_message TEXT NOT NULL DEFAULT '',
                     fired INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders (fired, fire_at);",
            )
        })
        .context("Failed to create reminders table")?;

        Ok(Self { db, notifier, clock })
    }

    /// Schedule a reminder
    pub fn set(&self, text: &str, fire_at: DateTime<Utc>, source_message: &str) -> Result<i64> {
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reminders (text, fire_at, source_message) VALUES (?1, ?2, ?3)",
                params![text, fire_at.to_rfc3339(), source_message],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        info!(id, %text, fire_at = %fire_at, "reminder set");
        Ok(id)
    }

    /// Fire every due reminder, at most once each
    ///
    /// Returns the number fired. A failed send leaves the row unfired for
    /// the next tick.
    pub async fn check_and_fire(&self) -> Result<usize> {
        let now = self.clock.now();
        let due: Vec<Reminder> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, text, fire_at, source_message, fired
                 FROM reminders WHERE fired = 0 AND fire_at <= ?1
                 ORDER BY fire_at",
            )?;
            let rows = stmt.query_map(params![now.to_rfc3339()], row_to_reminder)?;
            rows.collect()
        })?;

        let mut fired = 0;
        for reminder in due {
            match self.notifier.notify(Tier::Urgent, &format!("Reminder: {}", reminder.text)).await {
                Ok(_) => {
                    // Conditional update keeps the fire at-most-once even
                    // if a concurrent tick raced the select
                    let updated = self.db.with_conn(|conn| {
                        conn.execute("UPDATE reminders SET fired = 1 WHERE id = ?1 AND fired = 0", params![reminder.id])
                    })?;
                    if updated > 0 {
                        fired += 1;
                        debug!(id = reminder.id, "reminder fired");
                    }
                }
                Err(e) => {
                    warn!(id = reminder.id, error = %e, "reminder send failed, will retry next tick");
                }
            }
        }

        Ok(fired)
    }

    /// Unfired reminders, soonest first
    pub fn list_pending(&self) -> Result<Vec<Reminder>> {
        let reminders = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, text, fire_at, source_message, fired
                 FROM reminders WHERE fired = 0 ORDER BY fire_at",
            )?;
            let rows = stmt.query_map([], row_to_reminder)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(reminders)
    }

    /// Cancel unfired reminders whose text fuzzily matches `q`
    pub fn cancel_by_text(&self, q: &str) -> Result<usize> {
        let pattern = format!("%{}%", q);
        let cancelled = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE reminders SET fired = 1 WHERE fired = 0 AND text LIKE ?1",
                params![pattern],
            )
        })?;
        info!(q, cancelled, "reminders cancelled");
        Ok(cancelled)
    }
}

fn row_to_reminder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    let fire_at: String = row.get(2)?;
    Ok(Reminder {
        id: row.get(0)?,
        text: row.get(1)?,
        fire_at: DateTime::parse_from_rfc3339(&fire_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
        source_message: row.get(3)?,
        fired: row.get::<_, i64>(4)? != 0,
    })
}
