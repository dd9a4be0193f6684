//! Operator command dispatch
//!
//! Maps inbound SMS text to control-plane operations. The SMS transport
//! itself (reading the host message database) is an external adapter;
//! this layer takes the text and returns the reply.

use std::sync::Arc;

use chrono::DateTime;
use eyre::{Context, Result};
use rusqlite::params;
use tracing::{info, warn};

use crate::broker::LlmPriority;
use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::domain::AutonomyLevel;
use crate::sessions::SessionManager;
use crate::state::Store;
use crate::think::ThinkLoop;
use crate::trackers::{ReminderTracker, TrustTracker};

/// Conversation archive retention
const CONVERSATION_ARCHIVE_DAYS: i64 = 30;

/// Parsed operator command
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    AiOn,
    AiOff,
    ThinkNow,
    AutonomyGet,
    AutonomySet(AutonomyLevel),
    ListReminders,
    CancelReminder(String),
    SetReminder { text: String, at: String },
    Status,
    Explain,
    Help,
    Unknown(String),
}

/// Parse free-form SMS text into a command
pub fn parse(text: &str) -> OperatorCommand {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    let mut words = lower.split_whitespace();

    match words.next() {
        Some("ai") => match words.next() {
            Some("on") => OperatorCommand::AiOn,
            Some("off") => OperatorCommand::AiOff,
            _ => OperatorCommand::Unknown(trimmed.to_string()),
        },
        Some("think") => OperatorCommand::ThinkNow,
        Some("autonomy") => match words.next() {
            None => OperatorCommand::AutonomyGet,
            Some(level) => match level.parse::<AutonomyLevel>() {
                Ok(level) => OperatorCommand::AutonomySet(level),
                Err(_) => OperatorCommand::Unknown(trimmed.to_string()),
            },
        },
        Some("reminders") => OperatorCommand::ListReminders,
        Some("cancel") => {
            let q = trimmed.splitn(2, char::is_whitespace).nth(1).unwrap_or("").to_string();
            if q.is_empty() {
                OperatorCommand::Unknown(trimmed.to_string())
            } else {
                OperatorCommand::CancelReminder(q)
            }
        }
        Some("remind") => {
            // "remind <text> @ <rfc3339>"
            let rest = trimmed.splitn(2, char::is_whitespace).nth(1).unwrap_or("");
            match rest.rsplit_once('@') {
                Some((text, at)) if !text.trim().is_empty() => OperatorCommand::SetReminder {
                    text: text.trim().to_string(),
                    at: at.trim().to_string(),
                },
                _ => OperatorCommand::Unknown(trimmed.to_string()),
            }
        }
        Some("status") => OperatorCommand::Status,
        Some("why") | Some("explain") => OperatorCommand::Explain,
        Some("help") => OperatorCommand::Help,
        _ => OperatorCommand::Unknown(trimmed.to_string()),
    }
}

pub struct CommandDispatcher {
    store: Arc<Store>,
    db: Database,
    think: Arc<ThinkLoop>,
    trust: Arc<TrustTracker>,
    reminders: Arc<ReminderTracker>,
    sessions: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl CommandDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        db: Database,
        think: Arc<ThinkLoop>,
        trust: Arc<TrustTracker>,
        reminders: Arc<ReminderTracker>,
        sessions: Arc<SessionManager>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Result<Self> {
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS conversation (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     role TEXT NOT NULL,
                     text TEXT NOT NULL,
                     ts TEXT NOT NULL
                 );",
            )
        })
        .context("Failed to create conversation table")?;

        Ok(Self {
            store,
            db,
            think,
            trust,
            reminders,
            sessions,
            clock,
            config,
        })
    }

    /// Handle one inbound message; returns the reply text
    pub async fn handle(&self, text: &str) -> String {
        info!(%text, "operator command received");
        self.archive("user", text);
        let _ = self.store.append_conversation("user", text, self.clock.now());

        let reply = match parse(text) {
            OperatorCommand::AiOn => self.set_ai(true),
            OperatorCommand::AiOff => self.set_ai(false),
            OperatorCommand::ThinkNow => {
                let think = self.think.clone();
                tokio::spawn(async move {
                    think.tick(LlmPriority::Operator).await;
                });
                "Think cycle triggered".to_string()
            }
            OperatorCommand::AutonomyGet => {
                format!("Autonomy: {}", self.store.autonomy_level(self.config.ai.autonomy_level))
            }
            OperatorCommand::AutonomySet(level) => self.set_autonomy(level),
            OperatorCommand::ListReminders => self.list_reminders(),
            OperatorCommand::CancelReminder(q) => match self.reminders.cancel_by_text(&q) {
                Ok(0) => format!("No pending reminders match '{}'", q),
                Ok(n) => format!("Cancelled {} reminder(s)", n),
                Err(e) => format!("Cancel failed: {}", e),
            },
            OperatorCommand::SetReminder { text, at } => self.set_reminder(&text, &at),
            OperatorCommand::Status => self.status().await,
            OperatorCommand::Explain => self.explain(),
            OperatorCommand::Help => {
                "Commands: ai on|off, think, autonomy [level], reminders, remind <text> @ <time>, cancel <q>, status, why".to_string()
            }
            OperatorCommand::Unknown(text) => format!("Unrecognized: '{}'. Send 'help' for commands.", text),
        };

        self.archive("assistant", &reply);
        let _ = self.store.append_conversation("assistant", &reply, self.clock.now());
        reply
    }

    fn set_ai(&self, enabled: bool) -> String {
        match self.store.set_ai_enabled(enabled) {
            Ok(()) => format!("AI {}", if enabled { "enabled" } else { "disabled" }),
            Err(e) => format!("Failed to persist: {}", e),
        }
    }

    /// The one path that changes the runtime level: operator command only
    fn set_autonomy(&self, level: AutonomyLevel) -> String {
        if let Err(e) = self.store.set_autonomy_level(level) {
            return format!("Failed to persist level: {}", e);
        }
        if let Err(e) = self.trust.note_level_change(level) {
            warn!(error = %e, "failed to record level change in trust summary");
        }
        info!(%level, "autonomy level changed by operator");
        format!("Autonomy set to {}", level)
    }

    fn list_reminders(&self) -> String {
        match self.reminders.list_pending() {
            Ok(list) if list.is_empty() => "No pending reminders".to_string(),
            Ok(list) => list
                .iter()
                .map(|r| format!("#{} {} @ {}", r.id, r.text, r.fire_at.format("%m-%d %H:%M")))
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("List failed: {}", e),
        }
    }

    fn set_reminder(&self, text: &str, at: &str) -> String {
        let Ok(fire_at) = DateTime::parse_from_rfc3339(at) else {
            return format!("Could not parse time '{}'; use RFC3339", at);
        };
        match self.reminders.set(text, fire_at.to_utc(), text) {
            Ok(id) => format!("Reminder #{} set for {}", id, at),
            Err(e) => format!("Failed to set reminder: {}", e),
        }
    }

    async fn status(&self) -> String {
        let level = self.store.autonomy_level(self.config.ai.autonomy_level);
        let ai = self.store.ai_enabled(self.config.ai.enabled);
        let running = self.sessions.running_count().await;
        let version = self.store.version();
        format!(
            "autonomy {}, ai {}, {} session(s) running, state v{}",
            level,
            if ai { "on" } else { "off" },
            running,
            version
        )
    }

    fn explain(&self) -> String {
        self.store.read(|state| match state.decisions.last() {
            None => "No decisions yet".to_string(),
            Some(decision) => {
                let mut out = format!("Last decision ({}): {}", decision.ts.format("%H:%M"), decision.summary);
                for entry in &decision.evaluated {
                    let rec = &entry.recommendation;
                    let verdict = if entry.allowed {
                        "allowed".to_string()
                    } else {
                        format!("blocked ({})", entry.blocked_reason.map(|r| r.to_string()).unwrap_or_default())
                    };
                    out.push_str(&format!("\n- {} {}: {}", rec.action, rec.project, verdict));
                }
                if let Some(error) = &decision.error {
                    out.push_str(&format!("\nerror: {}", error));
                }
                out
            }
        })
    }

    /// Dual-write the exchange into the database archive with TTL pruning
    fn archive(&self, role: &str, text: &str) {
        let now = self.clock.now();
        let cutoff = (now - chrono::Duration::days(CONVERSATION_ARCHIVE_DAYS)).to_rfc3339();
        let result = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversation (role, text, ts) VALUES (?1, ?2, ?3)",
                params![role, text, now.to_rfc3339()],
            )?;
            conn.execute("DELETE FROM conversation WHERE ts < ?1", params![cutoff])
        });
        if let Err(e) = result {
            tracing::debug!(error = %e, "conversation archive write failed");
        }
    }
}
