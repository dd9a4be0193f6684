//! Scan loop
//!
//! Fixed 60-second cadence, independent of autonomy level: detect ended
//! sessions, sweep timeouts, fire reminders, accrue trust, and trigger
//! revenue collection every Nth tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration as StdDuration;

use chrono::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::executor::Executor;
use crate::notify::{Notifier, Tier};
use crate::sessions::{SessionEvaluator, SessionManager};
use crate::trackers::{ReminderTracker, RevenueTracker, TrustTracker};

/// Scan cadence
pub const SCAN_INTERVAL: StdDuration = StdDuration::from_secs(60);

pub struct ScanLoop {
    sessions: Arc<SessionManager>,
    evaluator: Arc<SessionEvaluator>,
    executor: Arc<Executor>,
    reminders: Arc<ReminderTracker>,
    trust: Arc<TrustTracker>,
    revenue: Arc<RevenueTracker>,
    notifier: Arc<Notifier>,
    config: Config,
    scan_count: AtomicU64,
}

impl ScanLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionManager>,
        evaluator: Arc<SessionEvaluator>,
        executor: Arc<Executor>,
        reminders: Arc<ReminderTracker>,
        trust: Arc<TrustTracker>,
        revenue: Arc<RevenueTracker>,
        notifier: Arc<Notifier>,
        config: Config,
    ) -> Self {
        Self {
            sessions,
            evaluator,
            executor,
            reminders,
            trust,
            revenue,
            notifier,
            config,
            scan_count: AtomicU64::new(0),
        }
    }

    /// Run until shutdown at the fixed cadence
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = SCAN_INTERVAL.as_secs(), "scan loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(SCAN_INTERVAL) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    debug!("scan loop shutting down");
                    break;
                }
            }
        }
    }

    /// One scan tick
    pub async fn tick(&self) {
        let tick = self.scan_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(tick, "scan tick");

        // 1. Naturally-ended sessions feed the evaluator
        for ended in self.sessions.detect_ended().await {
            debug!(project = %ended.session.project_name, "session ended naturally");
            let evaluator = self.evaluator.clone();
            // Fire-and-forget; the evaluator's own artifact check guards
            // against duplicate evaluation
            tokio::spawn(async move {
                if let Err(e) = evaluator.evaluate(&ended).await {
                    warn!(error = %e, "evaluation of ended session failed");
                }
            });
        }

        // 2. Timeout sweep
        let max_duration = Duration::milliseconds(self.config.ai.max_session_duration_ms as i64);
        for entry in self.sessions.timed_out(max_duration).await {
            let project = entry.session.project_name.clone();

            // Best-effort tail for the notification before the kill
            let tail = self
                .sessions
                .capture_output(&entry.session, 5)
                .await
                .map(|s| s.trim().to_string())
                .unwrap_or_default();

            let (record, session) = self.executor.stop_for_timeout(&project).await;
            debug!(project, result = ?record.result, "timeout stop recorded");
            let Some(session) = session else {
                continue;
            };

            let minutes = self.config.ai.max_session_duration_ms / 60_000;
            let mut text = format!("Session {} timed out after {}m and was stopped", project, minutes);
            if !tail.is_empty() {
                text.push_str(&format!("\nlast output:\n{}", truncate(&tail, 300)));
            }
            let _ = self.notifier.notify(Tier::Action, &text).await;

            let stopped = crate::sessions::RunningSession {
                session,
                path: entry.path.clone(),
            };
            let evaluator = self.evaluator.clone();
            tokio::spawn(async move {
                if let Err(e) = evaluator.evaluate(&stopped).await {
                    warn!(error = %e, "evaluation of timed-out session failed");
                }
            });
        }

        // 3. Reminders
        if self.config.reminders.enabled {
            if let Err(e) = self.reminders.check_and_fire().await {
                warn!(error = %e, "reminder tick failed");
            }
        }

        // 4. Trust accrual
        if let Err(e) = self.trust.update() {
            warn!(error = %e, "trust update failed");
        }

        // 5. Revenue collection every Nth tick
        let every = self.config.revenue.collection_interval_scans.max(1);
        if self.config.revenue.enabled && tick % every == 0 {
            if let Err(e) = self.revenue.collect().await {
                warn!(error = %e, "revenue collection failed");
            }
        }
    }

    /// Ticks so far (status)
    pub fn ticks(&self) -> u64 {
        self.scan_count.load(Ordering::Relaxed)
    }
}

fn truncate(s: &str, cap: usize) -> String {
    s.chars().take(cap).collect()
}
