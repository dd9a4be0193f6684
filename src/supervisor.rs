//! Supervisor boot and lifetime
//!
//! Builds every component, recovers running sessions from signal files,
//! spawns the scan and think loops plus the cron jobs, and coordinates
//! graceful shutdown: cancel timers, drain the in-flight think cycle,
//! flush the pending notification batch.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use cron::Schedule;
use eyre::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::SubprocessBroker;
use crate::clock::{Clock, SystemClock};
use crate::commands::CommandDispatcher;
use crate::config::Config;
use crate::context::ContextAssembler;
use crate::db::Database;
use crate::executor::Executor;
use crate::notify::{CommandTransport, LogTransport, Notifier, SmsTransport, Tier};
use crate::policy::Policy;
use crate::projects::Projects;
use crate::resources::ResourceMonitor;
use crate::scan::ScanLoop;
use crate::sessions::{GitTracker, SessionEvaluator, SessionManager, Tmux};
use crate::state::Store;
use crate::think::ThinkLoop;
use crate::trackers::{ReminderTracker, RevenueSource, RevenueTracker, SessionLearner, TrustTracker};

pub struct Supervisor {
    pub config: Config,
    pub store: Arc<Store>,
    pub notifier: Arc<Notifier>,
    pub sessions: Arc<SessionManager>,
    pub projects: Arc<Projects>,
    pub think: Arc<ThinkLoop>,
    pub scan: Arc<ScanLoop>,
    pub commands: Arc<CommandDispatcher>,
    pub trust: Arc<TrustTracker>,
    pub revenue: Arc<RevenueTracker>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    /// Wire every component from configuration
    ///
    /// `revenue_sources` are the external fetcher adapters; an empty list
    /// disables collection without disabling the subsystem.
    pub fn build(config: Config, revenue_sources: Vec<Arc<dyn RevenueSource>>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tz = config.timezone();

        let store = Arc::new(Store::load(config.storage.state_path()).context("Failed to load state document")?);
        let db = Database::open(config.storage.database_path())?;

        let broker = Arc::new(SubprocessBroker::new(config.ai.command.clone()));

        let transport: Arc<dyn SmsTransport> = if config.notifications.send_command.is_empty() {
            Arc::new(LogTransport)
        } else {
            Arc::new(CommandTransport::new(broker.clone(), config.notifications.send_command.clone()))
        };
        let notifier = Arc::new(Notifier::new(
            transport,
            clock.clone(),
            tz,
            config.notifications.clone(),
            &config.quiet_hours,
        ));

        let projects = Arc::new(Projects::new(config.storage.projects_root.clone()));
        let tmux = Arc::new(Tmux::new(broker.clone()));
        let git = Arc::new(GitTracker::new(broker.clone()));
        let sessions = Arc::new(SessionManager::new(
            tmux.clone(),
            git.clone(),
            clock.clone(),
            config.ai.command.clone(),
        ));
        let resources = Arc::new(ResourceMonitor::new(broker.clone()));

        let learner = Arc::new(SessionLearner::new(db.clone(), config.learning.clone())?);
        let evaluator = Arc::new(SessionEvaluator::new(
            tmux,
            git,
            broker.clone(),
            store.clone(),
            learner.clone(),
            notifier.clone(),
            clock.clone(),
            config.ai.eval_model.clone(),
            StdDuration::from_millis(config.ai.eval_timeout_ms),
        ));

        let policy = Arc::new(Policy::new(store.clone(), clock.clone(), &config.ai, &config.priorities.block));
        let executor = Arc::new(Executor::new(
            store.clone(),
            policy.clone(),
            sessions.clone(),
            projects.clone(),
            resources.clone(),
            notifier.clone(),
            clock.clone(),
            config.ai.max_concurrent_sessions,
            config.ai.resource_limits.min_free_memory_mb,
        ));

        let trust = Arc::new(TrustTracker::new(
            db.clone(),
            store.clone(),
            clock.clone(),
            config.trust.clone(),
            config.ai.autonomy_level,
        )?);
        let revenue = Arc::new(RevenueTracker::new(
            db.clone(),
            clock.clone(),
            revenue_sources,
            config.revenue.retention_days,
        )?);
        let reminders = Arc::new(ReminderTracker::new(db.clone(), notifier.clone(), clock.clone())?);

        let assembler = Arc::new(ContextAssembler::new(
            store.clone(),
            projects.clone(),
            sessions.clone(),
            resources.clone(),
            revenue.clone(),
            trust.clone(),
            learner.clone(),
            notifier.clone(),
            clock.clone(),
            config.clone(),
        ));

        let think = Arc::new(ThinkLoop::new(
            assembler,
            broker,
            policy,
            executor.clone(),
            store.clone(),
            projects.clone(),
            resources,
            notifier.clone(),
            clock.clone(),
            config.clone(),
        ));

        let scan = Arc::new(ScanLoop::new(
            sessions.clone(),
            evaluator,
            executor,
            reminders.clone(),
            trust.clone(),
            revenue.clone(),
            notifier.clone(),
            config.clone(),
        ));

        let commands = Arc::new(CommandDispatcher::new(
            store.clone(),
            db,
            think.clone(),
            trust.clone(),
            reminders,
            sessions.clone(),
            clock,
            config.clone(),
        )?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            store,
            notifier,
            sessions,
            projects,
            think,
            scan,
            commands,
            trust,
            revenue,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Run until a termination signal, then shut down gracefully
    pub async fn run(&self) -> Result<()> {
        info!("supervisor starting");

        // Recover sessions that survived a restart
        let recovered = self.sessions.recover(&self.projects.name_path_pairs()).await;
        debug!(recovered, "session recovery complete");

        let mut handles = Vec::new();
        handles.push(tokio::spawn(self.scan.clone().run(self.shutdown_rx.clone())));
        handles.push(tokio::spawn(self.think.clone().run(self.shutdown_rx.clone())));

        // Tier-3 batch flush timer
        handles.push(tokio::spawn(batch_flush_loop(
            self.notifier.clone(),
            self.config.notifications.batch_interval_ms,
            self.shutdown_rx.clone(),
        )));

        // Daily revenue pruning rides the promotion-check schedule hour
        self.spawn_cron_jobs(&mut handles);

        wait_for_termination().await;
        info!("termination signal received, shutting down");

        // Cancel timers, drain the in-flight cycle, flush the batch
        let _ = self.shutdown_tx.send(true);
        self.think.drain().await;
        if let Err(e) = self.notifier.flush_batch(true).await {
            warn!(error = %e, "final batch flush failed");
        }

        for handle in handles {
            handle.abort();
        }
        info!("supervisor stopped");
        Ok(())
    }

    fn spawn_cron_jobs(&self, handles: &mut Vec<tokio::task::JoinHandle<()>>) {
        let tz = self.config.timezone();

        // Promotion check + revenue pruning
        if self.config.trust.enabled {
            let trust = self.trust.clone();
            let revenue = self.revenue.clone();
            let notifier = self.notifier.clone();
            handles.push(spawn_cron(
                "promotion-check",
                &self.config.trust.promotion_check_cron,
                tz,
                self.shutdown_rx.clone(),
                move || {
                    let trust = trust.clone();
                    let revenue = revenue.clone();
                    let notifier = notifier.clone();
                    async move {
                        match trust.check_promotion() {
                            Ok(Some(message)) => {
                                let _ = notifier.notify(Tier::Action, &message).await;
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "promotion check failed"),
                        }
                        if let Err(e) = revenue.prune() {
                            warn!(error = %e, "revenue pruning failed");
                        }
                    }
                },
            ));
        }

        // Morning and evening digests
        for (name, job, cron) in [
            ("morning-digest", &self.config.morning_digest, self.config.morning_cron()),
            ("evening-digest", &self.config.evening_digest, self.config.evening_cron()),
        ] {
            if !job.enabled {
                continue;
            }
            let trust = self.trust.clone();
            let revenue = self.revenue.clone();
            let sessions = self.sessions.clone();
            let store = self.store.clone();
            let notifier = self.notifier.clone();
            handles.push(spawn_cron(name, &cron, tz, self.shutdown_rx.clone(), move || {
                let trust = trust.clone();
                let revenue = revenue.clone();
                let sessions = sessions.clone();
                let store = store.clone();
                let notifier = notifier.clone();
                async move {
                    let digest = build_digest(&trust, &revenue, &sessions, &store).await;
                    let _ = notifier.notify(Tier::Action, &digest).await;
                }
            }));
        }

        // Weekly revenue report
        if self.config.weekly_revenue.enabled {
            let revenue = self.revenue.clone();
            let notifier = self.notifier.clone();
            handles.push(spawn_cron(
                "weekly-revenue",
                &self.config.weekly_revenue_cron(),
                tz,
                self.shutdown_rx.clone(),
                move || {
                    let revenue = revenue.clone();
                    let notifier = notifier.clone();
                    async move {
                        match revenue.weekly_trend() {
                            Ok(trend) if !trend.is_empty() => {
                                let _ = notifier.notify(Tier::Action, &format!("Weekly revenue:\n{}", trend)).await;
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "weekly revenue report failed"),
                        }
                    }
                },
            ));
        }
    }
}

/// Build the morning/evening digest text
async fn build_digest(
    trust: &TrustTracker,
    revenue: &RevenueTracker,
    sessions: &SessionManager,
    store: &Store,
) -> String {
    let mut parts = Vec::new();

    if let Ok(line) = trust.format_for_context() {
        parts.push(format!("Trust: {}", line));
    }

    let running = sessions.running_sessions().await;
    if running.is_empty() {
        parts.push("No active sessions".to_string());
    } else {
        let names: Vec<_> = running.iter().map(|e| e.session.project_name.clone()).collect();
        parts.push(format!("Active: {}", names.join(", ")));
    }

    let recent: Vec<String> = store.read(|state| {
        state
            .evaluations
            .iter()
            .rev()
            .take(3)
            .map(|e| format!("{} {}/5", e.project_name, e.score))
            .collect()
    });
    if !recent.is_empty() {
        parts.push(format!("Recent evals: {}", recent.join(", ")));
    }

    if let Ok(rev) = revenue.format_for_context() {
        if !rev.is_empty() {
            parts.push(format!("Revenue:\n{}", rev));
        }
    }

    parts.join("\n")
}

/// Timer-driven tier-3 batch flush
async fn batch_flush_loop(notifier: Arc<Notifier>, interval_ms: u64, mut shutdown: watch::Receiver<bool>) {
    let interval = StdDuration::from_millis(interval_ms.max(1000));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = notifier.flush_batch(false).await {
                    warn!(error = %e, "batch flush failed");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Spawn a cron-scheduled job in the configured timezone
fn spawn_cron<F, Fut>(
    name: &'static str,
    expression: &str,
    tz: chrono_tz::Tz,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let schedule = match Schedule::from_str(expression) {
        Ok(schedule) => schedule,
        Err(e) => {
            warn!(name, expression, error = %e, "invalid cron expression, job disabled");
            return tokio::spawn(async {});
        }
    };

    tokio::spawn(async move {
        info!(name, "cron job scheduled");
        loop {
            let now = Utc::now().with_timezone(&tz);
            let Some(next) = schedule.after(&now).next() else {
                warn!(name, "cron schedule exhausted");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(StdDuration::from_secs(60));
            debug!(name, next = %next, "cron job sleeping");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    debug!(name, "cron job firing");
                    job().await;
                }
                _ = shutdown.changed() => {
                    debug!(name, "cron job shutting down");
                    return;
                }
            }
        }
    })
}

/// Block until SIGTERM or SIGINT
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
