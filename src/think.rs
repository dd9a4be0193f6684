//! Think loop
//!
//! Adaptive recursive timer driving one think-evaluate-execute cycle at a
//! time. The mutex guarantees a single in-flight cycle; a tick arriving
//! while one runs is dropped, not queued. The LLM may request the next
//! cycle delay via `nextThinkInSec`, clamped so it can never drive the
//! cadence outside [60, 1800] seconds.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::{LlmPriority, LlmRequest, SubprocessBroker, parse_llm_json};
use crate::clock::Clock;
use crate::config::Config;
use crate::context::ContextAssembler;
use crate::domain::{DecisionRecord, Recommendation};
use crate::executor::Executor;
use crate::notify::{Notifier, Tier};
use crate::policy::Policy;
use crate::projects::Projects;
use crate::resources::ResourceMonitor;
use crate::state::Store;

/// Clamp bounds for the LLM-requested think delay
const MIN_THINK_SEC: u64 = 60;
const MAX_THINK_SEC: u64 = 1800;

/// LLM response shape for a think cycle
#[derive(Debug, Deserialize)]
struct ThinkResponse {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    recommendations: Vec<Recommendation>,
    #[serde(rename = "nextThinkInSec")]
    next_think_in_sec: Option<u64>,
}

pub struct ThinkLoop {
    assembler: Arc<ContextAssembler>,
    broker: Arc<SubprocessBroker>,
    policy: Arc<Policy>,
    executor: Arc<Executor>,
    store: Arc<Store>,
    projects: Arc<Projects>,
    resources: Arc<ResourceMonitor>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    config: Config,

    /// Held for the duration of one cycle
    thinking: tokio::sync::Mutex<()>,
    /// Single-use delay override from the last cycle
    next_override: std::sync::Mutex<Option<u64>>,
}

impl ThinkLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        assembler: Arc<ContextAssembler>,
        broker: Arc<SubprocessBroker>,
        policy: Arc<Policy>,
        executor: Arc<Executor>,
        store: Arc<Store>,
        projects: Arc<Projects>,
        resources: Arc<ResourceMonitor>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            assembler,
            broker,
            policy,
            executor,
            store,
            projects,
            resources,
            notifier,
            clock,
            config,
            thinking: tokio::sync::Mutex::new(()),
            next_override: std::sync::Mutex::new(None),
        }
    }

    /// Run until shutdown; each iteration sleeps then ticks
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.config.ai.think_interval_ms, "think loop started");

        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    self.tick(LlmPriority::Background).await;
                }
                _ = shutdown.changed() => {
                    debug!("think loop shutting down");
                    break;
                }
            }
        }
    }

    /// The delay before the next cycle: the single-use override, else the
    /// configured default
    fn next_delay(&self) -> StdDuration {
        let override_sec = self.next_override.lock().unwrap().take();
        match override_sec {
            Some(sec) => StdDuration::from_secs(sec),
            None => StdDuration::from_millis(self.config.ai.think_interval_ms),
        }
    }

    /// One think-evaluate-execute cycle
    ///
    /// Skips silently when a cycle is already in flight, when AI is
    /// disabled, or when free memory is below the floor.
    pub async fn tick(&self, priority: LlmPriority) {
        let Ok(_guard) = self.thinking.try_lock() else {
            debug!("think cycle already in flight, tick dropped");
            return;
        };

        if !self.store.ai_enabled(self.config.ai.enabled) {
            debug!("AI disabled, think cycle skipped");
            return;
        }

        let free = self.resources.free_memory_mb();
        if free < self.config.ai.resource_limits.min_free_memory_mb {
            debug!(free, "free memory below floor, think cycle skipped");
            return;
        }

        let started = std::time::Instant::now();
        let prompt = self.assembler.assemble().await;

        let request = LlmRequest {
            model: self.config.ai.model.clone(),
            prompt,
            schema: Some(crate::prompts::think_response_schema()),
            allowed_tools: Vec::new(),
            max_turns: Some(1),
            timeout: StdDuration::from_millis(self.config.ai.think_timeout_ms),
        };

        let raw = match self.broker.invoke_llm(request, priority).await {
            Ok(raw) => raw,
            Err(e) => {
                // Subprocess failure (timeout, non-zero exit, spawn)
                warn!(error = %e, "think LLM call failed");
                self.record_failed_cycle(&e.to_string(), Tier::Action, started).await;
                return;
            }
        };

        let Some(response) = parse_llm_json::<ThinkResponse>(&raw) else {
            // Parse failures are tolerated; constrained decoding makes
            // them rare and they are not worth an immediate send
            warn!("think response unparseable after constrained decoding");
            self.record_failed_cycle("response parse failure", Tier::Summary, started).await;
            return;
        };

        let known = self.projects.known_names();
        let evaluated = self.policy.evaluate(&response.recommendations, &known);
        let level = self.policy.runtime_level();

        if level == crate::domain::AutonomyLevel::Observe {
            // Observe mode: surface what would have happened, execute nothing
            if evaluated.is_empty() {
                debug!("observe cycle produced no recommendations");
            } else if let Some(text) = self.notifier.format_evaluated(&level.to_string(), &evaluated).await {
                let _ = self.notifier.notify(Tier::Summary, &text).await;
            } else {
                debug!("all observe-mode recommendations were duplicates, send skipped");
            }
        } else {
            // Executions are sequential in LLM order
            for entry in &evaluated {
                if entry.executable() {
                    if let Err(e) = self.executor.execute(entry).await {
                        warn!(error = %e, "execution dispatch failed");
                    }
                }
            }

            let blocked: Vec<_> = evaluated.iter().filter(|e| !e.allowed).cloned().collect();
            if !blocked.is_empty() {
                if let Some(text) = self.notifier.format_evaluated(&level.to_string(), &blocked).await {
                    let _ = self.notifier.notify(Tier::Summary, &text).await;
                }
            }
        }

        let next = response.next_think_in_sec.map(|sec| sec.clamp(MIN_THINK_SEC, MAX_THINK_SEC));
        if let Some(sec) = next {
            *self.next_override.lock().unwrap() = Some(sec);
        }

        let record = DecisionRecord {
            ts: self.clock.now(),
            summary: response.summary,
            recommendations: response.recommendations,
            evaluated,
            duration_ms: started.elapsed().as_millis() as u64,
            next_think_in_sec: next,
            error: None,
        };
        if let Err(e) = self.store.log_decision(record) {
            warn!(error = %e, "failed to persist decision record");
            let _ = self.notifier.notify(Tier::Action, "State write failed after think cycle").await;
        }

        info!(duration_ms = started.elapsed().as_millis() as u64, "think cycle complete");
    }

    /// Record a cycle that produced no recommendations
    ///
    /// The tier distinguishes the failure kind: subprocess failures go
    /// out at tier 2, parse failures at tier 3.
    async fn record_failed_cycle(&self, error: &str, tier: Tier, started: std::time::Instant) {
        let record = DecisionRecord {
            ts: self.clock.now(),
            summary: String::new(),
            recommendations: Vec::new(),
            evaluated: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            next_think_in_sec: None,
            error: Some(error.to_string()),
        };
        if let Err(e) = self.store.log_decision(record) {
            warn!(error = %e, "failed to persist failed-cycle record");
        }
        let _ = self
            .notifier
            .notify(tier, &format!("Think cycle failed: {}", error))
            .await;
    }

    /// Wait for any in-flight cycle to finish (graceful shutdown), up to
    /// the LLM timeout
    pub async fn drain(&self) {
        let timeout = StdDuration::from_millis(self.config.ai.think_timeout_ms);
        if tokio::time::timeout(timeout, self.thinking.lock()).await.is_err() {
            warn!("think cycle still in flight after drain timeout");
        }
    }

    /// Peek at the pending override (tests, status)
    pub fn pending_override_sec(&self) -> Option<u64> {
        *self.next_override.lock().unwrap()
    }
}
