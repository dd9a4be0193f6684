//! Tiered notification dispatch
//!
//! Four tiers over a single SMS transport: URGENT sends immediately and
//! ignores quiet hours and the daily budget; ACTION sends immediately
//! while budget remains, otherwise downgrades into the batch; SUMMARY is
//! always batched; DEBUG never leaves the log. Content-hash deduplication
//! with a one-hour TTL drops repeats across think cycles.

mod transport;

pub use transport::{CommandTransport, LogTransport, MockTransport, SmsTransport};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use eyre::Result;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{NotificationConfig, QuietHoursConfig};
use crate::domain::EvaluatedRecommendation;

/// Transport length ceiling for one message
const MAX_MESSAGE_CHARS: usize = 1500;

/// Notification priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Urgent = 1,
    Action = 2,
    Summary = 3,
    Debug = 4,
}

impl Tier {
    /// Clamp an LLM-supplied tier number into the valid range
    pub fn from_number(n: u8) -> Tier {
        match n {
            0 | 1 => Tier::Urgent,
            2 => Tier::Action,
            3 => Tier::Summary,
            _ => Tier::Debug,
        }
    }
}

/// A message queued for batch delivery
#[derive(Debug, Clone)]
#[allow(dead_code)]
struct Envelope {
    text: String,
    tier: Tier,
    hash: u64,
    created_at: DateTime<Utc>,
}

struct NotifierInner {
    /// Tier-2 messages sent since the last local-midnight reset
    sent_today: u32,
    /// Local calendar day the counter belongs to
    budget_day: Option<NaiveDate>,
    /// Recently-sent content hashes with their send time
    recent_hashes: HashMap<u64, DateTime<Utc>>,
    /// Pending batch, oldest first
    batch: VecDeque<Envelope>,
}

/// The four-tier notification router
pub struct Notifier {
    transport: Arc<dyn SmsTransport>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    config: NotificationConfig,
    quiet_start: NaiveTime,
    quiet_end: NaiveTime,
    inner: Mutex<NotifierInner>,
}

impl Notifier {
    pub fn new(
        transport: Arc<dyn SmsTransport>,
        clock: Arc<dyn Clock>,
        tz: Tz,
        config: NotificationConfig,
        quiet_hours: &QuietHoursConfig,
    ) -> Self {
        let quiet_start = parse_hhmm(&quiet_hours.start).unwrap_or_else(|| NaiveTime::from_hms_opt(22, 30, 0).unwrap());
        let quiet_end = parse_hhmm(&quiet_hours.end).unwrap_or_else(|| NaiveTime::from_hms_opt(7, 0, 0).unwrap());

        Self {
            transport,
            clock,
            tz,
            config,
            quiet_start,
            quiet_end,
            inner: Mutex::new(NotifierInner {
                sent_today: 0,
                budget_day: None,
                recent_hashes: HashMap::new(),
                batch: VecDeque::new(),
            }),
        }
    }

    /// Route one message through its tier
    ///
    /// Returns true when the message was sent or enqueued; false when it
    /// was dropped as a duplicate or was log-only.
    pub async fn notify(&self, tier: Tier, text: &str) -> Result<bool> {
        let hash = djb2(&text.to_lowercase());
        self.notify_hashed(tier, text, hash).await
    }

    /// Route with an explicit dedup key (recommendation traffic uses
    /// `project:action:reason` rather than the rendered text)
    pub async fn notify_keyed(&self, tier: Tier, text: &str, dedup_key: &str) -> Result<bool> {
        self.notify_hashed(tier, text, djb2(dedup_key)).await
    }

    async fn notify_hashed(&self, tier: Tier, text: &str, hash: u64) -> Result<bool> {
        if tier == Tier::Debug {
            debug!(%text, "tier-4 notification (log only)");
            return Ok(false);
        }

        let now = self.clock.now();

        {
            let mut inner = self.inner.lock().await;
            self.prune_hashes(&mut inner, now);
            if inner.recent_hashes.contains_key(&hash) {
                debug!(hash, "duplicate notification dropped");
                return Ok(false);
            }
        }

        match tier {
            Tier::Urgent => {
                self.transport.send(text).await?;
                let mut inner = self.inner.lock().await;
                inner.recent_hashes.insert(hash, now);
                drop(inner);
                // Piggyback the pending batch on the outbound message
                self.flush_batch(true).await?;
                Ok(true)
            }
            Tier::Action => {
                let quiet = self.in_quiet_hours(now);
                let budget_left = {
                    let mut inner = self.inner.lock().await;
                    self.roll_budget_day(&mut inner, now);
                    inner.sent_today < self.config.daily_budget
                };

                if quiet || !budget_left {
                    debug!(quiet, budget_left, "tier-2 downgraded to batch");
                    self.enqueue(tier, text, hash, now).await;
                    return Ok(true);
                }

                self.transport.send(text).await?;
                let mut inner = self.inner.lock().await;
                inner.sent_today += 1;
                inner.recent_hashes.insert(hash, now);
                drop(inner);
                self.flush_batch(true).await?;
                Ok(true)
            }
            Tier::Summary => {
                self.enqueue(tier, text, hash, now).await;
                Ok(true)
            }
            Tier::Debug => unreachable!(),
        }
    }

    /// Format a batch of evaluated recommendations for the operator,
    /// dropping entries already sent within the dedup window
    ///
    /// Returns None when everything deduplicated away; the caller must
    /// treat that as a skip, not an empty send.
    pub async fn format_evaluated(&self, level_label: &str, evaluated: &[EvaluatedRecommendation]) -> Option<String> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        self.prune_hashes(&mut inner, now);

        let mut lines = Vec::new();
        for entry in evaluated {
            let rec = &entry.recommendation;
            let hash = djb2(&recommendation_key(&rec.project, &rec.action, &rec.reason));
            if inner.recent_hashes.contains_key(&hash) {
                continue;
            }
            inner.recent_hashes.insert(hash, now);

            let status = if entry.allowed {
                "would execute".to_string()
            } else {
                format!(
                    "blocked: {}",
                    entry.blocked_reason.map(|r| r.to_string()).unwrap_or_default()
                )
            };
            lines.push(format!("- {} {} ({}) [{}]", rec.action, rec.project, rec.reason, status));
        }

        if lines.is_empty() {
            return None;
        }

        Some(format!("[{}] proposed:\n{}", level_label, lines.join("\n")))
    }

    /// Flush the pending batch as one bounded message
    ///
    /// Timer-driven flushes skip quiet hours; forced flushes (piggyback,
    /// shutdown) send regardless.
    pub async fn flush_batch(&self, force: bool) -> Result<()> {
        let now = self.clock.now();
        if !force && self.in_quiet_hours(now) {
            return Ok(());
        }

        let text = {
            let mut inner = self.inner.lock().await;
            if inner.batch.is_empty() {
                return Ok(());
            }

            // Trim oldest until the concatenation fits the ceiling
            loop {
                let total: usize = inner.batch.iter().map(|e| e.text.len() + 1).sum();
                if total <= MAX_MESSAGE_CHARS || inner.batch.len() == 1 {
                    break;
                }
                let dropped = inner.batch.pop_front();
                if let Some(d) = dropped {
                    warn!(text = %d.text, "batch over length ceiling, dropped oldest");
                }
            }

            let text = inner
                .batch
                .drain(..)
                .map(|e| e.text)
                .collect::<Vec<_>>()
                .join("\n");
            if text.chars().count() > MAX_MESSAGE_CHARS {
                text.chars().take(MAX_MESSAGE_CHARS).collect()
            } else {
                text
            }
        };

        self.transport.send(&text).await?;
        Ok(())
    }

    /// Number of messages waiting in the batch
    pub async fn batch_len(&self) -> usize {
        self.inner.lock().await.batch.len()
    }

    /// Tier-2 sends counted against today's budget
    pub async fn sent_today(&self) -> u32 {
        self.inner.lock().await.sent_today
    }

    /// Whether `now` falls inside the configured quiet window
    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz).time();
        if self.quiet_start <= self.quiet_end {
            local >= self.quiet_start && local < self.quiet_end
        } else {
            local >= self.quiet_start || local < self.quiet_end
        }
    }

    async fn enqueue(&self, tier: Tier, text: &str, hash: u64, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        inner.recent_hashes.insert(hash, now);
        inner.batch.push_back(Envelope {
            text: text.to_string(),
            tier,
            hash,
            created_at: now,
        });
    }

    fn prune_hashes(&self, inner: &mut NotifierInner, now: DateTime<Utc>) {
        let ttl = Duration::milliseconds(self.config.dedup_ttl_ms as i64);
        inner.recent_hashes.retain(|_, sent_at| now - *sent_at < ttl);
    }

    fn roll_budget_day(&self, inner: &mut NotifierInner, now: DateTime<Utc>) {
        let today = now.with_timezone(&self.tz).date_naive();
        if inner.budget_day != Some(today) {
            inner.budget_day = Some(today);
            inner.sent_today = 0;
        }
    }
}

/// djb2 over the content key
pub fn djb2(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
    }
    hash
}

/// Canonical dedup key for recommendation traffic:
/// `project:action:reason` lowercased, reason capped at 100 chars
pub fn recommendation_key(project: &str, action: &str, reason: &str) -> String {
    let reason: String = reason.chars().take(100).collect();
    format!("{}:{}:{}", project, action, reason).to_lowercase()
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn notifier_at(hour: u32) -> (Arc<Notifier>, Arc<MockTransport>, Arc<ManualClock>) {
        let transport = Arc::new(MockTransport::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 2, hour, 0, 0).unwrap()));
        let notifier = Notifier::new(
            transport.clone(),
            clock.clone(),
            chrono_tz::UTC,
            NotificationConfig::default(),
            &QuietHoursConfig::default(),
        );
        (Arc::new(notifier), transport, clock)
    }

    #[tokio::test]
    async fn test_urgent_sends_immediately() {
        let (notifier, transport, _) = notifier_at(12);

        assert!(notifier.notify(Tier::Urgent, "host on fire").await.unwrap());
        assert_eq!(transport.sent(), vec!["host on fire".to_string()]);
    }

    #[tokio::test]
    async fn test_urgent_bypasses_quiet_hours() {
        // 23:00 is inside the default 22:30-07:00 quiet window
        let (notifier, transport, _) = notifier_at(23);

        notifier.notify(Tier::Urgent, "urgent at night").await.unwrap();
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_action_batched_during_quiet_hours() {
        let (notifier, transport, _) = notifier_at(23);

        notifier.notify(Tier::Action, "quiet-hours action").await.unwrap();
        assert_eq!(transport.sent_count(), 0);
        assert_eq!(notifier.batch_len().await, 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_downgrades_to_batch() {
        let transport = Arc::new(MockTransport::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()));
        let notifier = Notifier::new(
            transport.clone(),
            clock.clone(),
            chrono_tz::UTC,
            NotificationConfig {
                daily_budget: 2,
                ..Default::default()
            },
            &QuietHoursConfig::default(),
        );

        notifier.notify(Tier::Action, "first").await.unwrap();
        notifier.notify(Tier::Action, "second").await.unwrap();
        assert_eq!(notifier.sent_today().await, 2);

        notifier.notify(Tier::Action, "third").await.unwrap();
        // Budget spent: third went to the batch, not the wire
        assert_eq!(transport.sent_count(), 2);
        assert_eq!(notifier.batch_len().await, 1);
    }

    #[tokio::test]
    async fn test_budget_resets_at_day_boundary() {
        let transport = Arc::new(MockTransport::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()));
        let notifier = Notifier::new(
            transport.clone(),
            clock.clone(),
            chrono_tz::UTC,
            NotificationConfig {
                daily_budget: 1,
                ..Default::default()
            },
            &QuietHoursConfig {
                start: "23:59".into(),
                end: "00:00".into(),
                timezone: "UTC".into(),
            },
        );

        notifier.notify(Tier::Action, "day one").await.unwrap();
        assert_eq!(notifier.sent_today().await, 1);

        // Next local day: counter resets
        clock.advance(Duration::days(1));
        notifier.notify(Tier::Action, "day two").await.unwrap();
        assert_eq!(notifier.sent_today().await, 1);
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_dropped_within_ttl() {
        let (notifier, transport, clock) = notifier_at(12);

        assert!(notifier.notify(Tier::Action, "same text").await.unwrap());
        assert!(!notifier.notify(Tier::Action, "same text").await.unwrap());
        assert_eq!(transport.sent_count(), 1);

        // After the TTL the same content may go out again
        clock.advance(Duration::hours(2));
        assert!(notifier.notify(Tier::Action, "same text").await.unwrap());
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_send_does_not_record_dedup_hash() {
        let (notifier, transport, _) = notifier_at(12);

        transport.set_failing(true);
        assert!(notifier.notify(Tier::Urgent, "retry me").await.is_err());

        // Transport recovers; the retry must not be treated as a duplicate
        transport.set_failing(false);
        assert!(notifier.notify(Tier::Urgent, "retry me").await.unwrap());
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_summary_batches_and_piggybacks_on_urgent() {
        let (notifier, transport, _) = notifier_at(12);

        notifier.notify(Tier::Summary, "summary one").await.unwrap();
        notifier.notify(Tier::Summary, "summary two").await.unwrap();
        assert_eq!(transport.sent_count(), 0);

        notifier.notify(Tier::Urgent, "urgent now").await.unwrap();
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], "urgent now");
        assert!(sent[1].contains("summary one"));
        assert!(sent[1].contains("summary two"));
    }

    #[tokio::test]
    async fn test_batch_flush_trims_oldest_over_ceiling() {
        let (notifier, transport, _) = notifier_at(12);

        for i in 0..5 {
            let text = format!("{}-{}", i, "x".repeat(600));
            notifier.notify(Tier::Summary, &text).await.unwrap();
        }
        notifier.flush_batch(false).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].len() <= MAX_MESSAGE_CHARS);
        // Newest survives, oldest was trimmed
        assert!(sent[0].contains("4-"));
        assert!(!sent[0].contains("0-"));
    }

    #[tokio::test]
    async fn test_debug_never_sends() {
        let (notifier, transport, _) = notifier_at(12);

        assert!(!notifier.notify(Tier::Debug, "debug detail").await.unwrap());
        assert_eq!(transport.sent_count(), 0);
        assert_eq!(notifier.batch_len().await, 0);
    }

    #[tokio::test]
    async fn test_format_evaluated_none_when_all_duplicates() {
        use crate::domain::{EvaluatedRecommendation, Recommendation};

        let (notifier, _, _) = notifier_at(12);

        let evaluated = vec![EvaluatedRecommendation {
            recommendation: Recommendation {
                project: "alpha".into(),
                action: "start".into(),
                reason: "idle too long".into(),
                prompt: None,
                confidence: None,
                notification_tier: None,
            },
            allowed: false,
            blocked_reason: None,
            observe_only: true,
            decided_at: Utc::now(),
        }];

        let first = notifier.format_evaluated("observe", &evaluated).await;
        assert!(first.is_some());
        assert!(first.unwrap().contains("alpha"));

        // Identical recommendation inside the TTL: no envelope at all
        let second = notifier.format_evaluated("observe", &evaluated).await;
        assert!(second.is_none());
    }

    #[test]
    fn test_djb2_stable_and_case_normalized_key() {
        let a = djb2(&recommendation_key("Alpha", "start", "Reason text"));
        let b = djb2(&recommendation_key("alpha", "START", "reason TEXT"));
        assert_eq!(a, b);

        let c = djb2(&recommendation_key("alpha", "stop", "reason text"));
        assert_ne!(a, c);
    }

    #[test]
    fn test_recommendation_key_caps_reason_at_100() {
        let long = "r".repeat(500);
        let key = recommendation_key("p", "start", &long);
        assert_eq!(key.len(), "p:start:".len() + 100);
    }

    #[test]
    fn test_quiet_hours_window_crossing_midnight() {
        let transport = Arc::new(MockTransport::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let notifier = Notifier::new(
            transport,
            clock,
            chrono_tz::UTC,
            NotificationConfig::default(),
            &QuietHoursConfig::default(), // 22:30 - 07:00
        );

        let inside_late = Utc.with_ymd_and_hms(2025, 6, 2, 23, 30, 0).unwrap();
        let inside_early = Utc.with_ymd_and_hms(2025, 6, 2, 6, 0, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap();

        assert!(notifier.in_quiet_hours(inside_late));
        assert!(notifier.in_quiet_hours(inside_early));
        assert!(!notifier.in_quiet_hours(outside));
    }
}
