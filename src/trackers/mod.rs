//! Database-backed trackers: reminders, trust, revenue, session learning

mod learner;
mod reminders;
mod revenue;
mod trust;

pub use learner::{PatternReport, SessionLearner, classify_prompt};
pub use reminders::ReminderTracker;
pub use revenue::{RevenueSource, RevenueTracker};
pub use trust::TrustTracker;
