//! orchd - autonomous supervisor for a personal compute host
//!
//! A long-running daemon that manages a portfolio of software projects:
//! it scans project directories, launches and stops coding sessions in
//! detached terminal-multiplexer windows, evaluates their output, tracks
//! host health and revenue, and talks to a single operator over SMS. An
//! LLM proposes actions; an autonomy policy the LLM cannot touch decides
//! what actually executes.
//!
//! # Core pieces
//!
//! - [`think`] - the think-evaluate-execute pipeline
//! - [`policy`] / [`executor`] - autonomy gating and side-effect dispatch
//! - [`notify`] - tiered, budgeted operator notifications
//! - [`sessions`] - session lifecycle and evaluation feedback
//! - [`state`] / [`db`] - the persistent state model

pub mod broker;
pub mod cli;
pub mod clock;
pub mod commands;
pub mod config;
pub mod context;
pub mod daemon;
pub mod db;
pub mod domain;
pub mod executor;
pub mod notify;
pub mod policy;
pub mod projects;
pub mod prompts;
pub mod resources;
pub mod scan;
pub mod sessions;
pub mod state;
pub mod supervisor;
pub mod think;
pub mod trackers;

pub use broker::{BrokerError, LlmPriority, LlmRequest, SubprocessBroker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use daemon::DaemonManager;
pub use domain::{
    Action, AutonomyLevel, BlockedReason, DecisionRecord, EvaluatedRecommendation, EvaluationRecord,
    ExecutionRecord, ExecutionResult, Recommendation, Session, SessionStatus,
};
pub use notify::{Notifier, SmsTransport, Tier};
pub use policy::Policy;
pub use state::Store;
pub use supervisor::Supervisor;
