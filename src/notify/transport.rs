//! Outbound SMS transport
//!
//! The transport itself is an external collaborator: the supervisor only
//! needs "send one text of bounded length". The production adapter shells
//! out through the broker to whatever host tool delivers SMS; tests use
//! the recording mock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, eyre};
use tracing::{debug, info};

use crate::broker::SubprocessBroker;

/// One-way message delivery to the operator
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Adapter that invokes a host command with the message as the final argument
pub struct CommandTransport {
    broker: Arc<SubprocessBroker>,
    command: Vec<String>,
}

impl CommandTransport {
    pub fn new(broker: Arc<SubprocessBroker>, command: Vec<String>) -> Self {
        Self { broker, command }
    }
}

#[async_trait]
impl SmsTransport for CommandTransport {
    async fn send(&self, text: &str) -> Result<()> {
        let Some((program, prefix)) = self.command.split_first() else {
            return Err(eyre!("No send command configured"));
        };

        let mut args: Vec<&str> = prefix.iter().map(String::as_str).collect();
        args.push(text);

        self.broker
            .run_checked(program, &args, Duration::from_secs(10))
            .await
            .map_err(|e| eyre!("SMS send failed: {}", e))?;
        Ok(())
    }
}

/// Log-only transport used when no send command is configured
pub struct LogTransport;

#[async_trait]
impl SmsTransport for LogTransport {
    async fn send(&self, text: &str) -> Result<()> {
        info!(%text, "SMS (no transport configured)");
        Ok(())
    }
}

/// Recording transport for tests
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Make subsequent sends fail (transport down)
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

#[async_trait]
impl SmsTransport for MockTransport {
    async fn send(&self, text: &str) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(eyre!("transport down"));
        }
        debug!(%text, "MockTransport send");
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
