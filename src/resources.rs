//! Host resource monitoring
//!
//! CPU load, memory, and uptime come from OS facilities via `sysinfo`;
//! disk usage goes through a `df` shell call that is tolerated to fail
//! to None.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::System;
use tracing::debug;

use crate::broker::SubprocessBroker;

/// Point-in-time host health
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub load_one: f64,
    pub free_memory_mb: u64,
    pub total_memory_mb: u64,
    /// None when the probe failed
    pub disk_used_percent: Option<u8>,
    pub uptime_secs: u64,
}

impl ResourceSnapshot {
    /// One-line rendering for the context prompt
    pub fn format_line(&self) -> String {
        let disk = self
            .disk_used_percent
            .map(|p| format!("{}%", p))
            .unwrap_or_else(|| "?".to_string());
        format!(
            "load {:.2}, mem {}/{} MB free, disk {} used, up {}h",
            self.load_one,
            self.free_memory_mb,
            self.total_memory_mb,
            disk,
            self.uptime_secs / 3600
        )
    }
}

/// Samples host health on demand
pub struct ResourceMonitor {
    sys: Mutex<System>,
    broker: Arc<SubprocessBroker>,
}

impl ResourceMonitor {
    pub fn new(broker: Arc<SubprocessBroker>) -> Self {
        Self {
            sys: Mutex::new(System::new()),
            broker,
        }
    }

    /// Take a fresh snapshot
    pub async fn snapshot(&self) -> ResourceSnapshot {
        let (free_memory_mb, total_memory_mb) = {
            let mut sys = self.sys.lock().unwrap();
            sys.refresh_memory();
            (sys.available_memory() / (1024 * 1024), sys.total_memory() / (1024 * 1024))
        };

        let snapshot = ResourceSnapshot {
            load_one: System::load_average().one,
            free_memory_mb,
            total_memory_mb,
            disk_used_percent: self.disk_used_percent().await,
            uptime_secs: System::uptime(),
        };
        debug!(?snapshot, "resource snapshot");
        snapshot
    }

    /// Free memory in MB only (think/start precondition checks)
    pub fn free_memory_mb(&self) -> u64 {
        let mut sys = self.sys.lock().unwrap();
        sys.refresh_memory();
        sys.available_memory() / (1024 * 1024)
    }

    async fn disk_used_percent(&self) -> Option<u8> {
        let output = self
            .broker
            .run("df", &["--output=pcent", "/"], Duration::from_secs(5), None)
            .await
            .ok()?;
        if output.exit_code != 0 {
            return None;
        }

        // Second line is the percentage, e.g. " 42%"
        output
            .stdout
            .lines()
            .nth(1)
            .and_then(|line| line.trim().trim_end_matches('%').parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_has_plausible_memory() {
        let broker = Arc::new(SubprocessBroker::new("true"));
        let monitor = ResourceMonitor::new(broker);

        let snapshot = monitor.snapshot().await;
        assert!(snapshot.total_memory_mb > 0);
        assert!(snapshot.free_memory_mb <= snapshot.total_memory_mb);
    }

    #[test]
    fn test_format_line_with_unknown_disk() {
        let snapshot = ResourceSnapshot {
            load_one: 1.25,
            free_memory_mb: 2048,
            total_memory_mb: 8192,
            disk_used_percent: None,
            uptime_secs: 7200,
        };
        let line = snapshot.format_line();
        assert!(line.contains("load 1.25"));
        assert!(line.contains("2048/8192"));
        assert!(line.contains("disk ? used"));
        assert!(line.contains("up 2h"));
    }
}
