//! Project registry
//!
//! Scans the configured projects root for directories and reads their
//! `.orchestrator/` signal files. Deep per-project state parsing belongs
//! to the sessions themselves; the supervisor only needs names, status,
//! last-activity age, and error signals.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::sessions::SIGNAL_DIR;

/// Optional per-project status file (`.orchestrator/project.json`)
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProjectSignal {
    status: Option<String>,
    needs_attention: bool,
}

/// Optional error signal (`.orchestrator/error.json`)
#[derive(Debug, Deserialize)]
struct ErrorSignal {
    message: String,
}

/// What the supervisor knows about one project directory
#[derive(Debug, Clone)]
pub struct ProjectInfo {
    pub name: String,
    pub path: PathBuf,
    pub status: Option<String>,
    pub needs_attention: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Whether any signal file exists for this project
    pub has_state: bool,
}

impl ProjectInfo {
    /// Days since the last observed activity
    pub fn idle_days(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_activity.map(|ts| (now - ts).num_days())
    }
}

/// The scanning adapter over the projects root
pub struct Projects {
    root: PathBuf,
}

impl Projects {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Enumerate project directories with their signal state
    pub fn scan(&self) -> Vec<ProjectInfo> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            debug!(root = %self.root.display(), "projects root unreadable");
            return Vec::new();
        };

        let mut projects: Vec<ProjectInfo> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    return None;
                }
                Some(read_project(&name, &entry.path()))
            })
            .collect();

        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    /// Known project names (policy resolution)
    pub fn known_names(&self) -> HashSet<String> {
        self.scan().into_iter().map(|p| p.name).collect()
    }

    /// Directory for a known project, if it exists
    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        // Reject path separators so a crafted "project" name cannot
        // escape the root
        if name.contains('/') || name.contains("..") {
            return None;
        }
        let path = self.root.join(name);
        path.is_dir().then_some(path)
    }

    /// (name, path) pairs for session recovery
    pub fn name_path_pairs(&self) -> Vec<(String, PathBuf)> {
        self.scan().into_iter().map(|p| (p.name, p.path)).collect()
    }
}

fn read_project(name: &str, path: &Path) -> ProjectInfo {
    let signal_dir = path.join(SIGNAL_DIR);

    let signal: ProjectSignal = read_json(&signal_dir.join("project.json")).unwrap_or_default();
    let error: Option<ErrorSignal> = read_json(&signal_dir.join("error.json"));

    let has_state = ["project.json", "session.json", "evaluation.json", "error.json"]
        .iter()
        .any(|f| signal_dir.join(f).exists());

    ProjectInfo {
        name: name.to_string(),
        path: path.to_path_buf(),
        status: signal.status,
        needs_attention: signal.needs_attention || error.is_some(),
        last_activity: last_activity(path, &signal_dir),
        error: error.map(|e| e.message),
        has_state,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Most recent mtime across the project dir and its signal files
fn last_activity(path: &Path, signal_dir: &Path) -> Option<DateTime<Utc>> {
    let mut latest: Option<std::time::SystemTime> = mtime(path);
    for file in ["session.json", "evaluation.json", "project.json"] {
        if let Some(ts) = mtime(&signal_dir.join(file)) {
            latest = Some(latest.map_or(ts, |cur| cur.max(ts)));
        }
    }
    latest.map(DateTime::<Utc>::from)
}

fn mtime(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_project(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn test_scan_lists_directories_sorted() {
        let root = TempDir::new().unwrap();
        make_project(root.path(), "zeta");
        make_project(root.path(), "alpha");
        std::fs::write(root.path().join("stray-file.txt"), "x").unwrap();

        let projects = Projects::new(root.path()).scan();
        let names: Vec<_> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_hidden_directories_skipped() {
        let root = TempDir::new().unwrap();
        make_project(root.path(), ".git");
        make_project(root.path(), "visible");

        let projects = Projects::new(root.path()).scan();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "visible");
    }

    #[test]
    fn test_error_signal_sets_needs_attention() {
        let root = TempDir::new().unwrap();
        let path = make_project(root.path(), "broken");
        let signal_dir = path.join(SIGNAL_DIR);
        std::fs::create_dir_all(&signal_dir).unwrap();
        std::fs::write(signal_dir.join("error.json"), r#"{"message": "build exploded"}"#).unwrap();

        let projects = Projects::new(root.path()).scan();
        assert!(projects[0].needs_attention);
        assert_eq!(projects[0].error.as_deref(), Some("build exploded"));
        assert!(projects[0].has_state);
    }

    #[test]
    fn test_status_from_project_signal() {
        let root = TempDir::new().unwrap();
        let path = make_project(root.path(), "done");
        let signal_dir = path.join(SIGNAL_DIR);
        std::fs::create_dir_all(&signal_dir).unwrap();
        std::fs::write(signal_dir.join("project.json"), r#"{"status": "complete"}"#).unwrap();

        let projects = Projects::new(root.path()).scan();
        assert_eq!(projects[0].status.as_deref(), Some("complete"));
    }

    #[test]
    fn test_path_of_rejects_traversal() {
        let root = TempDir::new().unwrap();
        make_project(root.path(), "alpha");
        let projects = Projects::new(root.path());

        assert!(projects.path_of("alpha").is_some());
        assert!(projects.path_of("missing").is_none());
        assert!(projects.path_of("../etc").is_none());
        assert!(projects.path_of("a/b").is_none());
    }
}
