//! Git progress tracking over a session window
//!
//! Every git failure (missing repo, timeout, bad exit) coerces to
//! "no git data" so evaluation can fall back to output-only judging.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::broker::SubprocessBroker;
use crate::domain::GitProgress;

const GIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Enumerates commits and diff stats since a point in time
pub struct GitTracker {
    broker: Arc<SubprocessBroker>,
}

impl GitTracker {
    pub fn new(broker: Arc<SubprocessBroker>) -> Self {
        Self { broker }
    }

    /// Current HEAD hash, or None outside a repository
    pub async fn head(&self, repo: &Path) -> Option<String> {
        let repo_str = repo.display().to_string();
        let stdout = self.run_git(&repo_str, &["rev-parse", "HEAD"]).await?;
        let hash = stdout.trim().to_string();
        if hash.is_empty() { None } else { Some(hash) }
    }

    /// Progress made in `repo` since a point in time
    ///
    /// Used when no start-of-session commit hash is known. Time-based
    /// selection can pick up concurrent commits landing in the same
    /// window; prefer [`progress_between`](Self::progress_between) when a
    /// hash is available.
    pub async fn progress_since(&self, repo: &Path, since: DateTime<Utc>) -> GitProgress {
        let since_str = since.to_rfc3339();
        self.gather(
            repo,
            &["rev-list", "--count", "HEAD", "--since", &since_str],
            &["log", "--numstat", "--format=", "--since", &since_str],
            &["log", "--format=%H|%s|%aI", "-1"],
        )
        .await
    }

    /// Progress made in `repo` after the commit `head_before`
    ///
    /// Commit-range selection is exact: immune to clock skew and to
    /// unrelated commits that happen to share the time window.
    pub async fn progress_between(&self, repo: &Path, head_before: &str) -> GitProgress {
        let range = format!("{}..HEAD", head_before);
        self.gather(
            repo,
            &["rev-list", "--count", &range],
            &["log", "--numstat", "--format=", &range],
            &["log", "--format=%H|%s|%aI", "-1", &range],
        )
        .await
    }

    /// Shared evidence pipeline over a commit selector
    async fn gather(
        &self,
        repo: &Path,
        count_args: &[&str],
        numstat_args: &[&str],
        last_args: &[&str],
    ) -> GitProgress {
        let repo_str = repo.display().to_string();

        let count_output = self.run_git(&repo_str, count_args).await;
        let commit_count: u32 = match count_output {
            Some(stdout) => stdout.trim().parse().unwrap_or(0),
            None => {
                debug!(repo = %repo_str, "rev-list failed, treating as no git data");
                return GitProgress::none();
            }
        };

        let mut progress = GitProgress {
            commit_count,
            ..Default::default()
        };

        if commit_count == 0 {
            return progress;
        }

        if let Some(stdout) = self.run_git(&repo_str, numstat_args).await {
            let (insertions, deletions, files) = parse_numstat(&stdout);
            progress.insertions = insertions;
            progress.deletions = deletions;
            progress.files_changed = files;
        }

        if let Some(stdout) = self.run_git(&repo_str, last_args).await {
            if let Some((hash, subject, at)) = parse_commit_line(stdout.trim()) {
                progress.last_commit_hash = Some(hash);
                progress.last_commit_subject = Some(subject);
                progress.last_commit_at = at;
            }
        }

        progress
    }

    /// Run one git subcommand; Some(stdout) only on a clean exit
    async fn run_git(&self, repo: &str, args: &[&str]) -> Option<String> {
        let mut full_args = vec!["-C", repo];
        full_args.extend_from_slice(args);

        match self.broker.run("git", &full_args, GIT_TIMEOUT, None).await {
            Ok(output) if output.exit_code == 0 => Some(output.stdout),
            _ => None,
        }
    }
}

/// Sum a `--numstat` body: "insertions\tdeletions\tpath" per line
fn parse_numstat(body: &str) -> (u32, u32, u32) {
    let mut insertions = 0u32;
    let mut deletions = 0u32;
    let mut files = 0u32;

    for line in body.lines() {
        let mut parts = line.split('\t');
        let (Some(ins), Some(del)) = (parts.next(), parts.next()) else {
            continue;
        };
        // Binary files show "-" in both columns; count the file, skip the sums
        files += 1;
        insertions += ins.trim().parse().unwrap_or(0);
        deletions += del.trim().parse().unwrap_or(0);
    }

    (insertions, deletions, files)
}

/// Parse "hash|subject|iso-date"
fn parse_commit_line(line: &str) -> Option<(String, String, Option<DateTime<Utc>>)> {
    let mut parts = line.splitn(3, '|');
    let hash = parts.next()?.to_string();
    if hash.is_empty() {
        return None;
    }
    let subject = parts.next().unwrap_or("").to_string();
    let at = parts
        .next()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Some((hash, subject, at))
}
