use crate::budget::backup::{BackupListing, list_backups};
use crate::budget::config::RecoveryConfig;
use crate::budget::paths::BudgetPaths;
use crate::budget::transcript::TranscriptStatistics;
use crate::budget::util::write_json_atomic;
use anyhow::Result;
use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const MAX_WINDOW_HOURS: u64 = 24 * 365 * 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_messages: usize,
    pub total_tokens: u64,
    pub duration_seconds: i64,
}

impl From<&TranscriptStatistics> for RecoveryStatistics {
    fn from(stats: &TranscriptStatistics) -> Self {
        Self {
            total_messages: stats.total_messages,
            total_tokens: stats.total_tokens,
            duration_seconds: stats.duration_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub timestamp: DateTime<Utc>,
    #[serde(default, alias = "backup_file")]
    pub backup_file_ref: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub summary_length: usize,
    #[serde(default, alias = "collection")]
    pub collection_ref: Option<String>,
    #[serde(default)]
    pub auto_compact_triggered: bool,
    #[serde(default)]
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<RecoveryStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
}

impl RecoveryState {
    /// Stub written right after the backup lands, before summarization.
    pub fn marker(
        now: DateTime<Utc>,
        backup: Option<&Path>,
        collection: Option<&str>,
        statistics: Option<RecoveryStatistics>,
    ) -> Self {
        Self {
            timestamp: now,
            backup_file_ref: backup.map(|p| p.display().to_string()),
            summary: String::new(),
            summary_length: 0,
            collection_ref: collection.map(ToOwned::to_owned),
            auto_compact_triggered: true,
            recovered: false,
            recovered_at: None,
            statistics,
            store_error: None,
        }
    }

    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = summary.to_string();
        self.summary_length = summary.chars().count();
        self
    }

    pub fn is_fresh(&self, window: Duration, now: DateTime<Utc>) -> bool {
        !self.recovered && now.signed_duration_since(self.timestamp) < window
    }
}

/// `None` when absent or unparsable; a broken recovery file never blocks
/// session start.
pub fn read_state(path: &Path) -> Option<RecoveryState> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "recovery state unparsable; ignoring"
            );
            None
        }
    }
}

pub fn write_state(path: &Path, state: &RecoveryState) -> Result<()> {
    write_json_atomic(path, state)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Fresh summary: emit it as authoritative context.
    Applied(RecoveryState),
    /// No usable summary, but a backup exists to point at.
    Hint {
        reason: String,
        backup: PathBuf,
        collection: Option<String>,
    },
    Nothing,
}

pub struct RecoveryCoordinator<'a> {
    paths: &'a BudgetPaths,
    window: Duration,
}

impl<'a> RecoveryCoordinator<'a> {
    pub fn new(paths: &'a BudgetPaths, cfg: &RecoveryConfig) -> Self {
        // Capped at a century so the duration cannot overflow.
        let hours = i64::try_from(cfg.threshold_hours.min(MAX_WINDOW_HOURS)).unwrap_or(0);
        Self {
            paths,
            window: Duration::hours(hours),
        }
    }

    fn newest_backup(&self) -> Option<BackupListing> {
        list_backups(&self.paths.backups_dir).into_iter().next()
    }

    /// Run once at the start of a new session. A fresh, unconsumed state is
    /// marked recovered before its summary is handed back so a second run
    /// cannot emit it again.
    pub fn run(&self, now: DateTime<Utc>) -> RecoveryOutcome {
        let state = read_state(&self.paths.recovery_file);
        let collection = state.as_ref().and_then(|s| s.collection_ref.clone());

        if let Some(mut state) = state.filter(|s| s.is_fresh(self.window, now)) {
            if !state.summary.trim().is_empty() {
                state.recovered = true;
                state.recovered_at = Some(now);
                if let Err(err) = write_state(&self.paths.recovery_file, &state) {
                    tracing::warn!(
                        error = %format!("{err:#}"),
                        "failed to mark recovery state consumed"
                    );
                }
                return RecoveryOutcome::Applied(state);
            }

            // Summarization failed for this compaction: not consumed, point at
            // its own backup when it still exists.
            let own_backup = state
                .backup_file_ref
                .as_deref()
                .map(PathBuf::from)
                .filter(|p| p.is_file());
            if let Some(backup) = own_backup.or_else(|| self.newest_backup().map(|b| b.path)) {
                return RecoveryOutcome::Hint {
                    reason: "last compaction produced no summary".to_string(),
                    backup,
                    collection,
                };
            }
            return RecoveryOutcome::Nothing;
        }

        match self.newest_backup() {
            Some(listing) => RecoveryOutcome::Hint {
                reason: "no fresh recovery summary".to_string(),
                backup: listing.path,
                collection,
            },
            None => RecoveryOutcome::Nothing,
        }
    }
}

pub fn render_applied(state: &RecoveryState) -> String {
    let rule = "=".repeat(80);
    let when = state
        .timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S");
    let mut out = String::new();
    out.push_str(&format!("{rule}\n"));
    out.push_str("IMPORTANT: The summary below is the official context for this session.\n");
    out.push_str("Prioritize the content below over any auto-generated summaries.\n");
    out.push_str(&format!("(compacted at {when})\n"));
    out.push_str(&format!("{rule}\n\n"));
    out.push_str(state.summary.trim());
    out.push('\n');
    out
}

pub fn render_hint(reason: &str, backup: &Path, collection: Option<&str>) -> String {
    let mut out = format!(
        "Previous context is not restored automatically ({reason}).\nMost recent backup: {}\n",
        backup.display()
    );
    if let Some(collection) = collection {
        out.push_str(&format!(
            "Stored summaries may also be found in collection `{collection}` (type=context_compact).\n"
        ));
    }
    out.push_str("To restore manually, share the backup content with the new conversation.\n");
    out
}
