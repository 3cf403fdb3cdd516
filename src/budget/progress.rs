use crate::budget::paths::BudgetPaths;
use crate::budget::util::{now_epoch_secs, pid_alive, remove_if_exists, write_json_atomic};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStatus {
    Running,
    Completed,
    Error,
}

impl CompactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Init,
    Backup,
    Summary,
    Store,
    Cleanup,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Backup => "backup",
            Self::Summary => "summary",
            Self::Store => "store",
            Self::Cleanup => "cleanup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionProgress {
    pub pid: u32,
    pub status: CompactionStatus,
    pub stage: Stage,
    pub progress: u8,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_stages: Vec<Stage>,
}

impl CompactionProgress {
    pub fn started(pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            pid,
            status: CompactionStatus::Running,
            stage: Stage::Init,
            progress: 0,
            message: "Starting compaction".to_string(),
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            failed_stages: Vec::new(),
        }
    }
}

/// `None` when the record is absent, unreadable or mid-rewrite.
pub fn read_progress(path: &Path) -> Option<CompactionProgress> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

pub fn write_progress(path: &Path, progress: &CompactionProgress) -> Result<()> {
    write_json_atomic(path, progress)
}

/// Owns the progress record for one worker run. Every transition rewrites
/// the whole file and keeps `started_at`.
pub struct ProgressWriter {
    path: PathBuf,
    current: CompactionProgress,
}

impl ProgressWriter {
    /// Adopt the record the launcher wrote (same pid), or start a new one.
    pub fn begin(path: &Path, pid: u32, now: DateTime<Utc>) -> Result<Self> {
        let current = match read_progress(path) {
            Some(existing)
                if existing.pid == pid && existing.status == CompactionStatus::Running =>
            {
                existing
            }
            _ => CompactionProgress::started(pid, now),
        };
        let writer = Self {
            path: path.to_path_buf(),
            current,
        };
        write_progress(&writer.path, &writer.current)?;
        Ok(writer)
    }

    pub fn current(&self) -> &CompactionProgress {
        &self.current
    }

    pub fn update(&mut self, stage: Stage, progress: u8, message: &str) -> Result<()> {
        self.current.stage = stage;
        self.current.progress = progress.min(100);
        self.current.message = message.to_string();
        self.current.updated_at = Utc::now();
        write_progress(&self.path, &self.current)
    }

    pub fn mark_stage_failed(&mut self, stage: Stage) {
        if !self.current.failed_stages.contains(&stage) {
            self.current.failed_stages.push(stage);
        }
    }

    pub fn complete(&mut self, message: &str) -> Result<()> {
        let now = Utc::now();
        self.current.status = CompactionStatus::Completed;
        self.current.stage = Stage::Cleanup;
        self.current.progress = 100;
        self.current.message = message.to_string();
        self.current.updated_at = now;
        self.current.completed_at = Some(now);
        write_progress(&self.path, &self.current)
    }

    pub fn fail(&mut self, error: &str) -> Result<()> {
        let now = Utc::now();
        self.current.status = CompactionStatus::Error;
        self.current.message = "Compaction failed".to_string();
        self.current.error = Some(error.to_string());
        self.current.updated_at = now;
        self.current.completed_at = Some(now);
        write_progress(&self.path, &self.current)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    pub pid: u32,
    #[serde(default, alias = "start_time")]
    pub started_at_epoch_secs: u64,
    #[serde(default)]
    pub build_uuid: String,
    #[serde(default)]
    pub project_root: String,
}

pub fn parse_pid_record(raw: &str) -> Option<PidRecord> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(record) = serde_json::from_str::<PidRecord>(trimmed) {
        return Some(record);
    }

    // Older PID files hold only the pid.
    let pid = trimmed.lines().next()?.trim().parse::<u32>().ok()?;
    Some(PidRecord {
        pid,
        started_at_epoch_secs: 0,
        build_uuid: String::new(),
        project_root: String::new(),
    })
}

pub fn read_pid_record(path: &Path) -> Option<PidRecord> {
    let raw = fs::read_to_string(path).ok()?;
    parse_pid_record(&raw)
}

pub fn write_pid_record(paths: &BudgetPaths, pid: u32) -> Result<PidRecord> {
    let record = PidRecord {
        pid,
        started_at_epoch_secs: now_epoch_secs()?,
        build_uuid: env!("BUILD_UUID").to_string(),
        project_root: paths.project_root.display().to_string(),
    };
    write_json_atomic(&paths.pid_file, &record)
        .with_context(|| format!("failed to write pid file {}", paths.pid_file.display()))?;
    Ok(record)
}

/// A worker is bounded by the summarizer and store timeouts; a record older
/// than this names a pid the OS has likely handed to another process.
const MAX_WORKER_AGE_SECS: u64 = 60 * 60;

fn record_is_recent(record: &PidRecord, now_secs: u64) -> bool {
    record.started_at_epoch_secs == 0
        || now_secs.saturating_sub(record.started_at_epoch_secs) <= MAX_WORKER_AGE_SECS
}

/// Pid of a live worker recorded in the PID file, if any.
pub fn live_worker_pid(paths: &BudgetPaths) -> Option<u32> {
    let record = read_pid_record(&paths.pid_file)?;
    let now_secs = now_epoch_secs().unwrap_or(0);
    if !record_is_recent(&record, now_secs) {
        tracing::info!(pid = record.pid, "pid record outlived any worker; treating as stale");
        return None;
    }
    Some(record.pid).filter(|pid| pid_alive(*pid))
}

pub fn clear_pid_file(paths: &BudgetPaths) -> Result<bool> {
    remove_if_exists(&paths.pid_file)
}

/// Delete the progress record and the PID file together.
pub fn clear_all(paths: &BudgetPaths) -> Result<()> {
    remove_if_exists(&paths.progress_file)?;
    remove_if_exists(&paths.pid_file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_json_and_legacy_pid_files() {
        let json = r#"{"pid":42,"start_time":1700000000,"build_uuid":"abc"}"#;
        let record = parse_pid_record(json).expect("json record");
        assert_eq!(record.pid, 42);
        assert_eq!(record.started_at_epoch_secs, 1_700_000_000);

        let legacy = parse_pid_record("4242\n").expect("legacy record");
        assert_eq!(legacy.pid, 4242);
        assert!(legacy.build_uuid.is_empty());

        assert!(parse_pid_record("  ").is_none());
        assert!(parse_pid_record("nope").is_none());
    }

    #[test]
    fn old_pid_record_is_not_a_live_worker() {
        let tmp = tempdir().expect("tempdir");
        let paths = BudgetPaths::rooted_at(tmp.path());
        let me = std::process::id();
        write_pid_record(&paths, me).expect("pid");
        assert_eq!(live_worker_pid(&paths), Some(me));
        assert_eq!(
            read_pid_record(&paths.pid_file).expect("record").build_uuid,
            env!("BUILD_UUID")
        );

        let reused = PidRecord {
            pid: me,
            started_at_epoch_secs: now_epoch_secs().expect("clock") - 2 * MAX_WORKER_AGE_SECS,
            build_uuid: "old-build".into(),
            project_root: String::new(),
        };
        write_json_atomic(&paths.pid_file, &reused).expect("write");
        assert_eq!(live_worker_pid(&paths), None);
    }

    #[test]
    fn writer_preserves_started_at_across_updates() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("compact-status.json");
        let started = Utc::now() - chrono::Duration::seconds(30);
        write_progress(&path, &CompactionProgress::started(7, started)).expect("seed");

        let mut writer = ProgressWriter::begin(&path, 7, Utc::now()).expect("begin");
        writer.update(Stage::Backup, 20, "Backing up").expect("update");
        writer.mark_stage_failed(Stage::Summary);
        writer.mark_stage_failed(Stage::Summary);
        writer.complete("done").expect("complete");

        let read = read_progress(&path).expect("read back");
        assert_eq!(read.started_at, started);
        assert_eq!(read.status, CompactionStatus::Completed);
        assert_eq!(read.progress, 100);
        assert_eq!(read.failed_stages, vec![Stage::Summary]);
        assert!(read.completed_at.is_some());
    }

    #[test]
    fn writer_replaces_record_from_another_pid() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("compact-status.json");
        let old = Utc::now() - chrono::Duration::hours(3);
        write_progress(&path, &CompactionProgress::started(1, old)).expect("seed");

        let writer = ProgressWriter::begin(&path, 2, Utc::now()).expect("begin");
        assert_eq!(writer.current().pid, 2);
        assert_ne!(writer.current().started_at, old);
    }

    #[test]
    fn partial_progress_file_reads_as_absent() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("compact-status.json");
        fs::write(&path, r#"{"pid": 3, "status": "runn"#).expect("write");
        assert!(read_progress(&path).is_none());
    }

    #[test]
    fn stage_names_serialize_lowercase() {
        let progress = CompactionProgress::started(9, Utc::now());
        let json = serde_json::to_value(&progress).expect("json");
        assert_eq!(json["stage"], "init");
        assert_eq!(json["status"], "running");
        assert_eq!(json["progress"], 0);
        assert!(json.get("error").is_none());
    }
}
