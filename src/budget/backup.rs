use crate::budget::config::BackupConfig;
use crate::budget::transcript::{FileSnapshot, Message, ParsedTranscript, TranscriptStatistics};
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const BACKUP_PREFIX: &str = "conversation_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    Json,
    Gzip,
    Text,
}

impl BackupFormat {
    fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Gzip => "json.gz",
            Self::Text => "txt",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Gzip => "gzip",
            Self::Text => "text",
        }
    }

    fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".json.gz") {
            Some(Self::Gzip)
        } else if name.ends_with(".json") {
            Some(Self::Json)
        } else if name.ends_with(".txt") {
            Some(Self::Text)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub format: BackupFormat,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub token_count: u64,
    pub sha256: String,
}

/// Hook context recorded alongside the conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

#[derive(Debug, Serialize)]
struct FileHistory<'a> {
    snapshots: &'a [FileSnapshot],
}

#[derive(Debug, Serialize)]
struct BackupDocument<'a> {
    backup_metadata: &'a BackupMetadata,
    conversation: &'a [Message],
    file_history: FileHistory<'a>,
    statistics: &'a TranscriptStatistics,
}

/// What the worker hands to the backup stage.
pub enum BackupInput<'a> {
    Parsed {
        metadata: &'a BackupMetadata,
        transcript: &'a ParsedTranscript,
        statistics: &'a TranscriptStatistics,
    },
    /// The hook payload was not JSON: keep it verbatim.
    Raw(&'a str),
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.{ext}"));
    if !first.exists() {
        return first;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{n}.{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn write_backup(
    dir: &Path,
    cfg: &BackupConfig,
    input: BackupInput<'_>,
    now: DateTime<Local>,
) -> Result<BackupArtifact> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let stem = format!("{BACKUP_PREFIX}{}", now.format("%Y%m%d_%H%M%S"));

    let (format, bytes, message_count, token_count) = match input {
        BackupInput::Parsed {
            metadata,
            transcript,
            statistics,
        } => {
            let doc = BackupDocument {
                backup_metadata: metadata,
                conversation: &transcript.messages,
                file_history: FileHistory {
                    snapshots: &transcript.snapshots,
                },
                statistics,
            };
            let json = serde_json::to_vec_pretty(&doc)?;
            let (format, bytes) = if cfg.compress {
                (BackupFormat::Gzip, gzip(&json)?)
            } else {
                (BackupFormat::Json, json)
            };
            (
                format,
                bytes,
                statistics.total_messages,
                statistics.total_tokens,
            )
        }
        BackupInput::Raw(text) => (BackupFormat::Text, text.as_bytes().to_vec(), 0, 0),
    };

    let path = unique_path(dir, &stem, format.extension());
    fs::write(&path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;

    Ok(BackupArtifact {
        path,
        format,
        created_at: now.with_timezone(&Utc),
        message_count,
        token_count,
        sha256: sha256_hex(&bytes),
    })
}

fn backup_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .is_some_and(|n| {
                    n.starts_with(BACKUP_PREFIX) && BackupFormat::from_file_name(&n).is_some()
                })
        })
        .collect()
}

/// Keep the newest `max_backups` artifacts. Names embed a sortable timestamp,
/// so the lexicographically smallest are the oldest.
pub fn prune_backups(dir: &Path, max_backups: usize) -> Result<Vec<PathBuf>> {
    let mut files = backup_files(dir);
    if files.len() <= max_backups {
        return Ok(Vec::new());
    }
    files.sort();
    let excess = files.len() - max_backups;
    let mut removed = Vec::with_capacity(excess);
    for path in files.into_iter().take(excess) {
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        removed.push(path);
    }
    Ok(removed)
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupListing {
    pub path: PathBuf,
    pub format: BackupFormat,
    pub size_bytes: u64,
    #[serde(skip)]
    pub modified: SystemTime,
}

/// All backup artifacts, newest first by modification time.
pub fn list_backups(dir: &Path) -> Vec<BackupListing> {
    let mut out: Vec<BackupListing> = backup_files(dir)
        .into_iter()
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            let name = path.file_name()?.to_string_lossy().to_string();
            Some(BackupListing {
                format: BackupFormat::from_file_name(&name)?,
                size_bytes: meta.len(),
                modified: meta.modified().ok()?,
                path,
            })
        })
        .collect();
    out.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    out
}
