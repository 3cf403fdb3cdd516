use anyhow::{Context, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Token counts the host records on every assistant turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Context occupied by this turn: fresh input, cached input and output.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.cache_read_input_tokens)
            .saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub tracked_files: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptStatistics {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub total_tokens: u64,
    pub duration_seconds: i64,
    pub file_snapshots: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTranscript {
    pub messages: Vec<Message>,
    pub snapshots: Vec<FileSnapshot>,
    pub malformed_lines: usize,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default, alias = "git_branch", rename = "gitBranch")]
    git_branch: Option<String>,
    #[serde(default)]
    snapshot: Option<RawSnapshot>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Value,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    #[serde(default, rename = "messageId")]
    message_id: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, rename = "trackedFileBackups")]
    tracked_files: Value,
}

/// Classify one transcript line. `Err` means the line is not a JSON object;
/// `Ok(None)` means well-formed but of a kind this crate ignores.
fn parse_line(line: &str) -> std::result::Result<Option<Entry>, serde_json::Error> {
    let raw: RawEntry = serde_json::from_str(line)?;
    let entry = match raw.kind.as_deref() {
        Some("user") | Some("assistant") => {
            let role = if raw.kind.as_deref() == Some("user") {
                Role::User
            } else {
                Role::Assistant
            };
            let (content, model, usage) = match raw.message {
                Some(msg) => (msg.content, msg.model, msg.usage),
                None => (Value::Null, None, None),
            };
            Some(Entry::Message(Message {
                role,
                uuid: raw.uuid,
                timestamp: raw.timestamp,
                content,
                model: if role == Role::Assistant { model } else { None },
                usage: if role == Role::Assistant { usage } else { None },
                cwd: raw.cwd,
                git_branch: raw.git_branch,
            }))
        }
        Some("file-history-snapshot") => {
            let snap = raw.snapshot.unwrap_or(RawSnapshot {
                message_id: None,
                timestamp: None,
                tracked_files: Value::Null,
            });
            Some(Entry::Snapshot(FileSnapshot {
                message_id: snap.message_id,
                timestamp: snap.timestamp,
                tracked_files: snap.tracked_files,
            }))
        }
        _ => None,
    };
    Ok(entry)
}

enum Entry {
    Message(Message),
    Snapshot(FileSnapshot),
}

pub fn parse_transcript_str(raw: &str) -> ParsedTranscript {
    let mut out = ParsedTranscript::default();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_line(trimmed) {
            Ok(Some(Entry::Message(msg))) => out.messages.push(msg),
            Ok(Some(Entry::Snapshot(snap))) => out.snapshots.push(snap),
            Ok(None) => {}
            Err(_) => out.malformed_lines += 1,
        }
    }
    out
}

pub fn parse_transcript(path: &Path) -> Result<ParsedTranscript> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript {}", path.display()))?;
    Ok(parse_transcript_str(&raw))
}

fn duration_between(first: Option<&str>, last: Option<&str>) -> i64 {
    let (Some(first), Some(last)) = (first, last) else {
        return 0;
    };
    match (
        DateTime::parse_from_rfc3339(first),
        DateTime::parse_from_rfc3339(last),
    ) {
        (Ok(a), Ok(b)) => (b - a).num_seconds(),
        _ => 0,
    }
}

impl ParsedTranscript {
    pub fn statistics(&self) -> TranscriptStatistics {
        let user_messages = self
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .count();
        let assistant = self.messages.iter().filter(|m| m.role == Role::Assistant);
        let assistant_messages = assistant.clone().count();
        let total_tokens = assistant
            .filter_map(|m| m.usage)
            .map(|u| u.context_tokens())
            .fold(0u64, u64::saturating_add);

        let duration_seconds = duration_between(
            self.messages.first().and_then(|m| m.timestamp.as_deref()),
            self.messages.last().and_then(|m| m.timestamp.as_deref()),
        );

        TranscriptStatistics {
            total_messages: self.messages.len(),
            user_messages,
            assistant_messages,
            total_tokens,
            duration_seconds,
            file_snapshots: self.snapshots.len(),
        }
    }

    /// First non-empty git branch seen, newest first.
    pub fn git_branch(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter_map(|m| m.git_branch.as_deref())
            .find(|b| !b.trim().is_empty())
    }
}

/// Newest assistant turn carrying `message.usage`.
pub fn latest_usage_in(raw: &str) -> Option<Usage> {
    raw.lines().rev().find_map(|line| {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        match parse_line(trimmed) {
            Ok(Some(Entry::Message(msg))) if msg.role == Role::Assistant => msg.usage,
            _ => None,
        }
    })
}

pub fn latest_usage(path: &Path) -> Result<Option<Usage>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript {}", path.display()))?;
    Ok(latest_usage_in(&raw))
}

/// Session id encoded in a transcript file name (`<id>.jsonl`).
pub fn session_id_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
}

fn newest_jsonl(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .filter_map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, p)| p)
}

/// Resolve the active transcript: an explicit path from the hook payload,
/// then `CLAUDE_SESSION_ID` under the transcripts dir, then the newest
/// `.jsonl` there.
pub fn locate_transcript(
    transcripts_dir: &Path,
    explicit: Option<&str>,
    session_id: Option<&str>,
) -> Option<PathBuf> {
    if let Some(path) = explicit.map(str::trim).filter(|p| !p.is_empty()) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Some(path);
        }
    }

    let env_session = env::var("CLAUDE_SESSION_ID").ok();
    let session_id = session_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .or(env_session.filter(|s| !s.trim().is_empty()));
    if let Some(id) = session_id {
        let candidate = transcripts_dir.join(format!("{}.jsonl", id.trim()));
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    newest_jsonl(transcripts_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn user_line(ts: &str, text: &str) -> String {
        serde_json::json!({
            "type": "user",
            "uuid": "u",
            "timestamp": ts,
            "gitBranch": "main",
            "message": {"role": "user", "content": text}
        })
        .to_string()
    }

    fn assistant_line(ts: &str, input: u64, cache: u64, output: u64) -> String {
        serde_json::json!({
            "type": "assistant",
            "timestamp": ts,
            "message": {
                "model": "m",
                "content": [{"type": "text", "text": "ok"}],
                "usage": {
                    "input_tokens": input,
                    "cache_read_input_tokens": cache,
                    "output_tokens": output,
                    "cache_creation_input_tokens": 999
                }
            }
        })
        .to_string()
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let mut lines = Vec::new();
        for i in 0..5 {
            lines.push(user_line(&format!("2025-01-01T00:0{i}:00Z"), "hi"));
            lines.push(assistant_line(&format!("2025-01-01T00:0{i}:30Z"), 10, 5, 1));
        }
        lines.insert(3, "{not json".to_string());
        lines.push("garbage".to_string());
        let parsed = parse_transcript_str(&lines.join("\n"));

        assert_eq!(parsed.malformed_lines, 2);
        let stats = parsed.statistics();
        assert_eq!(stats.total_messages, 10);
        assert_eq!(stats.user_messages, 5);
        assert_eq!(stats.assistant_messages, 5);
        assert_eq!(stats.total_tokens, 80);
        assert_eq!(stats.duration_seconds, 270);
    }

    #[test]
    fn unknown_entry_kinds_are_neither_messages_nor_malformed() {
        let raw = format!(
            "{}\n{}\n{}",
            r#"{"type":"summary","summary":"x"}"#,
            r#"{"type":"file-history-snapshot","snapshot":{"messageId":"m1","trackedFileBackups":{}}}"#,
            user_line("2025-01-01T00:00:00Z", "hello")
        );
        let parsed = parse_transcript_str(&raw);
        assert_eq!(parsed.malformed_lines, 0);
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.snapshots.len(), 1);
        assert_eq!(parsed.snapshots[0].message_id.as_deref(), Some("m1"));
        assert_eq!(parsed.git_branch(), Some("main"));
    }

    #[test]
    fn latest_usage_takes_newest_assistant_turn() {
        let raw = [
            assistant_line("2025-01-01T00:00:00Z", 100, 0, 1),
            user_line("2025-01-01T00:00:10Z", "next"),
            assistant_line("2025-01-01T00:00:20Z", 1000, 500, 20),
            "{broken".to_string(),
        ]
        .join("\n");
        let usage = latest_usage_in(&raw).expect("usage");
        assert_eq!(usage.context_tokens(), 1520);
    }

    #[test]
    fn latest_usage_none_without_assistant_usage() {
        assert!(latest_usage_in(&user_line("2025-01-01T00:00:00Z", "hi")).is_none());
    }

    #[test]
    fn locate_prefers_explicit_then_session_then_newest() {
        let tmp = tempdir().expect("tempdir");
        let a = tmp.path().join("aaa.jsonl");
        let b = tmp.path().join("bbb.jsonl");
        fs::write(&a, "").expect("write a");
        fs::write(&b, "").expect("write b");
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(&b)
            .expect("open b")
            .set_modified(later)
            .expect("mtime");

        assert_eq!(
            locate_transcript(tmp.path(), Some(a.to_str().expect("utf8")), None),
            Some(a.clone())
        );
        assert_eq!(locate_transcript(tmp.path(), None, Some("aaa")), Some(a));
        assert_eq!(locate_transcript(tmp.path(), Some("/missing.jsonl"), None), Some(b));
    }
}
