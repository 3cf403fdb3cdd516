use crate::budget::backup::BackupMetadata;
use crate::budget::config::SummaryConfig;
use crate::budget::transcript::{Message, Role, TranscriptStatistics};
use crate::budget::util::{
    TimedOutput, keep_tail_chars, run_command_with_input_timeout, truncate_with_ellipsis,
};
use crate::error::BudgetError;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;

const TRUNCATION_MARKER: &str = "[earlier conversation truncated]\n";

/// Produces a bounded summary from a prompt. Implementations return
/// `BudgetError` variants (wrapped in `anyhow`) for timeouts, bad exits and
/// unparsable output so the caller can record a stable code.
pub trait Summarizer {
    fn summarize(&self, prompt: &str) -> Result<String>;
}

pub struct CliSummarizer {
    bin: PathBuf,
    args: Vec<String>,
    model: String,
    timeout_secs: u64,
}

fn resolve_binary(command: &str) -> Result<PathBuf> {
    let path = Path::new(command);
    if path.components().count() > 1 {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("summarizer command {} does not exist", path.display());
    }
    which::which(command)
        .with_context(|| format!("summarizer command `{command}` not found in PATH"))
}

impl CliSummarizer {
    pub fn from_config(cfg: &SummaryConfig) -> Result<Self> {
        Ok(Self {
            bin: resolve_binary(&cfg.command)?,
            args: cfg.args.clone(),
            model: cfg.model.clone(),
            timeout_secs: cfg.timeout_secs,
        })
    }
}

impl Summarizer for CliSummarizer {
    fn summarize(&self, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.args);
        if !self.model.trim().is_empty() {
            cmd.arg("--model").arg(self.model.trim());
        }

        let result =
            run_command_with_input_timeout(&mut cmd, prompt.as_bytes(), self.timeout_secs)?;
        let output = match result {
            TimedOutput::TimedOut => {
                return Err(BudgetError::SummaryTimeout(self.timeout_secs).into());
            }
            TimedOutput::Finished(output) => output,
        };
        if !output.status.success() {
            return Err(BudgetError::SummaryExit {
                status: output.status.to_string(),
                stderr: truncate_with_ellipsis(&String::from_utf8_lossy(&output.stderr), 500),
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        extract_summary_text(&stdout).ok_or_else(|| BudgetError::SummaryUnparsable.into())
    }
}

fn text_parts(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let chunks: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if chunks.is_empty() {
                None
            } else {
                Some(chunks.join("\n"))
            }
        }
        _ => None,
    }
}

/// Pull the summary out of the CLI's JSON envelope. A list envelope prefers
/// the `result` item, then the first assistant text; an object envelope
/// prefers `result`, then `content`. Anything else is unparsable.
pub fn extract_summary_text(stdout: &str) -> Option<String> {
    let json: Value = serde_json::from_str(stdout.trim()).ok()?;
    let text = match &json {
        Value::Array(items) => items
            .iter()
            .find(|i| i.get("type").and_then(Value::as_str) == Some("result"))
            .and_then(|i| i.get("result"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                items
                    .iter()
                    .find(|i| i.get("type").and_then(Value::as_str) == Some("assistant"))
                    .and_then(|i| i.get("message"))
                    .and_then(|m| m.get("content"))
                    .and_then(text_parts)
            }),
        Value::Object(obj) => obj
            .get("result")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .filter(|s| !s.trim().is_empty())
            .or_else(|| obj.get("content").and_then(text_parts)),
        _ => None,
    }?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Cap a model summary at `max_chars`, marking the cut.
pub fn clamp_summary(summary: &str, max_chars: usize) -> String {
    let normalized = summary.trim_end();
    if normalized.chars().count() <= max_chars {
        return normalized.to_string();
    }
    let truncated = truncate_with_ellipsis(normalized, max_chars);
    format!("{truncated}\n\n[summary truncated]")
}

fn render_message(msg: &Message) -> Option<String> {
    let ts = msg.timestamp.as_deref().unwrap_or("");
    match msg.role {
        Role::User => {
            let text = match &msg.content {
                Value::String(s) => s.clone(),
                other => text_parts(other).unwrap_or_default(),
            };
            if text.trim().is_empty() {
                return None;
            }
            Some(format!("[User - {ts}]\n{text}\n"))
        }
        Role::Assistant => {
            let parts: Vec<String> = match &msg.content {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .iter()
                    .filter_map(|item| match item.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            item.get("text").and_then(Value::as_str).map(ToOwned::to_owned)
                        }
                        Some("tool_use") => {
                            let name = item.get("name").and_then(Value::as_str).unwrap_or("");
                            let input = item.get("input").cloned().unwrap_or(Value::Null);
                            Some(format!("[Tool: {name}]\n{input}"))
                        }
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            if parts.is_empty() {
                return None;
            }
            Some(format!("[Assistant - {ts}]\n{}\n", parts.join("\n")))
        }
    }
}

/// Render the last `keep_recent` messages in conversation order.
pub fn format_recent(messages: &[Message], keep_recent: usize) -> String {
    let start = messages.len().saturating_sub(keep_recent);
    messages[start..]
        .iter()
        .filter_map(render_message)
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn prompt_header(
    metadata: &BackupMetadata,
    statistics: &TranscriptStatistics,
    focus_areas: &[String],
) -> String {
    let session: String = metadata.session_id.chars().take(8).collect();
    let session = if session.is_empty() { "N/A".to_string() } else { session };
    format!(
        "Please summarize the next development session **concise within 5000 characters**.

## Session Information
[{focus}] | Session: {session}... | Branch: {branch} | Messages: {messages} | Duration: {minutes} minutes

## Summary Rules (Important!)
1. **Must be within 5000 characters** - Focus on bullet points, keep concise
2. Core only: Purpose of work -> Key changes -> Decisions made -> Unfinished items
3. Code: Only filename:line (Minimize code blocks)
4. Remove unnecessary explanations, repetition, and background information

## Summary Format
# Previous Session Summary (Working Directory: {cwd})

## Purpose of Work
[Core objective in 1-2 lines]

## Key Changes
- File name: Line - [Change details in 1 line]

## Key Decisions
- [Decision in 1 line]

## Unfinished/Next Steps
- [TODO items]

---

## Conversation Details
",
        focus = focus_areas.join(", "),
        branch = metadata.git_branch.as_deref().unwrap_or("N/A"),
        messages = statistics.total_messages,
        minutes = statistics.duration_seconds.max(0) / 60,
        cwd = metadata.cwd.as_deref().unwrap_or("N/A"),
    )
}

const PROMPT_FOOTER: &str = "\n\nSummarize the key points of the above conversation within \
     5,000 characters. Remove unnecessary explanations and retain only the information needed \
     to restore the work context.";

/// Build the summarization prompt, never longer than `cfg.prompt_char_cap`
/// characters. When the conversation does not fit, its oldest text is dropped.
pub fn build_prompt(
    messages: &[Message],
    metadata: &BackupMetadata,
    statistics: &TranscriptStatistics,
    cfg: &SummaryConfig,
) -> Option<String> {
    let conversation = format_recent(messages, cfg.keep_recent_messages);
    if conversation.trim().is_empty() {
        return None;
    }

    let header = prompt_header(metadata, statistics, &cfg.focus_areas);
    let fixed = header.chars().count() + PROMPT_FOOTER.chars().count();
    let budget = cfg.prompt_char_cap.saturating_sub(fixed);
    let body = if conversation.chars().count() <= budget {
        conversation
    } else {
        let room = budget.saturating_sub(TRUNCATION_MARKER.chars().count());
        format!("{TRUNCATION_MARKER}{}", keep_tail_chars(&conversation, room))
    };

    let prompt = format!("{header}{body}{PROMPT_FOOTER}");
    if prompt.chars().count() > cfg.prompt_char_cap {
        // Header alone exceeds the cap: hard cut.
        return Some(prompt.chars().take(cfg.prompt_char_cap).collect());
    }
    Some(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::transcript::parse_transcript_str;

    fn conversation(n: usize, text_len: usize) -> Vec<Message> {
        let body = "x".repeat(text_len);
        let lines: Vec<String> = (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    serde_json::json!({
                        "type": "user",
                        "timestamp": format!("t{i}"),
                        "message": {"content": format!("u{i} {body}")}
                    })
                    .to_string()
                } else {
                    serde_json::json!({
                        "type": "assistant",
                        "timestamp": format!("t{i}"),
                        "message": {"content": [
                            {"type": "text", "text": format!("a{i}")},
                            {"type": "tool_use", "name": "Edit", "input": {"file": "src/main.rs"}}
                        ]}
                    })
                    .to_string()
                }
            })
            .collect();
        parse_transcript_str(&lines.join("\n")).messages
    }

    #[test]
    fn keeps_only_recent_messages() {
        let msgs = conversation(30, 5);
        let text = format_recent(&msgs, 10);
        assert!(!text.contains("u18 "));
        assert!(text.contains("u20 "));
        assert!(text.contains("[Tool: Edit]"));
        assert!(text.contains("[Assistant - t29]"));
    }

    #[test]
    fn prompt_respects_char_cap_and_keeps_newest_text() {
        let msgs = conversation(10, 5_000);
        let cfg = SummaryConfig {
            prompt_char_cap: 8_000,
            ..SummaryConfig::default()
        };
        let prompt = build_prompt(
            &msgs,
            &BackupMetadata::default(),
            &TranscriptStatistics::default(),
            &cfg,
        )
        .expect("prompt");
        assert!(prompt.chars().count() <= 8_000);
        assert!(prompt.contains(TRUNCATION_MARKER.trim()));
        assert!(prompt.contains("a9"));
        assert!(prompt.ends_with("restore the work context."));
    }

    #[test]
    fn no_renderable_messages_means_no_prompt() {
        assert!(
            build_prompt(
                &[],
                &BackupMetadata::default(),
                &TranscriptStatistics::default(),
                &SummaryConfig::default()
            )
            .is_none()
        );
    }

    #[test]
    fn extracts_result_from_list_envelope() {
        let raw = r#"[{"type":"system"},{"type":"assistant","message":{"content":[{"type":"text","text":"draft"}]}},{"type":"result","result":"  final summary "}]"#;
        assert_eq!(extract_summary_text(raw).as_deref(), Some("final summary"));
    }

    #[test]
    fn list_envelope_falls_back_to_assistant_text() {
        let raw = r#"[{"type":"assistant","message":{"content":[{"type":"text","text":"only text"}]}}]"#;
        assert_eq!(extract_summary_text(raw).as_deref(), Some("only text"));
    }

    #[test]
    fn object_envelope_uses_result_then_content() {
        assert_eq!(
            extract_summary_text(r#"{"result":"r"}"#).as_deref(),
            Some("r")
        );
        assert_eq!(
            extract_summary_text(
                r#"{"result":"","content":[{"type":"text","text":"c1"},{"type":"text","text":"c2"}]}"#
            )
            .as_deref(),
            Some("c1\nc2")
        );
    }

    #[test]
    fn non_json_or_empty_is_unparsable() {
        assert!(extract_summary_text("plain words").is_none());
        assert!(extract_summary_text(r#"{"result":"   "}"#).is_none());
        assert!(extract_summary_text("42").is_none());
    }

    #[test]
    fn clamp_summary_limits_large_output() {
        let giant = "A".repeat(9_000);
        let clamped = clamp_summary(&giant, 8_000);
        assert!(clamped.chars().count() <= 8_000 + 32);
        assert!(clamped.contains("[summary truncated]"));
        assert_eq!(clamp_summary("short\n", 8_000), "short");
    }
}
