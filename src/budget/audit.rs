use crate::budget::paths::BudgetPaths;
use crate::budget::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

const MAX_AUDIT_LOG_SIZE: u64 = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn audit_log_path(paths: &BudgetPaths) -> std::path::PathBuf {
    paths.logs_dir.join("audit.log")
}

pub fn append_event(paths: &BudgetPaths, phase: &str, status: &str, message: &str) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = AuditEvent {
        at_epoch_secs: now_epoch_secs()?,
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = audit_log_path(paths);
    maybe_rotate_log(&path);

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

fn maybe_rotate_log(path: &Path) {
    if let Ok(meta) = fs::metadata(path)
        && meta.len() >= MAX_AUDIT_LOG_SIZE
    {
        let backup = format!("{}.1", path.display());
        let _ = fs::rename(path, backup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::paths::BudgetPaths;
    use tempfile::tempdir;

    #[test]
    fn append_event_writes_one_json_line_per_call() {
        let tmp = tempdir().expect("tempdir");
        let paths = BudgetPaths::rooted_at(tmp.path());
        append_event(&paths, "backup", "ok", "wrote conversation_1.json").expect("append");
        append_event(&paths, "summary", "failed", "timeout").expect("append");

        let raw = fs::read_to_string(audit_log_path(&paths)).expect("read audit");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("json line");
        assert_eq!(second["phase"], "summary");
        assert_eq!(second["status"], "failed");
    }
}
