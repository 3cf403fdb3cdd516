use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

struct Layout {
    project: PathBuf,
    home: PathBuf,
    transcripts: PathBuf,
}

impl Layout {
    fn new(root: &Path) -> Self {
        let layout = Self {
            project: root.join("project"),
            home: root.join("home"),
            transcripts: root.join("transcripts"),
        };
        fs::create_dir_all(layout.recovery_dir()).expect("mkdir recovery");
        fs::create_dir_all(&layout.home).expect("mkdir home");
        fs::create_dir_all(&layout.transcripts).expect("mkdir transcripts");
        layout
    }

    fn recovery_dir(&self) -> PathBuf {
        self.project.join(".claude/recovery")
    }

    fn progress_file(&self) -> PathBuf {
        self.recovery_dir().join("compact-status.json")
    }

    fn pid_file(&self) -> PathBuf {
        self.recovery_dir().join("auto-compact.pid")
    }

    fn recovery_file(&self) -> PathBuf {
        self.recovery_dir().join("compact-recovery.json")
    }

    fn ledger_file(&self) -> PathBuf {
        self.home.join(".claude/sessions/token-usage.json")
    }

    fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("ctx-budget");
        cmd.current_dir(&self.project)
            .env("HOME", &self.home)
            .env("CLAUDE_PROJECT_DIR", &self.project)
            .env("CTX_BUDGET_CLAUDE_HOME", self.home.join(".claude"))
            .env("CTX_BUDGET_HOST_SETTINGS", self.home.join(".claude.json"))
            .env("CTX_BUDGET_TRANSCRIPTS_DIR", &self.transcripts)
            .env_remove("CLAUDE_SESSION_ID")
            .env_remove("CTX_BUDGET_AUTO_COMPACT")
            .env_remove("CTX_BUDGET_CONFIG_PATH");
        cmd
    }

    fn write_progress(&self, pid: u32, status: &str, stage: &str, extra: Value) {
        let mut record = serde_json::json!({
            "pid": pid,
            "status": status,
            "stage": stage,
            "progress": 30,
            "message": "Backing up conversation",
            "started_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:05Z"
        });
        if let (Some(obj), Value::Object(extra)) = (record.as_object_mut(), extra) {
            obj.extend(extra);
        }
        fs::write(self.progress_file(), record.to_string()).expect("write progress");
    }

    fn write_ledger(&self, session: &str, tokens: u64) {
        fs::create_dir_all(self.home.join(".claude/sessions")).expect("mkdir sessions");
        let ledger = serde_json::json!({
            "current_session_id": session,
            "sessions": {
                session: {
                    "tokens": tokens,
                    "status": "active",
                    "updated_at": "2025-01-01T00:00:00Z"
                }
            },
            "total_accumulated": 0,
            "reset_count": 0
        });
        fs::write(self.ledger_file(), ledger.to_string()).expect("write ledger");
    }
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
}

fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().expect("spawn");
    let pid = child.id();
    child.wait().expect("wait");
    pid
}

fn hours_ago(hours: i64) -> String {
    (chrono::Utc::now() - chrono::Duration::hours(hours)).to_rfc3339()
}

#[test]
#[cfg(not(windows))]
fn progress_removes_stale_running_record_silently() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    let pid = dead_pid();
    layout.write_progress(pid, "running", "backup", Value::Null);
    fs::write(layout.pid_file(), format!("{pid}\n")).expect("write pid");

    layout
        .cmd()
        .arg("progress")
        .write_stdin("{}")
        .assert()
        .success()
        .stdout(predicates::str::is_empty())
        .stderr(predicates::str::is_empty());

    assert!(!layout.progress_file().exists());
    assert!(!layout.pid_file().exists());
}

#[test]
fn progress_shows_completion_banner_once() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    layout.write_progress(
        1,
        "completed",
        "cleanup",
        serde_json::json!({"progress": 100, "completed_at": "2025-01-01T00:01:00Z"}),
    );

    layout
        .cmd()
        .arg("progress")
        .write_stdin("{}")
        .assert()
        .success()
        .stdout(contains("Context compaction complete"))
        .stderr(contains("use /clear or start a new session"));

    layout
        .cmd()
        .arg("progress")
        .write_stdin("{}")
        .assert()
        .success()
        .stdout(predicates::str::is_empty());
}

#[test]
fn progress_reports_worker_error() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    layout.write_progress(
        1,
        "error",
        "summary",
        serde_json::json!({"error": "no transcript found to compact"}),
    );

    layout
        .cmd()
        .arg("progress")
        .write_stdin("{}")
        .assert()
        .success()
        .stdout(contains("Context compaction failed").and(contains("no transcript found")));
    assert!(!layout.progress_file().exists());
}

#[test]
fn session_start_applies_recovery_exactly_once() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    let state = serde_json::json!({
        "timestamp": hours_ago(2),
        "backup_file_ref": null,
        "summary": "# Summary\n- parser refactor half done",
        "summary_length": 37,
        "collection_ref": "session_summaries",
        "auto_compact_triggered": true,
        "recovered": false
    });
    fs::write(layout.recovery_file(), state.to_string()).expect("write state");
    layout.write_ledger("old-session", 120_000);

    layout
        .cmd()
        .arg("session-start")
        .write_stdin(
            r#"{"session_id":"new-session","hook_event_name":"SessionStart","source":"startup"}"#,
        )
        .assert()
        .success()
        .stdout(
            contains("IMPORTANT: The summary below is the official context for this session.")
                .and(contains("parser refactor half done")),
        );

    let persisted: Value = read_json(&layout.recovery_file());
    assert_eq!(persisted["recovered"], true);
    assert!(persisted["recovered_at"].is_string());

    let ledger: Value = read_json(&layout.ledger_file());
    assert_eq!(ledger["total_accumulated"], 0);
    assert!(ledger["current_session_id"].is_null());
    assert_eq!(ledger["sessions"]["old-session"]["status"], "archived");

    layout
        .cmd()
        .arg("session-start")
        .write_stdin(r#"{"session_id":"newer-session","hook_event_name":"SessionStart"}"#)
        .assert()
        .success()
        .stdout(contains("parser refactor half done").not());
}

#[test]
fn session_start_points_at_backup_when_state_is_stale() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    let backups = layout.project.join(".claude/backups");
    fs::create_dir_all(&backups).expect("mkdir backups");
    fs::write(backups.join("conversation_20250101_000000.json"), "{}").expect("write backup");
    let state = serde_json::json!({
        "timestamp": hours_ago(13),
        "summary": "too old to trust",
        "recovered": false
    });
    fs::write(layout.recovery_file(), state.to_string()).expect("write state");

    layout
        .cmd()
        .arg("session-start")
        .write_stdin(r#"{"session_id":"s2"}"#)
        .assert()
        .success()
        .stdout(
            contains("conversation_20250101_000000.json").and(contains("too old to trust").not()),
        );
}

#[test]
fn session_start_reaps_finished_progress() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    layout.write_progress(1, "completed", "cleanup", Value::Null);

    layout
        .cmd()
        .arg("session-start")
        .write_stdin("{}")
        .assert()
        .success();
    assert!(!layout.progress_file().exists());
}

#[test]
fn guard_blocks_tool_use_over_critical() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    layout.write_ledger("s1", 190_000);

    layout
        .cmd()
        .arg("guard")
        .write_stdin(r#"{"session_id":"s1","hook_event_name":"PreToolUse","tool_name":"Edit"}"#)
        .assert()
        .code(2)
        .stderr(contains("CRITICAL: Session tokens 190,000/180,000 exceeded"));

    let before = fs::read_to_string(layout.ledger_file()).expect("read");
    layout
        .cmd()
        .arg("guard")
        .write_stdin(r#"{"hook_event_name":"UserPromptSubmit","prompt":"continue"}"#)
        .assert()
        .success()
        .stdout(contains("\"decision\":\"block\""));
    let after = fs::read_to_string(layout.ledger_file()).expect("read");
    assert_eq!(before, after, "guard must not mutate the ledger");
}

#[test]
fn guard_allows_below_critical() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    layout.write_ledger("s1", 10_000);

    layout
        .cmd()
        .arg("guard")
        .write_stdin(r#"{"hook_event_name":"PreToolUse"}"#)
        .assert()
        .success()
        .stderr(predicates::str::is_empty());
}
