use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
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
        fs::create_dir_all(&layout.project).expect("mkdir project");
        fs::create_dir_all(&layout.home).expect("mkdir home");
        fs::create_dir_all(&layout.transcripts).expect("mkdir transcripts");
        layout
    }

    fn ledger_file(&self) -> PathBuf {
        self.home.join(".claude/sessions/token-usage.json")
    }

    fn recovery_dir(&self) -> PathBuf {
        self.project.join(".claude/recovery")
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

    fn write_transcript(&self, session: &str, input_tokens: u64, output_tokens: u64) -> PathBuf {
        let path = self.transcripts.join(format!("{session}.jsonl"));
        let lines = [
            serde_json::json!({
                "type": "user",
                "timestamp": "2025-01-01T00:00:00Z",
                "message": {"content": "refactor the parser"}
            }),
            serde_json::json!({"type":"assistant","timestamp":"2025-01-01T00:01:00Z","message":{
                "content":[{"type":"text","text":"working on it"}],
                "usage": {
                    "input_tokens": input_tokens,
                    "output_tokens": output_tokens,
                    "cache_read_input_tokens": 0
                }
            }}),
        ];
        let body: Vec<String> = lines.iter().map(Value::to_string).collect();
        fs::write(&path, body.join("\n")).expect("write transcript");
        path
    }

    fn payload(&self, session: &str, transcript: &Path) -> String {
        serde_json::json!({
            "session_id": session,
            "transcript_path": transcript.display().to_string(),
            "cwd": self.project.display().to_string(),
            "hook_event_name": "PostToolUse",
            "tool_name": "Bash"
        })
        .to_string()
    }
}

fn write_fake_summarizer(bin_path: &Path) {
    let script = "#!/usr/bin/env bash\ncat > /dev/null\necho '{\"type\":\"result\",\"result\":\"# Summary\\n- parser refactor in progress\"}'\n";
    fs::write(bin_path, script).expect("write fake summarizer");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(bin_path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(bin_path, perms).expect("chmod");
    }
}

fn read_json(path: &Path) -> Value {
    let raw = fs::read_to_string(path).expect("read json");
    serde_json::from_str(&raw).expect("parse json")
}

fn wait_for_terminal_progress(path: &Path) -> Value {
    for _ in 0..150 {
        if let Ok(raw) = fs::read_to_string(path)
            && let Ok(value) = serde_json::from_str::<Value>(&raw)
            && value["status"] != "running"
        {
            return value;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("worker did not finish: {}", path.display());
}

#[test]
fn warning_band_prints_advisory_without_worker() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    let transcript = layout.write_transcript("sess-a", 158_000, 2_000);

    layout
        .cmd()
        .arg("extract")
        .write_stdin(layout.payload("sess-a", &transcript))
        .assert()
        .success()
        .stderr(contains("WARNING: Session tokens 160,000/180,000 (88%)"));

    let ledger = read_json(&layout.ledger_file());
    assert_eq!(ledger["current_session_id"], "sess-a");
    assert_eq!(ledger["sessions"]["sess-a"]["tokens"], 160_000);
    assert_eq!(ledger["sessions"]["sess-a"]["status"], "active");
    assert!(!layout.recovery_dir().join("compact-status.json").exists());
    assert!(!layout.recovery_dir().join("auto-compact.pid").exists());
}

#[test]
#[cfg(not(windows))]
fn critical_crossing_blocks_and_launches_worker_once() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    let fake = tmp.path().join("fake-claude");
    write_fake_summarizer(&fake);
    let transcript = layout.write_transcript("sess-b", 180_000, 5_000);

    layout
        .cmd()
        .env("CTX_BUDGET_SUMMARY_COMMAND", &fake)
        .arg("extract")
        .write_stdin(layout.payload("sess-b", &transcript))
        .assert()
        .code(2)
        .stderr(
            contains("CRITICAL: Session tokens 185,000/180,000 exceeded")
                .and(contains("started in the background")),
        );

    let progress_file = layout.recovery_dir().join("compact-status.json");
    assert!(progress_file.exists(), "launcher must create the progress record");
    let progress = wait_for_terminal_progress(&progress_file);
    assert_eq!(progress["status"], "completed");
    assert_eq!(progress["progress"], 100);
    assert!(!layout.recovery_dir().join("auto-compact.pid").exists());

    let recovery = read_json(&layout.recovery_dir().join("compact-recovery.json"));
    assert!(
        recovery["summary"]
            .as_str()
            .is_some_and(|s| s.contains("parser refactor"))
    );
    assert_eq!(recovery["recovered"], false);
    assert_eq!(read_json(&layout.ledger_file())["critical_latched"], true);

    // Still critical: blocked again, but no second worker.
    layout
        .cmd()
        .env("CTX_BUDGET_SUMMARY_COMMAND", &fake)
        .arg("extract")
        .write_stdin(layout.payload("sess-b", &transcript))
        .assert()
        .code(2)
        .stderr(contains("already triggered").and(contains("started in the background").not()));
    assert_eq!(read_json(&progress_file)["status"], "completed");
}

#[test]
fn manual_mode_prints_instructions_instead_of_launching() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    let transcript = layout.write_transcript("sess-c", 185_000, 0);

    layout
        .cmd()
        .env("CTX_BUDGET_AUTO_COMPACT_ON_THRESHOLD", "false")
        .arg("extract")
        .write_stdin(layout.payload("sess-c", &transcript))
        .assert()
        .code(2)
        .stderr(contains("ACTION REQUIRED"));
    assert!(!layout.recovery_dir().join("compact-status.json").exists());
}

#[test]
fn host_auto_compact_moves_auto_stop_to_total() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    fs::write(
        layout.home.join(".claude.json"),
        "{ autoCompactEnabled: true, // host managed\n}",
    )
    .expect("write host settings");
    let transcript = layout.write_transcript("sess-d", 185_000, 0);

    // 185k is over the session critical but total (critical 500k) is primary.
    layout
        .cmd()
        .arg("extract")
        .write_stdin(layout.payload("sess-d", &transcript))
        .assert()
        .success();
    assert!(!layout.recovery_dir().join("compact-status.json").exists());
}

#[test]
fn rollover_accumulates_and_auto_reset_notices() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());
    let first = layout.write_transcript("sess-1", 100_000, 0);
    let second = layout.write_transcript("sess-2", 60_000, 0);

    layout
        .cmd()
        .env("CTX_BUDGET_AUTO_RESET_THRESHOLD", "150000")
        .arg("extract")
        .write_stdin(layout.payload("sess-1", &first))
        .assert()
        .success();

    layout
        .cmd()
        .env("CTX_BUDGET_AUTO_RESET_THRESHOLD", "150000")
        .arg("extract")
        .write_stdin(layout.payload("sess-2", &second))
        .assert()
        .success()
        .stderr(contains("AUTO RESET"));

    let ledger = read_json(&layout.ledger_file());
    assert_eq!(ledger["sessions"]["sess-1"]["status"], "compacted");
    assert_eq!(ledger["sessions"]["sess-2"]["status"], "active");
    assert_eq!(ledger["total_accumulated"], 0);
    assert_eq!(ledger["reset_count"], 1);
}

#[test]
fn malformed_stdin_fails_open() {
    let tmp = tempdir().expect("tempdir");
    let layout = Layout::new(tmp.path());

    layout
        .cmd()
        .arg("extract")
        .write_stdin("{not json")
        .assert()
        .success()
        .stdout(predicates::str::is_empty());
}
