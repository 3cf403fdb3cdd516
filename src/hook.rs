use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{IsTerminal, Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub const STDIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload the host writes to a hook's stdin. Every field is optional:
/// missing or malformed input is an empty payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookInput {
    pub session_id: Option<String>,
    pub transcript_path: Option<String>,
    pub cwd: Option<String>,
    pub hook_event_name: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub prompt: Option<String>,
    pub source: Option<String>,
    pub trigger: Option<String>,
    pub git_branch: Option<String>,
}

impl HookInput {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    pub fn is_prompt_submit(&self) -> bool {
        self.hook_event_name.as_deref() == Some("UserPromptSubmit")
    }
}

/// Read all of stdin, giving up after `timeout`. An interactive terminal is
/// treated as no input.
pub fn read_stdin_with_timeout(timeout: Duration) -> String {
    if std::io::stdin().is_terminal() {
        return String::new();
    }
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = std::io::stdin().read_to_string(&mut buf);
        let _ = tx.send(buf);
    });
    rx.recv_timeout(timeout).unwrap_or_default()
}

pub fn read_hook_input() -> HookInput {
    HookInput::parse(&read_stdin_with_timeout(STDIN_TIMEOUT)).unwrap_or_default()
}

#[derive(Debug, Serialize)]
struct Decision<'a> {
    decision: &'static str,
    reason: &'a str,
}

/// What a hook process reports back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Silent,
    /// Plain stdout text, appended to the session context.
    Context(String),
    /// Stderr only, allow.
    Notice(String),
    /// Both streams, allow. For banners that must reach the user and the log.
    Announce(String),
    /// Stderr reason, exit 2.
    Block(String),
    /// Structured `{"decision":"block"}` object on stdout, exit 0.
    Decision(String),
}

impl HookOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Block(_) => 2,
            _ => 0,
        }
    }

    /// Write the outcome to the real streams and return the exit code.
    pub fn emit(&self) -> i32 {
        let mut stdout = std::io::stdout();
        let mut stderr = std::io::stderr();
        match self {
            Self::Silent => {}
            Self::Context(text) => {
                let _ = writeln!(stdout, "{}", text.trim_end());
            }
            Self::Notice(text) | Self::Block(text) => {
                let _ = writeln!(stderr, "{}", text.trim_end());
            }
            Self::Announce(text) => {
                let _ = writeln!(stdout, "{}", text.trim_end());
                let _ = writeln!(stderr, "{}", text.trim_end());
            }
            Self::Decision(reason) => {
                let decision = Decision {
                    decision: "block",
                    reason,
                };
                if let Ok(json) = serde_json::to_string(&decision) {
                    let _ = writeln!(stdout, "{json}");
                }
            }
        }
        let _ = stdout.flush();
        let _ = stderr.flush();
        self.exit_code()
    }
}
