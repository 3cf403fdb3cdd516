pub mod backups;
pub mod check_continuity;
pub mod compact;
pub mod compact_worker;
pub mod extract;
pub mod guard;
pub mod progress;
pub mod reset;
pub mod session_start;
pub mod status;

use crate::budget::config::{BudgetConfig, load_config_or_default};
use crate::budget::paths::{BudgetPaths, resolve_paths};
use crate::hook::HookOutcome;
use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

/// Run a hook body and map it onto the hook contract. Internal errors are
/// logged and the hook exits 0 so a broken budget subsystem never blocks
/// interactive use.
pub fn run_hook(
    name: &str,
    body: impl FnOnce(&BudgetPaths, &BudgetConfig) -> Result<HookOutcome>,
) -> i32 {
    let paths = match resolve_paths() {
        Ok(paths) => paths,
        Err(err) => {
            eprintln!("{name}: {err:#}");
            return 0;
        }
    };
    crate::logging::init(&paths);
    let cfg = load_config_or_default(&paths);

    match body(&paths, &cfg) {
        Ok(outcome) => outcome.emit(),
        Err(err) => {
            tracing::warn!(hook = name, error = %format!("{err:#}"), "hook failed open");
            0
        }
    }
}
