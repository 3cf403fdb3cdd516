use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

pub const PROGRESS_FILE: &str = "compact-status.json";
pub const PID_FILE: &str = "auto-compact.pid";
pub const RECOVERY_FILE: &str = "compact-recovery.json";
pub const LEDGER_FILE: &str = "token-usage.json";

#[derive(Debug, Clone)]
pub struct BudgetPaths {
    pub project_root: PathBuf,
    pub claude_home: PathBuf,
    pub ledger_file: PathBuf,
    pub recovery_dir: PathBuf,
    pub progress_file: PathBuf,
    pub pid_file: PathBuf,
    pub recovery_file: PathBuf,
    pub backups_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub host_settings_file: PathBuf,
    pub config_file: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

/// Nearest ancestor of `start` holding both `.claude/` and `.git/`.
fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".claude").is_dir() && dir.join(".git").exists())
        .map(Path::to_path_buf)
}

fn project_root_from_inputs(project_dir_env: Option<&str>, cwd: &Path) -> PathBuf {
    match project_dir_env {
        Some(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => find_project_root(cwd).unwrap_or_else(|| cwd.to_path_buf()),
    }
}

/// Directory name the host uses for a project's transcripts:
/// `/home/alice/repo` -> `-home-alice-repo`.
pub fn transcript_dir_name(project_root: &Path) -> String {
    project_root.to_string_lossy().replace(['/', '\\'], "-")
}

pub fn resolve_paths() -> Result<BudgetPaths> {
    let home = required_home_dir()?;
    let cwd = env::current_dir().context("failed to resolve current working directory")?;
    let project_env = env::var("CLAUDE_PROJECT_DIR").ok();
    let project_root = project_root_from_inputs(project_env.as_deref(), &cwd);

    let claude_home = env_or_default_path("CTX_BUDGET_CLAUDE_HOME", home.join(".claude"));
    let ledger_file = env_or_default_path(
        "CTX_BUDGET_LEDGER_FILE",
        claude_home.join("sessions").join(LEDGER_FILE),
    );
    let recovery_dir = env_or_default_path(
        "CTX_BUDGET_RECOVERY_DIR",
        project_root.join(".claude").join("recovery"),
    );
    let backups_dir = env_or_default_path(
        "CTX_BUDGET_BACKUPS_DIR",
        project_root.join(".claude").join("backups"),
    );
    let logs_dir = env_or_default_path(
        "CTX_BUDGET_LOGS_DIR",
        project_root.join(".claude").join("logs"),
    );
    let transcripts_dir = env_or_default_path(
        "CTX_BUDGET_TRANSCRIPTS_DIR",
        claude_home
            .join("projects")
            .join(transcript_dir_name(&project_root)),
    );
    let host_settings_file =
        env_or_default_path("CTX_BUDGET_HOST_SETTINGS", home.join(".claude.json"));
    let config_file = env_or_default_path(
        "CTX_BUDGET_CONFIG_PATH",
        project_root
            .join(".claude")
            .join("config")
            .join("ctx-budget.toml"),
    );

    Ok(BudgetPaths {
        progress_file: recovery_dir.join(PROGRESS_FILE),
        pid_file: recovery_dir.join(PID_FILE),
        recovery_file: recovery_dir.join(RECOVERY_FILE),
        project_root,
        claude_home,
        ledger_file,
        recovery_dir,
        backups_dir,
        logs_dir,
        transcripts_dir,
        host_settings_file,
        config_file,
    })
}

impl BudgetPaths {
    /// Every location under one directory. Used by unit tests so they never
    /// touch the real home directory.
    #[cfg(test)]
    pub fn rooted_at(root: &Path) -> Self {
        let recovery_dir = root.join(".claude/recovery");
        Self {
            project_root: root.to_path_buf(),
            claude_home: root.join("home/.claude"),
            ledger_file: root.join("home/.claude/sessions").join(LEDGER_FILE),
            progress_file: recovery_dir.join(PROGRESS_FILE),
            pid_file: recovery_dir.join(PID_FILE),
            recovery_file: recovery_dir.join(RECOVERY_FILE),
            recovery_dir,
            backups_dir: root.join(".claude/backups"),
            logs_dir: root.join(".claude/logs"),
            transcripts_dir: root.join("home/.claude/projects/test"),
            host_settings_file: root.join("home/.claude.json"),
            config_file: root.join(".claude/config/ctx-budget.toml"),
        }
    }
}
