use crate::budget::paths::BudgetPaths;
use crate::budget::progress::{self, CompactionProgress, CompactionStatus};
use crate::budget::util::pid_alive;
use crate::hook::HookOutcome;

const BAR_WIDTH: usize = 20;

fn bar(percent: u8) -> String {
    let filled = (usize::from(percent.min(100)) / 5).min(BAR_WIDTH);
    if filled >= BAR_WIDTH {
        return "=".repeat(BAR_WIDTH);
    }
    format!("{}>{}", "=".repeat(filled), ".".repeat(BAR_WIDTH - filled - 1))
}

pub fn render_running(record: &CompactionProgress) -> String {
    format!(
        "[context compaction] [{}] {}% {}: {}",
        bar(record.progress),
        record.progress,
        record.stage.label(),
        record.message
    )
}

pub fn render_completed(record: &CompactionProgress) -> String {
    let rule = "=".repeat(60);
    let mut out = format!("{rule}\nContext compaction complete\n");
    if !record.failed_stages.is_empty() {
        let stages: Vec<&str> = record.failed_stages.iter().map(|s| s.label()).collect();
        out.push_str(&format!("Degraded stages: {}\n", stages.join(", ")));
    }
    out.push_str(&format!("{rule}\n"));
    out.push_str("When you start the next session, you will see a condensed summary.\n");
    out.push_str("To end the current session, use /clear or start a new session.");
    out
}

pub fn render_error(record: &CompactionProgress) -> String {
    let rule = "=".repeat(60);
    format!(
        "{rule}\nContext compaction failed\nError: {}\n{rule}",
        record.error.as_deref().unwrap_or("unknown error")
    )
}

/// Observe the progress record once. Terminal records are rendered and then
/// deleted together with the PID file; a running record whose pid is gone is
/// deleted without output.
pub fn poll(paths: &BudgetPaths) -> HookOutcome {
    let Some(record) = progress::read_progress(&paths.progress_file) else {
        return HookOutcome::Silent;
    };

    let outcome = match record.status {
        CompactionStatus::Running if pid_alive(record.pid) => {
            return HookOutcome::Notice(render_running(&record));
        }
        CompactionStatus::Running => {
            tracing::info!(
                pid = record.pid,
                stage = record.stage.label(),
                "removing stale progress record"
            );
            HookOutcome::Silent
        }
        CompactionStatus::Completed => HookOutcome::Announce(render_completed(&record)),
        CompactionStatus::Error => HookOutcome::Announce(render_error(&record)),
    };

    if let Err(err) = progress::clear_all(paths) {
        tracing::warn!(error = %format!("{err:#}"), "failed to remove progress record");
    }
    outcome
}

/// Session-start variant: delete terminal or stale records without rendering.
/// Returns `true` when something was removed.
pub fn reap(paths: &BudgetPaths) -> bool {
    let Some(record) = progress::read_progress(&paths.progress_file) else {
        return false;
    };
    if !record.status.is_terminal() && pid_alive(record.pid) {
        return false;
    }
    match progress::clear_all(paths) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "failed to reap progress record");
            false
        }
    }
}
