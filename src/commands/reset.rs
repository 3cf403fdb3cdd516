use anyhow::Result;
use chrono::Utc;

use crate::budget::ledger;
use crate::budget::paths::resolve_paths;
use crate::commands::CommandReport;

#[derive(Debug, Clone, Default)]
pub struct ResetOptions {
    pub delete_sessions: bool,
}

pub fn run(opts: &ResetOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("reset");

    let outcome = ledger::with_ledger(&paths, |l| {
        let sessions = l.sessions.len();
        l.reset(opts.delete_sessions, Utc::now());
        Ok((sessions, l.reset_count))
    })?;
    match outcome {
        Some((sessions, reset_count)) => {
            let verb = if opts.delete_sessions { "deleted" } else { "archived" };
            report.detail(format!("{verb} {sessions} session record(s)"));
            report.detail("total_accumulated=0");
            report.detail(format!("reset_count={reset_count}"));
        }
        None => report.issue(format!(
            "ledger is locked by another process ({})",
            paths.ledger_file.display()
        )),
    }
    Ok(report)
}
