use anyhow::Result;

use crate::budget::accountant::{DetachedLauncher, TriggerOutcome, launch_worker};
use crate::commands::run_hook;
use crate::hook::{HookOutcome, STDIN_TIMEOUT, read_stdin_with_timeout};

/// PreCompact, or run by hand: start a detached worker for the payload on
/// stdin. With no payload the worker compacts the newest transcript.
pub fn run() -> i32 {
    run_hook("compact", |paths, _cfg| -> Result<_> {
        let raw = read_stdin_with_timeout(STDIN_TIMEOUT);
        let payload = if raw.trim().is_empty() { "{}" } else { raw.as_str() };
        let launcher = DetachedLauncher::new(paths);
        let outcome = match launch_worker(paths, &launcher, payload) {
            TriggerOutcome::Launched(pid) => HookOutcome::Notice(format!(
                "Context compaction started in the background (pid {pid})."
            )),
            TriggerOutcome::AlreadyRunning(pid) => HookOutcome::Notice(format!(
                "Context compaction already running (pid {pid})."
            )),
            TriggerOutcome::LaunchFailed(err) => {
                HookOutcome::Notice(format!("Context compaction could not start: {err}"))
            }
            _ => HookOutcome::Silent,
        };
        Ok(outcome)
    })
}
