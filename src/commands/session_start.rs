use anyhow::Result;
use chrono::Utc;
use std::time::SystemTime;

use crate::budget::config::BudgetConfig;
use crate::budget::continuity::{self, Continuity};
use crate::budget::ledger;
use crate::budget::paths::BudgetPaths;
use crate::budget::poller;
use crate::budget::recovery::{self, RecoveryCoordinator, RecoveryOutcome};
use crate::budget::transcript;
use crate::commands::run_hook;
use crate::hook::{HookInput, HookOutcome, read_hook_input};

/// SessionStart: decide continuity, reap finished progress records, restore
/// context for a new session, then start the ledger fresh.
pub fn run() -> i32 {
    run_hook("session-start", |paths, cfg| {
        let input = read_hook_input();
        start(paths, cfg, &input)
    })
}

pub fn start(paths: &BudgetPaths, cfg: &BudgetConfig, input: &HookInput) -> Result<HookOutcome> {
    let last_session = ledger::load(&paths.ledger_file)?.current_session_id;
    let transcript = transcript::locate_transcript(
        &paths.transcripts_dir,
        input.transcript_path.as_deref(),
        input.session_id.as_deref(),
    );
    let continuity = continuity::detect(
        transcript.as_deref(),
        input.session_id.as_deref(),
        last_session.as_deref(),
        &cfg.continuity,
        SystemTime::now(),
    );
    tracing::info!(
        continued = continuity.is_continued(),
        reason = continuity.reason(),
        "session continuity decided"
    );

    if poller::reap(paths) {
        tracing::info!("reaped finished compaction progress");
    }

    if let Continuity::Continued(_) = continuity {
        return Ok(HookOutcome::Silent);
    }

    let now = Utc::now();
    let outcome = match RecoveryCoordinator::new(paths, &cfg.recovery).run(now) {
        RecoveryOutcome::Applied(state) => {
            tracing::info!(chars = state.summary_length, "recovery summary applied");
            HookOutcome::Context(recovery::render_applied(&state))
        }
        RecoveryOutcome::Hint {
            reason,
            backup,
            collection,
        } => HookOutcome::Context(recovery::render_hint(&reason, &backup, collection.as_deref())),
        RecoveryOutcome::Nothing => HookOutcome::Silent,
    };

    if ledger::with_ledger(paths, |l| {
        l.start_fresh(now);
        Ok(())
    })?
    .is_none()
    {
        tracing::warn!("ledger locked; fresh start skipped");
    }
    Ok(outcome)
}
