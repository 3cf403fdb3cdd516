use anyhow::Result;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::budget::config::load_config_or_default;
use crate::budget::continuity;
use crate::budget::ledger;
use crate::budget::paths::resolve_paths;
use crate::budget::transcript;
use crate::commands::CommandReport;

#[derive(Debug, Clone, Default)]
pub struct CheckContinuityOptions {
    pub transcript: Option<PathBuf>,
    pub session_id: Option<String>,
}

/// Returns the report and whether the session is a continuation.
pub fn run(opts: &CheckContinuityOptions) -> Result<(CommandReport, bool)> {
    let paths = resolve_paths()?;
    let cfg = load_config_or_default(&paths);
    let mut report = CommandReport::new("check-continuity");

    let last = ledger::load(&paths.ledger_file)?.current_session_id;
    let explicit = opts.transcript.as_ref().map(|p| p.display().to_string());
    let transcript = transcript::locate_transcript(
        &paths.transcripts_dir,
        explicit.as_deref(),
        opts.session_id.as_deref(),
    );
    let session_id = opts
        .session_id
        .clone()
        .or_else(|| transcript.as_deref().and_then(transcript::session_id_from_path));
    let decision = continuity::detect(
        transcript.as_deref(),
        session_id.as_deref(),
        last.as_deref(),
        &cfg.continuity,
        SystemTime::now(),
    );

    report.detail(format!(
        "transcript={}",
        transcript
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    ));
    report.detail(format!("last_session_id={}", last.as_deref().unwrap_or("none")));
    report.detail(format!(
        "decision={}",
        if decision.is_continued() { "continued" } else { "new" }
    ));
    report.detail(format!("reason={}", decision.reason()));
    Ok((report, decision.is_continued()))
}
