use anyhow::Result;

use crate::budget::config::{load_config, load_config_or_default};
use crate::budget::ledger;
use crate::budget::paths::resolve_paths;
use crate::budget::progress;
use crate::budget::thresholds::{Metric, ThresholdPolicy};
use crate::budget::util::format_thousands;
use crate::commands::CommandReport;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    let cfg = match load_config(&paths) {
        Ok(cfg) => cfg,
        Err(err) => {
            report.issue(format!("invalid config ({}): {err:#}", paths.config_file.display()));
            load_config_or_default(&paths)
        }
    };
    let policy = ThresholdPolicy::from_config(&cfg);
    let ledger = ledger::load(&paths.ledger_file)?;

    report.detail(format!("project_root={}", paths.project_root.display()));
    report.detail(format!("claude_home={}", paths.claude_home.display()));
    report.detail(format!("ledger_file={}", paths.ledger_file.display()));
    report.detail(format!("recovery_dir={}", paths.recovery_dir.display()));
    report.detail(format!("backups_dir={}", paths.backups_dir.display()));
    report.detail(format!("limits.enabled={}", cfg.limits.enabled));
    report.detail(format!("host.auto_compact={}", cfg.host_auto_compact));
    report.detail(format!("store.backend={}", cfg.store.backend.label()));
    report.detail(format!(
        "session_id={}",
        ledger.current_session_id.as_deref().unwrap_or("none")
    ));

    let session = policy.evaluate_metric(Metric::Session, ledger.current_tokens());
    let total = policy.evaluate_metric(Metric::Total, ledger.effective_total());
    for eval in [&session, &total] {
        report.detail(format!(
            "{}: {}/{} ({}%) warning={} auto_stop={} state={}",
            eval.metric.label(),
            format_thousands(eval.value),
            format_thousands(eval.limits.critical),
            eval.percent_of_critical(),
            format_thousands(eval.limits.warning),
            eval.limits.auto_stop,
            eval.state.label()
        ));
    }
    report.detail(format!("primary_metric={}", policy.primary().label()));
    report.detail(format!(
        "total_accumulated={}",
        format_thousands(ledger.total_accumulated)
    ));
    report.detail(format!("reset_count={}", ledger.reset_count));
    if let Some(at) = ledger.last_reset {
        report.detail(format!("last_reset={}", at.to_rfc3339()));
    }
    report.detail(format!("critical_latched={}", ledger.critical_latched));
    let active = ledger.active_count();
    report.detail(format!("active_sessions={active}"));
    if active > 1 {
        report.issue(format!("ledger has {active} active sessions; expected at most one"));
    }

    match progress::read_progress(&paths.progress_file) {
        Some(record) => report.detail(format!(
            "compaction: status={:?} stage={} progress={}% pid={}",
            record.status,
            record.stage.label(),
            record.progress,
            record.pid
        )),
        None => report.detail("compaction: idle"),
    }
    if let Some(record) = progress::read_pid_record(&paths.pid_file) {
        let live = progress::live_worker_pid(&paths).is_some();
        let build = match record.build_uuid.as_str() {
            "" => "unknown",
            uuid => uuid,
        };
        report.detail(format!("worker: pid={} build={build} live={live}", record.pid));
        if !live {
            report.detail(format!("stale pid file (pid {})", record.pid));
        }
    }

    Ok(report)
}
