use crate::budget::config::BudgetConfig;
use crate::budget::ledger::{self, TokenLedger};
use crate::budget::paths::BudgetPaths;
use crate::budget::progress::{self, CompactionProgress};
use crate::budget::thresholds::{
    BudgetState, Evaluation, Metric, ThresholdPolicy, evaluate_trigger,
};
use crate::budget::transcript;
use crate::budget::util::format_thousands;
use crate::hook::{HookInput, HookOutcome};
use anyhow::{Context, Result};
use chrono::Utc;
use std::io::Write;
use std::process::{Command, Stdio};

/// Starts a detached CompactionWorker. `on_spawn` runs with the child's pid
/// before the payload is delivered, so the liveness token and the initial
/// progress record exist before the worker can touch them.
pub trait WorkerLauncher {
    fn launch(
        &self,
        payload: &str,
        on_spawn: &mut dyn FnMut(u32) -> Result<()>,
    ) -> Result<u32>;
}

/// Re-executes this binary as `compact-worker` in its own process group with
/// null stdout/stderr.
pub struct DetachedLauncher<'a> {
    paths: &'a BudgetPaths,
}

impl<'a> DetachedLauncher<'a> {
    pub fn new(paths: &'a BudgetPaths) -> Self {
        Self { paths }
    }
}

impl WorkerLauncher for DetachedLauncher<'_> {
    fn launch(&self, payload: &str, on_spawn: &mut dyn FnMut(u32) -> Result<()>) -> Result<u32> {
        let exe = std::env::current_exe().context("failed to resolve current executable")?;
        let mut cmd = Command::new(exe);
        cmd.arg("compact-worker")
            .current_dir(&self.paths.project_root)
            .env("CLAUDE_PROJECT_DIR", &self.paths.project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().context("failed to spawn compaction worker")?;
        let pid = child.id();
        let registered = on_spawn(pid);

        if let Some(mut stdin) = child.stdin.take() {
            // The worker treats a closed, empty stdin as "no payload".
            let _ = stdin.write_all(payload.as_bytes());
        }
        registered?;
        Ok(pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    NotNeeded,
    Launched(u32),
    AlreadyRunning(u32),
    /// Already launched during this critical crossing.
    Latched,
    /// Compaction on critical is enabled but automatic launch is off.
    ManualRequired,
    /// `save_on_critical` is off.
    Disabled,
    LaunchFailed(String),
}

/// Launch a worker unless one is already alive. Writes the PID file and the
/// initial `init`/0% progress record for the new pid.
pub fn launch_worker(
    paths: &BudgetPaths,
    launcher: &dyn WorkerLauncher,
    payload: &str,
) -> TriggerOutcome {
    if let Some(pid) = progress::live_worker_pid(paths) {
        return TriggerOutcome::AlreadyRunning(pid);
    }
    let mut register = |pid: u32| -> Result<()> {
        progress::write_pid_record(paths, pid)?;
        progress::write_progress(
            &paths.progress_file,
            &CompactionProgress::started(pid, Utc::now()),
        )
    };
    match launcher.launch(payload, &mut register) {
        Ok(pid) => {
            tracing::info!(pid, "compaction worker launched");
            TriggerOutcome::Launched(pid)
        }
        Err(err) => {
            let msg = format!("{err:#}");
            tracing::warn!(error = %msg, "compaction worker launch failed");
            TriggerOutcome::LaunchFailed(msg)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub evaluation: Evaluation,
    pub trigger: TriggerOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractResult {
    Disabled,
    NoSample,
    /// Another hook holds the ledger lock; the sample was skipped.
    Skipped,
    Updated {
        session_id: String,
        tokens: u64,
        auto_reset: Option<u64>,
        check: CheckResult,
    },
}

pub struct TokenAccountant<'a> {
    paths: &'a BudgetPaths,
    cfg: &'a BudgetConfig,
    policy: ThresholdPolicy,
    launcher: &'a dyn WorkerLauncher,
}

impl<'a> TokenAccountant<'a> {
    pub fn new(
        paths: &'a BudgetPaths,
        cfg: &'a BudgetConfig,
        launcher: &'a dyn WorkerLauncher,
    ) -> Self {
        Self {
            paths,
            cfg,
            policy: ThresholdPolicy::from_config(cfg),
            launcher,
        }
    }

    pub fn evaluate(&self, ledger: &TokenLedger) -> Evaluation {
        self.policy
            .evaluate(ledger.current_tokens(), ledger.effective_total())
    }

    /// Evaluate the primary metric and, at a fresh critical crossing whose
    /// metric carries `auto_stop`, trigger compaction. Updates the latch.
    pub fn check(&self, ledger: &mut TokenLedger, payload: &str) -> CheckResult {
        let evaluation = self.evaluate(ledger);
        let decision = evaluate_trigger(&evaluation, ledger.critical_latched);
        if decision.clear_latch {
            ledger.critical_latched = false;
        }
        if !decision.should_trigger {
            let trigger = if evaluation.state == BudgetState::Critical && ledger.critical_latched {
                TriggerOutcome::Latched
            } else {
                TriggerOutcome::NotNeeded
            };
            return CheckResult {
                evaluation,
                trigger,
            };
        }

        let trigger = if !self.cfg.compaction.save_on_critical {
            TriggerOutcome::Disabled
        } else if !self.cfg.compaction.auto_compact_on_threshold {
            TriggerOutcome::ManualRequired
        } else {
            launch_worker(self.paths, self.launcher, payload)
        };
        if decision.set_latch
            && matches!(
                trigger,
                TriggerOutcome::Launched(_) | TriggerOutcome::AlreadyRunning(_)
            )
        {
            ledger.critical_latched = true;
        }
        CheckResult {
            evaluation,
            trigger,
        }
    }

    /// Record the newest per-turn sample, apply auto-reset, then `check`.
    /// A launched worker receives the hook input with the resolved session
    /// id and transcript path filled in.
    pub fn extract(&self, input: &HookInput) -> Result<ExtractResult> {
        if !self.cfg.limits.enabled {
            return Ok(ExtractResult::Disabled);
        }
        let Some(path) = transcript::locate_transcript(
            &self.paths.transcripts_dir,
            input.transcript_path.as_deref(),
            input.session_id.as_deref(),
        ) else {
            return Ok(ExtractResult::NoSample);
        };
        let Some(usage) = transcript::latest_usage(&path)? else {
            return Ok(ExtractResult::NoSample);
        };
        let session_id = input
            .session_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| transcript::session_id_from_path(&path))
            .unwrap_or_else(|| "unknown".to_string());
        let tokens = usage.context_tokens();
        let auto_reset = self.policy.auto_reset;
        let resolved = HookInput {
            session_id: Some(session_id.clone()),
            transcript_path: Some(path.display().to_string()),
            ..input.clone()
        };
        let payload =
            serde_json::to_string(&resolved).context("failed to encode worker payload")?;

        let outcome = ledger::with_ledger(self.paths, |ledger| {
            let now = Utc::now();
            let update = ledger.record_sample(&session_id, tokens, now);
            for (old, old_tokens) in &update.rolled_over {
                tracing::info!(
                    session = %old,
                    tokens = old_tokens,
                    "session closed out into total"
                );
            }
            let reset = if auto_reset.enabled
                && ledger.apply_auto_reset(auto_reset.threshold, now)
            {
                tracing::info!(reset_count = ledger.reset_count, "total auto-reset");
                Some(ledger.reset_count)
            } else {
                None
            };
            let check = self.check(ledger, &payload);
            Ok((reset, check))
        })?;

        Ok(match outcome {
            None => ExtractResult::Skipped,
            Some((auto_reset, check)) => ExtractResult::Updated {
                session_id,
                tokens,
                auto_reset,
                check,
            },
        })
    }

    /// Check-only evaluation for PreToolUse: never mutates the ledger.
    pub fn guard(&self, input: &HookInput) -> Result<HookOutcome> {
        if !self.cfg.limits.enabled {
            return Ok(HookOutcome::Silent);
        }
        let ledger = ledger::load(&self.paths.ledger_file)?;
        let evaluation = self.evaluate(&ledger);
        let outcome = match evaluation.state {
            BudgetState::Critical
                if evaluation.limits.auto_stop && self.cfg.limits.block_on_critical =>
            {
                let reason = format!(
                    "{}\nWork is suspended until context is compacted: \
                     use /clear or start a new session.",
                    critical_line(&evaluation)
                );
                if input.is_prompt_submit() {
                    HookOutcome::Decision(reason)
                } else {
                    HookOutcome::Block(reason)
                }
            }
            BudgetState::Critical => HookOutcome::Notice(critical_line(&evaluation)),
            BudgetState::Warning => HookOutcome::Notice(warning_line(&evaluation)),
            BudgetState::Normal => HookOutcome::Silent,
        };
        Ok(outcome)
    }

    /// Render an `extract` result onto the hook contract.
    pub fn render(&self, result: &ExtractResult) -> HookOutcome {
        let ExtractResult::Updated {
            tokens,
            auto_reset,
            check,
            ..
        } = result
        else {
            return HookOutcome::Silent;
        };

        let mut lines = Vec::new();
        if let Some(count) = auto_reset {
            lines.push(format!(
                "AUTO RESET: cumulative tokens reset at {} (reset count: {count})",
                format_thousands(self.policy.auto_reset.threshold)
            ));
        }

        let evaluation = &check.evaluation;
        match evaluation.state {
            BudgetState::Normal => {}
            BudgetState::Warning => lines.push(warning_line(evaluation)),
            BudgetState::Critical => {
                lines.push(critical_line(evaluation));
                match &check.trigger {
                    TriggerOutcome::Launched(pid) => {
                        lines.push(format!(
                            "Context compaction started in the background (pid {pid})."
                        ));
                        lines.push(
                            "After it completes, use /clear or start a new session.".to_string(),
                        );
                    }
                    TriggerOutcome::AlreadyRunning(pid) => lines.push(format!(
                        "Context compaction already running (pid {pid})."
                    )),
                    TriggerOutcome::Latched => lines.push(
                        "Context compaction was already triggered for this session.".to_string(),
                    ),
                    TriggerOutcome::ManualRequired => lines.push(
                        "ACTION REQUIRED: run `ctx-budget compact`, then /clear.".to_string(),
                    ),
                    TriggerOutcome::LaunchFailed(err) => {
                        lines.push(format!("Context compaction could not start: {err}"))
                    }
                    TriggerOutcome::Disabled | TriggerOutcome::NotNeeded => {}
                }
                if evaluation.limits.auto_stop && self.cfg.limits.block_on_critical {
                    lines.push(format!(
                        "Session stopped at {} tokens to prevent cost overrun.",
                        format_thousands(*tokens)
                    ));
                    return HookOutcome::Block(lines.join("\n"));
                }
            }
        }

        if lines.is_empty() {
            HookOutcome::Silent
        } else {
            HookOutcome::Notice(lines.join("\n"))
        }
    }
}

fn metric_label(evaluation: &Evaluation) -> &'static str {
    match evaluation.metric {
        Metric::Session => "Session",
        Metric::Total => "Total",
    }
}

pub fn warning_line(evaluation: &Evaluation) -> String {
    format!(
        "WARNING: {} tokens {}/{} ({}%)",
        metric_label(evaluation),
        format_thousands(evaluation.value),
        format_thousands(evaluation.limits.critical),
        evaluation.percent_of_critical()
    )
}

pub fn critical_line(evaluation: &Evaluation) -> String {
    format!(
        "CRITICAL: {} tokens {}/{} exceeded",
        metric_label(evaluation),
        format_thousands(evaluation.value),
        format_thousands(evaluation.limits.critical)
    )
}
