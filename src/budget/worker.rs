use crate::budget::backup::{self, BackupArtifact, BackupInput, BackupMetadata};
use crate::budget::config::BudgetConfig;
use crate::budget::observer::Observer;
use crate::budget::paths::BudgetPaths;
use crate::budget::progress::{self, ProgressWriter, Stage};
use crate::budget::recovery::{self, RecoveryState, RecoveryStatistics};
use crate::budget::store::{self, DocumentStore};
use crate::budget::summarizer::{self, CliSummarizer, Summarizer};
use crate::budget::transcript::{self, ParsedTranscript, TranscriptStatistics};
use crate::budget::warn;
use crate::error::{BudgetError, BudgetErrorCode};
use crate::hook::HookInput;
use anyhow::{Result, anyhow};
use chrono::{Local, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

/// Stands in when the summarizer binary cannot be resolved, so the failure
/// degrades the summary stage instead of aborting the run.
struct UnavailableSummarizer(String);

impl Summarizer for UnavailableSummarizer {
    fn summarize(&self, _prompt: &str) -> Result<String> {
        Err(anyhow!("{}", self.0))
    }
}

struct UnavailableStore(String);

impl DocumentStore for UnavailableStore {
    fn label(&self) -> &'static str {
        "unavailable"
    }

    fn add(&self, _request: &store::StoreRequest) -> Result<()> {
        Err(BudgetError::StoreFailed(self.0.clone()).into())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    pub backup: Option<BackupArtifact>,
    pub pruned: usize,
    pub summary_chars: usize,
    pub failed_stages: Vec<Stage>,
    pub store_error: Option<String>,
}

enum Payload {
    Hook(HookInput),
    Raw(String),
}

fn classify(payload: &str) -> Payload {
    match serde_json::from_str::<serde_json::Value>(payload.trim()) {
        Ok(serde_json::Value::Object(_)) => {
            Payload::Hook(HookInput::parse(payload).unwrap_or_default())
        }
        _ => Payload::Raw(payload.to_string()),
    }
}

fn error_code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<BudgetError>()
        .map(|e| e.code().as_str())
        .unwrap_or(BudgetErrorCode::E007WorkerFailed.as_str())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

/// The detached compaction pipeline: init, backup, marker, summary, store,
/// cleanup. Degraded stages are recorded in `failed_stages`; only an
/// unhandled error ends the run in `error`.
pub struct CompactionWorker<'a> {
    paths: &'a BudgetPaths,
    cfg: &'a BudgetConfig,
    summarizer: Box<dyn Summarizer + 'a>,
    store: Option<Box<dyn DocumentStore + 'a>>,
    observer: Box<dyn Observer + 'a>,
}

impl<'a> CompactionWorker<'a> {
    pub fn new(
        paths: &'a BudgetPaths,
        cfg: &'a BudgetConfig,
        summarizer: Box<dyn Summarizer + 'a>,
        store: Option<Box<dyn DocumentStore + 'a>>,
        observer: Box<dyn Observer + 'a>,
    ) -> Self {
        Self {
            paths,
            cfg,
            summarizer,
            store,
            observer,
        }
    }

    pub fn from_config(
        paths: &'a BudgetPaths,
        cfg: &'a BudgetConfig,
        observer: Box<dyn Observer + 'a>,
    ) -> Self {
        let summarizer: Box<dyn Summarizer> = match CliSummarizer::from_config(&cfg.summary) {
            Ok(s) => Box::new(s),
            Err(err) => Box::new(UnavailableSummarizer(format!("{err:#}"))),
        };
        let store: Option<Box<dyn DocumentStore>> = match store::build_store(&cfg.store) {
            Ok(store) => store,
            Err(err) => Some(Box::new(UnavailableStore(format!("{err:#}")))),
        };
        Self::new(paths, cfg, summarizer, store, observer)
    }

    /// Run the pipeline under a panic guard. Any failure is written to the
    /// progress record and the PID file is removed before returning the exit
    /// code.
    pub fn run_guarded(&self, payload: &str) -> i32 {
        let pid = std::process::id();
        let begun = ProgressWriter::begin(&self.paths.progress_file, pid, Utc::now());
        let mut writer = match begun {
            Ok(writer) => writer,
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "cannot write progress record");
                let _ = progress::clear_pid_file(self.paths);
                return 1;
            }
        };

        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.run(payload, pid, &mut writer)));
        let err = match outcome {
            Ok(Ok(report)) => {
                tracing::info!(
                    summary_chars = report.summary_chars,
                    failed_stages = ?report.failed_stages,
                    "compaction completed"
                );
                return 0;
            }
            Ok(Err(err)) => err,
            Err(payload) => anyhow!(panic_message(payload)),
        };

        let msg = format!("{err:#}");
        warn::emit(warn::WarnEvent {
            code: BudgetErrorCode::E007WorkerFailed.as_str(),
            stage: writer.current().stage.label(),
            action: "compact",
            session: "na",
            artifact: &self.paths.progress_file.display().to_string(),
            source: "worker",
            retry: "none",
            reason: "unhandled-error",
            err: &msg,
        });
        self.observer.capture_error("worker", &err);
        if let Err(write_err) = writer.fail(&msg) {
            tracing::error!(error = %format!("{write_err:#}"), "cannot record worker failure");
        }
        if let Err(rm_err) = progress::clear_pid_file(self.paths) {
            tracing::error!(error = %format!("{rm_err:#}"), "cannot remove pid file");
        }
        1
    }

    fn degrade(
        &self,
        writer: &mut ProgressWriter,
        stage: Stage,
        session: &str,
        err: &anyhow::Error,
    ) {
        let msg = format!("{err:#}");
        warn::emit(warn::WarnEvent {
            code: error_code(err),
            stage: stage.label(),
            action: "compact",
            session,
            artifact: "na",
            source: "worker",
            retry: "continue",
            reason: "stage-degraded",
            err: &msg,
        });
        self.observer.capture_error(stage.label(), err);
        writer.mark_stage_failed(stage);
    }

    pub fn run(
        &self,
        payload: &str,
        pid: u32,
        writer: &mut ProgressWriter,
    ) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();

        // init
        progress::write_pid_record(self.paths, pid)?;
        writer.update(Stage::Init, 10, "Configuration loaded")?;
        self.observer.breadcrumb("init", &format!("worker {pid} started"));

        // backup
        writer.update(Stage::Backup, 20, "Backing up conversation")?;
        let now = Local::now();
        let input = classify(payload);
        let parsed: Option<(HookInput, ParsedTranscript, Option<PathBuf>)> = match &input {
            Payload::Hook(hook) => {
                let (transcript, path) = self.read_transcript(hook);
                Some((hook.clone(), transcript, path))
            }
            Payload::Raw(_) => None,
        };
        let statistics = parsed
            .as_ref()
            .map(|(_, t, _)| t.statistics())
            .unwrap_or_default();
        let metadata = match &parsed {
            Some((hook, t, path)) => BackupMetadata {
                timestamp: now.to_rfc3339(),
                session_id: hook
                    .session_id
                    .clone()
                    .or_else(|| path.as_deref().and_then(transcript::session_id_from_path))
                    .unwrap_or_else(|| "unknown".to_string()),
                transcript_path: path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .or_else(|| hook.transcript_path.clone()),
                cwd: hook.cwd.clone(),
                git_branch: hook
                    .git_branch
                    .clone()
                    .or_else(|| t.git_branch().map(ToOwned::to_owned)),
                hook_event_name: hook.hook_event_name.clone(),
                trigger: hook.trigger.clone(),
            },
            None => BackupMetadata {
                timestamp: now.to_rfc3339(),
                session_id: "unknown".to_string(),
                ..BackupMetadata::default()
            },
        };

        let backup_input = match (&input, &parsed) {
            (_, Some((_, t, _))) => Some(BackupInput::Parsed {
                metadata: &metadata,
                transcript: t,
                statistics: &statistics,
            }),
            (Payload::Raw(text), None) if !text.trim().is_empty() => Some(BackupInput::Raw(text)),
            _ => None,
        };
        if backup_input.is_none() {
            tracing::info!("empty payload; no conversation to back up");
        }
        if let Some(backup_input) = backup_input.filter(|_| self.cfg.backup.enabled) {
            let artifact =
                backup::write_backup(&self.paths.backups_dir, &self.cfg.backup, backup_input, now)?;
            self.observer
                .breadcrumb("backup", &format!("wrote {}", artifact.path.display()));
            match backup::prune_backups(&self.paths.backups_dir, self.cfg.backup.max_backups) {
                Ok(removed) => report.pruned = removed.len(),
                Err(err) => tracing::warn!(error = %format!("{err:#}"), "backup retention failed"),
            }
            report.backup = Some(artifact);
        }
        writer.update(Stage::Backup, 40, "Backup saved")?;

        // marker
        let recovery_stats = parsed.as_ref().map(|_| RecoveryStatistics::from(&statistics));
        let collection = self
            .store
            .as_ref()
            .map(|_| self.cfg.store.collection.as_str());
        let marker = RecoveryState::marker(
            Utc::now(),
            report.backup.as_ref().map(|a| a.path.as_path()),
            collection,
            recovery_stats,
        );
        if self.cfg.recovery.save_compact_state {
            recovery::write_state(&self.paths.recovery_file, &marker)?;
        }
        writer.update(Stage::Backup, 45, "Recovery marker written")?;

        // summary
        writer.update(Stage::Summary, 50, "Generating summary")?;
        let summary = match &parsed {
            None => {
                self.degrade(
                    writer,
                    Stage::Summary,
                    &metadata.session_id,
                    &anyhow!("payload was not JSON; nothing to summarize"),
                );
                String::new()
            }
            Some((_, t, _)) => self.summarize(t, &metadata, &statistics, writer),
        };
        report.summary_chars = summary.chars().count();
        writer.update(Stage::Summary, 70, "Summary stage finished")?;

        // store
        writer.update(Stage::Store, 80, "Storing summary")?;
        if let Some(store) = self.store.as_ref().filter(|_| !summary.is_empty()) {
            let request = store::build_request(
                &summary,
                &metadata,
                &statistics,
                &self.cfg.store,
                Local::now(),
            );
            match store.add(&request) {
                Ok(()) => self
                    .observer
                    .breadcrumb("store", &format!("stored summary via {}", store.label())),
                Err(err) => {
                    report.store_error = Some(format!("{err:#}"));
                    self.degrade(writer, Stage::Store, &metadata.session_id, &err);
                }
            }
        }
        writer.update(Stage::Store, 90, "Store stage finished")?;

        // cleanup
        writer.update(Stage::Cleanup, 95, "Saving recovery state")?;
        if self.cfg.recovery.save_compact_state {
            let mut state = marker.with_summary(&summary);
            state.store_error = report.store_error.clone();
            recovery::write_state(&self.paths.recovery_file, &state)?;
        }
        report.failed_stages = writer.current().failed_stages.clone();
        writer.complete("Context compaction complete")?;
        progress::clear_pid_file(self.paths)?;
        self.observer.breadcrumb("cleanup", "compaction complete");
        Ok(report)
    }

    /// Locate and parse the transcript named by the hook payload. A missing
    /// or unreadable transcript yields an empty conversation; the run goes on
    /// so the backup and the recovery marker are still written.
    fn read_transcript(&self, hook: &HookInput) -> (ParsedTranscript, Option<PathBuf>) {
        let session = hook.session_id.as_deref().unwrap_or("na");
        let Some(path) = transcript::locate_transcript(
            &self.paths.transcripts_dir,
            hook.transcript_path.as_deref(),
            hook.session_id.as_deref(),
        ) else {
            warn::emit(warn::WarnEvent {
                code: BudgetErrorCode::E007WorkerFailed.as_str(),
                stage: Stage::Backup.label(),
                action: "compact",
                session,
                artifact: hook.transcript_path.as_deref().unwrap_or("na"),
                source: "worker",
                retry: "continue",
                reason: "transcript-missing",
                err: "no transcript found to compact",
            });
            return (ParsedTranscript::default(), None);
        };
        match transcript::parse_transcript(&path) {
            Ok(parsed) => {
                if parsed.malformed_lines > 0 {
                    tracing::info!(
                        skipped = parsed.malformed_lines,
                        "skipped malformed transcript lines"
                    );
                }
                (parsed, Some(path))
            }
            Err(err) => {
                warn::emit(warn::WarnEvent {
                    code: BudgetErrorCode::E007WorkerFailed.as_str(),
                    stage: Stage::Backup.label(),
                    action: "compact",
                    session,
                    artifact: &path.display().to_string(),
                    source: "worker",
                    retry: "continue",
                    reason: "transcript-unreadable",
                    err: &format!("{err:#}"),
                });
                (ParsedTranscript::default(), Some(path))
            }
        }
    }

    fn summarize(
        &self,
        parsed: &ParsedTranscript,
        metadata: &BackupMetadata,
        statistics: &TranscriptStatistics,
        writer: &mut ProgressWriter,
    ) -> String {
        let prompt =
            summarizer::build_prompt(&parsed.messages, metadata, statistics, &self.cfg.summary);
        let Some(prompt) = prompt else {
            self.degrade(
                writer,
                Stage::Summary,
                &metadata.session_id,
                &anyhow!("transcript has no messages to summarize"),
            );
            return String::new();
        };
        match self.summarizer.summarize(&prompt) {
            Ok(text) => summarizer::clamp_summary(&text, self.cfg.summary.max_summary_chars),
            Err(err) => {
                self.degrade(writer, Stage::Summary, &metadata.session_id, &err);
                String::new()
            }
        }
    }
}
