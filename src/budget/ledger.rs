use crate::budget::paths::BudgetPaths;
use crate::budget::util::{now_epoch_secs, write_json_atomic};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Compacted,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub tokens: u64,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(alias = "updated")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenLedger {
    #[serde(alias = "current_session")]
    pub current_session_id: Option<String>,
    pub sessions: BTreeMap<String, SessionRecord>,
    pub total_accumulated: u64,
    pub last_reset: Option<DateTime<Utc>>,
    pub reset_count: u64,
    /// Set once a compaction has been launched for the current critical
    /// crossing; cleared when the primary metric falls below critical.
    pub critical_latched: bool,
}

impl Default for TokenLedger {
    fn default() -> Self {
        Self {
            current_session_id: None,
            sessions: BTreeMap::new(),
            total_accumulated: 0,
            last_reset: None,
            reset_count: 0,
            critical_latched: false,
        }
    }
}

/// What `record_sample` did to the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleUpdate {
    pub rolled_over: Vec<(String, u64)>,
}

impl TokenLedger {
    /// Tokens of the active session, zero when none is tracked.
    pub fn current_tokens(&self) -> u64 {
        self.current_session_id
            .as_deref()
            .and_then(|id| self.sessions.get(id))
            .filter(|r| r.status == SessionStatus::Active)
            .map(|r| r.tokens)
            .unwrap_or(0)
    }

    /// Cumulative consumption including the still-active session.
    pub fn effective_total(&self) -> u64 {
        self.total_accumulated.saturating_add(self.current_tokens())
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|r| r.status == SessionStatus::Active)
            .count()
    }

    /// Record the latest per-turn sample for `session_id`. Any other active
    /// session is closed out and its tokens rolled into the total, keeping at
    /// most one active record.
    pub fn record_sample(
        &mut self,
        session_id: &str,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> SampleUpdate {
        let mut update = SampleUpdate::default();
        for (id, record) in self.sessions.iter_mut() {
            if id != session_id && record.status == SessionStatus::Active {
                record.status = SessionStatus::Compacted;
                record.updated_at = now;
                self.total_accumulated = self.total_accumulated.saturating_add(record.tokens);
                update.rolled_over.push((id.clone(), record.tokens));
            }
        }

        let record = self
            .sessions
            .entry(session_id.to_string())
            .or_insert(SessionRecord {
                tokens: 0,
                status: SessionStatus::Active,
                updated_at: now,
            });
        record.tokens = tokens;
        record.status = SessionStatus::Active;
        record.updated_at = now;
        self.current_session_id = Some(session_id.to_string());
        update
    }

    /// Zero the cumulative total once it reaches `threshold`. Returns `true`
    /// when a reset happened.
    pub fn apply_auto_reset(&mut self, threshold: u64, now: DateTime<Utc>) -> bool {
        if threshold == 0 || self.effective_total() < threshold {
            return false;
        }
        self.total_accumulated = 0;
        self.reset_count = self.reset_count.saturating_add(1);
        self.last_reset = Some(now);
        true
    }

    /// Manual reset: archive (or drop) every record and zero the total.
    pub fn reset(&mut self, delete_sessions: bool, now: DateTime<Utc>) {
        if delete_sessions {
            self.sessions.clear();
            self.current_session_id = None;
        } else {
            for record in self.sessions.values_mut() {
                if record.status != SessionStatus::Archived {
                    record.status = SessionStatus::Archived;
                    record.updated_at = now;
                }
            }
        }
        self.total_accumulated = 0;
        self.reset_count = self.reset_count.saturating_add(1);
        self.last_reset = Some(now);
        self.critical_latched = false;
    }

    /// Reset applied when a new session starts. `reset_count` is kept: it
    /// counts budget resets, not session boundaries.
    pub fn start_fresh(&mut self, now: DateTime<Utc>) {
        for record in self.sessions.values_mut() {
            if record.status != SessionStatus::Archived {
                record.status = SessionStatus::Archived;
                record.updated_at = now;
            }
        }
        self.current_session_id = None;
        self.total_accumulated = 0;
        self.last_reset = Some(now);
        self.critical_latched = false;
    }
}

pub fn load(path: &Path) -> Result<TokenLedger> {
    if !path.exists() {
        return Ok(TokenLedger::default());
    }

    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(TokenLedger::default());
    }

    match serde_json::from_str::<TokenLedger>(&raw) {
        Ok(ledger) => Ok(ledger),
        Err(err) => {
            let timestamp = now_epoch_secs().unwrap_or(0);
            let backup_path = path.with_extension(format!("json.corrupt.{timestamp}"));
            let _ = fs::write(&backup_path, &raw);

            crate::budget::warn::emit(crate::budget::warn::WarnEvent {
                code: crate::error::BudgetErrorCode::E006LedgerCorrupt.as_str(),
                stage: "ledger",
                action: "load-ledger",
                session: "na",
                artifact: &backup_path.display().to_string(),
                source: &path.display().to_string(),
                retry: "started-fresh",
                reason: "json-parse-failed",
                err: &format!("{err:#}"),
            });
            Ok(TokenLedger::default())
        }
    }
}

pub fn save(path: &Path, ledger: &TokenLedger) -> Result<()> {
    write_json_atomic(path, ledger)
}

fn lock_path(ledger_file: &Path) -> PathBuf {
    ledger_file.with_extension("json.lock")
}

/// Run `update` against the ledger under a non-blocking exclusive lock and
/// persist the result. Returns `Ok(None)` without touching the ledger when
/// another process holds the lock.
pub fn with_ledger<T>(
    paths: &BudgetPaths,
    update: impl FnOnce(&mut TokenLedger) -> Result<T>,
) -> Result<Option<T>> {
    let file = &paths.ledger_file;
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let lock_file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(file))
        .with_context(|| format!("failed to open ledger lock for {}", file.display()))?;
    if lock_file.try_lock_exclusive().is_err() {
        tracing::debug!(ledger = %file.display(), "ledger locked by another hook; skipping");
        return Ok(None);
    }

    let mut ledger = load(file)?;
    let out = update(&mut ledger);
    let result = match out {
        Ok(value) => save(file, &ledger).map(|()| Some(value)),
        Err(err) => Err(err),
    };
    let _ = fs2::FileExt::unlock(&lock_file);
    result
}
