use crate::budget::paths::BudgetPaths;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricLimits {
    pub warning: u64,
    pub critical: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoResetConfig {
    pub enabled: bool,
    pub threshold: u64,
}

impl Default for AutoResetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 500_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub enabled: bool,
    pub block_on_critical: bool,
    pub session: MetricLimits,
    pub total: MetricLimits,
    pub auto_reset: AutoResetConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_on_critical: true,
            session: MetricLimits {
                warning: 150_000,
                critical: 180_000,
            },
            total: MetricLimits {
                warning: 400_000,
                critical: 500_000,
            },
            auto_reset: AutoResetConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub save_on_critical: bool,
    pub auto_compact_on_threshold: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            save_on_critical: true,
            auto_compact_on_threshold: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityConfig {
    pub min_lines: usize,
    pub min_age_secs: u64,
    pub marker_scan_lines: usize,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            min_lines: 5,
            min_age_secs: 30,
            marker_scan_lines: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub compress: bool,
    pub max_backups: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compress: false,
            max_backups: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub command: String,
    pub args: Vec<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub keep_recent_messages: usize,
    pub prompt_char_cap: usize,
    pub max_summary_chars: usize,
    pub focus_areas: Vec<String>,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            model: "claude-haiku-4-5".to_string(),
            timeout_secs: 180,
            keep_recent_messages: 10,
            prompt_char_cap: 60_000,
            max_summary_chars: 8_000,
            focus_areas: vec![
                "Work".to_string(),
                "Decision Items".to_string(),
                "Code modification".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    None,
    Command,
    Http,
}

impl StoreBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "disabled" => Some(Self::None),
            "command" | "cli" => Some(Self::Command),
            "http" | "chroma" => Some(Self::Http),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Command => "command",
            Self::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub command: String,
    pub url: String,
    pub collection: String,
    pub timeout_secs: u64,
    pub project: String,
    pub subproject: String,
    pub doc_type: String,
    pub tags: Vec<String>,
    pub status: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::None,
            command: "chroma-add".to_string(),
            url: "http://localhost:8000".to_string(),
            collection: "session_summaries".to_string(),
            timeout_secs: 120,
            project: String::new(),
            subproject: String::new(),
            doc_type: "context_compact".to_string(),
            tags: vec!["auto-compact".to_string(), "summary".to_string()],
            status: "completed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub threshold_hours: u64,
    pub save_compact_state: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            threshold_hours: 12,
            save_compact_state: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub audit_log: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { audit_log: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BudgetConfig {
    pub limits: LimitsConfig,
    pub compaction: CompactionConfig,
    pub continuity: ContinuityConfig,
    pub backup: BackupConfig,
    pub summary: SummaryConfig,
    pub store: StoreConfig,
    pub recovery: RecoveryConfig,
    pub telemetry: TelemetryConfig,
    /// Host `autoCompactEnabled`. Never read from the config file: it decides
    /// which metric carries `auto_stop`.
    #[serde(skip)]
    pub host_auto_compact: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialBudgetConfig {
    limits: Option<PartialLimitsConfig>,
    compaction: Option<CompactionConfig>,
    continuity: Option<ContinuityConfig>,
    backup: Option<BackupConfig>,
    summary: Option<SummaryConfig>,
    store: Option<StoreConfig>,
    recovery: Option<RecoveryConfig>,
    telemetry: Option<TelemetryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLimitsConfig {
    enabled: Option<bool>,
    block_on_critical: Option<bool>,
    session: Option<PartialMetricLimits>,
    total: Option<PartialMetricLimits>,
    auto_reset: Option<PartialAutoReset>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialMetricLimits {
    warning: Option<u64>,
    critical: Option<u64>,
    // Accepted for compatibility with older files; derived from the host flag.
    #[serde(rename = "auto_stop")]
    _auto_stop: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAutoReset {
    enabled: Option<bool>,
    threshold: Option<u64>,
}

fn merge_metric(base: &mut MetricLimits, partial: PartialMetricLimits) {
    if let Some(warning) = partial.warning {
        base.warning = warning;
    }
    if let Some(critical) = partial.critical {
        base.critical = critical;
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "on" => Some(true),
        "0" | "false" | "FALSE" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => parse_bool(&v).unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() {
                fallback.to_vec()
            } else {
                out
            }
        }
        Err(_) => fallback.to_vec(),
    }
}

fn validate(cfg: &BudgetConfig) -> Result<()> {
    for (label, metric) in [("session", cfg.limits.session), ("total", cfg.limits.total)] {
        if metric.warning == 0 || metric.critical == 0 {
            return Err(anyhow!(
                "invalid {label} limits: warning and critical must be >= 1"
            ));
        }
        if metric.warning >= metric.critical {
            return Err(anyhow!(
                "invalid {label} limits: require warning < critical"
            ));
        }
    }
    if cfg.limits.auto_reset.enabled && cfg.limits.auto_reset.threshold == 0 {
        return Err(anyhow!("invalid auto_reset threshold: must be >= 1"));
    }
    if cfg.continuity.marker_scan_lines == 0 {
        return Err(anyhow!(
            "invalid continuity marker_scan_lines: must be >= 1"
        ));
    }
    if cfg.backup.max_backups == 0 {
        return Err(anyhow!("invalid backup max_backups: must be >= 1"));
    }
    if cfg.summary.command.trim().is_empty() {
        return Err(anyhow!("invalid summary command: cannot be empty"));
    }
    if cfg.summary.keep_recent_messages == 0 {
        return Err(anyhow!(
            "invalid summary keep_recent_messages: must be >= 1"
        ));
    }
    if cfg.summary.prompt_char_cap < 1_000 {
        return Err(anyhow!("invalid summary prompt_char_cap: must be >= 1000"));
    }
    if cfg.summary.max_summary_chars == 0 {
        return Err(anyhow!("invalid summary max_summary_chars: must be >= 1"));
    }
    if cfg.summary.timeout_secs == 0 {
        return Err(anyhow!("invalid summary timeout_secs: must be >= 1"));
    }
    if cfg.store.timeout_secs == 0 {
        return Err(anyhow!("invalid store timeout_secs: must be >= 1"));
    }
    if cfg.store.collection.trim().is_empty() {
        return Err(anyhow!("invalid store collection: cannot be empty"));
    }
    match cfg.store.backend {
        StoreBackend::Command if cfg.store.command.trim().is_empty() => {
            return Err(anyhow!(
                "invalid store config: command is required when backend=command"
            ));
        }
        StoreBackend::Http if cfg.store.url.trim().is_empty() => {
            return Err(anyhow!(
                "invalid store config: url is required when backend=http"
            ));
        }
        _ => {}
    }
    if cfg.recovery.threshold_hours == 0 {
        return Err(anyhow!("invalid recovery threshold_hours: must be >= 1"));
    }
    Ok(())
}

fn merge_file_config(base: &mut BudgetConfig, paths: &BudgetPaths) -> Result<()> {
    let path = &paths.config_file;
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: PartialBudgetConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse config {}: {err}", path.display()))?;

    if let Some(limits) = parsed.limits {
        if let Some(enabled) = limits.enabled {
            base.limits.enabled = enabled;
        }
        if let Some(block) = limits.block_on_critical {
            base.limits.block_on_critical = block;
        }
        if let Some(session) = limits.session {
            merge_metric(&mut base.limits.session, session);
        }
        if let Some(total) = limits.total {
            merge_metric(&mut base.limits.total, total);
        }
        if let Some(auto_reset) = limits.auto_reset {
            if let Some(enabled) = auto_reset.enabled {
                base.limits.auto_reset.enabled = enabled;
            }
            if let Some(threshold) = auto_reset.threshold {
                base.limits.auto_reset.threshold = threshold;
            }
        }
    }
    if let Some(compaction) = parsed.compaction {
        base.compaction = compaction;
    }
    if let Some(continuity) = parsed.continuity {
        base.continuity = continuity;
    }
    if let Some(backup) = parsed.backup {
        base.backup = backup;
    }
    if let Some(summary) = parsed.summary {
        base.summary = summary;
    }
    if let Some(store) = parsed.store {
        base.store = store;
    }
    if let Some(recovery) = parsed.recovery {
        base.recovery = recovery;
    }
    if let Some(telemetry) = parsed.telemetry {
        base.telemetry = telemetry;
    }
    Ok(())
}

/// Read `autoCompactEnabled` from the host settings file. The file is JSON
/// written by the host but is parsed leniently; anything unreadable counts as
/// disabled.
pub fn read_host_auto_compact(paths: &BudgetPaths) -> bool {
    let Ok(raw) = fs::read_to_string(&paths.host_settings_file) else {
        return false;
    };
    let Ok(value) = json5::from_str::<serde_json::Value>(&raw) else {
        tracing::debug!(
            path = %paths.host_settings_file.display(),
            "host settings unparsable; treating autoCompactEnabled as false"
        );
        return false;
    };
    value
        .get("autoCompactEnabled")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

pub fn load_config(paths: &BudgetPaths) -> Result<BudgetConfig> {
    let mut cfg = BudgetConfig::default();
    merge_file_config(&mut cfg, paths)?;

    cfg.host_auto_compact = env_or_bool("CTX_BUDGET_AUTO_COMPACT", read_host_auto_compact(paths));

    cfg.limits.enabled = env_or_bool("CTX_BUDGET_LIMITS_ENABLED", cfg.limits.enabled);
    cfg.limits.block_on_critical =
        env_or_bool("CTX_BUDGET_BLOCK_ON_CRITICAL", cfg.limits.block_on_critical);
    cfg.limits.session.warning =
        env_or_u64("CTX_BUDGET_SESSION_WARNING", cfg.limits.session.warning);
    cfg.limits.session.critical =
        env_or_u64("CTX_BUDGET_SESSION_CRITICAL", cfg.limits.session.critical);
    cfg.limits.total.warning = env_or_u64("CTX_BUDGET_TOTAL_WARNING", cfg.limits.total.warning);
    cfg.limits.total.critical = env_or_u64("CTX_BUDGET_TOTAL_CRITICAL", cfg.limits.total.critical);
    cfg.limits.auto_reset.enabled =
        env_or_bool("CTX_BUDGET_AUTO_RESET", cfg.limits.auto_reset.enabled);
    cfg.limits.auto_reset.threshold = env_or_u64(
        "CTX_BUDGET_AUTO_RESET_THRESHOLD",
        cfg.limits.auto_reset.threshold,
    );

    cfg.compaction.save_on_critical =
        env_or_bool("CTX_BUDGET_SAVE_ON_CRITICAL", cfg.compaction.save_on_critical);
    cfg.compaction.auto_compact_on_threshold = env_or_bool(
        "CTX_BUDGET_AUTO_COMPACT_ON_THRESHOLD",
        cfg.compaction.auto_compact_on_threshold,
    );

    cfg.continuity.min_lines = env_or_usize("CTX_BUDGET_MIN_LINES", cfg.continuity.min_lines);
    cfg.continuity.min_age_secs =
        env_or_u64("CTX_BUDGET_MIN_AGE_SECS", cfg.continuity.min_age_secs);

    cfg.backup.enabled = env_or_bool("CTX_BUDGET_BACKUP_ENABLED", cfg.backup.enabled);
    cfg.backup.compress = env_or_bool("CTX_BUDGET_BACKUP_COMPRESS", cfg.backup.compress);
    cfg.backup.max_backups = env_or_usize("CTX_BUDGET_MAX_BACKUPS", cfg.backup.max_backups);

    cfg.summary.command = env_or_string("CTX_BUDGET_SUMMARY_COMMAND", &cfg.summary.command);
    cfg.summary.model = env_or_string("CTX_BUDGET_SUMMARY_MODEL", &cfg.summary.model);
    cfg.summary.timeout_secs =
        env_or_u64("CTX_BUDGET_SUMMARY_TIMEOUT_SECS", cfg.summary.timeout_secs);
    cfg.summary.keep_recent_messages = env_or_usize(
        "CTX_BUDGET_KEEP_RECENT_MESSAGES",
        cfg.summary.keep_recent_messages,
    );
    cfg.summary.prompt_char_cap =
        env_or_usize("CTX_BUDGET_PROMPT_CHAR_CAP", cfg.summary.prompt_char_cap);
    cfg.summary.focus_areas = env_or_csv("CTX_BUDGET_FOCUS_AREAS", &cfg.summary.focus_areas);

    if let Ok(raw) = env::var("CTX_BUDGET_STORE_BACKEND")
        && let Some(backend) = StoreBackend::parse(&raw)
    {
        cfg.store.backend = backend;
    }
    cfg.store.command = env_or_string("CTX_BUDGET_STORE_COMMAND", &cfg.store.command);
    cfg.store.url = env_or_string("CTX_BUDGET_STORE_URL", &cfg.store.url);
    cfg.store.collection = env_or_string("CTX_BUDGET_STORE_COLLECTION", &cfg.store.collection);
    cfg.store.timeout_secs = env_or_u64("CTX_BUDGET_STORE_TIMEOUT_SECS", cfg.store.timeout_secs);
    cfg.store.project = env_or_string("CTX_BUDGET_STORE_PROJECT", &cfg.store.project);
    cfg.store.tags = env_or_csv("CTX_BUDGET_STORE_TAGS", &cfg.store.tags);

    cfg.recovery.threshold_hours = env_or_u64(
        "CTX_BUDGET_RECOVERY_THRESHOLD_HOURS",
        cfg.recovery.threshold_hours,
    );
    cfg.telemetry.audit_log = env_or_bool("CTX_BUDGET_AUDIT_LOG", cfg.telemetry.audit_log);

    validate(&cfg)?;
    Ok(cfg)
}

/// Hook entry points must never block on a bad config file: fall back to
/// defaults (still honouring the host flag) and log the problem.
pub fn load_config_or_default(paths: &BudgetPaths) -> BudgetConfig {
    match load_config(paths) {
        Ok(cfg) => cfg,
        Err(err) => {
            crate::budget::warn::emit(crate::budget::warn::WarnEvent {
                code: crate::error::BudgetErrorCode::E005InvalidConfig.as_str(),
                stage: "startup",
                action: "load-config",
                session: "na",
                artifact: "na",
                source: &paths.config_file.display().to_string(),
                retry: "using-defaults",
                reason: "config-invalid",
                err: &format!("{err:#}"),
            });
            BudgetConfig {
                host_auto_compact: env_or_bool(
                    "CTX_BUDGET_AUTO_COMPACT",
                    read_host_auto_compact(paths),
                ),
                ..BudgetConfig::default()
            }
        }
    }
}
