use crate::budget::backup::BackupMetadata;
use crate::budget::config::{StoreBackend, StoreConfig};
use crate::budget::transcript::TranscriptStatistics;
use crate::budget::util::{TimedOutput, run_command_with_input_timeout, truncate_with_ellipsis};
use crate::error::BudgetError;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct StoreRequest {
    pub collection_name: String,
    pub documents: Vec<String>,
    pub ids: Vec<String>,
    pub metadatas: Vec<Map<String, Value>>,
}

pub trait DocumentStore {
    fn label(&self) -> &'static str;
    fn add(&self, request: &StoreRequest) -> Result<()>;
}

pub fn document_id(now: DateTime<Local>) -> String {
    format!("context_compact_{}", now.format("%Y%m%d_%H%M%S"))
}

pub fn build_request(
    summary: &str,
    metadata: &BackupMetadata,
    statistics: &TranscriptStatistics,
    cfg: &StoreConfig,
    now: DateTime<Local>,
) -> StoreRequest {
    let mut meta = Map::new();
    let project = if cfg.project.trim().is_empty() {
        metadata
            .cwd
            .as_deref()
            .and_then(|cwd| Path::new(cwd).file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        cfg.project.clone()
    };
    meta.insert("project".into(), json!(project));
    if !cfg.subproject.trim().is_empty() {
        meta.insert("subproject".into(), json!(cfg.subproject));
    }
    meta.insert("type".into(), json!(cfg.doc_type));
    meta.insert("date".into(), json!(now.format("%Y-%m-%d").to_string()));
    meta.insert(
        "summary".into(),
        json!(format!(
            "Context compression - {} messages",
            statistics.total_messages
        )),
    );
    meta.insert("tags".into(), json!(cfg.tags.join(", ")));
    meta.insert("status".into(), json!(cfg.status));
    meta.insert(
        "original_message_count".into(),
        json!(statistics.total_messages),
    );
    meta.insert("total_tokens".into(), json!(statistics.total_tokens));
    meta.insert("session_id".into(), json!(metadata.session_id));
    meta.insert(
        "git_branch".into(),
        json!(
            metadata
                .git_branch
                .as_deref()
                .filter(|b| !b.trim().is_empty())
                .unwrap_or("unknown")
        ),
    );
    meta.insert("timestamp".into(), json!(metadata.timestamp));

    StoreRequest {
        collection_name: cfg.collection.clone(),
        documents: vec![summary.to_string()],
        ids: vec![document_id(now)],
        metadatas: vec![meta],
    }
}

/// Hands the request JSON to an external command on stdin.
pub struct CommandStore {
    bin: PathBuf,
    timeout_secs: u64,
}

impl DocumentStore for CommandStore {
    fn label(&self) -> &'static str {
        "command"
    }

    fn add(&self, request: &StoreRequest) -> Result<()> {
        let payload = serde_json::to_vec(request)?;
        let mut cmd = Command::new(&self.bin);
        cmd.arg("add");
        let output = match run_command_with_input_timeout(&mut cmd, &payload, self.timeout_secs)? {
            TimedOutput::TimedOut => {
                return Err(BudgetError::StoreFailed(format!(
                    "timed out after {}s",
                    self.timeout_secs
                ))
                .into());
            }
            TimedOutput::Finished(output) => output,
        };
        if !output.status.success() {
            return Err(BudgetError::StoreFailed(format!(
                "{} exited with {}: {}",
                self.bin.display(),
                output.status,
                truncate_with_ellipsis(String::from_utf8_lossy(&output.stderr).trim(), 200)
            ))
            .into());
        }
        Ok(())
    }
}

/// Chroma-compatible REST store: get-or-create the collection, then add.
pub struct HttpStore {
    base_url: String,
    client: Client,
}

impl HttpStore {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn collection_id(&self, name: &str) -> Result<String> {
        let url = format!("{}/api/v1/collections", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({"name": name, "get_or_create": true}))
            .send()
            .map_err(|err| BudgetError::StoreFailed(format!("POST {url}: {err}")))?;
        if !response.status().is_success() {
            return Err(BudgetError::StoreFailed(format!(
                "POST {url} returned {}",
                response.status()
            ))
            .into());
        }
        let body: Value = response
            .json()
            .map_err(|err| BudgetError::StoreFailed(format!("collection response: {err}")))?;
        body.get("id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| BudgetError::StoreFailed("collection response missing id".into()).into())
    }
}

impl DocumentStore for HttpStore {
    fn label(&self) -> &'static str {
        "http"
    }

    fn add(&self, request: &StoreRequest) -> Result<()> {
        let id = self.collection_id(&request.collection_name)?;
        let url = format!("{}/api/v1/collections/{id}/add", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "documents": request.documents,
                "ids": request.ids,
                "metadatas": request.metadatas,
            }))
            .send()
            .map_err(|err| BudgetError::StoreFailed(format!("POST {url}: {err}")))?;
        if !response.status().is_success() {
            return Err(BudgetError::StoreFailed(format!(
                "POST {url} returned {}",
                response.status()
            ))
            .into());
        }
        Ok(())
    }
}

/// `Ok(None)` when no store is configured; compaction then skips the stage.
pub fn build_store(cfg: &StoreConfig) -> Result<Option<Box<dyn DocumentStore>>> {
    match cfg.backend {
        StoreBackend::None => Ok(None),
        StoreBackend::Command => {
            let path = Path::new(&cfg.command);
            let bin = if path.components().count() > 1 {
                path.to_path_buf()
            } else {
                which::which(&cfg.command).with_context(|| {
                    format!("store command `{}` not found in PATH", cfg.command)
                })?
            };
            Ok(Some(Box::new(CommandStore {
                bin,
                timeout_secs: cfg.timeout_secs,
            })))
        }
        StoreBackend::Http => Ok(Some(Box::new(HttpStore::new(&cfg.url, cfg.timeout_secs)?))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).single().expect("ts")
    }

    #[test]
    fn request_carries_structured_metadata() {
        let metadata = BackupMetadata {
            timestamp: "2025-03-04T05:06:07".into(),
            session_id: "abc".into(),
            cwd: Some("/work/my-repo".into()),
            git_branch: Some(String::new()),
            ..BackupMetadata::default()
        };
        let stats = TranscriptStatistics {
            total_messages: 12,
            total_tokens: 3456,
            ..TranscriptStatistics::default()
        };
        let req = build_request(
            "summary text",
            &metadata,
            &stats,
            &StoreConfig::default(),
            now(),
        );

        assert_eq!(req.ids, vec!["context_compact_20250304_050607"]);
        assert_eq!(req.documents, vec!["summary text"]);
        let meta = &req.metadatas[0];
        assert_eq!(meta["project"], "my-repo");
        assert_eq!(meta["type"], "context_compact");
        assert_eq!(meta["date"], "2025-03-04");
        assert_eq!(meta["tags"], "auto-compact, summary");
        assert_eq!(meta["original_message_count"], 12);
        assert_eq!(meta["total_tokens"], 3456);
        assert_eq!(meta["git_branch"], "unknown");
        assert!(meta.get("subproject").is_none());
    }

    #[test]
    fn unreachable_http_store_is_a_store_failure() {
        let store = HttpStore::new("http://127.0.0.1:9/", 2).expect("client");
        let req = build_request(
            "summary",
            &BackupMetadata::default(),
            &TranscriptStatistics::default(),
            &StoreConfig::default(),
            now(),
        );
        let err = store.add(&req).expect_err("nothing listens on port 9");
        let budget_err = err.downcast_ref::<BudgetError>().expect("typed error");
        assert_eq!(budget_err.code().as_str(), "E004");
        assert!(format!("{err:#}").contains("http://127.0.0.1:9/api/v1/collections"));
    }

    #[test]
    fn no_backend_means_no_store() {
        assert!(build_store(&StoreConfig::default()).expect("build").is_none());
    }

    #[test]
    fn missing_store_command_is_an_error() {
        let cfg = StoreConfig {
            backend: StoreBackend::Command,
            command: "definitely-not-a-real-store-bin".into(),
            ..StoreConfig::default()
        };
        assert!(build_store(&cfg).is_err());
    }
}
