//! Output sink dispatcher.
//!
//! Every configured output receives the final batch independently. A sink
//! that fails is reported and logged; it never affects its siblings or the
//! run. There is exactly one delivery attempt per sink.

pub mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use siteflow_shared::{
    EntityId, FileSinkConfig, OutputConfig, Record, Result, SiteflowError, StorageSinkConfig,
    WebhookSinkConfig,
};
use siteflow_storage::PersistenceStore;

/// Identifies the batch being delivered.
#[derive(Debug, Clone)]
pub struct Delivery<'a> {
    pub pipeline_id: EntityId,
    pub pipeline_name: &'a str,
    pub timestamp: DateTime<Utc>,
}

impl Delivery<'_> {
    /// Millisecond stamp used in keys and file names.
    pub fn stamp(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Result of one sink.
#[derive(Debug)]
pub struct SinkReport {
    pub index: usize,
    pub sink: &'static str,
    /// Where the batch went (key, path or URL) when delivery succeeded.
    pub location: Option<String>,
    pub error: Option<SiteflowError>,
}

impl SinkReport {
    pub fn delivered(&self) -> bool {
        self.error.is_none()
    }
}

/// Body posted by the webhook sink.
#[derive(Serialize)]
struct WebhookPayload<'a> {
    pipeline: String,
    timestamp: String,
    data: &'a [Record],
}

/// Sends batches to storage, files, and webhooks.
pub struct SinkDispatcher {
    store: Arc<dyn PersistenceStore>,
    http: Client,
    output_dir: PathBuf,
}

impl SinkDispatcher {
    pub fn new(store: Arc<dyn PersistenceStore>, http: Client, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            http,
            output_dir: output_dir.into(),
        }
    }

    /// Deliver `records` to every output, in declared order.
    #[instrument(skip_all, fields(pipeline_id = %delivery.pipeline_id, sinks = outputs.len()))]
    pub async fn dispatch(
        &self,
        outputs: &[OutputConfig],
        records: &[Record],
        delivery: &Delivery<'_>,
    ) -> Vec<SinkReport> {
        let mut reports = Vec::with_capacity(outputs.len());
        for (index, output) in outputs.iter().enumerate() {
            let sink = output.kind();
            let result = match output {
                OutputConfig::Storage(config) => self.to_storage(config, records, delivery).await,
                OutputConfig::Csv(config) => {
                    self.to_file(config, "csv", render::to_csv(records), delivery)
                        .await
                }
                OutputConfig::Json(config) => match render::to_json(records) {
                    Ok(text) => self.to_file(config, "json", text, delivery).await,
                    Err(e) => Err(SiteflowError::output(sink, e.to_string())),
                },
                OutputConfig::Webhook(config) => self.to_webhook(config, records, delivery).await,
                OutputConfig::Email(_) => Err(SiteflowError::output(
                    sink,
                    "email delivery is not supported",
                )),
            };

            let report = match result {
                Ok(location) => {
                    info!(index, sink, %location, records = records.len(), "batch delivered");
                    SinkReport {
                        index,
                        sink,
                        location: Some(location),
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(index, sink, error = %e, "sink failed");
                    SinkReport {
                        index,
                        sink,
                        location: None,
                        error: Some(e),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }

    async fn to_storage(
        &self,
        config: &StorageSinkConfig,
        records: &[Record],
        delivery: &Delivery<'_>,
    ) -> Result<String> {
        let key = config
            .key
            .clone()
            .unwrap_or_else(|| format!("dataset:{}:{}", delivery.pipeline_id, delivery.stamp()));

        let value = json!({
            "pipeline_id": delivery.pipeline_id.to_string(),
            "pipeline": delivery.pipeline_name,
            "created_at": delivery.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            "count": records.len(),
            "records": records,
        });

        self.store
            .set(&key, &value)
            .await
            .map_err(|e| SiteflowError::output("storage", e.to_string()))?;
        Ok(key)
    }

    async fn to_file(
        &self,
        config: &FileSinkConfig,
        ext: &str,
        content: String,
        delivery: &Delivery<'_>,
    ) -> Result<String> {
        let path = match config.path.as_deref() {
            Some(path) => siteflow_shared::expand_home(path),
            None => self
                .output_dir
                .join(format!("{}-{}.{ext}", delivery.pipeline_id, delivery.stamp())),
        };

        write_atomically(&path, content.as_bytes())
            .await
            .map_err(|e| SiteflowError::output(ext.to_string(), e.to_string()))?;
        Ok(path.display().to_string())
    }

    async fn to_webhook(
        &self,
        config: &WebhookSinkConfig,
        records: &[Record],
        delivery: &Delivery<'_>,
    ) -> Result<String> {
        let payload = WebhookPayload {
            pipeline: delivery.pipeline_id.to_string(),
            timestamp: delivery.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            data: records,
        };

        let mut request = self.http.post(&config.url).json(&payload);
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| SiteflowError::output("webhook", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SiteflowError::output(
                "webhook",
                format!("{} responded with HTTP {status}", config.url),
            ));
        }
        Ok(config.url.clone())
    }
}

/// Write to a temp file next to `path`, then rename over it.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SiteflowError::io(parent, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".into());
    let temp = path.with_file_name(format!(".{file_name}.tmp"));

    tokio::fs::write(&temp, bytes)
        .await
        .map_err(|e| SiteflowError::io(&temp, e))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| SiteflowError::io(path, e))?;
    Ok(())
}

/// Records inside a value written by the `storage` sink.
pub fn dataset_records(stored: &Value) -> Vec<Record> {
    stored
        .get("records")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_object().cloned()).collect())
        .unwrap_or_default()
}
