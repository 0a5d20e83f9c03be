//! `ai_analysis` stage: annotate records in batches with inference output.

use serde_json::Value;
use tracing::{info, warn};

use siteflow_inference::{CompletionRequest, InferenceBackend};
use siteflow_shared::{FIELD_AI_ANALYSIS, Record};

/// Records per inference call.
pub const ANALYSIS_BATCH_SIZE: usize = 10;

/// Attach one analysis text to every record of each batch. A failed call
/// leaves that batch unannotated.
pub(crate) async fn apply(
    backend: Option<&dyn InferenceBackend>,
    records: Vec<Record>,
    prompt: &str,
    system_prompt: Option<&str>,
) -> Vec<Record> {
    let Some(backend) = backend else {
        warn!("no inference backend configured, records pass through unannotated");
        return records;
    };

    let mut out = Vec::with_capacity(records.len());
    let mut batches = 0usize;
    let mut failed = 0usize;

    let mut remaining = records.into_iter().peekable();
    while remaining.peek().is_some() {
        let mut batch: Vec<Record> = remaining.by_ref().take(ANALYSIS_BATCH_SIZE).collect();
        batches += 1;

        let mut request = CompletionRequest::new(batch_prompt(prompt, &batch));
        request.system_prompt = system_prompt.map(str::to_string);

        match backend.complete(&request).await {
            Ok(text) => {
                for record in &mut batch {
                    record.insert(FIELD_AI_ANALYSIS.into(), Value::String(text.clone()));
                }
            }
            Err(e) => {
                failed += 1;
                warn!(batch = batches, error = %e, "analysis failed, batch left unannotated");
            }
        }
        out.extend(batch);
    }

    info!(batches, failed, "analysis complete");
    out
}

fn batch_prompt(prompt: &str, batch: &[Record]) -> String {
    let data = serde_json::to_string_pretty(batch).unwrap_or_else(|_| "[]".into());
    format!("{prompt}\n\nRecords ({} items):\n{data}", batch.len())
}
