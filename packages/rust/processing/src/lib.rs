//! Processing stage chain.
//!
//! Each stage takes the whole batch and returns a new one; stages run in
//! declared order. Stage configuration (regexes, formulas, operators) is
//! checked when the stage starts, and a bad configuration aborts the chain
//! with [`SiteflowError::Processor`]. Runtime problems inside a stage
//! (an enrichment source down, inference failing) are logged and recovered.

mod analysis;
mod enrich;
mod filter;
mod formula;
mod path;
mod transform;
mod validate;

use std::collections::HashSet;
use std::sync::Arc;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info, instrument};

use siteflow_inference::InferenceBackend;
use siteflow_shared::{Processor, Record, Result, SiteflowError};

pub use analysis::ANALYSIS_BATCH_SIZE;
pub use formula::Formula;
pub use path::{as_number, lookup, stringify};

/// Runs processor chains with the collaborators some stages need.
pub struct ProcessingChain {
    http: Client,
    inference: Option<Arc<dyn InferenceBackend>>,
}

impl ProcessingChain {
    pub fn new(http: Client, inference: Option<Arc<dyn InferenceBackend>>) -> Self {
        Self { http, inference }
    }

    /// Pass `records` through every processor in order.
    #[instrument(skip_all, fields(stages = processors.len(), input = records.len()))]
    pub async fn run(&self, processors: &[Processor], records: Vec<Record>) -> Result<Vec<Record>> {
        let mut batch = records;
        for (index, processor) in processors.iter().enumerate() {
            let before = batch.len();
            batch = self
                .apply(processor, batch)
                .await
                .map_err(|message| SiteflowError::processor(index, processor.kind(), message))?;
            debug!(
                index,
                stage = processor.kind(),
                before,
                after = batch.len(),
                "stage applied"
            );
        }
        info!(output = batch.len(), "processing chain complete");
        Ok(batch)
    }

    async fn apply(
        &self,
        processor: &Processor,
        records: Vec<Record>,
    ) -> std::result::Result<Vec<Record>, String> {
        Ok(match processor {
            Processor::Filter { conditions } => {
                filter::apply(records, &filter::compile(conditions)?)
            }
            Processor::Transform { operations } => {
                transform::apply(records, &transform::compile(operations)?)
            }
            Processor::Deduplicate { unique_field } => deduplicate(records, unique_field),
            Processor::Enrich { sources } => enrich::apply(&self.http, records, sources).await,
            Processor::AiAnalysis {
                prompt,
                system_prompt,
            } => {
                analysis::apply(
                    self.inference.as_deref(),
                    records,
                    prompt,
                    system_prompt.as_deref(),
                )
                .await
            }
            Processor::Validate { schema } => {
                validate::apply(records, &validate::compile(schema)?)
            }
        })
    }
}

/// First record per key wins; order is preserved. Records without the
/// field are kept.
pub fn deduplicate(records: Vec<Record>, unique_field: &str) -> Vec<Record> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| match lookup(record, unique_field).filter(|v| !v.is_null()) {
            Some(key) => seen.insert(dedup_key(key)),
            None => true,
        })
        .collect()
}

/// `1` and `1.0` share a key; strings never collide with numbers.
fn dedup_key(value: &Value) -> String {
    match value {
        Value::Number(n) if n.is_f64() => n
            .as_f64()
            .map_or(Value::Null, path::number_value)
            .to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use siteflow_shared::{FilterCondition, FilterOperator, TransformOp};

    fn records(values: Value) -> Vec<Record> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn chain() -> ProcessingChain {
        ProcessingChain::new(Client::new(), None)
    }

    #[test]
    fn deduplicate_keeps_first_seen() {
        let out = deduplicate(
            records(json!([{"id": 1, "v": "a"}, {"id": 1, "v": "b"}, {"id": 2, "v": "c"}])),
            "id",
        );
        assert_eq!(out, records(json!([{"id": 1, "v": "a"}, {"id": 2, "v": "c"}])));
    }

    #[test]
    fn deduplicate_keeps_records_without_key() {
        let out = deduplicate(records(json!([{"v": 1}, {"v": 2}, {"id": null}])), "id");
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn deduplicate_compares_numbers_by_value() {
        let out = deduplicate(
            records(json!([{"id": 1}, {"id": 1.0}, {"id": "1"}, {"id": 1.5}, {"id": 1.50}])),
            "id",
        );
        assert_eq!(out, records(json!([{"id": 1}, {"id": "1"}, {"id": 1.5}])));
    }

    #[tokio::test]
    async fn stages_run_in_declared_order() {
        let processors = vec![
            Processor::Transform {
                operations: vec![TransformOp::Calculate {
                    target: "total".into(),
                    formula: "price * qty".into(),
                }],
            },
            Processor::Filter {
                conditions: vec![FilterCondition {
                    field: "total".into(),
                    operator: FilterOperator::GreaterThan,
                    value: json!(50),
                }],
            },
            Processor::Deduplicate {
                unique_field: "sku".into(),
            },
        ];
        let input = records(json!([
            {"sku": "a", "price": 10, "qty": 6},
            {"sku": "a", "price": 10, "qty": 9},
            {"sku": "b", "price": 1, "qty": 2}
        ]));

        let out = chain().run(&processors, input).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["total"], json!(60));
    }

    #[tokio::test]
    async fn bad_stage_config_aborts_with_index_and_type() {
        let processors = vec![
            Processor::Deduplicate {
                unique_field: "id".into(),
            },
            Processor::Filter {
                conditions: vec![FilterCondition {
                    field: "name".into(),
                    operator: FilterOperator::Regex,
                    value: json!("(unclosed"),
                }],
            },
        ];

        let err = chain()
            .run(&processors, records(json!([{"id": 1}])))
            .await
            .unwrap_err();
        match err {
            SiteflowError::Processor { index, stage, .. } => {
                assert_eq!(index, 1);
                assert_eq!(stage, "filter");
            }
            other => panic!("expected processor error, got {other}"),
        }
    }

    #[tokio::test]
    async fn empty_chain_is_identity() {
        let input = records(json!([{"a": 1}]));
        let out = chain().run(&[], input.clone()).await.unwrap();
        assert_eq!(out, input);
    }
}
