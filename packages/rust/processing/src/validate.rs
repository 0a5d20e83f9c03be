//! `validate` stage: drop records that break any field rule.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use siteflow_shared::{FieldRule, Record, ValueKind};

use crate::path::{lookup, stringify};

pub(crate) struct Rule<'a> {
    field: &'a str,
    required: bool,
    kind: Option<ValueKind>,
    min_length: Option<usize>,
    pattern: Option<Regex>,
}

pub(crate) fn compile(schema: &BTreeMap<String, FieldRule>) -> Result<Vec<Rule<'_>>, String> {
    schema
        .iter()
        .map(|(field, rule)| {
            let pattern = rule
                .pattern
                .as_deref()
                .map(|p| Regex::new(p).map_err(|e| format!("invalid pattern for '{field}': {e}")))
                .transpose()?;
            Ok(Rule {
                field,
                required: rule.required,
                kind: rule.kind,
                min_length: rule.min_length,
                pattern,
            })
        })
        .collect()
}

pub(crate) fn apply(records: Vec<Record>, rules: &[Rule<'_>]) -> Vec<Record> {
    let before = records.len();
    let kept: Vec<Record> = records
        .into_iter()
        .filter(|record| rules.iter().all(|rule| rule.accepts(record)))
        .collect();
    if kept.len() < before {
        tracing::debug!(dropped = before - kept.len(), "records failed validation");
    }
    kept
}

impl Rule<'_> {
    fn accepts(&self, record: &Record) -> bool {
        let Some(value) = lookup(record, self.field).filter(|v| !v.is_null()) else {
            // Optional fields are only checked when present.
            return !self.required;
        };

        if self.kind.is_some_and(|kind| !matches_kind(value, kind)) {
            return false;
        }

        if let Some(min) = self.min_length {
            let len = match value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => stringify(other).chars().count(),
            };
            if len < min {
                return false;
            }
        }

        self.pattern
            .as_ref()
            .is_none_or(|re| re.is_match(&stringify(value)))
    }
}

fn matches_kind(value: &Value, kind: ValueKind) -> bool {
    match kind {
        ValueKind::String => value.is_string(),
        ValueKind::Number => value.is_number(),
        ValueKind::Boolean => value.is_boolean(),
        ValueKind::Array => value.is_array(),
        ValueKind::Object => value.is_object(),
    }
}
