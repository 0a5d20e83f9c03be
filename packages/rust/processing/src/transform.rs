//! `transform` stage: per-record field operations applied in order.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;

use siteflow_shared::{ConvertTarget, Record, TransformOp};

use crate::formula::Formula;
use crate::path::{as_number, lookup, lookup_mut, number_value, stringify};

/// An operation with its regex/formula compiled up front.
pub(crate) enum Step<'a> {
    Rename {
        from: &'a str,
        to: &'a str,
    },
    Convert {
        field: &'a str,
        to: ConvertTarget,
    },
    Extract {
        field: &'a str,
        pattern: Regex,
        target: &'a str,
    },
    Calculate {
        target: &'a str,
        formula: Formula,
    },
}

pub(crate) fn compile(operations: &[TransformOp]) -> Result<Vec<Step<'_>>, String> {
    operations
        .iter()
        .map(|op| {
            Ok(match op {
                TransformOp::Rename { from, to } => Step::Rename { from, to },
                TransformOp::ConvertType { field, to } => Step::Convert { field, to: *to },
                TransformOp::ExtractRegex {
                    field,
                    pattern,
                    target,
                } => Step::Extract {
                    field,
                    pattern: Regex::new(pattern)
                        .map_err(|e| format!("invalid regex '{pattern}': {e}"))?,
                    target: target.as_deref().unwrap_or(field),
                },
                TransformOp::Calculate { target, formula } => Step::Calculate {
                    target,
                    formula: Formula::parse(formula)
                        .map_err(|e| format!("invalid formula for '{target}': {e}"))?,
                },
            })
        })
        .collect()
}

pub(crate) fn apply(records: Vec<Record>, steps: &[Step<'_>]) -> Vec<Record> {
    records
        .into_iter()
        .map(|mut record| {
            for step in steps {
                step.apply(&mut record);
            }
            record
        })
        .collect()
}

impl Step<'_> {
    fn apply(&self, record: &mut Record) {
        match self {
            Self::Rename { from, to } => {
                if let Some(value) = record.shift_remove(*from) {
                    record.insert((*to).to_string(), value);
                }
            }
            Self::Convert { field, to } => {
                if let Some(value) = lookup_mut(record, field) {
                    *value = convert(value, *to);
                }
            }
            Self::Extract {
                field,
                pattern,
                target,
            } => {
                let extracted = lookup(record, field)
                    .filter(|v| !v.is_null())
                    .and_then(|v| {
                        let text = stringify(v);
                        pattern.captures(&text).map(|caps| {
                            caps.get(1)
                                .or_else(|| caps.get(0))
                                .map_or(Value::Null, |m| Value::String(m.as_str().to_string()))
                        })
                    })
                    .unwrap_or(Value::Null);
                record.insert((*target).to_string(), extracted);
            }
            Self::Calculate { target, formula } => {
                let result = formula.eval(record).map_or(Value::Null, number_value);
                record.insert((*target).to_string(), result);
            }
        }
    }
}

/// Convert a value; anything that does not fit the target becomes `null`.
fn convert(value: &Value, to: ConvertTarget) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match to {
        ConvertTarget::Number => match value {
            Value::Bool(b) => Value::from(u8::from(*b)),
            Value::String(s) => as_number(&Value::String(s.replace(',', "")))
                .map_or(Value::Null, number_value),
            other => as_number(other).map_or(Value::Null, number_value),
        },
        ConvertTarget::String => Value::String(stringify(value)),
        ConvertTarget::Boolean => match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::Number(n) => n.as_f64().map_or(Value::Null, |n| Value::Bool(n != 0.0)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" | "on" => Value::Bool(true),
                "false" | "no" | "n" | "0" | "off" => Value::Bool(false),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        ConvertTarget::Date => parse_date(value)
            .map_or(Value::Null, |dt| {
                Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true))
            }),
    }
}

/// RFC 3339, `YYYY-MM-DD[ HH:MM:SS]`, or a Unix timestamp in seconds.
fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => Utc.timestamp_opt(n.as_f64()? as i64, 0).single(),
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                        .ok()
                        .map(|dt| Utc.from_utc_datetime(&dt))
                })
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|dt| Utc.from_utc_datetime(&dt))
                })
        }
        _ => None,
    }
}
