//! `filter` stage: keep a record iff all conditions hold.

use regex::Regex;
use serde_json::Value;

use siteflow_shared::{FilterCondition, FilterOperator, Record};

use crate::path::{as_number, lookup, stringify};

/// A condition with its regex compiled up front.
pub(crate) struct Condition<'a> {
    field: &'a str,
    test: Test<'a>,
}

enum Test<'a> {
    Equals(&'a Value),
    NotEquals(&'a Value),
    Contains(String),
    GreaterThan(f64),
    LessThan(f64),
    Exists,
    NotExists,
    Regex(Regex),
}

/// Validate and compile conditions; errors describe the bad condition.
pub(crate) fn compile(conditions: &[FilterCondition]) -> Result<Vec<Condition<'_>>, String> {
    conditions
        .iter()
        .map(|c| {
            let numeric = || {
                as_number(&c.value).ok_or_else(|| {
                    format!("condition on '{}' needs a numeric value, got {}", c.field, c.value)
                })
            };
            let test = match c.operator {
                FilterOperator::Equals => Test::Equals(&c.value),
                FilterOperator::NotEquals => Test::NotEquals(&c.value),
                FilterOperator::Contains => Test::Contains(stringify(&c.value)),
                FilterOperator::GreaterThan => Test::GreaterThan(numeric()?),
                FilterOperator::LessThan => Test::LessThan(numeric()?),
                FilterOperator::Exists => Test::Exists,
                FilterOperator::NotExists => Test::NotExists,
                FilterOperator::Regex => {
                    let Value::String(pattern) = &c.value else {
                        return Err(format!("regex condition on '{}' needs a string", c.field));
                    };
                    Test::Regex(
                        Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))?,
                    )
                }
            };
            Ok(Condition {
                field: &c.field,
                test,
            })
        })
        .collect()
}

pub(crate) fn apply(records: Vec<Record>, conditions: &[Condition<'_>]) -> Vec<Record> {
    records
        .into_iter()
        .filter(|record| conditions.iter().all(|c| c.holds(record)))
        .collect()
}

impl Condition<'_> {
    fn holds(&self, record: &Record) -> bool {
        let value = lookup(record, self.field).filter(|v| !v.is_null());
        match (&self.test, value) {
            (Test::Exists, v) => v.is_some(),
            (Test::NotExists, v) => v.is_none(),
            (Test::NotEquals(expected), Some(v)) => !loosely_equal(v, expected),
            (Test::NotEquals(_), None) => true,
            (_, None) => false,
            (Test::Equals(expected), Some(v)) => loosely_equal(v, expected),
            (Test::Contains(needle), Some(v)) => stringify(v).contains(needle.as_str()),
            (Test::GreaterThan(bound), Some(v)) => as_number(v).is_some_and(|n| n > *bound),
            (Test::LessThan(bound), Some(v)) => as_number(v).is_some_and(|n| n < *bound),
            (Test::Regex(re), Some(v)) => re.is_match(&stringify(v)),
        }
    }
}

/// `15` equals `"15"`; otherwise structural equality.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::String(_), Value::Number(_)) | (Value::Number(_), Value::String(_)) => {
            matches!((as_number(a), as_number(b)), (Some(x), Some(y)) if x == y)
        }
        (Value::String(s), Value::Bool(flag)) | (Value::Bool(flag), Value::String(s)) => {
            s.eq_ignore_ascii_case(if *flag { "true" } else { "false" })
        }
        _ => false,
    }
}
