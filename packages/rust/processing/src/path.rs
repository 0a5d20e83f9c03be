//! Field lookup and value coercion shared by the stages.

use serde_json::Value;

use siteflow_shared::Record;

/// Resolve a field by name or dotted path (`seller.rating`, `tags.0`).
///
/// An exact top-level key wins over path traversal, so keys that contain
/// dots stay addressable.
pub fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    if let Some(value) = record.get(path) {
        return Some(value);
    }

    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable counterpart of [`lookup`], with the same resolution rules.
pub(crate) fn lookup_mut<'a>(record: &'a mut Record, path: &str) -> Option<&'a mut Value> {
    if record.contains_key(path) {
        return record.get_mut(path);
    }

    let mut parts = path.split('.');
    let mut current = record.get_mut(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get_mut(part)?,
            Value::Array(items) => items.get_mut(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Numeric view of a value: numbers and numeric strings.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// String view of a value. Strings are returned unquoted, `null` is empty.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// JSON number from an `f64`, integral values kept as integers.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn dotted_paths() {
        let r = record(json!({
            "seller": {"rating": 4.5},
            "tags": ["a", "b"],
            "odd.key": 1
        }));
        assert_eq!(lookup(&r, "seller.rating"), Some(&json!(4.5)));
        assert_eq!(lookup(&r, "tags.1"), Some(&json!("b")));
        assert_eq!(lookup(&r, "odd.key"), Some(&json!(1)));
        assert_eq!(lookup(&r, "seller.missing"), None);
        assert_eq!(lookup(&r, "tags.x"), None);
    }

    #[test]
    fn mutable_paths_resolve_like_lookup() {
        let mut r = record(json!({"seller": {"rating": "4.5"}, "tags": ["a"], "odd.key": 1}));
        *lookup_mut(&mut r, "seller.rating").unwrap() = json!(4.5);
        *lookup_mut(&mut r, "tags.0").unwrap() = json!("z");
        *lookup_mut(&mut r, "odd.key").unwrap() = json!(2);
        assert!(lookup_mut(&mut r, "seller.missing").is_none());
        assert_eq!(
            r,
            record(json!({"seller": {"rating": 4.5}, "tags": ["z"], "odd.key": 2}))
        );
    }

    #[test]
    fn coercion() {
        assert_eq!(as_number(&json!(" 20 ")), Some(20.0));
        assert_eq!(as_number(&json!("abc")), None);
        assert_eq!(as_number(&json!(null)), None);
        assert_eq!(stringify(&json!("x")), "x");
        assert_eq!(stringify(&json!(12)), "12");
        assert_eq!(number_value(3.0), json!(3));
        assert_eq!(number_value(2.5), json!(2.5));
    }
}
