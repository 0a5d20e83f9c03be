//! Batch serialization for the file sinks.

use std::borrow::Cow;

use serde_json::Value;

use siteflow_shared::Record;

/// CSV with a header taken from the first record's keys, in the order the
/// fields were added to it.
///
/// Later records are projected onto that header; keys they add are not
/// written. Fields are quoted per RFC 4180 and rows end with CRLF.
pub fn to_csv(records: &[Record]) -> String {
    let Some(first) = records.first() else {
        return String::new();
    };
    let header: Vec<&String> = first.keys().collect();

    let mut out = String::new();
    push_row(&mut out, header.iter().map(|k| Cow::Borrowed(k.as_str())));
    for record in records {
        push_row(
            &mut out,
            header
                .iter()
                .map(|key| Cow::Owned(record.get(key.as_str()).map(cell).unwrap_or_default())),
        );
    }
    out
}

/// Pretty-printed JSON array.
pub fn to_json(records: &[Record]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(records)
}

/// Strings unquoted, `null` empty, anything else as compact JSON.
fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn push_row<'a>(out: &mut String, cells: impl Iterator<Item = Cow<'a, str>>) {
    for (i, cell) in cells.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape(&cell));
    }
    out.push_str("\r\n");
}

fn escape(cell: &str) -> Cow<'_, str> {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\"")).into()
    } else {
        cell.into()
    }
}
