//! `enrich` stage: merge JSON from HTTP sources into each record.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use siteflow_shared::{EnrichSource, Record};

use crate::path::{lookup, stringify};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("valid regex"));

/// Query every source for every record. A failing source is logged and
/// leaves the record untouched.
pub(crate) async fn apply(
    client: &Client,
    records: Vec<Record>,
    sources: &[EnrichSource],
) -> Vec<Record> {
    let mut enriched = Vec::with_capacity(records.len());
    for mut record in records {
        for source in sources {
            match fetch(client, &record, source).await {
                Ok(value) => merge(&mut record, source, value),
                Err(reason) => warn!(source = %source.name, %reason, "enrichment skipped"),
            }
        }
        enriched.push(record);
    }
    enriched
}

async fn fetch(client: &Client, record: &Record, source: &EnrichSource) -> Result<Value, String> {
    let url = render_url(&source.url, record)?;
    debug!(source = %source.name, %url, "enriching record");

    let mut request = client.get(&url);
    for (name, value) in &source.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP {status}"));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| format!("invalid JSON: {e}"))
}

/// Substitute `{field}` placeholders with URL-encoded record values.
fn render_url(template: &str, record: &Record) -> Result<String, String> {
    let mut missing = None;
    let url = PLACEHOLDER_RE.replace_all(template, |caps: &Captures<'_>| {
        let field = caps[1].trim();
        match lookup(record, field).filter(|v| !v.is_null()) {
            Some(value) => url::form_urlencoded::byte_serialize(stringify(value).as_bytes())
                .collect::<String>(),
            None => {
                missing.get_or_insert_with(|| field.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(field) => Err(format!("record has no value for '{field}'")),
        None => Ok(url.into_owned()),
    }
}

/// Shallow merge. Objects contribute their keys (prefixed when configured);
/// any other JSON value is stored under the source name.
fn merge(record: &mut Record, source: &EnrichSource, value: Value) {
    let prefix = source.prefix.as_deref().unwrap_or("");
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                record.insert(format!("{prefix}{key}"), v);
            }
        }
        other => {
            record.insert(format!("{prefix}{}", source.name), other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn url_template_substitution() {
        let r = record(json!({"isbn": "978 0", "meta": {"lang": "en"}}));
        assert_eq!(
            render_url("https://api.example.com/books?isbn={isbn}&l={meta.lang}", &r).unwrap(),
            "https://api.example.com/books?isbn=978+0&l=en"
        );
        assert!(render_url("https://api.example.com/{missing}", &r).is_err());
    }

    #[tokio::test]
    async fn merges_object_and_skips_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/books"))
            .and(query_param("isbn", "111"))
            .and(header("x-api-key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"pages": 412})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/books"))
            .and(query_param("isbn", "222"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sources = vec![EnrichSource {
            name: "catalog".into(),
            url: format!("{}/books?isbn={{isbn}}", server.uri()),
            headers: BTreeMap::from([("x-api-key".to_string(), "k".to_string())]),
            prefix: Some("catalog_".into()),
        }];
        let records = vec![
            record(json!({"isbn": "111"})),
            record(json!({"isbn": "222"})),
            record(json!({"title": "no isbn"})),
        ];

        let out = apply(&Client::new(), records, &sources).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["catalog_pages"], json!(412));
        assert!(!out[1].contains_key("catalog_pages"));
        assert_eq!(out[2], record(json!({"title": "no isbn"})));
    }
}
