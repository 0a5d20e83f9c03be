//! Static-HTML page agent over `reqwest` + `scraper`.
//!
//! Pages are fetched once on open/navigate and parsed on demand. There is no
//! script engine, so interactive steps (click, forms, screenshots, scripts)
//! fail with an agent error; pagination works for anything that resolves to
//! an `href`.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue};
use scraper::{ElementRef, Html, Selector};
use serde_json::{Number, Value};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use url::Url;

use siteflow_shared::{
    AgentConfig, FieldSchema, FieldType, Pagination, Record, Result, SiteSelectors, SiteflowError,
};

use crate::agent::{OpenOptions, PageAgent, PageContent, PageHandle};

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

// ---------------------------------------------------------------------------
// HttpPageAgent
// ---------------------------------------------------------------------------

struct LoadedPage {
    url: Url,
    html: String,
    options: OpenOptions,
}

/// Page agent that fetches documents over HTTP and queries them with CSS.
pub struct HttpPageAgent {
    client: Client,
    pages: Mutex<HashMap<PageHandle, LoadedPage>>,
    /// Allow localhost/private IPs (integration tests with mock servers).
    allow_private_hosts: bool,
}

impl HttpPageAgent {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.call_timeout().max(Duration::from_secs(1)))
            .build()
            .map_err(|e| SiteflowError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            pages: Mutex::new(HashMap::new()),
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    #[instrument(skip_all, fields(url = %url))]
    async fn fetch(&self, url: &Url, options: &OpenOptions) -> Result<String> {
        if !self.allow_private_hosts && is_ssrf_target(url) {
            warn!("SSRF protection: blocked");
            return Err(SiteflowError::Agent(format!(
                "{url}: refusing to fetch private or non-http address"
            )));
        }

        debug!("fetching page");
        let response = self
            .client
            .get(url.as_str())
            .headers(request_headers(options)?)
            .send()
            .await
            .map_err(|e| SiteflowError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SiteflowError::Network(format!("{url}: HTTP {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| SiteflowError::Network(format!("{url}: body read failed: {e}")))
    }

    /// Run `f` against the parsed document of an open page.
    async fn with_page<T>(
        &self,
        handle: &PageHandle,
        f: impl FnOnce(&Html, &Url) -> Result<T>,
    ) -> Result<T> {
        let pages = self.pages.lock().await;
        let page = pages.get(handle).ok_or_else(|| unknown_handle(handle))?;
        let doc = Html::parse_document(&page.html);
        f(&doc, &page.url)
    }

    fn unsupported(operation: &str) -> SiteflowError {
        SiteflowError::Agent(format!(
            "{operation} is not supported by the HTTP page agent"
        ))
    }
}

#[async_trait]
impl PageAgent for HttpPageAgent {
    async fn open(&self, url: &str, options: &OpenOptions) -> Result<PageHandle> {
        let url = parse_url(url)?;
        let html = self.fetch(&url, options).await?;

        let handle = PageHandle::new();
        self.pages.lock().await.insert(
            handle,
            LoadedPage {
                url,
                html,
                options: options.clone(),
            },
        );
        Ok(handle)
    }

    async fn navigate(&self, handle: &PageHandle, url: &str, options: &OpenOptions) -> Result<()> {
        let target = {
            let pages = self.pages.lock().await;
            let page = pages.get(handle).ok_or_else(|| unknown_handle(handle))?;
            page.url
                .join(url)
                .map_err(|e| SiteflowError::Agent(format!("invalid URL {url}: {e}")))?
        };
        let html = self.fetch(&target, options).await?;

        let mut pages = self.pages.lock().await;
        let page = pages.get_mut(handle).ok_or_else(|| unknown_handle(handle))?;
        page.url = target;
        page.html = html;
        page.options = options.clone();
        Ok(())
    }

    async fn await_load(&self, handle: &PageHandle) -> Result<()> {
        // The body is fully read on fetch.
        if self.pages.lock().await.contains_key(handle) {
            Ok(())
        } else {
            Err(unknown_handle(handle))
        }
    }

    async fn extract(
        &self,
        handle: &PageHandle,
        selectors: &SiteSelectors,
        schema: &FieldSchema,
    ) -> Result<Vec<Record>> {
        self.with_page(handle, |doc, base| extract_records(doc, base, selectors, schema))
            .await
    }

    async fn paginate_next(&self, handle: &PageHandle, pagination: &Pagination) -> Result<bool> {
        let (next, options) = {
            let pages = self.pages.lock().await;
            let page = pages.get(handle).ok_or_else(|| unknown_handle(handle))?;
            let doc = Html::parse_document(&page.html);
            (find_next_link(&doc, &page.url, pagination)?, page.options.clone())
        };

        let Some(next) = next else {
            return Ok(false);
        };

        debug!(next = %next, "following pagination");
        self.navigate(handle, next.as_str(), &options).await?;
        Ok(true)
    }

    async fn click(&self, _handle: &PageHandle, _selector: &str) -> Result<()> {
        Err(Self::unsupported("click"))
    }

    async fn fill_form(
        &self,
        _handle: &PageHandle,
        _fields: &BTreeMap<String, String>,
        _submit: Option<&str>,
    ) -> Result<()> {
        Err(Self::unsupported("fill_form"))
    }

    async fn screenshot(&self, _handle: &PageHandle) -> Result<Vec<u8>> {
        Err(Self::unsupported("screenshot"))
    }

    async fn run_script(&self, _handle: &PageHandle, _code: &str) -> Result<Value> {
        Err(Self::unsupported("script"))
    }

    async fn content(&self, handle: &PageHandle) -> Result<PageContent> {
        self.with_page(handle, |doc, url| Ok(page_content(doc, url)))
            .await
    }

    async fn close(&self, handle: &PageHandle) -> Result<()> {
        self.pages.lock().await.remove(handle);
        Ok(())
    }
}

fn unknown_handle(handle: &PageHandle) -> SiteflowError {
    SiteflowError::Agent(format!("unknown page handle {handle}"))
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| SiteflowError::Agent(format!("invalid URL {raw}: {e}")))
}

fn parse_selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| SiteflowError::Agent(format!("invalid selector '{css}': {e}")))
}

fn request_headers(options: &OpenOptions) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &options.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SiteflowError::Agent(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| SiteflowError::Agent(format!("invalid header value: {e}")))?;
        headers.insert(name, value);
    }

    if !options.cookies.is_empty() {
        let cookie = options
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        let value = HeaderValue::from_str(&cookie)
            .map_err(|e| SiteflowError::Agent(format!("invalid cookie value: {e}")))?;
        headers.insert(COOKIE, value);
    }

    Ok(headers)
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// One record per container; each field is read relative to its container.
fn extract_records(
    doc: &Html,
    base: &Url,
    selectors: &SiteSelectors,
    schema: &FieldSchema,
) -> Result<Vec<Record>> {
    let container = parse_selector(&selectors.container)?;
    let fields = selectors
        .fields
        .iter()
        .map(|(name, sel)| Ok((name, parse_selector(sel.css())?, sel.attribute())))
        .collect::<Result<Vec<_>>>()?;

    let mut records = Vec::new();
    for element in doc.select(&container) {
        let mut record = Record::new();
        for (name, selector, attribute) in &fields {
            let raw = element
                .select(selector)
                .next()
                .and_then(|el| read_element(el, *attribute));
            let value = match raw {
                Some(raw) => coerce(&raw, schema.get(*name).copied(), base),
                None => Value::Null,
            };
            record.insert((*name).clone(), value);
        }
        records.push(record);
    }
    Ok(records)
}

fn read_element(el: ElementRef<'_>, attribute: Option<&str>) -> Option<String> {
    match attribute {
        Some(attr) => el.value().attr(attr).map(|v| v.trim().to_string()),
        None => Some(collapse_whitespace(&el.text().collect::<String>())),
    }
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
}

/// Coerce raw page text to the declared field type. Text that does not fit
/// the type is kept as a string rather than dropped.
fn coerce(raw: &str, field_type: Option<FieldType>, base: &Url) -> Value {
    match field_type.unwrap_or(FieldType::Text) {
        FieldType::Text | FieldType::Date => Value::String(raw.to_string()),
        FieldType::Number => {
            let cleaned = raw.replace(',', "");
            NUMBER_RE
                .find(&cleaned)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .and_then(Number::from_f64)
                .map_or_else(|| Value::String(raw.to_string()), Value::Number)
        }
        FieldType::Integer => {
            let cleaned = raw.replace(',', "");
            NUMBER_RE
                .find(&cleaned)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .map_or_else(
                    || Value::String(raw.to_string()),
                    |n| Value::from(n.trunc() as i64),
                )
        }
        FieldType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Value::Bool(true),
            "false" | "no" | "0" | "off" | "" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        FieldType::Url => base
            .join(raw)
            .map_or_else(|_| Value::String(raw.to_string()), |u| Value::String(u.into())),
    }
}

/// Resolve the next page URL; `None` when there is nothing to follow.
fn find_next_link(doc: &Html, base: &Url, pagination: &Pagination) -> Result<Option<Url>> {
    let element = match (
        pagination.next_selector.as_deref().filter(|s| !s.trim().is_empty()),
        pagination.next_text.as_deref().filter(|s| !s.trim().is_empty()),
    ) {
        (Some(css), _) => doc.select(&parse_selector(css)?).next(),
        (None, Some(text)) => {
            let wanted = text.trim().to_lowercase();
            let candidates = parse_selector("a, button, [role=button]")?;
            doc.select(&candidates)
                .find(|el| collapse_whitespace(&el.text().collect::<String>()).to_lowercase() == wanted)
        }
        (None, None) => None,
    };

    let Some(href) = element.and_then(|el| el.value().attr("href")) else {
        return Ok(None);
    };

    if href.starts_with('#') || href.starts_with("javascript:") {
        return Ok(None);
    }

    let mut next = base
        .join(href)
        .map_err(|e| SiteflowError::Agent(format!("invalid next link {href}: {e}")))?;
    next.set_fragment(None);

    let mut current = base.clone();
    current.set_fragment(None);
    Ok((next != current).then_some(next))
}

fn page_content(doc: &Html, url: &Url) -> PageContent {
    let first_text = |css: &str| -> Option<String> {
        let sel = Selector::parse(css).ok()?;
        doc.select(&sel)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .filter(|t| !t.is_empty())
    };

    let title = first_text("title")
        .or_else(|| first_text("h1"))
        .unwrap_or_default();
    let text = first_text("body").unwrap_or_default();

    PageContent {
        url: url.to_string(),
        title,
        text,
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    // Block non-HTTP schemes
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
