//! Per-site collection: open, extract, paginate, close.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use siteflow_shared::{
    EntityId, FIELD_COLLECTED_AT, FIELD_PAGE, FIELD_PIPELINE, FIELD_SOURCE, FieldSchema, Record,
    SiteConfig, SiteflowError,
};

use crate::agent::{OpenOptions, PageAgent, PageHandle};

/// Outcome of collecting one site.
///
/// `records` holds everything gathered before any failure; `error` is set
/// when collection stopped early or never started.
#[derive(Debug)]
pub struct CollectionReport {
    pub site: String,
    pub records: Vec<Record>,
    pub pages_visited: u32,
    pub error: Option<SiteflowError>,
}

impl CollectionReport {
    fn failed(site: &str, error: SiteflowError) -> Self {
        Self {
            site: site.to_string(),
            records: Vec::new(),
            pages_visited: 0,
            error: Some(error),
        }
    }
}

/// Collects records from sites through a [`PageAgent`].
pub struct SiteCollector {
    agent: Arc<dyn PageAgent>,
}

impl SiteCollector {
    pub fn new(agent: Arc<dyn PageAgent>) -> Self {
        Self { agent }
    }

    /// Collect one site. Never fails as a whole: failures are reported in the
    /// returned [`CollectionReport`] alongside any partial records.
    #[instrument(skip_all, fields(site = %site.url, pipeline = %pipeline_id))]
    pub async fn collect(
        &self,
        site: &SiteConfig,
        schema: &FieldSchema,
        pipeline_id: &EntityId,
        collected_at: DateTime<Utc>,
    ) -> CollectionReport {
        let options = OpenOptions {
            headers: site.headers.clone(),
            cookies: site.cookies.clone(),
        };

        let handle = match self.agent.open(&site.url, &options).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "failed to open site");
                return CollectionReport::failed(
                    &site.url,
                    SiteflowError::collection(&site.url, e.to_string()),
                );
            }
        };

        let report = self
            .collect_pages(&handle, site, schema, pipeline_id, collected_at)
            .await;

        if let Err(e) = self.agent.close(&handle).await {
            warn!(error = %e, "failed to close page");
        }

        info!(
            records = report.records.len(),
            pages = report.pages_visited,
            failed = report.error.is_some(),
            "site collected"
        );
        report
    }

    async fn collect_pages(
        &self,
        handle: &PageHandle,
        site: &SiteConfig,
        schema: &FieldSchema,
        pipeline_id: &EntityId,
        collected_at: DateTime<Utc>,
    ) -> CollectionReport {
        let mut report = CollectionReport {
            site: site.url.clone(),
            records: Vec::new(),
            pages_visited: 0,
            error: None,
        };
        let wait = Duration::from_millis(site.wait_time_ms);
        let stop = |e: SiteflowError| SiteflowError::collection(&site.url, e.to_string());

        if let Err(e) = self.agent.await_load(handle).await {
            report.error = Some(stop(e));
            return report;
        }
        pause(wait).await;

        let max_pages = site.max_pages.max(1);
        let pagination = site.pagination.as_ref().filter(|p| p.is_configured());

        for page in 1..=max_pages {
            match self.agent.extract(handle, &site.selectors, schema).await {
                Ok(batch) => {
                    debug!(page, records = batch.len(), "page extracted");
                    report.pages_visited = page;
                    report.records.extend(batch.into_iter().map(|record| {
                        tag(record, &site.url, collected_at, page, pipeline_id)
                    }));
                }
                Err(e) => {
                    warn!(page, error = %e, "extraction failed, keeping earlier pages");
                    report.error = Some(stop(e));
                    break;
                }
            }

            let Some(pagination) = pagination else { break };
            if page == max_pages {
                break;
            }

            match self.agent.paginate_next(handle, pagination).await {
                Ok(true) => {
                    if let Err(e) = self.agent.await_load(handle).await {
                        report.error = Some(stop(e));
                        break;
                    }
                    pause(wait).await;
                }
                Ok(false) => {
                    debug!(page, "no further page");
                    break;
                }
                Err(e) => {
                    warn!(page, error = %e, "pagination failed, keeping earlier pages");
                    report.error = Some(stop(e));
                    break;
                }
            }
        }

        report
    }
}

async fn pause(wait: Duration) {
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }
}

fn tag(
    mut record: Record,
    source: &str,
    collected_at: DateTime<Utc>,
    page: u32,
    pipeline_id: &EntityId,
) -> Record {
    record.insert(FIELD_SOURCE.into(), Value::String(source.to_string()));
    record.insert(
        FIELD_COLLECTED_AT.into(),
        Value::String(collected_at.to_rfc3339()),
    );
    record.insert(FIELD_PAGE.into(), Value::from(page));
    record.insert(FIELD_PIPELINE.into(), Value::String(pipeline_id.to_string()));
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use siteflow_shared::{FieldSelector, Pagination, Result, SiteSelectors};

    use crate::agent::PageContent;

    /// Serves `pages` records per page and fails extraction on `fail_on_page`.
    struct ScriptedAgent {
        pages: u32,
        fail_on_page: Option<u32>,
        fail_open: bool,
        current: AtomicU32,
        closed: AtomicU32,
    }

    impl ScriptedAgent {
        fn new(pages: u32) -> Self {
            Self {
                pages,
                fail_on_page: None,
                fail_open: false,
                current: AtomicU32::new(1),
                closed: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PageAgent for ScriptedAgent {
        async fn open(&self, url: &str, _: &OpenOptions) -> Result<PageHandle> {
            if self.fail_open {
                return Err(SiteflowError::Agent(format!("{url} unreachable")));
            }
            Ok(PageHandle::new())
        }
        async fn navigate(&self, _: &PageHandle, _: &str, _: &OpenOptions) -> Result<()> {
            Ok(())
        }
        async fn await_load(&self, _: &PageHandle) -> Result<()> {
            Ok(())
        }
        async fn extract(
            &self,
            _: &PageHandle,
            _: &SiteSelectors,
            _: &FieldSchema,
        ) -> Result<Vec<Record>> {
            let page = self.current.load(Ordering::SeqCst);
            if self.fail_on_page == Some(page) {
                return Err(SiteflowError::Agent("selector timed out".into()));
            }
            let mut record = Record::new();
            record.insert("title".into(), json!(format!("item {page}")));
            Ok(vec![record])
        }
        async fn paginate_next(&self, _: &PageHandle, _: &Pagination) -> Result<bool> {
            let page = self.current.load(Ordering::SeqCst);
            if page >= self.pages {
                return Ok(false);
            }
            self.current.store(page + 1, Ordering::SeqCst);
            Ok(true)
        }
        async fn click(&self, _: &PageHandle, _: &str) -> Result<()> {
            Ok(())
        }
        async fn fill_form(
            &self,
            _: &PageHandle,
            _: &BTreeMap<String, String>,
            _: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
        async fn screenshot(&self, _: &PageHandle) -> Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn run_script(&self, _: &PageHandle, _: &str) -> Result<Value> {
            Ok(Value::Null)
        }
        async fn content(&self, _: &PageHandle) -> Result<PageContent> {
            Ok(PageContent::default())
        }
        async fn close(&self, _: &PageHandle) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn site(max_pages: u32, paginated: bool) -> SiteConfig {
        SiteConfig {
            url: "https://shop.example.com".into(),
            selectors: SiteSelectors {
                container: ".item".into(),
                fields: BTreeMap::from([("title".to_string(), FieldSelector::Css("h2".into()))]),
            },
            pagination: paginated.then(|| Pagination {
                next_selector: Some("a.next".into()),
                next_text: None,
            }),
            wait_time_ms: 0,
            max_pages,
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
        }
    }

    async fn run(agent: Arc<ScriptedAgent>, site: &SiteConfig) -> CollectionReport {
        SiteCollector::new(agent)
            .collect(site, &FieldSchema::new(), &EntityId::new(), Utc::now())
            .await
    }

    #[tokio::test]
    async fn follows_pagination_up_to_max_pages() {
        let agent = Arc::new(ScriptedAgent::new(5));
        let report = run(agent.clone(), &site(3, true)).await;

        assert!(report.error.is_none());
        assert_eq!(report.pages_visited, 3);
        assert_eq!(report.records.len(), 3);
        assert_eq!(report.records[2]["title"], json!("item 3"));
        assert_eq!(report.records[2][FIELD_PAGE], json!(3));
        assert_eq!(report.records[0][FIELD_SOURCE], json!("https://shop.example.com"));
        assert!(report.records[0].contains_key(FIELD_COLLECTED_AT));
        assert!(report.records[0].contains_key(FIELD_PIPELINE));
        assert_eq!(agent.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_when_no_next_page() {
        let agent = Arc::new(ScriptedAgent::new(2));
        let report = run(agent, &site(10, true)).await;
        assert_eq!(report.pages_visited, 2);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn without_pagination_reads_one_page() {
        let agent = Arc::new(ScriptedAgent::new(5));
        let report = run(agent, &site(5, false)).await;
        assert_eq!(report.pages_visited, 1);
    }

    #[tokio::test]
    async fn failure_keeps_earlier_pages_and_closes() {
        let agent = Arc::new(ScriptedAgent {
            fail_on_page: Some(3),
            ..ScriptedAgent::new(5)
        });
        let report = run(agent.clone(), &site(5, true)).await;

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.pages_visited, 2);
        assert!(matches!(report.error, Some(SiteflowError::Collection { .. })));
        assert_eq!(agent.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_failure_yields_empty_report() {
        let agent = Arc::new(ScriptedAgent {
            fail_open: true,
            ..ScriptedAgent::new(1)
        });
        let report = run(agent.clone(), &site(1, false)).await;

        assert!(report.records.is_empty());
        assert!(report.error.is_some());
        assert_eq!(agent.closed.load(Ordering::SeqCst), 0);
    }
}
