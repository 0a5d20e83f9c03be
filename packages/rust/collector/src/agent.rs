//! The page agent abstraction: a capability that opens pages, extracts
//! structured data and performs interactive steps.
//!
//! Every call may fail with an agent error. [`TimeoutAgent`] bounds each
//! call with a time budget so a hung collaborator cannot stall a run.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use siteflow_shared::{FieldSchema, Pagination, Record, Result, SiteSelectors, SiteflowError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Opaque reference to a page opened by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle(pub Uuid);

impl PageHandle {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for PageHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Request decoration applied when opening or navigating a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
}

/// Readable content of the current page, fed to inference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageContent {
    pub url: String,
    pub title: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// External page-rendering capability.
#[async_trait]
pub trait PageAgent: Send + Sync {
    /// Open `url` in a fresh page.
    async fn open(&self, url: &str, options: &OpenOptions) -> Result<PageHandle>;

    /// Navigate an open page to another URL.
    async fn navigate(&self, handle: &PageHandle, url: &str, options: &OpenOptions) -> Result<()>;

    /// Wait until the page has finished loading.
    async fn await_load(&self, handle: &PageHandle) -> Result<()>;

    /// One record per container match; fields missing on the page are `null`.
    async fn extract(
        &self,
        handle: &PageHandle,
        selectors: &SiteSelectors,
        schema: &FieldSchema,
    ) -> Result<Vec<Record>>;

    /// Follow the "next" control. `Ok(false)` means there is no further page.
    async fn paginate_next(&self, handle: &PageHandle, pagination: &Pagination) -> Result<bool>;

    async fn click(&self, handle: &PageHandle, selector: &str) -> Result<()>;

    /// Fill inputs (selector → value) and optionally activate `submit`.
    async fn fill_form(
        &self,
        handle: &PageHandle,
        fields: &BTreeMap<String, String>,
        submit: Option<&str>,
    ) -> Result<()>;

    /// PNG bytes of the current viewport.
    async fn screenshot(&self, handle: &PageHandle) -> Result<Vec<u8>>;

    async fn run_script(&self, handle: &PageHandle, code: &str) -> Result<Value>;

    async fn content(&self, handle: &PageHandle) -> Result<PageContent>;

    /// Release the page. Closing an unknown handle is not an error.
    async fn close(&self, handle: &PageHandle) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Time-bounded wrapper
// ---------------------------------------------------------------------------

/// Wraps an agent so every call fails with [`SiteflowError::Timeout`] once
/// it exceeds `budget`.
pub struct TimeoutAgent {
    inner: Arc<dyn PageAgent>,
    budget: Duration,
}

impl TimeoutAgent {
    pub fn new(inner: Arc<dyn PageAgent>, budget: Duration) -> Self {
        Self { inner, budget }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.budget, call).await {
            Ok(result) => result,
            Err(_) => Err(SiteflowError::Timeout {
                operation: format!("page agent {operation}"),
                millis: self.budget.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl PageAgent for TimeoutAgent {
    async fn open(&self, url: &str, options: &OpenOptions) -> Result<PageHandle> {
        self.bounded("open", self.inner.open(url, options)).await
    }

    async fn navigate(&self, handle: &PageHandle, url: &str, options: &OpenOptions) -> Result<()> {
        self.bounded("navigate", self.inner.navigate(handle, url, options))
            .await
    }

    async fn await_load(&self, handle: &PageHandle) -> Result<()> {
        self.bounded("await_load", self.inner.await_load(handle)).await
    }

    async fn extract(
        &self,
        handle: &PageHandle,
        selectors: &SiteSelectors,
        schema: &FieldSchema,
    ) -> Result<Vec<Record>> {
        self.bounded("extract", self.inner.extract(handle, selectors, schema))
            .await
    }

    async fn paginate_next(&self, handle: &PageHandle, pagination: &Pagination) -> Result<bool> {
        self.bounded("paginate", self.inner.paginate_next(handle, pagination))
            .await
    }

    async fn click(&self, handle: &PageHandle, selector: &str) -> Result<()> {
        self.bounded("click", self.inner.click(handle, selector)).await
    }

    async fn fill_form(
        &self,
        handle: &PageHandle,
        fields: &BTreeMap<String, String>,
        submit: Option<&str>,
    ) -> Result<()> {
        self.bounded("fill_form", self.inner.fill_form(handle, fields, submit))
            .await
    }

    async fn screenshot(&self, handle: &PageHandle) -> Result<Vec<u8>> {
        self.bounded("screenshot", self.inner.screenshot(handle)).await
    }

    async fn run_script(&self, handle: &PageHandle, code: &str) -> Result<Value> {
        self.bounded("script", self.inner.run_script(handle, code))
            .await
    }

    async fn content(&self, handle: &PageHandle) -> Result<PageContent> {
        self.bounded("content", self.inner.content(handle)).await
    }

    async fn close(&self, handle: &PageHandle) -> Result<()> {
        self.bounded("close", self.inner.close(handle)).await
    }
}
