//! Fakes shared by the engine and scheduler tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Notify;

use siteflow_collector::{OpenOptions, PageAgent, PageContent, PageHandle};
use siteflow_shared::{
    AppConfig, FieldSchema, Pagination, Record, Result, RunStatus, SiteSelectors, SiteflowError,
};
use siteflow_storage::{MemoryStore, PersistenceStore};

use crate::clock::{Clock, SystemClock};
use crate::engine::Engine;
use crate::notify::{ExecutionNotifier, PipelineNotification, TaskNotification};

/// Parks `open` until released.
pub(crate) struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

/// Serves fixed records per URL and counts what it was asked to do.
#[derive(Default)]
pub(crate) struct ScriptedAgent {
    pages: HashMap<String, Vec<Record>>,
    failing: HashSet<String>,
    gate: Option<Arc<Gate>>,
    open_pages: Mutex<HashMap<PageHandle, String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    screenshots: AtomicUsize,
    scripts: AtomicUsize,
}

impl ScriptedAgent {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn page(mut self, url: &str, records: Vec<Value>) -> Self {
        let records = records
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        self.pages.insert(url.to_string(), records);
        self
    }

    pub(crate) fn failing_open(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub(crate) fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn screenshots(&self) -> usize {
        self.screenshots.load(Ordering::SeqCst)
    }

    pub(crate) fn scripts(&self) -> usize {
        self.scripts.load(Ordering::SeqCst)
    }

    fn url_of(&self, handle: &PageHandle) -> Result<String> {
        self.open_pages
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .ok_or_else(|| SiteflowError::Agent(format!("unknown page {handle}")))
    }
}

#[async_trait]
impl PageAgent for ScriptedAgent {
    async fn open(&self, url: &str, _options: &OpenOptions) -> Result<PageHandle> {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.failing.contains(url) || !self.pages.contains_key(url) {
            return Err(SiteflowError::Agent(format!("connection refused: {url}")));
        }
        let handle = PageHandle::new();
        self.open_pages.lock().unwrap().insert(handle, url.to_string());
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn navigate(&self, handle: &PageHandle, url: &str, _options: &OpenOptions) -> Result<()> {
        if !self.pages.contains_key(url) {
            return Err(SiteflowError::Agent(format!("connection refused: {url}")));
        }
        self.open_pages.lock().unwrap().insert(*handle, url.to_string());
        Ok(())
    }

    async fn await_load(&self, _handle: &PageHandle) -> Result<()> {
        Ok(())
    }

    async fn extract(
        &self,
        handle: &PageHandle,
        _selectors: &SiteSelectors,
        _schema: &FieldSchema,
    ) -> Result<Vec<Record>> {
        let url = self.url_of(handle)?;
        Ok(self.pages.get(&url).cloned().unwrap_or_default())
    }

    async fn paginate_next(&self, _handle: &PageHandle, _pagination: &Pagination) -> Result<bool> {
        Ok(false)
    }

    async fn click(&self, _handle: &PageHandle, selector: &str) -> Result<()> {
        if selector.contains("missing") {
            return Err(SiteflowError::Agent(format!("no element matches {selector}")));
        }
        Ok(())
    }

    async fn fill_form(
        &self,
        _handle: &PageHandle,
        _fields: &BTreeMap<String, String>,
        _submit: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    async fn screenshot(&self, _handle: &PageHandle) -> Result<Vec<u8>> {
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn run_script(&self, _handle: &PageHandle, _code: &str) -> Result<Value> {
        self.scripts.fetch_add(1, Ordering::SeqCst);
        Ok(json!("Example"))
    }

    async fn content(&self, handle: &PageHandle) -> Result<PageContent> {
        Ok(PageContent {
            url: self.url_of(handle)?,
            title: "Example".into(),
            text: "Example page body".into(),
        })
    }

    async fn close(&self, handle: &PageHandle) -> Result<()> {
        self.open_pages.lock().unwrap().remove(handle);
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Keeps every notification it receives.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    tasks: Mutex<Vec<TaskNotification>>,
    pipelines: Mutex<Vec<PipelineNotification>>,
}

impl RecordingNotifier {
    pub(crate) fn task_statuses(&self) -> Vec<RunStatus> {
        self.tasks.lock().unwrap().iter().map(|n| n.status).collect()
    }

    pub(crate) fn pipeline_statuses(&self) -> Vec<RunStatus> {
        self.pipelines.lock().unwrap().iter().map(|n| n.status).collect()
    }
}

impl ExecutionNotifier for RecordingNotifier {
    fn task_executed(&self, notification: &TaskNotification) {
        self.tasks.lock().unwrap().push(notification.clone());
    }

    fn pipeline_finished(&self, notification: &PipelineNotification) {
        self.pipelines.lock().unwrap().push(notification.clone());
    }
}

pub(crate) async fn build_engine(
    agent: Arc<dyn PageAgent>,
    config: AppConfig,
    clock: Arc<dyn Clock>,
) -> (Arc<Engine>, Arc<RecordingNotifier>) {
    build_engine_on(Arc::new(MemoryStore::new()), agent, config, clock).await
}

/// Like [`build_engine`], over a store other engines may share.
pub(crate) async fn build_engine_on(
    store: Arc<dyn PersistenceStore>,
    agent: Arc<dyn PageAgent>,
    config: AppConfig,
    clock: Arc<dyn Clock>,
) -> (Arc<Engine>, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = Engine::builder(config, store, agent)
        .clock(clock)
        .notifier(notifier.clone())
        .build()
        .await
        .unwrap();
    (engine, notifier)
}

pub(crate) async fn engine_with_config(
    agent: Arc<dyn PageAgent>,
    config: AppConfig,
) -> (Arc<Engine>, Arc<RecordingNotifier>) {
    build_engine(agent, config, Arc::new(SystemClock)).await
}

pub(crate) async fn engine_with(agent: Arc<dyn PageAgent>) -> (Arc<Engine>, Arc<RecordingNotifier>) {
    engine_with_config(agent, AppConfig::default()).await
}
