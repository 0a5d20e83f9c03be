//! Execution engine: owns the registry and every collaborator a run needs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{info, warn};

use siteflow_collector::{PageAgent, SiteCollector, TimeoutAgent};
use siteflow_inference::InferenceBackend;
use siteflow_processing::ProcessingChain;
use siteflow_shared::{
    AppConfig, EntityId, EntityKind, Result, RunRecord, RunStatus, Schedule, SiteflowError,
    expand_home,
};
use siteflow_sinks::SinkDispatcher;
use siteflow_storage::PersistenceStore;

use crate::clock::{Clock, SystemClock};
use crate::notify::{ExecutionNotifier, LogNotifier};
use crate::registry::Registry;

/// What happened when a pipeline or task was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run finished; pipelines report the delivered batch size.
    Completed {
        run_id: EntityId,
        records: Option<u64>,
    },
    /// The run started and failed.
    Failed { run_id: EntityId, error: String },
    /// Nothing ran: the entity is missing, disabled, or out of runs.
    Skipped { reason: String },
    /// A previous run of the same entity was still in flight.
    Suppressed,
}

impl RunOutcome {
    pub(crate) fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed {
                run_id,
                records: Some(n),
            } => write!(f, "completed run {run_id} ({n} records)"),
            Self::Completed { run_id, .. } => write!(f, "completed run {run_id}"),
            Self::Failed { run_id, error } => write!(f, "run {run_id} failed: {error}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::Suppressed => f.write_str("suppressed: a run is already in flight"),
        }
    }
}

// ---------------------------------------------------------------------------
// Re-entrancy guard
// ---------------------------------------------------------------------------

/// Ids with a run in flight.
#[derive(Default)]
pub(crate) struct InFlight {
    ids: Mutex<HashSet<EntityId>>,
}

impl InFlight {
    /// Claim `id`, or `None` if it is already running.
    pub(crate) fn try_acquire(&self, id: EntityId) -> Option<InFlightGuard<'_>> {
        let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.insert(id).then_some(InFlightGuard { owner: self, id })
    }
}

/// Releases its id on drop, however the run ends.
pub(crate) struct InFlightGuard<'a> {
    owner: &'a InFlight,
    id: EntityId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut ids = self.owner.ids.lock().unwrap_or_else(|e| e.into_inner());
        ids.remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs pipelines and tasks against the registry.
pub struct Engine {
    pub(crate) config: AppConfig,
    pub(crate) registry: Registry,
    pub(crate) store: Arc<dyn PersistenceStore>,
    pub(crate) agent: Arc<dyn PageAgent>,
    pub(crate) collector: SiteCollector,
    pub(crate) chain: ProcessingChain,
    pub(crate) sinks: SinkDispatcher,
    pub(crate) inference: Option<Arc<dyn InferenceBackend>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) notifier: Arc<dyn ExecutionNotifier>,
    pub(crate) in_flight: InFlight,
}

impl Engine {
    pub fn builder(
        config: AppConfig,
        store: Arc<dyn PersistenceStore>,
        agent: Arc<dyn PageAgent>,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            agent,
            inference: None,
            clock: None,
            notifier: None,
            http: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persist a finished run. Storage failures are logged, not propagated.
    pub(crate) async fn record_run(
        &self,
        parent_id: EntityId,
        kind: EntityKind,
        started_at: DateTime<Utc>,
        status: RunStatus,
        error: Option<String>,
        records: Option<u64>,
    ) -> EntityId {
        let run = RunRecord {
            id: EntityId::new(),
            parent_id,
            kind,
            started_at,
            ended_at: self.clock.now(),
            status,
            error,
            records,
        };
        if let Err(e) = self.store.record_run(&run).await {
            warn!(run_id = %run.id, %parent_id, error = %e, "failed to record run");
        }
        run.id
    }
}

/// Next fire time to store after a run started at `now`.
///
/// A time already in the future was set by the scheduler and stays. Anything
/// else moves to the first slot after `now`.
pub(crate) fn upcoming(
    schedule: Option<&Schedule>,
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let schedule = schedule?;
    if let Some(next) = current.filter(|next| *next > now) {
        return Some(next);
    }
    match schedule.next_due(now, now) {
        Ok(next) => Some(next),
        Err(e) => {
            warn!(error = %e, "stored schedule no longer parses");
            None
        }
    }
}

/// Collaborators for an [`Engine`]; the rest fall back to defaults.
pub struct EngineBuilder {
    config: AppConfig,
    store: Arc<dyn PersistenceStore>,
    agent: Arc<dyn PageAgent>,
    inference: Option<Arc<dyn InferenceBackend>>,
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn ExecutionNotifier>>,
    http: Option<Client>,
}

impl EngineBuilder {
    pub fn inference(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.inference = Some(backend);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// HTTP client shared by enrichment and webhook sinks.
    pub fn http_client(mut self, client: Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Wire everything up and load the registry from the store.
    pub async fn build(self) -> Result<Arc<Engine>> {
        let http = match self.http {
            Some(client) => client,
            None => Client::builder()
                .user_agent(&self.config.agent.user_agent)
                .timeout(self.config.agent.call_timeout())
                .build()
                .map_err(|e| SiteflowError::Network(e.to_string()))?,
        };

        let agent: Arc<dyn PageAgent> =
            Arc::new(TimeoutAgent::new(self.agent, self.config.agent.call_timeout()));
        let output_dir = expand_home(&self.config.defaults.output_dir);

        let registry = Registry::new(self.store.clone());
        registry.load().await?;

        info!(
            inference = self.inference.is_some(),
            output_dir = %output_dir.display(),
            "engine ready"
        );

        Ok(Arc::new(Engine {
            collector: SiteCollector::new(agent.clone()),
            chain: ProcessingChain::new(http.clone(), self.inference.clone()),
            sinks: SinkDispatcher::new(self.store.clone(), http, output_dir),
            registry,
            store: self.store,
            agent,
            inference: self.inference,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            in_flight: InFlight::default(),
            config: self.config,
        }))
    }
}
