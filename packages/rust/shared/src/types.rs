//! Core domain types: pipelines, sites, processors, outputs, tasks, actions, runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::schedule::Schedule;

/// A collected record: flat key → JSON value map.
pub type Record = serde_json::Map<String, Value>;

/// Field name → declared type, used to coerce extracted text.
pub type FieldSchema = BTreeMap<String, FieldType>;

/// Provenance: URL the record was collected from.
pub const FIELD_SOURCE: &str = "_source";
/// Provenance: RFC 3339 collection timestamp.
pub const FIELD_COLLECTED_AT: &str = "_collected_at";
/// Provenance: 1-based page number within the site.
pub const FIELD_PAGE: &str = "_page";
/// Provenance: owning pipeline id.
pub const FIELD_PIPELINE: &str = "_pipeline";
/// Text attached by the `ai_analysis` processor.
pub const FIELD_AI_ANALYSIS: &str = "_ai_analysis";

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline, task and run identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    /// Generate a new time-sortable identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Which registry an entity lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Pipeline,
    Task,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipeline => "pipeline",
            Self::Task => "task",
        }
    }
}

// ---------------------------------------------------------------------------
// Site config
// ---------------------------------------------------------------------------

/// Declared type of an extracted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Integer,
    Boolean,
    Url,
    Date,
}

/// How to read one field out of a container element.
///
/// Either a bare CSS selector (text content, `selector@attr` shorthand for an
/// attribute) or an explicit `{selector, attribute}` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSelector {
    Css(String),
    Detailed {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attribute: Option<String>,
    },
}

impl FieldSelector {
    /// The CSS part of the selector.
    pub fn css(&self) -> &str {
        match self {
            Self::Css(s) => s.split_once('@').map_or(s.as_str(), |(css, _)| css).trim(),
            Self::Detailed { selector, .. } => selector.trim(),
        }
    }

    /// Attribute to read instead of text content, if any.
    pub fn attribute(&self) -> Option<&str> {
        match self {
            Self::Css(s) => s.split_once('@').map(|(_, attr)| attr.trim()),
            Self::Detailed { attribute, .. } => attribute.as_deref(),
        }
    }
}

/// Container + per-field selectors for record extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSelectors {
    /// Selector matching one element per record.
    pub container: String,
    /// Field name → selector relative to the container.
    pub fields: BTreeMap<String, FieldSelector>,
}

/// How to advance to the next page of a site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Selector of the "next" link/button.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_selector: Option<String>,
    /// Visible text of the "next" link/button (used when no selector is set).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_text: Option<String>,
}

impl Pagination {
    /// Whether either strategy is configured.
    pub fn is_configured(&self) -> bool {
        self.next_selector.as_deref().is_some_and(|s| !s.trim().is_empty())
            || self.next_text.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

/// One external source of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub url: String,
    pub selectors: SiteSelectors,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    /// Delay after load and between pages.
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cookies: BTreeMap<String, String>,
}

fn default_wait_time_ms() -> u64 {
    1000
}
fn default_max_pages() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Processors
// ---------------------------------------------------------------------------

/// Comparison used by a filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
    Regex,
}

/// A single filter predicate over a (dotted) field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

/// Target type of a `convert_type` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvertTarget {
    Number,
    String,
    Boolean,
    Date,
}

/// One per-record transform operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformOp {
    Rename {
        from: String,
        to: String,
    },
    ConvertType {
        field: String,
        to: ConvertTarget,
    },
    ExtractRegex {
        field: String,
        pattern: String,
        /// Where to write the match; defaults to overwriting `field`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    Calculate {
        target: String,
        formula: String,
    },
}

/// An HTTP enrichment source. `{field}` placeholders in the URL are
/// substituted from the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichSource {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Prefix applied to every merged key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Expected JSON type of a validated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// Validation rules for one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    #[serde(default)]
    pub required: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// A batch transform stage, serialized as `{"type": ..., "config": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum Processor {
    Filter {
        conditions: Vec<FilterCondition>,
    },
    Transform {
        operations: Vec<TransformOp>,
    },
    Deduplicate {
        unique_field: String,
    },
    Enrich {
        sources: Vec<EnrichSource>,
    },
    AiAnalysis {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
    },
    Validate {
        schema: BTreeMap<String, FieldRule>,
    },
}

impl Processor {
    /// Stage type name, as used in the definition format.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Filter { .. } => "filter",
            Self::Transform { .. } => "transform",
            Self::Deduplicate { .. } => "deduplicate",
            Self::Enrich { .. } => "enrich",
            Self::AiAnalysis { .. } => "ai_analysis",
            Self::Validate { .. } => "validate",
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// `storage` sink settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSinkConfig {
    /// Store key; defaults to `dataset:{pipeline}:{timestamp}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// `csv` / `json` sink settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSinkConfig {
    /// Destination file; defaults to `{output_dir}/{pipeline}-{timestamp}.{ext}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// `webhook` sink settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSinkConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// `email` sink settings (declared, not delivered).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSinkConfig {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// A delivery target, serialized as `{"type": ..., "config": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum OutputConfig {
    Storage(StorageSinkConfig),
    Csv(FileSinkConfig),
    Json(FileSinkConfig),
    Webhook(WebhookSinkConfig),
    Email(EmailSinkConfig),
}

impl OutputConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::Csv(_) => "csv",
            Self::Json(_) => "json",
            Self::Webhook(_) => "webhook",
            Self::Email(_) => "email",
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Definition fields supplied when creating a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPipeline {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub sites: Vec<SiteConfig>,
    #[serde(default)]
    pub processors: Vec<Processor>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub schema: FieldSchema,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A registered pipeline: definition plus run bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub sites: Vec<SiteConfig>,
    #[serde(default)]
    pub processors: Vec<Processor>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub schema: FieldSchema,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    /// Records delivered across all successful runs; never decreases.
    #[serde(default)]
    pub total_records: u64,
}

impl Pipeline {
    /// Build a fresh pipeline with a new id from a definition.
    pub fn from_definition(def: NewPipeline, now: DateTime<Utc>) -> Self {
        Self {
            id: EntityId::new(),
            name: def.name,
            description: def.description,
            sites: def.sites,
            processors: def.processors,
            outputs: def.outputs,
            schedule: def.schedule,
            schema: def.schema,
            enabled: def.enabled,
            created_at: now,
            last_run: None,
            next_run: None,
            total_records: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Task & actions
// ---------------------------------------------------------------------------

/// Serialization format of an `extract_data` result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractFormat {
    #[default]
    Json,
    Csv,
}

/// One automation step executed against the page agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    Click {
        selector: String,
        #[serde(default = "default_click_wait_ms")]
        wait_ms: u64,
    },
    ExtractData {
        selectors: SiteSelectors,
        #[serde(default)]
        schema: FieldSchema,
        #[serde(default)]
        format: ExtractFormat,
    },
    FillForm {
        fields: BTreeMap<String, String>,
        /// Selector of the submit control; the form is not submitted when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        submit: Option<String>,
    },
    Screenshot,
    Wait {
        ms: u64,
    },
    /// Privileged: only runs when script actions are enabled in config.
    Script {
        code: String,
    },
    AiAnalysis {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
    },
}

fn default_click_wait_ms() -> u64 {
    500
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::ExtractData { .. } => "extract_data",
            Self::FillForm { .. } => "fill_form",
            Self::Screenshot => "screenshot",
            Self::Wait { .. } => "wait",
            Self::Script { .. } => "script",
            Self::AiAnalysis { .. } => "ai_analysis",
        }
    }
}

/// Definition fields supplied when creating a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub schedule: Schedule,
    pub actions: Vec<Action>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A registered recurring task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: EntityId,
    pub name: String,
    pub schedule: Schedule,
    pub actions: Vec<Action>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Task {
    /// Build a fresh task with a new id from a definition.
    pub fn from_definition(def: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: EntityId::new(),
            name: def.name,
            schedule: def.schedule,
            actions: def.actions,
            enabled: def.enabled,
            created_at: now,
            last_run: None,
            next_run: None,
            run_count: 0,
            max_runs: def.max_runs,
            tags: def.tags,
        }
    }

    /// Whether `max_runs` is set and already reached.
    pub fn runs_exhausted(&self) -> bool {
        self.max_runs.is_some_and(|max| self.run_count >= max)
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Final status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Outcome of a single pipeline or task execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: EntityId,
    pub parent_id: EntityId,
    pub kind: EntityKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final batch size, for pipeline runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<u64>,
}
