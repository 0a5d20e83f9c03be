//! Shared types, error model, and configuration for Siteflow.
//!
//! This crate is the foundation depended on by all other Siteflow crates.
//! It provides:
//! - [`SiteflowError`]: the unified error type
//! - Domain types ([`Pipeline`], [`Task`], [`Action`], [`Record`], [`RunRecord`])
//! - Schedules ([`Schedule`], [`Cadence`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod schedule;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AgentConfig, AppConfig, AutomationConfig, DefaultsConfig, InferenceConfig, SchedulerConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    resolve_api_key,
};
pub use error::{Result, SiteflowError};
pub use schedule::{Cadence, Schedule, ScheduleKind};
pub use types::{
    Action, ConvertTarget, EmailSinkConfig, EnrichSource, EntityId, EntityKind, ExtractFormat,
    FIELD_AI_ANALYSIS, FIELD_COLLECTED_AT, FIELD_PAGE, FIELD_PIPELINE, FIELD_SOURCE, FieldRule,
    FieldSchema, FieldSelector, FieldType, FileSinkConfig, FilterCondition, FilterOperator,
    NewPipeline, NewTask, OutputConfig, Pagination, Pipeline, Processor, Record, RunRecord,
    RunStatus, SiteConfig, SiteSelectors, StorageSinkConfig, Task, TransformOp, ValueKind,
    WebhookSinkConfig,
};
