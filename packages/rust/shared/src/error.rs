//! Error types for Siteflow.
//!
//! Library crates use [`SiteflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Every failure is recovered at the boundary of the unit that failed
//! (site, stage, sink, action), so each variant carries enough context to
//! identify that unit in logs.

use std::path::PathBuf;

/// Top-level error type for all Siteflow operations.
#[derive(Debug, thiserror::Error)]
pub enum SiteflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A site could not be collected at all.
    #[error("collection error for {site}: {message}")]
    Collection { site: String, message: String },

    /// A processing stage failed; the rest of the chain is skipped.
    #[error("processor #{index} ({stage}) failed: {message}")]
    Processor {
        index: usize,
        stage: String,
        message: String,
    },

    /// A single sink failed to deliver.
    #[error("output error ({sink}): {message}")]
    Output { sink: String, message: String },

    /// An automation action failed; remaining actions of that run are skipped.
    #[error("task {task_id} action #{index} ({action}) failed: {message}")]
    TaskAction {
        task_id: String,
        index: usize,
        action: String,
        message: String,
    },

    /// Malformed schedule, rejected at creation time.
    #[error("scheduling error: {message}")]
    Scheduling { message: String },

    /// Network/HTTP error.
    #[error("network error: {0}")]
    Network(String),

    /// Page agent failure (open, extract, click, ...).
    #[error("page agent error: {0}")]
    Agent(String),

    /// A collaborator call exceeded its time budget.
    #[error("timed out after {millis} ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// Inference backend error (HTTP status, malformed response).
    #[error("inference error: {0}")]
    Inference(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Unknown pipeline, task or key.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad definition, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SiteflowError>;

impl SiteflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a collection error for a site URL.
    pub fn collection(site: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Collection {
            site: site.into(),
            message: msg.into(),
        }
    }

    /// Create a processor error for the stage at `index`.
    pub fn processor(index: usize, stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Processor {
            index,
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create an output error for a sink type.
    pub fn output(sink: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Output {
            sink: sink.into(),
            message: msg.into(),
        }
    }

    /// Create a task action error.
    pub fn task_action(
        task_id: impl Into<String>,
        index: usize,
        action: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::TaskAction {
            task_id: task_id.into(),
            index,
            action: action.into(),
            message: msg.into(),
        }
    }

    /// Create a scheduling error from any displayable message.
    pub fn scheduling(msg: impl Into<String>) -> Self {
        Self::Scheduling {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
