//! Execution notifications.

use tracing::{info, warn};

use siteflow_shared::{EntityId, RunStatus};

/// Emitted after every task run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNotification {
    pub task_id: EntityId,
    pub name: String,
    pub status: RunStatus,
    pub message: String,
}

/// Emitted after every pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineNotification {
    pub pipeline_id: EntityId,
    pub name: String,
    pub status: RunStatus,
    pub records: u64,
    pub message: String,
}

/// Receives run notifications (desktop toasts, chat hooks, logs ...).
pub trait ExecutionNotifier: Send + Sync {
    fn task_executed(&self, notification: &TaskNotification);
    fn pipeline_finished(&self, notification: &PipelineNotification);
}

/// Writes notifications to the log.
pub struct LogNotifier;

impl ExecutionNotifier for LogNotifier {
    fn task_executed(&self, n: &TaskNotification) {
        match n.status {
            RunStatus::Failed => warn!(task_id = %n.task_id, name = %n.name, message = %n.message, "task failed"),
            _ => info!(task_id = %n.task_id, name = %n.name, status = n.status.as_str(), message = %n.message, "task executed"),
        }
    }

    fn pipeline_finished(&self, n: &PipelineNotification) {
        match n.status {
            RunStatus::Failed => warn!(pipeline_id = %n.pipeline_id, name = %n.name, message = %n.message, "pipeline failed"),
            _ => info!(pipeline_id = %n.pipeline_id, name = %n.name, records = n.records, "pipeline finished"),
        }
    }
}
