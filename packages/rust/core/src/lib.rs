//! Orchestration for Siteflow.
//!
//! [`Engine`] owns the [`Registry`] and the collaborators a run needs (page
//! agent, processing chain, sinks, inference, clock, notifier). It executes
//! pipelines and tasks on demand. [`Scheduler`] arms timers for scheduled
//! entities and fires them on the engine from a single loop.

mod actions;
pub mod clock;
pub mod engine;
pub mod notify;
mod pipeline;
pub mod registry;
pub mod scheduler;
mod task;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Engine, EngineBuilder, RunOutcome};
pub use notify::{
    ExecutionNotifier, LogNotifier, PipelineNotification, TaskNotification,
};
pub use registry::{Entity, Registry};
pub use scheduler::{EntityRef, Scheduler};
