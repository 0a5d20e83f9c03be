//! Task execution and run-count bookkeeping.

use tracing::{debug, info, instrument, warn};

use siteflow_shared::{EntityId, EntityKind, RunStatus, Task};

use crate::actions::ActionExecutor;
use crate::engine::{Engine, RunOutcome, upcoming};
use crate::notify::TaskNotification;

impl Engine {
    /// Run one task's actions.
    ///
    /// A task that already reached `max_runs` is disabled without running.
    /// Otherwise `last_run`, `run_count` and `next_run` are updated before the
    /// actions start, and the task is disabled right after the run that
    /// reaches `max_runs`. A failing action fails the run but the task stays
    /// scheduled.
    #[instrument(skip_all, fields(task_id = %id))]
    pub async fn execute_task(&self, id: &EntityId) -> RunOutcome {
        let Some(_guard) = self.in_flight.try_acquire(*id) else {
            debug!("task already running, firing suppressed");
            return RunOutcome::Suppressed;
        };

        let task = match self.registry.refresh_task(id).await {
            Ok(Some(task)) => task,
            Ok(None) => return RunOutcome::skipped("task not found"),
            Err(e) => {
                warn!(error = %e, "could not read task");
                return RunOutcome::skipped(format!("task unavailable: {e}"));
            }
        };
        if !task.enabled {
            debug!("task disabled, nothing to do");
            return RunOutcome::skipped("task disabled");
        }

        let started = self.clock.now();

        if task.runs_exhausted() {
            self.disable_exhausted(&task).await;
            let reason = "maximum runs reached";
            self.record_run(
                *id,
                EntityKind::Task,
                started,
                RunStatus::Skipped,
                Some(reason.into()),
                None,
            )
            .await;
            self.notify_task(&task, RunStatus::Skipped, reason.into());
            return RunOutcome::skipped(reason);
        }

        let next_run = upcoming(Some(&task.schedule), task.next_run, started);
        let task = match self
            .registry
            .update_task(id, |t| {
                t.last_run = Some(started);
                t.run_count += 1;
                t.next_run = next_run;
            })
            .await
        {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "failed to record run start, task not run");
                let error = e.to_string();
                let run_id = self
                    .record_run(*id, EntityKind::Task, started, RunStatus::Failed, Some(error.clone()), None)
                    .await;
                self.notify_task(&task, RunStatus::Failed, error.clone());
                return RunOutcome::Failed { run_id, error };
            }
        };

        info!(name = %task.name, run = task.run_count, actions = task.actions.len(), "task run started");
        let result = ActionExecutor::new(self, &task).run().await;

        if task.runs_exhausted() {
            self.disable_exhausted(&task).await;
        }

        match result {
            Ok(actions) => {
                let run_id = self
                    .record_run(*id, EntityKind::Task, started, RunStatus::Succeeded, None, None)
                    .await;
                info!(%run_id, actions, "task run finished");
                self.notify_task(&task, RunStatus::Succeeded, format!("{actions} actions completed"));
                RunOutcome::Completed {
                    run_id,
                    records: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "task run failed");
                let error = e.to_string();
                let run_id = self
                    .record_run(*id, EntityKind::Task, started, RunStatus::Failed, Some(error.clone()), None)
                    .await;
                self.notify_task(&task, RunStatus::Failed, error.clone());
                RunOutcome::Failed { run_id, error }
            }
        }
    }

    async fn disable_exhausted(&self, task: &Task) {
        match self
            .registry
            .update_task(&task.id, |t| {
                t.enabled = false;
                t.next_run = None;
            })
            .await
        {
            Ok(_) => info!(run_count = task.run_count, max_runs = ?task.max_runs, "maximum runs reached, task disabled"),
            Err(e) => warn!(error = %e, "failed to disable exhausted task"),
        }
    }

    fn notify_task(&self, task: &Task, status: RunStatus, message: String) {
        self.notifier.task_executed(&TaskNotification {
            task_id: task.id,
            name: task.name.clone(),
            status,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use siteflow_shared::{Action, AppConfig, NewTask, Schedule, SiteflowError};
    use siteflow_storage::MemoryStore;

    use crate::clock::SystemClock;
    use crate::testing::{ScriptedAgent, build_engine_on, engine_with, engine_with_config};

    use super::*;

    fn definition(actions: Vec<Action>, max_runs: Option<u32>) -> NewTask {
        NewTask {
            name: "watch".into(),
            schedule: Schedule::interval_minutes(5),
            actions,
            enabled: true,
            max_runs,
            tags: vec![],
        }
    }

    fn navigate(url: &str) -> Action {
        Action::Navigate {
            url: url.into(),
            headers: Default::default(),
        }
    }

    #[tokio::test]
    async fn max_runs_stops_after_limit() {
        let agent = Arc::new(ScriptedAgent::new().page("https://a.example.com", vec![]));
        let (engine, notifier) = engine_with(agent).await;
        let task = engine
            .registry()
            .create_task(definition(vec![navigate("https://a.example.com")], Some(3)), engine.now())
            .await
            .unwrap();

        let mut completed = 0;
        for _ in 0..4 {
            if let RunOutcome::Completed { .. } = engine.execute_task(&task.id).await {
                completed += 1;
            }
        }

        assert_eq!(completed, 3);
        let stored = engine.registry().task(&task.id).await.unwrap();
        assert_eq!(stored.run_count, 3);
        assert!(!stored.enabled);
        assert!(stored.next_run.is_none());
        assert_eq!(notifier.task_statuses().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_task_is_disabled_without_running() {
        let agent = Arc::new(ScriptedAgent::new());
        let (engine, _) = engine_with(agent.clone()).await;
        let task = engine
            .registry()
            .create_task(definition(vec![navigate("https://a.example.com")], Some(1)), engine.now())
            .await
            .unwrap();
        // Loaded from an older store where the limit was already hit.
        engine
            .registry()
            .update_task(&task.id, |t| t.run_count = 1)
            .await
            .unwrap();

        let outcome = engine.execute_task(&task.id).await;
        assert_eq!(outcome, RunOutcome::skipped("maximum runs reached"));
        assert!(!engine.registry().task(&task.id).await.unwrap().enabled);
        assert_eq!(agent.opened(), 0);
    }

    #[tokio::test]
    async fn task_deleted_through_another_engine_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let agent = Arc::new(ScriptedAgent::new().page("https://a.example.com", vec![]));
        let clock = Arc::new(SystemClock);
        let (ours, _) =
            build_engine_on(store.clone(), agent.clone(), AppConfig::default(), clock.clone()).await;
        let (theirs, _) = build_engine_on(store, agent.clone(), AppConfig::default(), clock).await;

        let task = ours
            .registry()
            .create_task(definition(vec![navigate("https://a.example.com")], None), ours.now())
            .await
            .unwrap();
        theirs.registry().load().await.unwrap();
        assert!(theirs.registry().delete_task(&task.id).await.unwrap());

        assert_eq!(ours.execute_task(&task.id).await, RunOutcome::skipped("task not found"));
        assert!(ours.registry().task(&task.id).await.is_none());
        assert_eq!(agent.opened(), 0);
    }

    #[tokio::test]
    async fn failing_action_closes_page_and_keeps_task_scheduled() {
        let agent = Arc::new(ScriptedAgent::new().page("https://a.example.com", vec![]));
        let (engine, notifier) = engine_with(agent.clone()).await;
        let task = engine
            .registry()
            .create_task(
                definition(
                    vec![
                        navigate("https://a.example.com"),
                        Action::Click {
                            selector: "#missing".into(),
                            wait_ms: 0,
                        },
                        Action::Screenshot,
                    ],
                    None,
                ),
                engine.now(),
            )
            .await
            .unwrap();

        let outcome = engine.execute_task(&task.id).await;
        let RunOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("action #1 (click)"), "{error}");
        assert_eq!(agent.opened(), 1);
        assert_eq!(agent.closed(), 1);
        assert_eq!(agent.screenshots(), 0);

        let stored = engine.registry().task(&task.id).await.unwrap();
        assert!(stored.enabled);
        assert_eq!(stored.run_count, 1);
        assert!(stored.next_run.is_some());
        assert_eq!(notifier.task_statuses(), vec![RunStatus::Failed]);
    }

    #[tokio::test]
    async fn script_actions_are_refused_unless_enabled() {
        let agent = Arc::new(ScriptedAgent::new().page("https://a.example.com", vec![]));
        let (engine, _) = engine_with(agent.clone()).await;
        let task = engine
            .registry()
            .create_task(
                definition(
                    vec![
                        navigate("https://a.example.com"),
                        Action::Script {
                            code: "document.title".into(),
                        },
                    ],
                    None,
                ),
                engine.now(),
            )
            .await
            .unwrap();

        let outcome = engine.execute_task(&task.id).await;
        assert!(matches!(outcome, RunOutcome::Failed { ref error, .. } if error.contains("script actions are disabled")));
        assert_eq!(agent.scripts(), 0);

        let mut config = AppConfig::default();
        config.automation.allow_script_actions = true;
        let (engine, _) = engine_with_config(agent.clone(), config).await;
        let task = engine
            .registry()
            .create_task(
                definition(
                    vec![
                        navigate("https://a.example.com"),
                        Action::Script {
                            code: "document.title".into(),
                        },
                    ],
                    None,
                ),
                engine.now(),
            )
            .await
            .unwrap();
        assert!(matches!(engine.execute_task(&task.id).await, RunOutcome::Completed { .. }));
        assert_eq!(agent.scripts(), 1);
    }

    #[tokio::test]
    async fn artifacts_are_persisted_under_task_keys() {
        let agent = Arc::new(
            ScriptedAgent::new().page("https://a.example.com", vec![json!({"title": "Dune"})]),
        );
        let (engine, _) = engine_with(agent).await;
        let selectors = serde_json::from_value(json!({"container": ".item", "fields": {"title": "h2"}})).unwrap();
        let task = engine
            .registry()
            .create_task(
                definition(
                    vec![
                        navigate("https://a.example.com"),
                        Action::ExtractData {
                            selectors,
                            schema: Default::default(),
                            format: siteflow_shared::ExtractFormat::Csv,
                        },
                        Action::Screenshot,
                    ],
                    None,
                ),
                engine.now(),
            )
            .await
            .unwrap();

        assert!(matches!(engine.execute_task(&task.id).await, RunOutcome::Completed { .. }));

        let extract_keys = engine.store().keys(&format!("extract:{}:", task.id)).await.unwrap();
        assert_eq!(extract_keys.len(), 1);
        let extract = engine.store().get(&extract_keys[0]).await.unwrap().unwrap();
        assert_eq!(extract["format"], json!("csv"));
        assert_eq!(extract["data"], json!("title\r\nDune\r\n"));

        let shots = engine.store().keys(&format!("screenshot:{}:", task.id)).await.unwrap();
        let shot = engine.store().get(&shots[0]).await.unwrap().unwrap();
        assert_eq!(shot["data"], json!("iVBORw=="));
    }

    #[tokio::test]
    async fn analysis_without_backend_fails_the_action() {
        let agent = Arc::new(ScriptedAgent::new().page("https://a.example.com", vec![]));
        let (engine, _) = engine_with(agent).await;
        let task = engine
            .registry()
            .create_task(
                definition(
                    vec![
                        navigate("https://a.example.com"),
                        Action::AiAnalysis {
                            prompt: "Summarize".into(),
                            system_prompt: None,
                        },
                    ],
                    None,
                ),
                engine.now(),
            )
            .await
            .unwrap();

        let outcome = engine.execute_task(&task.id).await;
        let RunOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure");
        };
        assert!(error.contains(&SiteflowError::Inference("no inference backend configured".into()).to_string()));
    }

    #[tokio::test]
    async fn action_before_navigate_is_rejected() {
        let agent = Arc::new(ScriptedAgent::new());
        let (engine, _) = engine_with(agent.clone()).await;
        let task = engine
            .registry()
            .create_task(definition(vec![Action::Screenshot], None), engine.now())
            .await
            .unwrap();

        let outcome = engine.execute_task(&task.id).await;
        assert!(matches!(outcome, RunOutcome::Failed { ref error, .. } if error.contains("no page is open")));
        assert_eq!(agent.closed(), 0);
    }
}
