//! Pipeline execution: collect every site, run the processor chain, deliver.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use siteflow_shared::{EntityId, EntityKind, Pipeline, Record, RunStatus};
use siteflow_sinks::Delivery;

use crate::engine::{Engine, RunOutcome, upcoming};
use crate::notify::PipelineNotification;

impl Engine {
    /// Run one pipeline end to end.
    ///
    /// A site that fails is logged and skipped. A failing processor fails the
    /// run and nothing is delivered. Sink failures never fail the run.
    /// `total_records` grows by the delivered batch size on success only.
    #[instrument(skip_all, fields(pipeline_id = %id))]
    pub async fn execute_pipeline(&self, id: &EntityId) -> RunOutcome {
        let Some(_guard) = self.in_flight.try_acquire(*id) else {
            debug!("pipeline already running, firing suppressed");
            return RunOutcome::Suppressed;
        };

        let pipeline = match self.registry.refresh_pipeline(id).await {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => return RunOutcome::skipped("pipeline not found"),
            Err(e) => {
                warn!(error = %e, "could not read pipeline");
                return RunOutcome::skipped(format!("pipeline unavailable: {e}"));
            }
        };
        if !pipeline.enabled {
            debug!("pipeline disabled, nothing to do");
            return RunOutcome::skipped("pipeline disabled");
        }

        let started = self.clock.now();
        let next_run = upcoming(pipeline.schedule.as_ref(), pipeline.next_run, started);
        if let Err(e) = self
            .registry
            .update_pipeline(id, |p| {
                p.last_run = Some(started);
                p.next_run = next_run;
            })
            .await
        {
            warn!(error = %e, "failed to record last run");
        }

        info!(name = %pipeline.name, sites = pipeline.sites.len(), "pipeline run started");
        let collected = self.collect_all(&pipeline, started).await;

        let batch = match self.chain.run(&pipeline.processors, collected).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "processing failed, nothing delivered");
                let error = e.to_string();
                let run_id = self
                    .record_run(
                        *id,
                        EntityKind::Pipeline,
                        started,
                        RunStatus::Failed,
                        Some(error.clone()),
                        None,
                    )
                    .await;
                self.notify_pipeline(&pipeline, RunStatus::Failed, 0, error.clone());
                return RunOutcome::Failed { run_id, error };
            }
        };

        let delivery = Delivery {
            pipeline_id: *id,
            pipeline_name: &pipeline.name,
            timestamp: started,
        };
        let reports = self.sinks.dispatch(&pipeline.outputs, &batch, &delivery).await;
        let failed_sinks = reports.iter().filter(|r| !r.delivered()).count();

        let records = batch.len() as u64;
        if let Err(e) = self
            .registry
            .update_pipeline(id, |p| p.total_records += records)
            .await
        {
            warn!(error = %e, "failed to persist record total");
        }

        let run_id = self
            .record_run(
                *id,
                EntityKind::Pipeline,
                started,
                RunStatus::Succeeded,
                None,
                Some(records),
            )
            .await;

        let message = if failed_sinks > 0 {
            format!("{records} records, {failed_sinks} of {} outputs failed", reports.len())
        } else {
            format!("{records} records delivered")
        };
        info!(%run_id, records, failed_sinks, "pipeline run finished");
        self.notify_pipeline(&pipeline, RunStatus::Succeeded, records, message);

        RunOutcome::Completed {
            run_id,
            records: Some(records),
        }
    }

    /// Concatenate the records of every site, in declared order.
    async fn collect_all(
        &self,
        pipeline: &Pipeline,
        started: DateTime<Utc>,
    ) -> Vec<Record> {
        let mut records = Vec::new();
        for site in &pipeline.sites {
            let report = self
                .collector
                .collect(site, &pipeline.schema, &pipeline.id, started)
                .await;
            if let Some(e) = &report.error {
                warn!(site = %report.site, kept = report.records.len(), error = %e, "site failed");
            }
            records.extend(report.records);
        }
        records
    }

    fn notify_pipeline(&self, pipeline: &Pipeline, status: RunStatus, records: u64, message: String) {
        self.notifier.pipeline_finished(&PipelineNotification {
            pipeline_id: pipeline.id,
            name: pipeline.name.clone(),
            status,
            records,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use siteflow_shared::NewPipeline;
    use siteflow_sinks::dataset_records;

    use crate::testing::{ScriptedAgent, engine_with};

    use super::*;

    fn definition(outputs: serde_json::Value, processors: serde_json::Value) -> NewPipeline {
        serde_json::from_value(json!({
            "name": "books",
            "sites": [
                {"url": "https://a.example.com", "wait_time_ms": 0,
                 "selectors": {"container": ".item", "fields": {"title": "h2"}}},
                {"url": "https://b.example.com", "wait_time_ms": 0,
                 "selectors": {"container": ".item", "fields": {"title": "h2"}}}
            ],
            "processors": processors,
            "outputs": outputs
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn total_records_grows_by_each_batch() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .page("https://a.example.com", vec![json!({"title": "Dune"})])
                .page("https://b.example.com", vec![json!({"title": "Emma"}), json!({"title": "Ulysses"})]),
        );
        let (engine, _) = engine_with(agent).await;
        let pipeline = engine
            .registry()
            .create_pipeline(definition(json!([]), json!([])), engine.now())
            .await
            .unwrap();

        for _ in 0..2 {
            let outcome = engine.execute_pipeline(&pipeline.id).await;
            assert!(matches!(outcome, RunOutcome::Completed { records: Some(3), .. }));
        }

        let stored = engine.registry().pipeline(&pipeline.id).await.unwrap();
        assert_eq!(stored.total_records, 6);
        assert!(stored.last_run.is_some());
        assert_eq!(engine.store().list_runs(&pipeline.id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failing_site_does_not_stop_the_next() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .failing_open("https://a.example.com")
                .page("https://b.example.com", vec![json!({"title": "Emma"})]),
        );
        let (engine, _) = engine_with(agent).await;
        let pipeline = engine
            .registry()
            .create_pipeline(
                definition(json!([{"type": "storage", "config": {"key": "latest"}}]), json!([])),
                engine.now(),
            )
            .await
            .unwrap();

        let outcome = engine.execute_pipeline(&pipeline.id).await;
        assert!(matches!(outcome, RunOutcome::Completed { records: Some(1), .. }));

        let stored = engine.store().get("latest").await.unwrap().unwrap();
        let records = dataset_records(&stored);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["title"], json!("Emma"));
        assert_eq!(records[0]["_source"], json!("https://b.example.com"));
    }

    #[tokio::test]
    async fn processor_failure_delivers_nothing() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .page("https://a.example.com", vec![json!({"title": "Dune"})])
                .page("https://b.example.com", vec![]),
        );
        let (engine, notifier) = engine_with(agent).await;
        let processors = json!([
            {"type": "filter", "config": {"conditions": [
                {"field": "title", "operator": "regex", "value": "(unclosed"}
            ]}}
        ]);
        let pipeline = engine
            .registry()
            .create_pipeline(
                definition(json!([{"type": "storage", "config": {"key": "latest"}}]), processors),
                engine.now(),
            )
            .await
            .unwrap();

        let outcome = engine.execute_pipeline(&pipeline.id).await;
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert!(engine.store().get("latest").await.unwrap().is_none());
        assert_eq!(
            engine.registry().pipeline(&pipeline.id).await.unwrap().total_records,
            0
        );

        let runs = engine.store().list_runs(&pipeline.id, 10).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(notifier.pipeline_statuses(), vec![RunStatus::Failed]);
    }

    #[tokio::test]
    async fn disabled_or_missing_pipeline_is_skipped() {
        let (engine, _) = engine_with(Arc::new(ScriptedAgent::new())).await;
        let mut def = definition(json!([]), json!([]));
        def.enabled = false;
        let pipeline = engine.registry().create_pipeline(def, engine.now()).await.unwrap();

        assert_eq!(
            engine.execute_pipeline(&pipeline.id).await,
            RunOutcome::skipped("pipeline disabled")
        );
        assert_eq!(
            engine.execute_pipeline(&EntityId::new()).await,
            RunOutcome::skipped("pipeline not found")
        );
        assert!(engine.registry().pipeline(&pipeline.id).await.unwrap().last_run.is_none());
    }
}
