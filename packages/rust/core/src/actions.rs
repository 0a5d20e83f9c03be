//! Runs a task's actions in order against one page.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use siteflow_collector::{OpenOptions, PageHandle};
use siteflow_inference::CompletionRequest;
use siteflow_shared::{Action, ExtractFormat, Result, SiteflowError, Task};

use crate::engine::Engine;

/// Page text sent with an `ai_analysis` action is cut to this many characters.
const ANALYSIS_CONTENT_CHARS: usize = 8000;

/// Executes the actions of one task run. Owns the run's page handle.
pub(crate) struct ActionExecutor<'a> {
    engine: &'a Engine,
    task: &'a Task,
    handle: Option<PageHandle>,
}

impl<'a> ActionExecutor<'a> {
    pub(crate) fn new(engine: &'a Engine, task: &'a Task) -> Self {
        Self {
            engine,
            task,
            handle: None,
        }
    }

    /// Run every action; the first failure stops the rest. The page is
    /// closed afterwards whatever happened.
    pub(crate) async fn run(mut self) -> Result<usize> {
        let result = self.run_actions().await;

        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.engine.agent.close(&handle).await {
                warn!(%handle, error = %e, "failed to close page");
            }
        }
        result
    }

    async fn run_actions(&mut self) -> Result<usize> {
        let task = self.task;
        for (index, action) in task.actions.iter().enumerate() {
            debug!(index, action = action.kind(), "running action");
            self.perform(action).await.map_err(|e| {
                SiteflowError::task_action(task.id.to_string(), index, action.kind(), e.to_string())
            })?;
        }
        Ok(task.actions.len())
    }

    async fn perform(&mut self, action: &Action) -> Result<()> {
        let agent = &self.engine.agent;
        match action {
            Action::Navigate { url, headers } => {
                let options = OpenOptions {
                    headers: headers.clone(),
                    ..OpenOptions::default()
                };
                let handle = match self.handle {
                    Some(handle) => {
                        agent.navigate(&handle, url, &options).await?;
                        handle
                    }
                    None => {
                        let handle = agent.open(url, &options).await?;
                        self.handle = Some(handle);
                        handle
                    }
                };
                agent.await_load(&handle).await
            }
            Action::Click { selector, wait_ms } => {
                agent.click(self.page()?, selector).await?;
                pause(*wait_ms).await;
                Ok(())
            }
            Action::ExtractData {
                selectors,
                schema,
                format,
            } => {
                let records = agent.extract(self.page()?, selectors, schema).await?;
                let count = records.len();
                let data = match format {
                    ExtractFormat::Json => Value::from(records),
                    ExtractFormat::Csv => Value::String(siteflow_sinks::render::to_csv(&records)),
                };
                let now = self.engine.now();
                let key = self.artifact_key("extract", now);
                self.save(
                    &key,
                    json!({
                        "task_id": self.task.id.to_string(),
                        "format": format,
                        "created_at": stamp(now),
                        "count": count,
                        "data": data,
                    }),
                )
                .await?;
                info!(%key, count, "extracted data saved");
                Ok(())
            }
            Action::FillForm { fields, submit } => {
                agent.fill_form(self.page()?, fields, submit.as_deref()).await
            }
            Action::Screenshot => {
                let bytes = agent.screenshot(self.page()?).await?;
                let now = self.engine.now();
                let key = self.artifact_key("screenshot", now);
                self.save(
                    &key,
                    json!({
                        "task_id": self.task.id.to_string(),
                        "created_at": stamp(now),
                        "mime": "image/png",
                        "data": STANDARD.encode(&bytes),
                    }),
                )
                .await?;
                info!(%key, bytes = bytes.len(), "screenshot saved");
                Ok(())
            }
            Action::Wait { ms } => {
                pause(*ms).await;
                Ok(())
            }
            Action::Script { code } => {
                if !self.engine.config.automation.allow_script_actions {
                    return Err(SiteflowError::validation(
                        "script actions are disabled; set [automation] allow_script_actions = true",
                    ));
                }
                let result = agent.run_script(self.page()?, code).await?;
                debug!(%result, "script finished");
                Ok(())
            }
            Action::AiAnalysis {
                prompt,
                system_prompt,
            } => {
                let backend = self
                    .engine
                    .inference
                    .as_ref()
                    .ok_or_else(|| SiteflowError::Inference("no inference backend configured".into()))?;
                let content = agent.content(self.page()?).await?;
                let system = system_prompt
                    .clone()
                    .unwrap_or_else(|| self.engine.config.automation.analysis_system_prompt.clone());

                let request = CompletionRequest::new(format!(
                    "{prompt}\n\nPage title: {}\nURL: {}\n\nContent:\n{}",
                    content.title,
                    content.url,
                    truncate_chars(&content.text, ANALYSIS_CONTENT_CHARS)
                ))
                .with_system(system);
                let analysis = backend.complete(&request).await?;

                let now = self.engine.now();
                let key = self.artifact_key("analysis", now);
                self.save(
                    &key,
                    json!({
                        "task_id": self.task.id.to_string(),
                        "url": content.url,
                        "prompt": prompt,
                        "analysis": analysis,
                        "created_at": stamp(now),
                    }),
                )
                .await?;
                info!(%key, "page analysis saved");
                Ok(())
            }
        }
    }

    fn page(&self) -> Result<&PageHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| SiteflowError::Agent("no page is open; add a navigate action first".into()))
    }

    fn artifact_key(&self, prefix: &str, at: DateTime<Utc>) -> String {
        format!("{prefix}:{}:{}", self.task.id, at.timestamp_millis())
    }

    async fn save(&self, key: &str, value: Value) -> Result<()> {
        self.engine.store.set(key, &value).await
    }
}

async fn pause(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// At most `max` characters, cut on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
