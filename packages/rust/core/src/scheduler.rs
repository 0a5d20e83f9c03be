//! Automation scheduler.
//!
//! One loop serves every scheduled pipeline and task. Timers live in a
//! min-heap ordered by `(due, seq)`. Cancelling bumps the target's generation
//! instead of searching the heap; entries carrying an older generation are
//! discarded when they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use siteflow_shared::{
    EntityId, EntityKind, NewPipeline, NewTask, Pipeline, Result, Schedule, SiteflowError, Task,
};

use crate::engine::{Engine, RunOutcome};

/// A schedulable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    pub fn pipeline(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Pipeline,
            id,
        }
    }

    pub fn task(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Task,
            id,
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

// ---------------------------------------------------------------------------
// Timer heap
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    due: DateTime<Utc>,
    seq: u64,
    target: EntityRef,
    generation: u64,
}

#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
    generations: HashMap<EntityRef, u64>,
}

impl Timers {
    /// Replace any armed timer of `target` with one at `due`.
    fn arm(&mut self, target: EntityRef, due: DateTime<Utc>) {
        let generation = self.generations.entry(target).or_default();
        *generation += 1;
        let generation = *generation;
        self.push(target, due, generation);
    }

    fn push(&mut self, target: EntityRef, due: DateTime<Utc>, generation: u64) {
        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            due,
            seq: self.seq,
            target,
            generation,
        }));
    }

    fn cancel(&mut self, target: EntityRef) {
        // Generations are never removed, so a stale entry cannot come back
        // to life when the target is armed again.
        if let Some(generation) = self.generations.get_mut(&target) {
            *generation += 1;
        }
    }

    fn is_live(&self, entry: &TimerEntry) -> bool {
        self.generations.get(&entry.target) == Some(&entry.generation)
    }

    /// Remove and return the live entries due at or before `now`, earliest first.
    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|Reverse(top)| top.due <= now) {
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if self.is_live(&entry) {
                due.push(entry);
            }
        }
        due
    }

    /// Earliest live due time; stale heads are discarded on the way.
    fn next_due(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.is_live(top) {
                return Some(top.due);
            }
            self.heap.pop();
        }
        None
    }

    fn armed(&self, target: EntityRef) -> Option<DateTime<Utc>> {
        self.heap
            .iter()
            .filter(|Reverse(e)| e.target == target && self.is_live(e))
            .map(|Reverse(e)| e.due)
            .min()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Arms timers for enabled, scheduled entities and fires them on the engine.
pub struct Scheduler {
    engine: Arc<Engine>,
    timers: Mutex<Timers>,
    wake: Notify,
    idle_poll: Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        let idle_poll = Duration::from_millis(engine.config().scheduler.idle_poll_ms.max(1));
        Arc::new(Self {
            engine,
            timers: Mutex::new(Timers::default()),
            wake: Notify::new(),
            idle_poll,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self, target: EntityRef, due: DateTime<Utc>) {
        self.timers().arm(target, due);
        debug!(%target, %due, "timer armed");
        self.wake.notify_one();
    }

    fn cancel(&self, target: EntityRef) {
        self.timers().cancel(target);
        debug!(%target, "timer cancelled");
    }

    /// When `target` will next fire, if it is armed.
    pub fn armed(&self, target: EntityRef) -> Option<DateTime<Utc>> {
        self.timers().armed(target)
    }

    /// Earliest armed timer across all entities.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.timers().next_due()
    }

    /// Arm every enabled, scheduled entity in the registry. Fire times that
    /// passed while nothing was running are skipped, not replayed.
    pub async fn start(&self) -> Result<usize> {
        let now = self.engine.now();
        let registry = self.engine.registry();
        let mut armed = 0;

        for pipeline in registry.pipelines().await {
            let Some(schedule) = pipeline.schedule.as_ref().filter(|_| pipeline.enabled) else {
                continue;
            };
            if let Some(due) = self.resume_at(schedule, pipeline.next_run, now) {
                if pipeline.next_run != Some(due) {
                    registry.update_pipeline(&pipeline.id, |p| p.next_run = Some(due)).await?;
                }
                self.arm(EntityRef::pipeline(pipeline.id), due);
                armed += 1;
            }
        }

        for task in registry.tasks().await {
            if !task.enabled {
                continue;
            }
            if let Some(due) = self.resume_at(&task.schedule, task.next_run, now) {
                if task.next_run != Some(due) {
                    registry.update_task(&task.id, |t| t.next_run = Some(due)).await?;
                }
                self.arm(EntityRef::task(task.id), due);
                armed += 1;
            }
        }

        info!(armed, "scheduler started");
        Ok(armed)
    }

    fn resume_at(
        &self,
        schedule: &Schedule,
        stored: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match stored {
            Some(next) if next > now => Some(next),
            stored => match schedule.next_due(stored.unwrap_or(now), now) {
                Ok(next) => Some(next),
                Err(e) => {
                    warn!(error = %e, "unparseable schedule, not arming");
                    None
                }
            },
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register a pipeline and arm it when enabled and scheduled.
    pub async fn create_pipeline(&self, def: NewPipeline) -> Result<Pipeline> {
        let pipeline = self
            .engine
            .registry()
            .create_pipeline(def, self.engine.now())
            .await?;
        if let Some(due) = pipeline.next_run {
            self.arm(EntityRef::pipeline(pipeline.id), due);
        }
        Ok(pipeline)
    }

    /// Register a task and arm it when enabled.
    pub async fn create_task(&self, def: NewTask) -> Result<Task> {
        let task = self
            .engine
            .registry()
            .create_task(def, self.engine.now())
            .await?;
        if let Some(due) = task.next_run {
            self.arm(EntityRef::task(task.id), due);
        }
        Ok(task)
    }

    /// Enable or disable a pipeline. Disabling cancels its timer but lets a
    /// run in flight finish.
    pub async fn set_pipeline_enabled(&self, id: &EntityId, enabled: bool) -> Result<Pipeline> {
        let target = EntityRef::pipeline(*id);
        let registry = self.engine.registry();
        let current = registry
            .refresh_pipeline(id)
            .await?
            .ok_or_else(|| SiteflowError::NotFound(format!("pipeline {id}")))?;

        let next_run = match (&current.schedule, enabled) {
            (Some(schedule), true) => Some(schedule.next_after(self.engine.now())?),
            _ => None,
        };
        let pipeline = registry
            .update_pipeline(id, |p| {
                p.enabled = enabled;
                p.next_run = next_run;
            })
            .await?;

        match next_run {
            Some(due) => self.arm(target, due),
            None => self.cancel(target),
        }
        info!(%target, enabled, "pipeline toggled");
        Ok(pipeline)
    }

    /// Enable or disable a task. A task that used up its `max_runs` cannot
    /// be enabled again.
    pub async fn set_task_enabled(&self, id: &EntityId, enabled: bool) -> Result<Task> {
        let target = EntityRef::task(*id);
        let registry = self.engine.registry();
        let current = registry
            .refresh_task(id)
            .await?
            .ok_or_else(|| SiteflowError::NotFound(format!("task {id}")))?;

        if enabled && current.runs_exhausted() {
            return Err(SiteflowError::validation(format!(
                "task {id} already ran {} of {} times",
                current.run_count,
                current.max_runs.unwrap_or_default()
            )));
        }

        let next_run = if enabled {
            Some(current.schedule.next_after(self.engine.now())?)
        } else {
            None
        };
        let task = registry
            .update_task(id, |t| {
                t.enabled = enabled;
                t.next_run = next_run;
            })
            .await?;

        match next_run {
            Some(due) => self.arm(target, due),
            None => self.cancel(target),
        }
        info!(%target, enabled, "task toggled");
        Ok(task)
    }

    pub async fn delete_pipeline(&self, id: &EntityId) -> Result<bool> {
        self.cancel(EntityRef::pipeline(*id));
        self.engine.registry().delete_pipeline(id).await
    }

    pub async fn delete_task(&self, id: &EntityId) -> Result<bool> {
        self.cancel(EntityRef::task(*id));
        self.engine.registry().delete_task(id).await
    }

    /// Run a pipeline now, outside its schedule.
    pub async fn trigger_pipeline(&self, id: &EntityId) -> RunOutcome {
        self.execute(EntityRef::pipeline(*id)).await
    }

    /// Run a task now, outside its schedule. It counts toward `max_runs`.
    pub async fn trigger_task(&self, id: &EntityId) -> RunOutcome {
        self.execute(EntityRef::task(*id)).await
    }

    // -----------------------------------------------------------------------
    // Firing
    // -----------------------------------------------------------------------

    /// Fire every timer due by the engine clock. Each run is spawned on its
    /// own tokio task and re-armed before it starts.
    #[instrument(skip_all)]
    pub async fn tick(self: &Arc<Self>) -> Vec<JoinHandle<RunOutcome>> {
        let now = self.engine.now();
        let due = self.timers().pop_due(now);

        let mut spawned = Vec::with_capacity(due.len());
        for entry in due {
            if self.rearm(&entry, now).await {
                let scheduler = Arc::clone(self);
                let target = entry.target;
                spawned.push(tokio::spawn(async move { scheduler.execute(target).await }));
            } else {
                debug!(target = %entry.target, "timer dropped, target gone or disabled");
            }
        }
        spawned
    }

    /// Arm the next slot after `entry` and store it as `next_run`. Returns
    /// whether the target should fire.
    ///
    /// The enabled check and the `next_run` write happen in one registry
    /// update against the stored row, so an entity disabled or deleted by
    /// another process is dropped here instead of being run.
    async fn rearm(&self, entry: &TimerEntry, now: DateTime<Utc>) -> bool {
        let registry = self.engine.registry();
        let target = entry.target;
        let slot = |schedule: &Schedule| match schedule.next_due(entry.due, now) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(%target, error = %e, "unparseable schedule, timer dropped");
                None
            }
        };

        let updated = match target.kind {
            EntityKind::Pipeline => registry
                .update_pipeline_if(&target.id, |p| {
                    let next = p.schedule.as_ref().filter(|_| p.enabled).and_then(slot);
                    p.next_run = next.or(p.next_run);
                    next.is_some()
                })
                .await
                .map(|p| p.and_then(|p| p.next_run)),
            EntityKind::Task => registry
                .update_task_if(&target.id, |t| {
                    let next = Some(&t.schedule).filter(|_| t.enabled).and_then(slot);
                    t.next_run = next.or(t.next_run);
                    next.is_some()
                })
                .await
                .map(|t| t.and_then(|t| t.next_run)),
        };

        match updated {
            Ok(Some(next)) => {
                self.timers().push(target, next, entry.generation);
                true
            }
            Ok(None) => false,
            Err(e) => {
                // Retry on the next poll rather than lose the timer.
                warn!(%target, error = %e, "failed to re-arm, retrying shortly");
                let retry = chrono::Duration::from_std(self.idle_poll)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1));
                self.timers().push(target, now + retry, entry.generation);
                false
            }
        }
    }

    /// Execute `target`, then drop its timer if the run left it disabled.
    async fn execute(&self, target: EntityRef) -> RunOutcome {
        let registry = self.engine.registry();
        let (outcome, still_enabled) = match target.kind {
            EntityKind::Pipeline => {
                let outcome = self.engine.execute_pipeline(&target.id).await;
                let enabled = match registry.refresh_pipeline(&target.id).await {
                    Ok(pipeline) => pipeline.is_some_and(|p| p.enabled),
                    Err(_) => true,
                };
                (outcome, enabled)
            }
            EntityKind::Task => {
                let outcome = self.engine.execute_task(&target.id).await;
                let enabled = match registry.refresh_task(&target.id).await {
                    Ok(task) => task.is_some_and(|t| t.enabled),
                    Err(_) => true,
                };
                (outcome, enabled)
            }
        };
        if !still_enabled {
            self.cancel(target);
        }
        outcome
    }

    fn sleep_budget(&self) -> Duration {
        let now = self.engine.now();
        match self.next_wakeup() {
            Some(due) => (due - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.idle_poll),
            None => self.idle_poll,
        }
    }

    /// Drive the timers until `shutdown` resolves. Runs already in flight
    /// keep going on their own tasks.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(idle_poll_ms = self.idle_poll.as_millis() as u64, "scheduler loop running");

        loop {
            let fired = self.tick().await;
            if !fired.is_empty() {
                debug!(fired = fired.len(), "timers fired");
            }

            let sleep_for = self.sleep_budget();
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler loop stopping");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use siteflow_shared::{Action, AppConfig};

    use crate::clock::ManualClock;
    use crate::registry::Entity;
    use siteflow_storage::{MemoryStore, PersistenceStore};

    use crate::testing::{Gate, ScriptedAgent, build_engine, build_engine_on};

    const URL: &str = "https://a.example.com";

    fn watch(max_runs: Option<u32>) -> NewTask {
        NewTask {
            name: "watch".into(),
            schedule: Schedule::interval_minutes(5),
            actions: vec![Action::Navigate {
                url: URL.into(),
                headers: Default::default(),
            }],
            enabled: true,
            max_runs,
            tags: vec![],
        }
    }

    async fn setup(agent: ScriptedAgent) -> (Arc<Scheduler>, Arc<ManualClock>, DateTime<Utc>) {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let (engine, _) = build_engine(Arc::new(agent), AppConfig::default(), clock.clone()).await;
        (Scheduler::new(engine), clock, start)
    }

    fn scheduled_pipeline() -> NewPipeline {
        serde_json::from_value(json!({
            "name": "prices",
            "schedule": {"type": "interval", "value": "5"},
            "sites": [{"url": URL, "wait_time_ms": 0,
                       "selectors": {"container": ".item", "fields": {"title": "h2"}}}]
        }))
        .unwrap()
    }

    /// Two schedulers over one store, as `serve` and a CLI command would be.
    async fn shared_pair() -> (Arc<Scheduler>, Arc<Scheduler>, Arc<ManualClock>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut schedulers = Vec::new();
        for _ in 0..2 {
            let (engine, _) = build_engine_on(
                store.clone(),
                Arc::new(ScriptedAgent::new().page(URL, vec![])),
                AppConfig::default(),
                clock.clone(),
            )
            .await;
            schedulers.push(Scheduler::new(engine));
        }
        let other = schedulers.remove(1);
        (schedulers.remove(0), other, clock, store)
    }

    async fn run_due(scheduler: &Arc<Scheduler>) -> Vec<RunOutcome> {
        let mut outcomes = Vec::new();
        for handle in scheduler.tick().await {
            outcomes.push(handle.await.unwrap());
        }
        outcomes
    }

    #[test]
    fn cancelled_entries_are_skipped_lazily() {
        let now = Utc::now();
        let a = EntityRef::task(EntityId::new());
        let b = EntityRef::pipeline(EntityId::new());
        let mut timers = Timers::default();

        timers.arm(a, now);
        timers.arm(b, now + ChronoDuration::seconds(1));
        timers.arm(a, now + ChronoDuration::seconds(2));
        assert_eq!(timers.next_due(), Some(now + ChronoDuration::seconds(1)));

        timers.cancel(b);
        let due = timers.pop_due(now + ChronoDuration::seconds(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].target, a);
        assert_eq!(timers.next_due(), None);
    }

    #[tokio::test]
    async fn interval_task_fires_when_due() {
        let (scheduler, clock, start) = setup(ScriptedAgent::new().page(URL, vec![])).await;
        let task = scheduler.create_task(watch(None)).await.unwrap();
        assert_eq!(scheduler.next_wakeup(), Some(start + ChronoDuration::minutes(5)));

        assert!(run_due(&scheduler).await.is_empty());

        clock.advance(ChronoDuration::minutes(5));
        let outcomes = run_due(&scheduler).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], RunOutcome::Completed { .. }));

        let stored = scheduler.engine().registry().task(&task.id).await.unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.next_run, Some(start + ChronoDuration::minutes(10)));
        assert_eq!(
            scheduler.armed(EntityRef::task(task.id)),
            Some(start + ChronoDuration::minutes(10))
        );
    }

    #[tokio::test]
    async fn max_runs_three_fired_four_times() {
        let (scheduler, clock, _) = setup(ScriptedAgent::new().page(URL, vec![])).await;
        let task = scheduler.create_task(watch(Some(3))).await.unwrap();

        let mut completed = 0;
        for _ in 0..4 {
            clock.advance(ChronoDuration::minutes(5));
            completed += run_due(&scheduler)
                .await
                .iter()
                .filter(|o| matches!(o, RunOutcome::Completed { .. }))
                .count();
        }

        assert_eq!(completed, 3);
        let stored = scheduler.engine().registry().task(&task.id).await.unwrap();
        assert_eq!(stored.run_count, 3);
        assert!(!stored.enabled);
        assert_eq!(scheduler.next_wakeup(), None);
    }

    #[tokio::test]
    async fn missed_firings_are_skipped() {
        let (scheduler, clock, start) = setup(ScriptedAgent::new().page(URL, vec![])).await;
        let task = scheduler.create_task(watch(None)).await.unwrap();

        clock.advance(ChronoDuration::minutes(17));
        assert_eq!(run_due(&scheduler).await.len(), 1);
        let stored = scheduler.engine().registry().task(&task.id).await.unwrap();
        assert_eq!(stored.next_run, Some(start + ChronoDuration::minutes(20)));
    }

    #[tokio::test]
    async fn disabling_and_deleting_cancel_timers() {
        let (scheduler, clock, start) = setup(ScriptedAgent::new().page(URL, vec![])).await;
        let task = scheduler.create_task(watch(None)).await.unwrap();

        let disabled = scheduler.set_task_enabled(&task.id, false).await.unwrap();
        assert!(disabled.next_run.is_none());
        clock.advance(ChronoDuration::minutes(5));
        assert!(run_due(&scheduler).await.is_empty());

        let enabled = scheduler.set_task_enabled(&task.id, true).await.unwrap();
        assert_eq!(enabled.next_run, Some(start + ChronoDuration::minutes(10)));
        assert_eq!(scheduler.armed(EntityRef::task(task.id)), enabled.next_run);

        assert!(scheduler.delete_task(&task.id).await.unwrap());
        clock.advance(ChronoDuration::minutes(5));
        assert!(run_due(&scheduler).await.is_empty());
        assert_eq!(scheduler.next_wakeup(), None);
    }

    #[tokio::test]
    async fn overlapping_firing_is_suppressed() {
        let gate = Gate::new();
        let (scheduler, clock, _) =
            setup(ScriptedAgent::new().page(URL, vec![]).gated(gate.clone())).await;
        scheduler.create_task(watch(None)).await.unwrap();

        clock.advance(ChronoDuration::minutes(5));
        let mut first = scheduler.tick().await;
        assert_eq!(first.len(), 1);
        gate.entered.notified().await;

        // The first run is parked inside the page agent.
        clock.advance(ChronoDuration::minutes(5));
        assert_eq!(run_due(&scheduler).await, vec![RunOutcome::Suppressed]);

        gate.release.notify_one();
        let outcome = first.remove(0).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn unscheduled_pipeline_is_never_armed() {
        let (scheduler, _, _) = setup(ScriptedAgent::new()).await;
        let def: NewPipeline = serde_json::from_value(json!({
            "name": "once",
            "sites": [{"url": URL, "wait_time_ms": 0,
                       "selectors": {"container": ".item", "fields": {"title": "h2"}}}]
        }))
        .unwrap();
        let pipeline = scheduler.create_pipeline(def).await.unwrap();
        assert!(pipeline.next_run.is_none());
        assert_eq!(scheduler.next_wakeup(), None);
        assert_eq!(scheduler.start().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn start_rearms_persisted_entities() {
        let (scheduler, clock, start) = setup(ScriptedAgent::new().page(URL, vec![])).await;
        let task = scheduler.create_task(watch(None)).await.unwrap();

        let fresh = Scheduler::new(scheduler.engine().clone());
        clock.advance(ChronoDuration::minutes(12));
        assert_eq!(fresh.start().await.unwrap(), 1);
        assert_eq!(
            fresh.armed(EntityRef::task(task.id)),
            Some(start + ChronoDuration::minutes(15))
        );
    }

    #[tokio::test]
    async fn scheduled_pipeline_fires_and_rearms() {
        let agent = ScriptedAgent::new().page(URL, vec![json!({"title": "Dune"}), json!({"title": "Emma"})]);
        let (scheduler, clock, start) = setup(agent).await;
        let pipeline = scheduler.create_pipeline(scheduled_pipeline()).await.unwrap();
        let target = EntityRef::pipeline(pipeline.id);
        assert_eq!(scheduler.armed(target), Some(start + ChronoDuration::minutes(5)));

        clock.advance(ChronoDuration::minutes(5));
        let outcomes = run_due(&scheduler).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], RunOutcome::Completed { records: Some(2), .. }));

        let stored = scheduler.engine().registry().pipeline(&pipeline.id).await.unwrap();
        assert_eq!(stored.total_records, 2);
        assert_eq!(stored.last_run, Some(start + ChronoDuration::minutes(5)));
        assert_eq!(stored.next_run, Some(start + ChronoDuration::minutes(10)));
        assert_eq!(scheduler.armed(target), stored.next_run);
    }

    #[tokio::test]
    async fn overlapping_pipeline_firing_is_suppressed() {
        let gate = Gate::new();
        let agent = ScriptedAgent::new().page(URL, vec![json!({"title": "Dune"})]).gated(gate.clone());
        let (scheduler, clock, _) = setup(agent).await;
        let pipeline = scheduler.create_pipeline(scheduled_pipeline()).await.unwrap();

        clock.advance(ChronoDuration::minutes(5));
        let mut first = scheduler.tick().await;
        assert_eq!(first.len(), 1);
        gate.entered.notified().await;

        clock.advance(ChronoDuration::minutes(5));
        assert_eq!(run_due(&scheduler).await, vec![RunOutcome::Suppressed]);

        gate.release.notify_one();
        let outcome = first.remove(0).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { records: Some(1), .. }));
        let stored = scheduler.engine().registry().pipeline(&pipeline.id).await.unwrap();
        assert_eq!(stored.total_records, 1);
    }

    #[tokio::test]
    async fn task_deleted_by_another_scheduler_does_not_run() {
        let (serving, other, clock, store) = shared_pair().await;
        let task = serving.create_task(watch(None)).await.unwrap();

        other.engine().registry().load().await.unwrap();
        assert!(other.delete_task(&task.id).await.unwrap());

        clock.advance(ChronoDuration::minutes(5));
        assert!(run_due(&serving).await.is_empty());
        assert_eq!(serving.armed(EntityRef::task(task.id)), None);
        assert!(serving.engine().registry().task(&task.id).await.is_none());
        assert!(store.get(&Task::key_for(&task.id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn task_disabled_by_another_scheduler_does_not_run() {
        let (serving, other, clock, _) = shared_pair().await;
        let task = serving.create_task(watch(None)).await.unwrap();

        other.engine().registry().load().await.unwrap();
        other.set_task_enabled(&task.id, false).await.unwrap();

        clock.advance(ChronoDuration::minutes(5));
        assert!(run_due(&serving).await.is_empty());
        assert_eq!(serving.armed(EntityRef::task(task.id)), None);

        let stored = other.engine().registry().refresh_task(&task.id).await.unwrap().unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.run_count, 0);
        assert!(stored.next_run.is_none());
    }

    #[tokio::test]
    async fn pipeline_disabled_between_firings_is_not_rearmed() {
        let (scheduler, clock, _) = setup(ScriptedAgent::new().page(URL, vec![])).await;
        let pipeline = scheduler.create_pipeline(scheduled_pipeline()).await.unwrap();

        // Flip the flag behind the scheduler's back so the timer stays armed.
        scheduler
            .engine()
            .registry()
            .update_pipeline(&pipeline.id, |p| p.enabled = false)
            .await
            .unwrap();

        clock.advance(ChronoDuration::minutes(5));
        assert!(run_due(&scheduler).await.is_empty());
        let stored = scheduler.engine().registry().pipeline(&pipeline.id).await.unwrap();
        assert!(stored.last_run.is_none());
        assert_eq!(scheduler.armed(EntityRef::pipeline(pipeline.id)), None);
    }
}
