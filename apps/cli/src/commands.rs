//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use siteflow_collector::HttpPageAgent;
use siteflow_core::{
    Engine, ExecutionNotifier, LogNotifier, PipelineNotification, RunOutcome, Scheduler,
    TaskNotification,
};
use siteflow_inference::{InferenceBackend, OpenRouterBackend};
use siteflow_shared::{
    AppConfig, EntityId, NewPipeline, NewTask, Pipeline, Task, expand_home, init_config,
    load_config, load_config_from,
};
use siteflow_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Siteflow: scheduled web data pipelines and page automation.
#[derive(Parser)]
#[command(
    name = "siteflow",
    version,
    about = "Collect, process and deliver web data on a schedule.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.siteflow/siteflow.toml).
    #[arg(long, env = "SITEFLOW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding `[defaults] database_path`.
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Manage data pipelines.
    Pipeline {
        #[command(subcommand)]
        action: EntityAction,
    },

    /// Manage automation tasks.
    Task {
        #[command(subcommand)]
        action: EntityAction,
    },

    /// Show recent runs of a pipeline or task.
    Runs {
        /// Pipeline or task id.
        id: String,

        /// Number of runs to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Run the scheduler until interrupted (Ctrl-C).
    Serve,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Operations shared by pipelines and tasks.
#[derive(Subcommand)]
pub(crate) enum EntityAction {
    /// Register a definition read from a JSON file.
    Create {
        /// Path to the JSON definition.
        file: PathBuf,
    },
    /// List everything registered.
    List,
    /// Print one definition with its run bookkeeping.
    Show { id: String },
    /// Execute now, outside the schedule.
    Run { id: String },
    /// Enable and arm the schedule.
    Enable { id: String },
    /// Disable and cancel the schedule.
    Disable { id: String },
    /// Remove the definition.
    Delete { id: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "siteflow=info",
        1 => "siteflow=debug",
        _ => "siteflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()),
        },
        Command::Pipeline { action } => {
            let foreground = matches!(action, EntityAction::Run { .. });
            let app = App::open(cli.config.as_deref(), cli.database.as_deref(), foreground).await?;
            pipeline_command(&app, action).await
        }
        Command::Task { action } => {
            let foreground = matches!(action, EntityAction::Run { .. });
            let app = App::open(cli.config.as_deref(), cli.database.as_deref(), foreground).await?;
            task_command(&app, action).await
        }
        Command::Runs { id, limit } => {
            let app = App::open(cli.config.as_deref(), cli.database.as_deref(), false).await?;
            cmd_runs(&app, &id, limit).await
        }
        Command::Serve => {
            let app = App::open(cli.config.as_deref(), cli.database.as_deref(), false).await?;
            cmd_serve(app).await
        }
    }
}

/// Engine and scheduler opened over the configured database.
struct App {
    scheduler: Arc<Scheduler>,
    progress: Option<Arc<CliProgress>>,
}

impl App {
    async fn open(
        config_path: Option<&Path>,
        database: Option<&Path>,
        foreground: bool,
    ) -> Result<Self> {
        let config = resolve_config(config_path)?;
        let db_path = match database {
            Some(path) => path.to_path_buf(),
            None => expand_home(&config.defaults.database_path),
        };
        debug!(db = %db_path.display(), "opening database");
        let store = Arc::new(
            Storage::open(&db_path)
                .await
                .wrap_err_with(|| format!("failed to open {}", db_path.display()))?,
        );

        let agent = Arc::new(HttpPageAgent::new(&config.agent)?);
        let inference: Option<Arc<dyn InferenceBackend>> =
            match OpenRouterBackend::from_config(&config.inference) {
                Ok(backend) => Some(Arc::new(backend) as Arc<dyn InferenceBackend>),
                Err(e) => {
                    debug!(error = %e, "inference disabled");
                    None
                }
            };

        let progress = foreground.then(|| Arc::new(CliProgress::new()));
        let notifier: Arc<dyn ExecutionNotifier> = match &progress {
            Some(progress) => progress.clone(),
            None => Arc::new(LogNotifier),
        };

        let mut builder = Engine::builder(config, store, agent).notifier(notifier);
        if let Some(backend) = inference {
            builder = builder.inference(backend);
        }
        let engine = builder.build().await?;

        Ok(Self {
            scheduler: Scheduler::new(engine),
            progress,
        })
    }

    fn engine(&self) -> &Engine {
        self.scheduler.engine()
    }

    fn start_progress(&self, message: String) {
        if let Some(progress) = &self.progress {
            progress.spinner.set_message(message);
            progress.spinner.enable_steady_tick(Duration::from_millis(80));
        }
    }

    fn finish_progress(&self) {
        if let Some(progress) = &self.progress {
            progress.spinner.finish_and_clear();
        }
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

fn parse_id(raw: &str) -> Result<EntityId> {
    EntityId::from_str(raw.trim()).map_err(|e| eyre!("invalid id '{raw}': {e}"))
}

fn read_definition<T: serde::de::DeserializeOwned>(file: &Path) -> Result<T> {
    let text = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("failed to read {}", file.display()))?;
    serde_json::from_str(&text).wrap_err_with(|| format!("invalid definition in {}", file.display()))
}

fn when(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into())
}

fn report_outcome(outcome: RunOutcome) -> Result<()> {
    match outcome {
        RunOutcome::Failed { .. } => Err(eyre!("{outcome}")),
        other => {
            println!("  {other}");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline commands
// ---------------------------------------------------------------------------

async fn pipeline_command(app: &App, action: EntityAction) -> Result<()> {
    let scheduler = &app.scheduler;
    let registry = app.engine().registry();

    match action {
        EntityAction::Create { file } => {
            let def: NewPipeline = read_definition(&file)?;
            let pipeline = scheduler.create_pipeline(def).await?;
            info!(pipeline_id = %pipeline.id, "pipeline created");
            print_pipeline(&pipeline);
        }
        EntityAction::List => {
            let pipelines = registry.pipelines().await;
            if pipelines.is_empty() {
                println!("No pipelines registered.");
            }
            for p in pipelines {
                println!(
                    "{}  {:<24} {:<8} sites={:<3} records={:<8} next={}",
                    p.id,
                    p.name,
                    if p.enabled { "enabled" } else { "disabled" },
                    p.sites.len(),
                    p.total_records,
                    when(p.next_run),
                );
            }
        }
        EntityAction::Show { id } => {
            let id = parse_id(&id)?;
            let pipeline = registry
                .pipeline(&id)
                .await
                .ok_or_else(|| eyre!("no pipeline with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&pipeline)?);
        }
        EntityAction::Run { id } => {
            let id = parse_id(&id)?;
            app.start_progress(format!("Running pipeline {id}"));
            let outcome = scheduler.trigger_pipeline(&id).await;
            app.finish_progress();
            return report_outcome(outcome);
        }
        EntityAction::Enable { id } => {
            let pipeline = scheduler.set_pipeline_enabled(&parse_id(&id)?, true).await?;
            print_pipeline(&pipeline);
        }
        EntityAction::Disable { id } => {
            let pipeline = scheduler.set_pipeline_enabled(&parse_id(&id)?, false).await?;
            print_pipeline(&pipeline);
        }
        EntityAction::Delete { id } => {
            let id = parse_id(&id)?;
            if !scheduler.delete_pipeline(&id).await? {
                return Err(eyre!("no pipeline with id {id}"));
            }
            println!("Deleted pipeline {id}");
        }
    }
    Ok(())
}

fn print_pipeline(p: &Pipeline) {
    println!();
    println!("  Pipeline: {}", p.name);
    println!("  ID:       {}", p.id);
    println!("  Enabled:  {}", p.enabled);
    println!("  Sites:    {}", p.sites.len());
    println!("  Records:  {}", p.total_records);
    println!("  Last run: {}", when(p.last_run));
    println!("  Next run: {}", when(p.next_run));
    println!();
}

// ---------------------------------------------------------------------------
// Task commands
// ---------------------------------------------------------------------------

async fn task_command(app: &App, action: EntityAction) -> Result<()> {
    let scheduler = &app.scheduler;
    let registry = app.engine().registry();

    match action {
        EntityAction::Create { file } => {
            let def: NewTask = read_definition(&file)?;
            let task = scheduler.create_task(def).await?;
            info!(task_id = %task.id, "task created");
            print_task(&task);
        }
        EntityAction::List => {
            let tasks = registry.tasks().await;
            if tasks.is_empty() {
                println!("No tasks registered.");
            }
            for t in tasks {
                let runs = match t.max_runs {
                    Some(max) => format!("{}/{max}", t.run_count),
                    None => t.run_count.to_string(),
                };
                println!(
                    "{}  {:<24} {:<8} {:<10} runs={:<7} next={}",
                    t.id,
                    t.name,
                    if t.enabled { "enabled" } else { "disabled" },
                    t.schedule.value,
                    runs,
                    when(t.next_run),
                );
            }
        }
        EntityAction::Show { id } => {
            let id = parse_id(&id)?;
            let task = registry
                .task(&id)
                .await
                .ok_or_else(|| eyre!("no task with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        EntityAction::Run { id } => {
            let id = parse_id(&id)?;
            app.start_progress(format!("Running task {id}"));
            let outcome = scheduler.trigger_task(&id).await;
            app.finish_progress();
            return report_outcome(outcome);
        }
        EntityAction::Enable { id } => {
            let task = scheduler.set_task_enabled(&parse_id(&id)?, true).await?;
            print_task(&task);
        }
        EntityAction::Disable { id } => {
            let task = scheduler.set_task_enabled(&parse_id(&id)?, false).await?;
            print_task(&task);
        }
        EntityAction::Delete { id } => {
            let id = parse_id(&id)?;
            if !scheduler.delete_task(&id).await? {
                return Err(eyre!("no task with id {id}"));
            }
            println!("Deleted task {id}");
        }
    }
    Ok(())
}

fn print_task(t: &Task) {
    println!();
    println!("  Task:     {}", t.name);
    println!("  ID:       {}", t.id);
    println!("  Enabled:  {}", t.enabled);
    println!("  Schedule: {:?} {}", t.schedule.kind, t.schedule.value);
    println!("  Actions:  {}", t.actions.len());
    match t.max_runs {
        Some(max) => println!("  Runs:     {} of {max}", t.run_count),
        None => println!("  Runs:     {}", t.run_count),
    }
    println!("  Last run: {}", when(t.last_run));
    println!("  Next run: {}", when(t.next_run));
    println!();
}

// ---------------------------------------------------------------------------
// Runs, serve, config
// ---------------------------------------------------------------------------

async fn cmd_runs(app: &App, id: &str, limit: u32) -> Result<()> {
    let id = parse_id(id)?;
    let runs = app.engine().store().list_runs(&id, limit).await?;
    if runs.is_empty() {
        println!("No runs recorded for {id}.");
        return Ok(());
    }
    for run in runs {
        let took = (run.ended_at - run.started_at).num_milliseconds() as f64 / 1000.0;
        let records = run.records.map(|n| format!(" records={n}")).unwrap_or_default();
        let error = run.error.map(|e| format!(" error={e}")).unwrap_or_default();
        println!(
            "{}  {:<9} {}  {took:.1}s{records}{error}",
            run.id,
            run.status.as_str(),
            when(Some(run.started_at)),
        );
    }
    Ok(())
}

async fn cmd_serve(app: App) -> Result<()> {
    let scheduler = app.scheduler;
    let armed = scheduler.start().await?;
    println!("Scheduler running with {armed} armed timers. Press Ctrl-C to stop.");

    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress
// ---------------------------------------------------------------------------

/// Spinner for foreground runs; run notifications update its message.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        Self { spinner }
    }
}

impl ExecutionNotifier for CliProgress {
    fn task_executed(&self, n: &TaskNotification) {
        self.spinner
            .set_message(format!("{} {}: {}", n.name, n.status.as_str(), n.message));
    }

    fn pipeline_finished(&self, n: &PipelineNotification) {
        self.spinner
            .set_message(format!("{} {}: {}", n.name, n.status.as_str(), n.message));
    }
}
