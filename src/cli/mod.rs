//! Command-line interface for bi-forecast.
//!
//! Provides commands for running the forecast pipeline, inspecting runs,
//! reading stored forecasts, managing model promotion, and triggering runs
//! on a schedule or when the data file changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use uuid::Uuid;

use crate::adapters::{CsvDataSource, CsvSourceConfig, DataSource, HttpInsightClient};
use crate::config::{self, ResolvedConfig};
use crate::core::{ForecastStore, ModelRegistry, Orchestrator, PipelineConfig};
use crate::domain::{EntityStage, RunRecord, RunStatus, TimeRange};
use crate::error::{OrchestratorError, StoreError};
use crate::trigger::{DataFileWatcher, Scheduler, TickOutcome, WatcherConfig};

/// Exit code when the requested entities are claimed by another run
pub const EXIT_RUN_IN_PROGRESS: i32 = 3;

/// bi-forecast - Revenue forecasting pipeline
#[derive(Parser, Debug)]
#[command(name = "bi-forecast")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (default: .bi-forecast/config.yaml in this or a parent directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// CSV data file (overrides config and BI_FORECAST_DATA)
    #[arg(long, global = true, env = "BI_FORECAST_DATA")]
    pub data: Option<PathBuf>,

    /// Pipeline config YAML (overrides the `pipeline` section of the config file)
    #[arg(long, global = true)]
    pub pipeline: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline for the given entities (all known entities if none)
    Run {
        entities: Vec<String>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print the latest forecast of an entity as JSON
    Latest {
        entity: String,
    },

    /// Print stored forecast versions of an entity as JSON
    History {
        entity: String,

        /// Only versions generated within the last N days
        #[arg(short, long)]
        days: Option<i64>,
    },

    /// List model artifacts of an entity
    Models {
        entity: String,
    },

    /// Promote a model version manually
    Promote {
        entity: String,
        version: String,
    },

    /// List entities known to the data source
    Entities,

    /// Run the pipeline on a fixed interval until Ctrl-C
    Schedule {
        /// Interval in seconds
        #[arg(short, long, default_value = "86400")]
        every: u64,

        entities: Vec<String>,
    },

    /// Run the pipeline whenever the data file changes, until Ctrl-C
    Watch {
        /// Seconds the file must be stable before a run starts
        #[arg(long, default_value = "5")]
        stability_delay: u64,

        entities: Vec<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub async fn execute(self) -> Result<i32> {
        let cfg = match &self.config {
            Some(path) => config::load_from(path)?,
            None => config::config()?.clone(),
        };
        let app = App::new(cfg, self.data, self.pipeline)?;

        match self.command {
            Commands::Run { entities } => app.run(entities).await,
            Commands::Status { run_id } => app.show_status(&run_id).await,
            Commands::Runs { limit } => app.list_runs(limit).await,
            Commands::Latest { entity } => app.latest(&entity).await,
            Commands::History { entity, days } => app.history(&entity, days).await,
            Commands::Models { entity } => app.models(&entity).await,
            Commands::Promote { entity, version } => app.promote(&entity, &version).await,
            Commands::Entities => app.entities().await,
            Commands::Schedule { every, entities } => app.schedule(every, entities).await,
            Commands::Watch {
                stability_delay,
                entities,
            } => app.watch(stability_delay, entities).await,
            Commands::Config => app.show_config(),
        }
    }
}

/// Resolved settings shared by every command
struct App {
    cfg: ResolvedConfig,
    data: Option<CsvSourceConfig>,
    pipeline: PipelineConfig,
}

impl App {
    fn new(
        cfg: ResolvedConfig,
        data_override: Option<PathBuf>,
        pipeline_override: Option<PathBuf>,
    ) -> Result<Self> {
        let data = match (data_override, cfg.data.clone()) {
            (Some(path), Some(mut data)) => {
                data.path = path;
                Some(data)
            }
            (Some(path), None) => Some(CsvSourceConfig::new(path)),
            (None, data) => data,
        };
        let pipeline = match pipeline_override {
            Some(path) => PipelineConfig::from_file(&path)?,
            None => cfg.pipeline.clone(),
        };
        Ok(Self {
            cfg,
            data,
            pipeline,
        })
    }

    fn source(&self) -> Result<Arc<dyn DataSource>> {
        let data = self
            .data
            .clone()
            .context("No data file configured (use --data, BI_FORECAST_DATA or data.path in config)")?;
        Ok(Arc::new(CsvDataSource::new(data)))
    }

    async fn registry(&self) -> Result<ModelRegistry> {
        Ok(ModelRegistry::open(self.cfg.registry_path()).await?)
    }

    async fn store(&self) -> Result<ForecastStore> {
        Ok(ForecastStore::open(self.cfg.forecasts_path(), self.pipeline.store.clone()).await?)
    }

    async fn orchestrator(&self) -> Result<Orchestrator> {
        let mut orchestrator = Orchestrator::new(
            self.source()?,
            Arc::new(self.registry().await?),
            Arc::new(self.store().await?),
        )
        .with_run_log(self.cfg.runs_dir())
        .with_lock_dir(self.cfg.locks_dir());

        if let Some(client) = HttpInsightClient::from_config(&self.cfg.insight)? {
            orchestrator = orchestrator.with_insight(Arc::new(client));
        }
        Ok(orchestrator)
    }

    /// Orchestrator that only reads run logs
    async fn run_log_reader(&self) -> Result<Orchestrator> {
        let source: Arc<dyn DataSource> = Arc::new(crate::adapters::MemoryDataSource::new());
        Ok(Orchestrator::new(
            source,
            Arc::new(ModelRegistry::in_memory()),
            Arc::new(ForecastStore::in_memory(self.pipeline.store.clone())),
        )
        .with_run_log(self.cfg.runs_dir()))
    }

    async fn resolve_entities(&self, orchestrator: &Orchestrator, entities: Vec<String>) -> Result<Vec<String>> {
        if !entities.is_empty() {
            return Ok(entities);
        }
        Ok(orchestrator.source().entities().await?)
    }

    async fn run(&self, entities: Vec<String>) -> Result<i32> {
        let orchestrator = self.orchestrator().await?;
        let entities = self.resolve_entities(&orchestrator, entities).await?;

        match orchestrator.run_pipeline(&entities, &self.pipeline).await {
            Ok(run) => {
                print_run(&run);
                Ok(run.status.code())
            }
            Err(OrchestratorError::RunInProgress(e)) => {
                eprintln!("{}", e);
                Ok(EXIT_RUN_IN_PROGRESS)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn show_status(&self, run_id_str: &str) -> Result<i32> {
        let run_id = Uuid::parse_str(run_id_str)
            .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

        let run = self.run_log_reader().await?.get_run_status(run_id).await?;
        print_run(&run);
        Ok(0)
    }

    async fn list_runs(&self, limit: usize) -> Result<i32> {
        let runs = self.run_log_reader().await?.list_runs(limit).await?;

        if runs.is_empty() {
            println!("No runs found");
            return Ok(0);
        }

        println!("{:<38} {:<26} {:<16} {:>8}", "RUN ID", "STARTED", "STATUS", "ENTITIES");
        println!("{}", "-".repeat(91));

        for run in runs {
            println!(
                "{:<38} {:<26} {:<16} {:>8}",
                run.id,
                run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                run.status.as_str(),
                run.entity_ids.len()
            );
        }

        Ok(0)
    }

    async fn latest(&self, entity: &str) -> Result<i32> {
        let store = self.store().await?;
        match store.latest(entity).await {
            Ok(forecast) => {
                println!("{}", serde_json::to_string_pretty(&forecast)?);
                Ok(0)
            }
            Err(e @ StoreError::Stale(_)) | Err(e @ StoreError::NotFound(_)) => {
                eprintln!("{}", e);
                Ok(1)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn history(&self, entity: &str, days: Option<i64>) -> Result<i32> {
        let range = match days {
            Some(days) => TimeRange::trailing_days(Utc::now(), days),
            None => TimeRange::all(),
        };
        let history = self.store().await?.history(entity, range).await;
        let versions: Vec<_> = history.iter().collect();
        println!("{}", serde_json::to_string_pretty(&versions)?);
        Ok(0)
    }

    async fn models(&self, entity: &str) -> Result<i32> {
        let artifacts = self.registry().await?.list(entity).await;

        if artifacts.is_empty() {
            println!("No models for {}", entity);
            return Ok(0);
        }

        println!("{:<20} {:<12} {:>10} {:>8} {:<26}", "VERSION", "STATUS", "MAPE", "POINTS", "CREATED");
        println!("{}", "-".repeat(80));
        for artifact in artifacts {
            println!(
                "{:<20} {:<12} {:>10.2} {:>8} {:<26}",
                artifact.version,
                format!("{:?}", artifact.status).to_lowercase(),
                artifact.quality_score(),
                artifact.metrics.observations,
                artifact.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        Ok(0)
    }

    async fn promote(&self, entity: &str, version: &str) -> Result<i32> {
        let decision = self.registry().await?.promote(entity, version).await?;
        println!("{}@{}: {:?}", entity, version, decision);
        Ok(0)
    }

    async fn entities(&self) -> Result<i32> {
        for entity in self.source()?.entities().await? {
            println!("{}", entity);
        }
        Ok(0)
    }

    async fn schedule(&self, every: u64, entities: Vec<String>) -> Result<i32> {
        anyhow::ensure!(every > 0, "--every must be at least 1 second");

        let scheduler = Scheduler::new(Arc::new(self.orchestrator().await?), self.pipeline.clone(), entities);
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = stop_tx.send(true);
            }
        });

        let outcomes = scheduler.run_every(Duration::from_secs(every), stop_rx).await;
        for outcome in &outcomes {
            match outcome {
                TickOutcome::Completed(summary) => println!("{} {}", summary.run_id, summary.status.as_str()),
                TickOutcome::Skipped(reason) => println!("skipped: {}", reason),
                TickOutcome::Failed(reason) => println!("failed: {}", reason),
            }
        }
        Ok(0)
    }

    async fn watch(&self, stability_delay: u64, entities: Vec<String>) -> Result<i32> {
        let data = self.data.clone().context("No data file configured")?;
        let mut watcher_config = WatcherConfig::new(data.path);
        watcher_config.stability_delay_secs = stability_delay;

        let scheduler = Scheduler::new(Arc::new(self.orchestrator().await?), self.pipeline.clone(), entities);
        let (mut changes, handle) = DataFileWatcher::new(watcher_config).watch().await?;

        println!("Watching for data changes (Ctrl-C to stop)");
        loop {
            tokio::select! {
                change = changes.recv() => {
                    let Some(change) = change else { break };
                    println!("Data changed ({}), running pipeline", change.hash);
                    match scheduler.tick().await {
                        TickOutcome::Completed(summary) => println!("{} {}", summary.run_id, summary.status.as_str()),
                        TickOutcome::Skipped(reason) => println!("skipped: {}", reason),
                        TickOutcome::Failed(reason) => println!("failed: {}", reason),
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        handle.stop().await?;
        Ok(0)
    }

    fn show_config(&self) -> Result<i32> {
        let cfg = &self.cfg;

        println!("bi-forecast configuration");
        println!();
        println!(
            "Config file: {}",
            cfg.config_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none - using defaults)".to_string())
        );
        println!();
        println!("Paths:");
        println!("  Home:       {}", cfg.home.display());
        println!("  Registry:   {}", cfg.registry_path().display());
        println!("  Forecasts:  {}", cfg.forecasts_path().display());
        println!("  Runs:       {}", cfg.runs_dir().display());
        println!("  Locks:      {}", cfg.locks_dir().display());
        println!(
            "  Data:       {}",
            self.data
                .as_ref()
                .map(|d| d.path.display().to_string())
                .unwrap_or_else(|| "(not configured)".to_string())
        );
        println!();
        println!(
            "Logging: format={} level={} file={}",
            cfg.logging.format,
            cfg.logging.level,
            cfg.logging
                .file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(stderr only)".to_string())
        );
        println!(
            "Insight: {}",
            cfg.insight.endpoint.as_deref().unwrap_or("(disabled)")
        );
        println!();
        println!("Pipeline:");
        print!("{}", serde_yaml::to_string(&self.pipeline)?);

        Ok(0)
    }
}

fn print_run(run: &RunRecord) {
    println!("Run ID: {}", run.id);
    println!("Status: {} (code {})", run.status.as_str(), run.status.code());
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("Retries: {}", run.retry_count);
    println!("\nEntities:");
    for (entity, report) in &run.entities {
        let detail = match &report.stage {
            EntityStage::Done => format!(
                "done (model {}, MAPE {:.2})",
                report.model_version.as_deref().unwrap_or("-"),
                report.quality_score.unwrap_or(f64::NAN)
            ),
            EntityStage::Failed(reason) => format!("{:?}: {}", reason.outcome(), reason),
            other if run.status == RunStatus::Running => format!("{} (in progress)", other.name()),
            other => format!("{} (unfinished)", other.name()),
        };
        println!("  {}: {}", entity, detail);
    }
}
