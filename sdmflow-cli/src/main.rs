//! sdmflow - batched species distribution pipelines on Slurm
//!
//! `run` drives every batch and then the aggregation fan-out, `plan` prints
//! the stages and extents of one batch without submitting anything, and
//! `aggregate` runs only the aggregation fan-out.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdmflow::observability::{init_logging, LogFormat, DEFAULT_FILTER};
use sdmflow::prelude::*;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sdmflow", version)]
#[command(about = "Batched driver for species distribution pipelines on Slurm")]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true, default_value = "sdmflow.toml")]
    config: PathBuf,

    /// Log output: text or json
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every batch, then the aggregation fan-out
    Run {
        /// First batch to run (1-based); earlier batches are skipped
        #[arg(long, default_value = "1")]
        start_batch: u32,

        /// Log submissions instead of making them; scratch is kept
        #[arg(long)]
        dry_run: bool,

        /// Stop after the last batch
        #[arg(long)]
        skip_aggregation: bool,
    },
    /// Print the stages and extents of one batch
    Plan {
        /// Entity count to plan for; defaults to the current entity list
        #[arg(long)]
        entities: Option<u32>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Submit only the aggregation jobs
    Aggregate {
        /// Log submissions instead of making them
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_format, DEFAULT_FILTER) {
        eprintln!("sdmflow: cannot initialise logging: {e}");
    }

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("sdmflow: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(e: &anyhow::Error) -> u8 {
    if let Some(e) = e.downcast_ref::<SdmflowError>() {
        return e.exit_code();
    }
    if e.downcast_ref::<ConfigurationError>().is_some() {
        return 2;
    }
    1
}

async fn dispatch(cli: Cli) -> Result<()> {
    let params = load(&cli.config)?;
    match cli.command {
        Command::Run {
            start_batch,
            dry_run,
            skip_aggregation,
        } => run(params, start_batch, dry_run, skip_aggregation).await,
        Command::Plan { entities, json } => plan(&params, entities, json),
        Command::Aggregate { dry_run } => {
            let session = Arc::new(SessionContext::from_params(&params)?);
            aggregate(&params, session, scheduler(&params, dry_run)?).await
        }
    }
}

fn load(path: &Path) -> Result<ParameterSet> {
    ParameterSet::from_file(path)
        .with_context(|| format!("loading settings from {}", path.display()))
}

fn scheduler(params: &ParameterSet, dry_run: bool) -> Result<Arc<dyn JobScheduler>> {
    if dry_run {
        info!("Dry run: nothing will be submitted");
        return Ok(Arc::new(DryRunScheduler::new()));
    }
    let mut slurm = SlurmScheduler::new().with_binaries(
        params.optional_str("scheduler.sbatch")?.unwrap_or("sbatch"),
        params.optional_str("scheduler.sacct")?.unwrap_or("sacct"),
    );
    if let Some(extra) = params.optional_list("scheduler.extra_args")? {
        slurm = slurm.with_extra_args(extra);
    }
    Ok(Arc::new(slurm))
}

fn mirror(params: &ParameterSet, dry_run: bool) -> Result<Arc<dyn Mirror>> {
    match params.optional_str("sync.mirror")?.unwrap_or("rsync") {
        "rsync" => {
            let binary = params.optional_str("sync.rsync")?.unwrap_or("rsync");
            Ok(Arc::new(
                RsyncMirror::new().with_binary(binary).with_dry_run(dry_run),
            ))
        }
        "local" => Ok(Arc::new(LocalMirror)),
        other => Err(ConfigurationError::invalid(
            "sync.mirror",
            format!("unknown mirror '{other}' (expected rsync or local)"),
        )
        .into()),
    }
}

async fn run(
    params: ParameterSet,
    start_batch: u32,
    dry_run: bool,
    skip_aggregation: bool,
) -> Result<()> {
    let session = Arc::new(SessionContext::bootstrap(&params)?);
    let toggles = PipelineToggles::from_params(&params)?;
    let scheduler = scheduler(&params, dry_run)?;
    let events: Arc<dyn EventSink> = Arc::new(LoggingEventSink::debug());

    let driver = PipelineDriver::new(
        StageCatalog::standard()?,
        params.clone(),
        toggles,
        session.clone(),
        scheduler.clone(),
    )
    .with_event_sink(events.clone());
    let settings = CommandSettingsUpdater::from_params(&params, session.layout().clone())?;
    let resolver = CountResolver::new(&params, &toggles, &session)?;
    let archiver = Archiver::new(
        session.clone(),
        ArchiveSettings::from_params(&params)?,
        mirror(&params, dry_run)?,
        scheduler.clone(),
    )
    .with_event_sink(events.clone())
    .with_dry_run(dry_run);

    info!(
        session_id = %session.session_id(),
        levels = toggles.levels,
        projections = toggles.projections,
        start_batch,
        "Starting run"
    );
    let report = RunBatcher::new(
        session.clone(),
        Arc::new(settings),
        resolver,
        Arc::new(driver),
        Arc::new(archiver),
    )
    .with_start_batch(start_batch)
    .with_event_sink(events)
    .run_session(&params)
    .await?;
    info!(
        batches = report.batches.len(),
        total = report.total_batches,
        "Batches finished"
    );

    if skip_aggregation {
        info!("Aggregation skipped");
        return Ok(());
    }
    if !params.contains("aggregation") {
        warn!("No [aggregation] settings; aggregation skipped");
        return Ok(());
    }
    aggregate(&params, session, scheduler).await
}

fn plan(params: &ParameterSet, entities: Option<u32>, json: bool) -> Result<()> {
    let session = SessionContext::from_params(params)?;
    let toggles = PipelineToggles::from_params(params)?;
    let resolver = CountResolver::new(params, &toggles, &session)?;
    let counts = match entities {
        Some(entities) => resolver.counts_for(entities)?,
        None => resolver
            .resolve(session.layout())
            .context("no --entities given and the current entity list is unreadable")?,
    };

    let catalog = StageCatalog::standard()?;
    let plan = ExecutionPlan::build(&catalog, params, &toggles, &counts, &session)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{plan}");
    }
    Ok(())
}

async fn aggregate(
    params: &ParameterSet,
    session: Arc<SessionContext>,
    scheduler: Arc<dyn JobScheduler>,
) -> Result<()> {
    let settings = AggregationSettings::from_params(params, &session)?;
    let report = Aggregator::new(settings, session, scheduler)
        .with_event_sink(Arc::new(LoggingEventSink::debug()))
        .run()
        .await?;
    for (group, job_id) in &report.submitted {
        info!(group = %group, job_id = job_id.as_deref().unwrap_or("-"), "Aggregation job");
    }
    report.into_result()?;
    Ok(())
}
