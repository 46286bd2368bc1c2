// src/lib.rs

pub mod batch;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod errors;
pub mod eta;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod notify;
pub mod orchestrator;
pub mod stages;
pub mod status_log;
pub mod subject;
pub mod types;
pub mod workspace;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, info};

use crate::cli::{CliArgs, Command, MissingArgs, RunArgs, SplitArgs};
use crate::config::{load_or_default, validate_config, ConfigFile};
use crate::exec::{ShellInvoker, ToolInvoker};
use crate::fs::{FileSystem, RealFileSystem};
use crate::notify::{CommandNotifier, NoopNotifier, Notifier};
use crate::orchestrator::{run_startup, Orchestrator};
use crate::stages::graph::order_stages;
use crate::stages::runner_for;
use crate::status_log::StatusLog;
use crate::subject::SubjectId;

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    match &args.command {
        Command::Run(run_args) => run_pipeline(&args, run_args).await,
        Command::Split(split) => run_split(split),
        Command::Missing(missing) => run_missing(missing),
    }
}

/// Config file plus CLI overrides, validated again after the overrides.
pub fn effective_config(args: &CliArgs, run_args: &RunArgs) -> Result<ConfigFile> {
    let mut cfg = load_or_default(args.config.as_deref())?;
    run_args.apply_to(&mut cfg);
    validate_config(&cfg)?;
    Ok(cfg)
}

async fn run_pipeline(args: &CliArgs, run_args: &RunArgs) -> Result<()> {
    let cfg = effective_config(args, run_args)?;
    let stages = order_stages(&cfg.run.stages)?;

    if let Some(minutes) = run_args.wait.filter(|m| *m > 0) {
        info!(minutes, "waiting before start");
        tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
    }

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);

    let log = if cfg.run.log && !run_args.dry_run {
        StatusLog::start(fs.clone(), &cfg.paths.logs_dir, &cfg.run.task, Local::now())?
    } else {
        StatusLog::disabled()
    };
    let log = Arc::new(log);

    let startup = run_startup(
        fs.as_ref(),
        &cfg,
        &run_args.mode,
        run_args.input.as_deref(),
        run_args.notelegram,
        &log,
    )?;

    if run_args.dry_run {
        print_dry_run(&cfg, &stages, &startup.subjects);
        return Ok(());
    }

    let invoker: Arc<dyn ToolInvoker> = Arc::new(ShellInvoker);
    let notifier: Arc<dyn Notifier> = if startup.notifications {
        Arc::new(CommandNotifier::new(cfg.notify.command.clone(), invoker.clone()))
    } else {
        Arc::new(NoopNotifier)
    };

    let cfg = Arc::new(cfg);
    let orchestrator = Orchestrator::new(cfg, fs, invoker, log.clone(), notifier);
    let reports = orchestrator.run(&stages, &startup.subjects).await?;
    log.close();

    for report in &reports {
        println!("{}", report.summary());
    }
    Ok(())
}

fn run_split(args: &SplitArgs) -> Result<()> {
    let fs = RealFileSystem;
    let ids = batch::load_split_input(&fs, &args.input)?;
    let written = batch::write_shards(&fs, &ids, args.size, &args.prefix, &args.outdir)
        .with_context(|| format!("splitting {:?}", args.input))?;

    println!("{} subjects split into {} file(s):", ids.len(), written.len());
    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}

fn run_missing(args: &MissingArgs) -> Result<()> {
    let fs = RealFileSystem;
    let raw = subject::scan_subject_dirs(&fs, &args.rawdir)?;
    let missing = batch::missing_subjects(&fs, &args.rawdir, &args.preprocdir)?;

    println!("{} subjects in raw data", raw.len());
    println!("{} subjects missing preprocessing:", missing.len());
    let mut body = String::new();
    for sub in &missing {
        println!("{sub}");
        body.push_str(sub.as_str());
        body.push('\n');
    }

    if let Some(path) = &args.output {
        fs.write(path, body.as_bytes())?;
        debug!(path = %path.display(), "missing list written");
    }
    Ok(())
}

/// Print configuration, stage order, subjects and command templates.
fn print_dry_run(cfg: &ConfigFile, stages: &[types::StageKind], subjects: &[SubjectId]) {
    println!("dwiprep dry-run");
    println!("  paths.datain = {}", cfg.paths.datain.display());
    println!("  paths.dataout = {}", cfg.paths.dataout.display());
    println!("  paths.workspace_root = {}", cfg.paths.workspace_root.display());
    println!("  run.task = {}", cfg.run.task);
    println!("  run.threads = {}", cfg.run.threads);
    println!(
        "  run.clean = {}, run.copy = {}, run.skip_processed = {}",
        cfg.run.clean, cfg.run.copy, cfg.run.skip_processed
    );
    println!("  pipeline.denoiser = {:?}", cfg.pipeline.denoiser);
    println!();

    println!("subjects ({}):", subjects.len());
    for sub in subjects {
        println!("  - {sub}");
    }
    println!();

    let cfg = Arc::new(cfg.clone());
    println!("stages ({}):", stages.len());
    for stage in stages {
        let runner = runner_for(*stage, cfg.clone());
        let mut commands: BTreeMap<String, String> = runner
            .default_commands()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        commands.extend(cfg.stage(*stage).commands);

        println!("  - {stage}");
        for (key, cmd) in &commands {
            println!("      {key}: {cmd}");
        }
        let section = cfg.stage(*stage);
        for qa in section.qa_before.iter().chain(section.qa.iter()) {
            println!("      qa: {qa}");
        }
        if let Some(first) = subjects.first() {
            println!("      markers: {:?}", runner.markers(first));
        }
    }

    debug!("dry-run complete (no execution)");
}
