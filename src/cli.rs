// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::ConfigFile;
use crate::types::StageKind;

/// Command-line arguments for `dwiprep`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dwiprep",
    version,
    about = "Resumable, per-subject diffusion MRI preprocessing pipeline.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Dwiprep.toml` in the current working directory, if present.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DWIPREP_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run pipeline stages over a set of subjects.
    Run(RunArgs),
    /// Split a subject list (or a directory of sub-* dirs) into shard files.
    Split(SplitArgs),
    /// List subjects present in raw data but missing from the preprocessed tree.
    Missing(MissingArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// s|sub|single, l|list or a|all.
    #[arg(value_name = "MODE")]
    pub mode: String,

    /// Subject id (single mode) or list file (list mode).
    #[arg(short, long, value_name = "ID|FILE")]
    pub input: Option<String>,

    #[arg(long, value_name = "DIR")]
    pub datain: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    pub dataout: Option<PathBuf>,

    /// Stage to run; repeat for several. Defaults to `[run].stages`.
    #[arg(long = "stage", value_name = "STAGE")]
    pub stages: Vec<StageKind>,

    /// Task name, used in the log file name.
    #[arg(long, value_name = "NAME")]
    pub task: Option<String>,

    #[arg(long, value_name = "N")]
    pub threads: Option<u32>,

    /// Keep the workspace after each subject.
    #[arg(long)]
    pub noclean: bool,

    /// Do not promote outputs or record checkpoints.
    #[arg(long)]
    pub nocopy: bool,

    /// Do not send batch notifications.
    #[arg(long)]
    pub notelegram: bool,

    /// Skip subjects whose checkpoint is complete.
    #[arg(long)]
    pub skip_processed: bool,

    /// Do not require the container environment marker.
    #[arg(long)]
    pub no_env_check: bool,

    /// Minutes to wait before starting.
    #[arg(long, value_name = "MIN")]
    pub wait: Option<u64>,

    /// Print what would run, without running anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    /// Override config values with the flags that were given.
    pub fn apply_to(&self, cfg: &mut ConfigFile) {
        if let Some(dir) = &self.datain {
            cfg.paths.datain = dir.clone();
        }
        if let Some(dir) = &self.dataout {
            cfg.paths.dataout = dir.clone();
        }
        if !self.stages.is_empty() {
            cfg.run.stages = self.stages.clone();
        }
        if let Some(task) = &self.task {
            cfg.run.task = task.clone();
        }
        if let Some(threads) = self.threads {
            cfg.run.threads = threads;
        }
        if self.noclean {
            cfg.run.clean = false;
        }
        if self.nocopy {
            cfg.run.copy = false;
        }
        if self.skip_processed {
            cfg.run.skip_processed = true;
        }
        if self.no_env_check {
            cfg.environment.check = false;
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct SplitArgs {
    /// List file, or directory containing sub-* directories.
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Subjects per shard.
    #[arg(long, value_name = "N")]
    pub size: usize,

    #[arg(long, default_value = "batch", value_name = "P")]
    pub prefix: String,

    #[arg(long, default_value = ".", value_name = "DIR")]
    pub outdir: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct MissingArgs {
    #[arg(long, value_name = "DIR")]
    pub rawdir: PathBuf,

    #[arg(long, value_name = "DIR")]
    pub preprocdir: PathBuf,

    /// Also write the list to this file.
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["dwiprep", "run"];
        full.extend_from_slice(argv);
        match CliArgs::try_parse_from(full).unwrap().command {
            Command::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn repeated_stage_flags_parse() {
        let args = run_args(&["l", "-i", "batch0.csv", "--stage", "eddy", "--stage", "p2s"]);
        assert_eq!(args.stages, vec![StageKind::Eddy, StageKind::Patch2self]);
        assert_eq!(args.input.as_deref(), Some("batch0.csv"));
    }

    #[test]
    fn flags_override_config() {
        let args = run_args(&["a", "--noclean", "--nocopy", "--threads", "12", "--no-env-check"]);
        let mut cfg = ConfigFile::default();
        args.apply_to(&mut cfg);
        assert!(!cfg.run.clean);
        assert!(!cfg.run.copy);
        assert_eq!(cfg.run.threads, 12);
        assert!(!cfg.environment.check);
        assert!(cfg.run.stages.is_empty());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = CliArgs::try_parse_from([
            "dwiprep", "missing", "--rawdir", "raw", "--preprocdir", "prep", "--log-level", "debug",
        ])
        .unwrap();
        assert!(matches!(cli.log_level, Some(LogLevel::Debug)));
        assert!(matches!(cli.command, Command::Missing(_)));
    }
}
