#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use dwiprep::config::ConfigFile;
use dwiprep::errors::ErrorKind;
use dwiprep::fs::mock::MockFileSystem;
use dwiprep::fs::FileSystem;
use dwiprep::notify::{NoopNotifier, Notifier};
use dwiprep::orchestrator::Orchestrator;
use dwiprep::status_log::{read_records, LogRecord, LogStatus, StatusLog};
use dwiprep::types::{AcqparamsOrder, Denoiser, FailureAction, StageKind};

use crate::fake_invoker::FakeInvoker;

/// AP b-values used by [`seed_raw_subject`]: 7 volumes, b0s at 0, 3 and 6.
pub const AP_BVALS: &str = "0 1000 1000 5 1000 2000 50\n";
pub const AP_VOLUMES: usize = 7;
pub const AP_B0S: usize = 3;

/// Builder for `ConfigFile` to simplify test setup.
///
/// Paths are relative (`raw`, `out`, `tmp`, `logs`) so they work both on
/// the mock filesystem and, joined onto a temp dir, on the real one.
pub struct ConfigFileBuilder {
    config: ConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        let mut config = ConfigFile::default();
        config.paths.datain = PathBuf::from("raw");
        config.paths.dataout = PathBuf::from("out");
        config.paths.workspace_root = PathBuf::from("tmp");
        config.paths.logs_dir = PathBuf::from("logs");
        config.environment.check = false;
        config.notify.enabled = false;
        config.lease.owner = Some("tester@host".to_string());
        Self { config }
    }

    /// Prefix every path with `root`.
    pub fn rooted_at(mut self, root: &Path) -> Self {
        let paths = &mut self.config.paths;
        paths.datain = root.join(&paths.datain);
        paths.dataout = root.join(&paths.dataout);
        paths.workspace_root = root.join(&paths.workspace_root);
        paths.logs_dir = root.join(&paths.logs_dir);
        self
    }

    pub fn with_stages(mut self, stages: &[StageKind]) -> Self {
        self.config.run.stages = stages.to_vec();
        self
    }

    pub fn with_denoiser(mut self, denoiser: Denoiser) -> Self {
        self.config.pipeline.denoiser = denoiser;
        self
    }

    pub fn skip_processed(mut self, val: bool) -> Self {
        self.config.run.skip_processed = val;
        self
    }

    pub fn copy(mut self, val: bool) -> Self {
        self.config.run.copy = val;
        self
    }

    pub fn clean(mut self, val: bool) -> Self {
        self.config.run.clean = val;
        self
    }

    pub fn verify_digests(mut self, val: bool) -> Self {
        self.config.checkpoint.verify_digests = val;
        self
    }

    pub fn abort_on(mut self, kind: ErrorKind) -> Self {
        self.config.policy.on_error.insert(kind, FailureAction::Abort);
        self
    }

    pub fn with_acqparams(mut self, order: AcqparamsOrder, ap_polarity: i8) -> Self {
        self.config.topup.acqparams_order = order;
        self.config.topup.ap_polarity = ap_polarity;
        self
    }

    pub fn with_command(mut self, stage: StageKind, key: &str, template: &str) -> Self {
        self.config
            .stages
            .entry(stage)
            .or_default()
            .commands
            .insert(key.to_string(), template.to_string());
        self
    }

    pub fn with_qa(mut self, stage: StageKind, template: &str) -> Self {
        self.config
            .stages
            .entry(stage)
            .or_default()
            .qa
            .push(template.to_string());
        self
    }

    pub fn build(self) -> ConfigFile {
        self.config
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the six raw files gibbs expects into `<datain>/<sub>/dwi/`, plus
/// a derived map that must be ignored.
pub fn seed_raw_subject(fs: &dyn FileSystem, cfg: &ConfigFile, sub: &str) {
    let dir = cfg.paths.datain.join(sub).join("dwi");
    let json = b"{\"TotalReadoutTime\": 0.0959097}\n";
    let files: [(&str, &[u8]); 7] = [
        ("dir-AP_dwi_AP_.nii.gz", b"ap image"),
        ("dir-AP_dwi_AP_.bval", AP_BVALS.as_bytes()),
        ("dir-AP_dwi_AP_.bvec", b"0 1 0 0 1 0 0\n"),
        ("dir-AP_dwi_AP_.json", json),
        ("dir-PA_dwi_PA_.nii.gz", b"pa image"),
        ("dir-PA_dwi_PA_.json", json),
        ("dir-AP_dwi_AP_SBRef_.nii.gz", b"sbref"),
    ];
    for (name, contents) in files {
        fs.write(&dir.join(format!("{sub}_{name}")), contents)
            .expect("seeding raw file");
    }
}

/// Mock filesystem, fake invoker and status log wired into an orchestrator.
pub struct Harness {
    pub fs: MockFileSystem,
    pub invoker: Arc<FakeInvoker>,
    pub log: Arc<StatusLog>,
    pub config: Arc<ConfigFile>,
}

impl Harness {
    pub fn new(config: ConfigFile) -> Self {
        let fs = MockFileSystem::new();
        let shared: Arc<dyn FileSystem> = Arc::new(fs.clone());
        let started = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let log = StatusLog::start(shared.clone(), &config.paths.logs_dir, &config.run.task, started)
            .expect("opening status log");
        Self {
            invoker: Arc::new(FakeInvoker::new(shared)),
            log: Arc::new(log),
            config: Arc::new(config),
            fs,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(Arc::new(NoopNotifier))
    }

    pub fn orchestrator_with(&self, notifier: Arc<dyn Notifier>) -> Orchestrator {
        Orchestrator::new(
            self.config.clone(),
            Arc::new(self.fs.clone()),
            self.invoker.clone(),
            self.log.clone(),
            notifier,
        )
    }

    pub fn seed(&self, sub: &str) {
        seed_raw_subject(&self.fs, &self.config, sub);
    }

    pub fn records(&self) -> Vec<LogRecord> {
        let path = self.log.path().expect("log enabled");
        read_records(&self.fs, path).expect("reading status log")
    }

    /// Records for `subject` with `status`.
    pub fn records_for(&self, subject: &str, status: LogStatus) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.subject == subject && r.status == status)
            .collect()
    }

    pub fn durable(&self, sub: &str, name: &str) -> PathBuf {
        self.config.paths.dataout.join(sub).join(name)
    }
}
