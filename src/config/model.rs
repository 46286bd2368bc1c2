// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::errors::ErrorKind;
use crate::types::{
    AcqparamsOrder, Denoiser, EtaMode, FailureAction, GibbsBackend, StageKind,
};

/// Configuration as read from `Dwiprep.toml`, before validation.
///
/// ```toml
/// [paths]
/// datain = "/mnt/clab/COST_mri/rawdata"
/// dataout = "/mnt/clab/COST_mri/derivatives/dwi/preproc"
///
/// [run]
/// task = "gibbs batch 1"
/// threads = 8
///
/// [pipeline]
/// denoiser = "mppca"
///
/// [policy.on_error]
/// lease = "abort"
///
/// [stage.eddy.commands]
/// mask = "mri_synthstrip -i {b0} -m {mask}"
/// ```
///
/// Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub policy: RawPolicySection,
    #[serde(default)]
    pub notify: NotifySection,
    #[serde(default)]
    pub gibbs: GibbsSection,
    #[serde(default)]
    pub denoise: DenoiseSection,
    #[serde(default)]
    pub topup: TopupSection,
    #[serde(default)]
    pub eddy: EddySection,

    /// `[stage.<name>]` tables, keyed by the stage name as written.
    #[serde(default)]
    pub stage: BTreeMap<String, StageSection>,
}

/// Validated configuration used by the rest of the crate.
///
/// Built from [`RawConfigFile`] via `TryFrom` (see `validate.rs`), or with
/// `ConfigFile::default()` when no file is present.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub paths: PathsSection,
    pub run: RunSection,
    pub environment: EnvironmentSection,
    pub pipeline: PipelineSection,
    pub lease: LeaseSection,
    pub checkpoint: CheckpointSection,
    pub policy: FailurePolicy,
    pub notify: NotifySection,
    pub gibbs: GibbsSection,
    pub denoise: DenoiseSection,
    pub topup: TopupSection,
    pub eddy: EddySection,
    pub stages: BTreeMap<StageKind, StageSection>,
}

impl ConfigFile {
    /// Per-stage overrides, or an empty section when none were configured.
    pub fn stage(&self, kind: StageKind) -> StageSection {
        self.stages.get(&kind).cloned().unwrap_or_default()
    }
}

/// `[paths]`: where data lives.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    /// Raw BIDS tree with `<sub>/dwi/` directories.
    #[serde(default = "default_datain")]
    pub datain: PathBuf,

    /// Durable derivatives tree, one directory per subject.
    #[serde(default = "default_dataout")]
    pub dataout: PathBuf,

    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

fn default_datain() -> PathBuf {
    PathBuf::from("rawdata")
}

fn default_dataout() -> PathBuf {
    PathBuf::from("derivatives/dwi")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("tmp")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            datain: default_datain(),
            dataout: default_dataout(),
            workspace_root: default_workspace_root(),
            logs_dir: default_logs_dir(),
        }
    }
}

/// `[run]`: behaviour of one invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    /// Free-form task name, used for the log file name.
    #[serde(default = "default_task")]
    pub task: String,

    #[serde(default = "default_threads")]
    pub threads: u32,

    /// Remove the workspace after each subject.
    #[serde(default = "default_true")]
    pub clean: bool,

    /// Promote outputs to `paths.dataout` and record checkpoints.
    #[serde(default = "default_true")]
    pub copy: bool,

    /// Write the status log file.
    #[serde(default = "default_true")]
    pub log: bool,

    #[serde(default)]
    pub skip_processed: bool,

    /// Stages to run when none are given on the command line.
    #[serde(default)]
    pub stages: Vec<StageKind>,
}

fn default_task() -> String {
    "dwiprep".to_string()
}

fn default_threads() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            task: default_task(),
            threads: default_threads(),
            clean: true,
            copy: true,
            log: true,
            skip_processed: false,
            stages: Vec::new(),
        }
    }
}

/// `[environment]`: container sentinel check.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentSection {
    #[serde(default = "default_true")]
    pub check: bool,

    #[serde(default = "default_marker")]
    pub marker: PathBuf,
}

fn default_marker() -> PathBuf {
    PathBuf::from("/opt/dwiprep.txt")
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            check: true,
            marker: default_marker(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub denoiser: Denoiser,
    #[serde(default)]
    pub gibbs_backend: GibbsBackend,
    #[serde(default)]
    pub eta: EtaMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseSection {
    /// A lease older than this is considered abandoned and is broken.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Owner recorded in the lease file; defaults to `$USER@$HOSTNAME`.
    #[serde(default)]
    pub owner: Option<String>,
}

fn default_ttl_hours() -> u64 {
    48
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            owner: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointSection {
    /// Re-hash marker files against the sidecar record on skip checks.
    #[serde(default)]
    pub verify_digests: bool,
}

/// `[policy]` as written in TOML. Keys are error kind and stage names.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPolicySection {
    #[serde(default)]
    pub default: FailureAction,

    #[serde(default)]
    pub on_error: BTreeMap<String, FailureAction>,

    #[serde(default)]
    pub stage: BTreeMap<String, BTreeMap<String, FailureAction>>,
}

/// Decides whether a failed subject aborts the rest of the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailurePolicy {
    pub default: FailureAction,
    pub on_error: BTreeMap<ErrorKind, FailureAction>,
    pub stages: BTreeMap<StageKind, BTreeMap<ErrorKind, FailureAction>>,
}

impl FailurePolicy {
    /// Stage override, then global override, then the default.
    pub fn decide(&self, stage: StageKind, kind: ErrorKind) -> FailureAction {
        self.stages
            .get(&stage)
            .and_then(|m| m.get(&kind))
            .or_else(|| self.on_error.get(&kind))
            .copied()
            .unwrap_or(self.default)
    }
}

/// `[notify]`: batch notifications through an external command.
///
/// The message is appended to `command` as one shell-quoted argument.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifySection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_notify_command")]
    pub command: String,

    /// File that must exist for notifications to be enabled.
    #[serde(default = "default_notify_requires")]
    pub requires: Option<PathBuf>,
}

fn default_notify_command() -> String {
    "python3 send_telegram.py".to_string()
}

fn default_notify_requires() -> Option<PathBuf> {
    Some(PathBuf::from("send_telegram.py"))
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_notify_command(),
            requires: default_notify_requires(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GibbsSection {
    #[serde(default = "default_expected_raw_files")]
    pub expected_raw_files: usize,

    /// Raw files whose names contain any of these are derived maps, not DWI.
    #[serde(default = "default_exclude_tokens")]
    pub exclude_tokens: Vec<String>,
}

fn default_expected_raw_files() -> usize {
    6
}

fn default_exclude_tokens() -> Vec<String> {
    ["_SBRef_", "_ADC_", "_TRACEW_", "_ColFA_", "_FA_", ".DS_"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for GibbsSection {
    fn default() -> Self {
        Self {
            expected_raw_files: default_expected_raw_files(),
            exclude_tokens: default_exclude_tokens(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DenoiseSection {
    /// b-values assumed for the PA acquisition when it has no `.bval` file.
    #[serde(default = "default_pa_bvals")]
    pub pa_bvals: Vec<f64>,
}

fn default_pa_bvals() -> Vec<f64> {
    vec![5.0; 5]
}

impl Default for DenoiseSection {
    fn default() -> Self {
        Self {
            pa_bvals: default_pa_bvals(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopupSection {
    #[serde(default = "default_b0_threshold")]
    pub b0_threshold: f64,

    /// Leading PA volumes taken as b0 when there is no `_PA.bval`.
    #[serde(default = "default_pa_b0_count")]
    pub pa_b0_count: usize,

    #[serde(default)]
    pub acqparams_order: AcqparamsOrder,

    /// Sign of the phase-encoding vector for AP rows; PA rows get the opposite.
    #[serde(default = "default_ap_polarity")]
    pub ap_polarity: i8,

    #[serde(default = "default_topup_config")]
    pub config_file: String,
}

fn default_b0_threshold() -> f64 {
    50.0
}

fn default_pa_b0_count() -> usize {
    4
}

fn default_ap_polarity() -> i8 {
    1
}

fn default_topup_config() -> String {
    "b02b0.cnf".to_string()
}

impl Default for TopupSection {
    fn default() -> Self {
        Self {
            b0_threshold: default_b0_threshold(),
            pa_b0_count: default_pa_b0_count(),
            acqparams_order: AcqparamsOrder::default(),
            ap_polarity: default_ap_polarity(),
            config_file: default_topup_config(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EddySection {
    #[serde(default = "default_niter")]
    pub niter: u32,

    /// Pass `--verbose` to eddy and eddy_quad.
    #[serde(default)]
    pub verbose: bool,
}

fn default_niter() -> u32 {
    8
}

impl Default for EddySection {
    fn default() -> Self {
        Self {
            niter: default_niter(),
            verbose: false,
        }
    }
}

/// `[stage.<name>]`: per-stage command overrides and QA hooks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StageSection {
    /// Replaces individual default command templates by key.
    #[serde(default)]
    pub commands: BTreeMap<String, String>,

    /// QA commands run before the main tool; failures are warnings.
    #[serde(default)]
    pub qa_before: Vec<String>,

    /// QA commands run after the main tool; failures are warnings.
    #[serde(default)]
    pub qa: Vec<String>,
}
