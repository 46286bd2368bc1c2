use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the subject list for a run is obtained.
///
/// - `Single`: one id given on the command line.
/// - `List`: a text file with one id per line.
/// - `All`: every `sub-*` directory below the input data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Single,
    List,
    All,
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Single => "single",
            RunMode::List => "list",
            RunMode::All => "all",
        }
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s" | "sub" | "single" => Ok(RunMode::Single),
            "l" | "list" => Ok(RunMode::List),
            "a" | "all" => Ok(RunMode::All),
            other => Err(format!(
                "invalid mode: {other} (expected s|sub, l|list or a|all)"
            )),
        }
    }
}

/// Pipeline stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Gibbs,
    Mppca,
    Patch2self,
    Topup,
    Eddy,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Gibbs,
        StageKind::Mppca,
        StageKind::Patch2self,
        StageKind::Topup,
        StageKind::Eddy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Gibbs => "gibbs",
            StageKind::Mppca => "mppca",
            StageKind::Patch2self => "patch2self",
            StageKind::Topup => "topup",
            StageKind::Eddy => "eddy",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gibbs" => Ok(StageKind::Gibbs),
            "mppca" => Ok(StageKind::Mppca),
            "patch2self" | "p2s" => Ok(StageKind::Patch2self),
            "topup" => Ok(StageKind::Topup),
            "eddy" => Ok(StageKind::Eddy),
            other => Err(format!(
                "invalid stage: {other} (expected gibbs, mppca, patch2self, topup or eddy)"
            )),
        }
    }
}

/// Which denoised volumes feed topup and eddy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Denoiser {
    Mppca,
    Patch2self,
}

impl Default for Denoiser {
    fn default() -> Self {
        Denoiser::Mppca
    }
}

impl Denoiser {
    /// File-name suffix appended after `<sub>_<DIR>`.
    pub fn suffix(&self) -> &'static str {
        match self {
            Denoiser::Mppca => "_gib_mppca",
            Denoiser::Patch2self => "_gib_p2s",
        }
    }

    pub fn stage(&self) -> StageKind {
        match self {
            Denoiser::Mppca => StageKind::Mppca,
            Denoiser::Patch2self => StageKind::Patch2self,
        }
    }
}

impl FromStr for Denoiser {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mppca" => Ok(Denoiser::Mppca),
            "patch2self" | "p2s" => Ok(Denoiser::Patch2self),
            other => Err(format!(
                "invalid denoiser: {other} (expected \"mppca\" or \"patch2self\")"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GibbsBackend {
    Mrtrix3,
    Dipy,
}

impl Default for GibbsBackend {
    fn default() -> Self {
        GibbsBackend::Mrtrix3
    }
}

impl FromStr for GibbsBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mrtrix3" | "mrtrix" => Ok(GibbsBackend::Mrtrix3),
            "dipy" => Ok(GibbsBackend::Dipy),
            other => Err(format!(
                "invalid gibbs backend: {other} (expected \"mrtrix3\" or \"dipy\")"
            )),
        }
    }
}

/// Row order of the acquisition parameter file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcqparamsOrder {
    ApFirst,
    PaFirst,
}

impl Default for AcqparamsOrder {
    fn default() -> Self {
        AcqparamsOrder::ApFirst
    }
}

impl FromStr for AcqparamsOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ap-first" => Ok(AcqparamsOrder::ApFirst),
            "pa-first" => Ok(AcqparamsOrder::PaFirst),
            other => Err(format!(
                "invalid acqparams order: {other} (expected \"ap-first\" or \"pa-first\")"
            )),
        }
    }
}

/// What the orchestrator does with the rest of the batch after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    Continue,
    Abort,
}

impl Default for FailureAction {
    fn default() -> Self {
        FailureAction::Continue
    }
}

/// Aggregate used to estimate the remaining time from past subject durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EtaMode {
    Mean,
    Median,
}

impl Default for EtaMode {
    fn default() -> Self {
        EtaMode::Median
    }
}

/// Phase-encoding direction of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseDir {
    Ap,
    Pa,
}

impl PhaseDir {
    pub const BOTH: [PhaseDir; 2] = [PhaseDir::Ap, PhaseDir::Pa];

    pub fn tag(&self) -> &'static str {
        match self {
            PhaseDir::Ap => "AP",
            PhaseDir::Pa => "PA",
        }
    }
}
