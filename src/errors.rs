// src/errors.rs

//! Crate-wide error types.
//!
//! Three layers: [`StartupError`] aborts the process before any subject is
//! touched, [`StepError`] describes one failed sub-step of one subject and is
//! contained by the orchestrator, and [`DwiprepError`] is everything else.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DwiprepError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DwiprepError>;

/// Preconditions checked once before any stage runs. Each one is fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    #[error("mode not recognised: {0:?} (expected s|sub, l|list or a|all)")]
    ModeNotRecognised(String),

    #[error("mode {0} needs an --input value")]
    InputMissing(String),

    #[error("subject list not found: {}", .0.display())]
    ListNotFound(PathBuf),

    #[error("subject list unreadable: {}: {reason}", .path.display())]
    ListUnreadable { path: PathBuf, reason: String },

    #[error("invalid subject id {0:?}: the label must be non-empty and use only letters, digits, '.', '_' or '-'")]
    InvalidSubject(String),

    #[error("subject list is empty: {}", .0.display())]
    EmptyList(PathBuf),

    #[error("input directory missing: {}", .0.display())]
    DirectoryMissing(PathBuf),

    #[error("no subjects found in {}", .0.display())]
    NoSubjects(PathBuf),

    #[error("environment marker missing: {} (not running inside the dwiprep container?)", .0.display())]
    EnvironmentMarkerMissing(PathBuf),

    #[error("workspace root {} could not be created: {reason}", .path.display())]
    WorkspaceRoot { path: PathBuf, reason: String },
}

/// Classification of a per-subject failure; the failure policy is keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotReady,
    Input,
    Copy,
    Tool,
    MissingOutput,
    Workspace,
    Lease,
    Checkpoint,
    Cleanup,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::NotReady => "not_ready",
            ErrorKind::Input => "input",
            ErrorKind::Copy => "copy",
            ErrorKind::Tool => "tool",
            ErrorKind::MissingOutput => "missing_output",
            ErrorKind::Workspace => "workspace",
            ErrorKind::Lease => "lease",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::Cleanup => "cleanup",
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "not_ready" => Ok(ErrorKind::NotReady),
            "input" => Ok(ErrorKind::Input),
            "copy" => Ok(ErrorKind::Copy),
            "tool" => Ok(ErrorKind::Tool),
            "missing_output" => Ok(ErrorKind::MissingOutput),
            "workspace" => Ok(ErrorKind::Workspace),
            "lease" => Ok(ErrorKind::Lease),
            "checkpoint" => Ok(ErrorKind::Checkpoint),
            "cleanup" => Ok(ErrorKind::Cleanup),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One failed sub-step of one (subject, stage) pair.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{kind}] {step}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub step: String,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn not_ready(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotReady, step, message)
    }

    pub fn input(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Input, step, message)
    }

    pub fn copy(step: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Copy, step, err.to_string())
    }

    pub fn tool(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tool, step, message)
    }

    pub fn missing_output(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingOutput, step, message)
    }

    pub fn workspace(step: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Workspace, step, err.to_string())
    }

    pub fn checkpoint(step: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Checkpoint, step, err.to_string())
    }

    pub fn is_not_ready(&self) -> bool {
        self.kind == ErrorKind::NotReady
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_display_names_kind_and_step() {
        let err = StepError::copy("stage_inputs", "disk full");
        assert_eq!(err.to_string(), "[copy] stage_inputs: disk full");
    }

    #[test]
    fn startup_error_mentions_path() {
        let err = StartupError::ListNotFound(PathBuf::from("lists/batch1.csv"));
        assert!(err.to_string().contains("lists/batch1.csv"));
    }
}
