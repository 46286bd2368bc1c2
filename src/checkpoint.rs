// src/checkpoint.rs

//! Per-(subject, stage) completion tracking in durable storage.
//!
//! Completion is primarily the presence of non-empty marker files in
//! `<dataout>/<sub>/`. A JSON sidecar at `<dataout>/<sub>/.dwiprep/<stage>.json`
//! carries the explicit state and, once done, the marker digests. Subjects
//! processed before sidecars existed have markers but no sidecar; they count
//! as complete.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fs::FileSystem;
use crate::subject::SubjectId;
use crate::types::StageKind;

/// Directory (under the subject's durable dir) holding sidecar records.
pub const SIDECAR_DIR: &str = ".dwiprep";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Pending,
    InProgress,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDigest {
    /// Path relative to the subject's durable directory.
    pub path: String,
    pub size: u64,
    pub blake3: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub subject: String,
    pub stage: StageKind,
    pub state: CheckpointState,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactDigest>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    fs: Arc<dyn FileSystem>,
    dataout: PathBuf,
    verify_digests: bool,
}

/// Hash a file through the filesystem abstraction.
pub fn digest_file(fs: &dyn FileSystem, path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut reader = fs.open_read(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading {:?} for hashing", path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

impl CheckpointStore {
    pub fn new(fs: Arc<dyn FileSystem>, dataout: impl Into<PathBuf>, verify_digests: bool) -> Self {
        Self {
            fs,
            dataout: dataout.into(),
            verify_digests,
        }
    }

    pub fn subject_dir(&self, subject: &SubjectId) -> PathBuf {
        self.dataout.join(subject.as_str())
    }

    pub fn sidecar_path(&self, subject: &SubjectId, stage: StageKind) -> PathBuf {
        self.subject_dir(subject)
            .join(SIDECAR_DIR)
            .join(format!("{}.json", stage.name()))
    }

    pub fn read_record(
        &self,
        subject: &SubjectId,
        stage: StageKind,
    ) -> Result<Option<CheckpointRecord>> {
        let path = self.sidecar_path(subject, stage);
        if !self.fs.is_file(&path) {
            return Ok(None);
        }
        let text = self.fs.read_to_string(&path)?;
        let record = serde_json::from_str(&text)
            .with_context(|| format!("parsing checkpoint record {:?}", path))?;
        Ok(Some(record))
    }

    /// Whether `stage` can be skipped for `subject`.
    ///
    /// `markers` are file names relative to the subject's durable directory.
    pub fn is_complete(&self, subject: &SubjectId, stage: StageKind, markers: &[String]) -> bool {
        if markers.is_empty() {
            return false;
        }

        let dir = self.subject_dir(subject);
        for marker in markers {
            let path = dir.join(marker);
            let non_empty = self.fs.is_file(&path)
                && self.fs.file_size(&path).map(|n| n > 0).unwrap_or(false);
            if !non_empty {
                debug!(subject = %subject, stage = %stage, marker = %marker, "marker missing or empty");
                return false;
            }
        }

        let record = match self.read_record(subject, stage) {
            Ok(Some(record)) => record,
            Ok(None) => return true,
            Err(err) => {
                warn!(subject = %subject, stage = %stage, error = %err, "unreadable checkpoint record");
                return false;
            }
        };

        if record.state != CheckpointState::Done {
            return false;
        }

        if self.verify_digests {
            for artifact in &record.artifacts {
                let path = dir.join(&artifact.path);
                match digest_file(self.fs.as_ref(), &path) {
                    Ok(hash) if hash == artifact.blake3 => {}
                    Ok(_) => {
                        warn!(subject = %subject, stage = %stage, path = %artifact.path, "digest mismatch");
                        return false;
                    }
                    Err(err) => {
                        warn!(subject = %subject, stage = %stage, error = %err, "cannot hash artifact");
                        return false;
                    }
                }
            }
        }

        true
    }

    pub fn mark(
        &self,
        subject: &SubjectId,
        stage: StageKind,
        state: CheckpointState,
        detail: Option<String>,
    ) -> Result<()> {
        let record = CheckpointRecord {
            subject: subject.to_string(),
            stage,
            state,
            updated_at: Utc::now(),
            detail,
            artifacts: Vec::new(),
        };
        self.write_record(&self.sidecar_path(subject, stage), &record)
    }

    /// Record `done` together with the size and digest of every marker.
    pub fn mark_done(&self, subject: &SubjectId, stage: StageKind, markers: &[String]) -> Result<()> {
        let dir = self.subject_dir(subject);
        let mut artifacts = Vec::with_capacity(markers.len());
        for marker in markers {
            let path = dir.join(marker);
            artifacts.push(ArtifactDigest {
                path: marker.clone(),
                size: self.fs.file_size(&path)?,
                blake3: digest_file(self.fs.as_ref(), &path)?,
            });
        }

        let record = CheckpointRecord {
            subject: subject.to_string(),
            stage,
            state: CheckpointState::Done,
            updated_at: Utc::now(),
            detail: None,
            artifacts,
        };
        self.write_record(&self.sidecar_path(subject, stage), &record)
    }

    /// Write to a temp file next to `path`, then rename over it.
    fn write_record(&self, path: &Path, record: &CheckpointRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("checkpoint");
        let tmp = path.with_file_name(format!(
            ".{}.tmp.{}.{}",
            name,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        self.fs.write(&tmp, &bytes)?;
        self.fs.rename(&tmp, path)?;
        Ok(())
    }
}
