// src/workspace/mod.rs

//! Per-subject scratch directories under the workspace root.
//!
//! A workspace is `<root>/<subject>/`. It is recreated from scratch for
//! every (subject, stage) run, filled from durable storage, worked on by
//! the external tools, promoted back and finally removed.

pub mod lease;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use globset::{GlobBuilder, GlobMatcher};
use tracing::debug;

use crate::errors::StepError;
use crate::fs::{walk_files, FileSystem};
use crate::subject::SubjectId;

pub use lease::{acquire_lease, LeaseError, LeaseRecord, StaleLease, SubjectLease};

/// A file copied into the workspace before the tools run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInput {
    pub source: PathBuf,
    /// Destination relative to the workspace directory.
    pub name: String,
}

impl StagedInput {
    pub fn new(source: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
        }
    }
}

/// An artifact to promote from the workspace to durable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    /// Exact path relative to the workspace; must exist.
    File(String),
    /// Glob over workspace-relative paths; may match nothing.
    Glob(String),
}

impl OutputSpec {
    pub fn file(name: impl Into<String>) -> Self {
        OutputSpec::File(name.into())
    }

    pub fn glob(pattern: impl Into<String>) -> Self {
        OutputSpec::Glob(pattern.into())
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("invalid output pattern: {pattern}"))?;
    Ok(glob.compile_matcher())
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    fs: Arc<dyn FileSystem>,
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(fs: Arc<dyn FileSystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, subject: &SubjectId) -> PathBuf {
        self.root.join(subject.as_str())
    }

    pub fn ensure_root(&self) -> Result<()> {
        self.fs.create_dir_all(&self.root)
    }

    /// Take the subject's lease under this root.
    pub fn lease(
        &self,
        subject: &SubjectId,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> std::result::Result<(SubjectLease, Option<StaleLease>), LeaseError> {
        acquire_lease(self.fs.clone(), &self.root, subject, owner, ttl, now)
    }

    /// Recreate an empty workspace for `subject` with the given subdirectories.
    pub fn acquire(&self, subject: &SubjectId, subdirs: &[String]) -> Result<PathBuf> {
        let dir = self.dir(subject);
        if self.fs.exists(&dir) {
            debug!(subject = %subject, dir = %dir.display(), "removing stale workspace");
            self.fs
                .remove_dir_all(&dir)
                .with_context(|| format!("removing stale workspace {:?}", dir))?;
        }
        self.fs.create_dir_all(&dir)?;
        for sub in subdirs {
            self.fs.create_dir_all(&dir.join(sub))?;
        }
        Ok(dir)
    }

    /// Copy every input into the workspace. The first failure aborts.
    pub fn stage_inputs(
        &self,
        subject: &SubjectId,
        inputs: &[StagedInput],
    ) -> std::result::Result<(), StepError> {
        let dir = self.dir(subject);
        for input in inputs {
            let dest = dir.join(&input.name);
            self.fs.copy(&input.source, &dest).map_err(|e| {
                StepError::copy(
                    "stage_inputs",
                    format!("{} -> {}: {e:#}", input.source.display(), dest.display()),
                )
            })?;
            debug!(subject = %subject, file = %input.name, "staged input");
        }
        Ok(())
    }

    /// Copy workspace artifacts to `dest`, keeping relative paths.
    ///
    /// Returns the promoted paths relative to the workspace, in promotion
    /// order.
    pub fn promote_outputs(
        &self,
        subject: &SubjectId,
        outputs: &[OutputSpec],
        dest: &Path,
    ) -> std::result::Result<Vec<String>, StepError> {
        let dir = self.dir(subject);
        let mut promoted = Vec::new();

        // Listed once; globs are matched against this snapshot.
        let mut files: Option<Vec<String>> = None;

        for output in outputs {
            match output {
                OutputSpec::File(name) => {
                    let src = dir.join(name);
                    if !self.fs.is_file(&src) {
                        return Err(StepError::copy(
                            "promote_outputs",
                            format!("missing output {}", src.display()),
                        ));
                    }
                    self.copy_out(&src, &dest.join(name))?;
                    promoted.push(name.clone());
                }
                OutputSpec::Glob(pattern) => {
                    let matcher = compile_glob(pattern)
                        .map_err(|e| StepError::copy("promote_outputs", format!("{e:#}")))?;
                    if files.is_none() {
                        files = Some(self.relative_files(&dir)?);
                    }
                    for rel in files.iter().flatten() {
                        if matcher.is_match(rel) && !promoted.contains(rel) {
                            self.copy_out(&dir.join(rel), &dest.join(rel))?;
                            promoted.push(rel.clone());
                        }
                    }
                }
            }
        }

        Ok(promoted)
    }

    /// Remove the workspace unless `keep`. Returns whether anything was removed.
    pub fn release(&self, subject: &SubjectId, keep: bool) -> Result<bool> {
        if keep {
            return Ok(false);
        }
        let dir = self.dir(subject);
        if !self.fs.exists(&dir) {
            return Ok(false);
        }
        self.fs
            .remove_dir_all(&dir)
            .with_context(|| format!("removing workspace {:?}", dir))?;
        Ok(true)
    }

    fn copy_out(&self, src: &Path, dest: &Path) -> std::result::Result<(), StepError> {
        self.fs.copy(src, dest).map(|_| ()).map_err(|e| {
            StepError::copy(
                "promote_outputs",
                format!("{} -> {}: {e:#}", src.display(), dest.display()),
            )
        })
    }

    fn relative_files(&self, dir: &Path) -> std::result::Result<Vec<String>, StepError> {
        let mut out: Vec<String> = walk_files(self.fs.as_ref(), dir)
            .map_err(|e| StepError::workspace("promote_outputs", format!("{e:#}")))?
            .into_iter()
            .filter_map(|p| {
                p.strip_prefix(dir)
                    .ok()
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::fs::mock::MockFileSystem;

    fn manager(fs: &Arc<MockFileSystem>) -> WorkspaceManager {
        WorkspaceManager::new(fs.clone(), "tmp")
    }

    #[test]
    fn acquire_replaces_stale_contents() {
        let fs = Arc::new(MockFileSystem::new());
        fs.add_file("tmp/sub-1/leftover.nii.gz", b"old");
        let ws = manager(&fs);

        let dir = ws
            .acquire(&SubjectId::new("1"), &["imgs/gibbs".to_string()])
            .unwrap();
        assert_eq!(dir, PathBuf::from("tmp/sub-1"));
        assert!(!fs.exists(Path::new("tmp/sub-1/leftover.nii.gz")));
        assert!(fs.is_dir(Path::new("tmp/sub-1/imgs/gibbs")));
    }

    #[test]
    fn stage_inputs_fails_on_first_missing_source() {
        let fs = Arc::new(MockFileSystem::new());
        fs.add_file("out/sub-1/sub-1_AP.bval", b"0 1000");
        let ws = manager(&fs);
        let sub = SubjectId::new("1");
        ws.acquire(&sub, &[]).unwrap();

        let err = ws
            .stage_inputs(
                &sub,
                &[
                    StagedInput::new("out/sub-1/sub-1_AP.bval", "sub-1_AP.bval"),
                    StagedInput::new("out/sub-1/sub-1_AP.bvec", "sub-1_AP.bvec"),
                ],
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Copy);
        assert!(fs.is_file(Path::new("tmp/sub-1/sub-1_AP.bval")));
    }

    #[test]
    fn promote_copies_files_and_globs_with_structure() {
        let fs = Arc::new(MockFileSystem::new());
        let ws = manager(&fs);
        let sub = SubjectId::new("1");
        ws.acquire(&sub, &[]).unwrap();
        fs.add_file("tmp/sub-1/sub-1_AP_gib.nii.gz", b"a");
        fs.add_file("tmp/sub-1/imgs/gibbs/ap.png", b"b");
        fs.add_file("tmp/sub-1/scratch.txt", b"c");

        let promoted = ws
            .promote_outputs(
                &sub,
                &[
                    OutputSpec::file("sub-1_AP_gib.nii.gz"),
                    OutputSpec::glob("imgs/gibbs/**"),
                ],
                Path::new("out/sub-1"),
            )
            .unwrap();

        assert_eq!(promoted, vec!["sub-1_AP_gib.nii.gz", "imgs/gibbs/ap.png"]);
        assert!(fs.is_file(Path::new("out/sub-1/imgs/gibbs/ap.png")));
        assert!(!fs.exists(Path::new("out/sub-1/scratch.txt")));
    }

    #[test]
    fn glob_star_does_not_cross_directories() {
        let fs = Arc::new(MockFileSystem::new());
        let ws = manager(&fs);
        let sub = SubjectId::new("1");
        ws.acquire(&sub, &[]).unwrap();
        fs.add_file("tmp/sub-1/sub-1_dwi.eddy_rms", b"a");
        fs.add_file("tmp/sub-1/eddyqc/sub-1_dwi.eddy_x", b"b");

        let promoted = ws
            .promote_outputs(&sub, &[OutputSpec::glob("sub-1_dwi.eddy_*")], Path::new("out/sub-1"))
            .unwrap();
        assert_eq!(promoted, vec!["sub-1_dwi.eddy_rms"]);
    }

    #[test]
    fn missing_exact_output_is_copy_failure() {
        let fs = Arc::new(MockFileSystem::new());
        let ws = manager(&fs);
        let sub = SubjectId::new("1");
        ws.acquire(&sub, &[]).unwrap();

        let err = ws
            .promote_outputs(&sub, &[OutputSpec::file("sub-1_dwi.nii.gz")], Path::new("out/sub-1"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Copy);
    }

    #[test]
    fn release_honours_keep() {
        let fs = Arc::new(MockFileSystem::new());
        let ws = manager(&fs);
        let sub = SubjectId::new("1");
        ws.acquire(&sub, &[]).unwrap();

        assert!(!ws.release(&sub, true).unwrap());
        assert!(fs.is_dir(Path::new("tmp/sub-1")));
        assert!(ws.release(&sub, false).unwrap());
        assert!(!fs.exists(Path::new("tmp/sub-1")));
    }
}
