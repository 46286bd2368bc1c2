// src/subject.rs

//! Subject identifiers and resolution of the run's subject list.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::errors::StartupError;
use crate::fs::FileSystem;
use crate::types::RunMode;

pub const SUBJECT_PREFIX: &str = "sub-";

/// A subject id in canonical `sub-<label>` form.
///
/// The label is a single path component made of ASCII letters, digits, `.`,
/// `_` and `-`, so the id can be joined onto the workspace root and the
/// output tree without escaping either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(String);

fn valid_label(label: &str) -> bool {
    !label.is_empty()
        && !label.chars().all(|c| c == '.')
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl SubjectId {
    /// Normalize `raw`, returning the id and whether the prefix was added.
    pub fn normalize(raw: &str) -> Result<(Self, bool), StartupError> {
        let raw = raw.trim();
        let (label, fixed) = match raw.strip_prefix(SUBJECT_PREFIX) {
            Some(label) => (label, false),
            None => (raw, true),
        };
        if !valid_label(label) {
            return Err(StartupError::InvalidSubject(raw.to_string()));
        }
        Ok((SubjectId(format!("{SUBJECT_PREFIX}{label}")), fixed))
    }

    /// Unchecked constructor for ids written in code. External input goes
    /// through [`SubjectId::normalize`].
    pub fn new(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with(SUBJECT_PREFIX) {
            SubjectId(raw.to_string())
        } else {
            SubjectId(format!("{SUBJECT_PREFIX}{raw}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for SubjectId {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

/// Outcome of input resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub subjects: Vec<SubjectId>,
    /// Raw ids that lacked the `sub-` prefix, as given.
    pub normalized: Vec<String>,
    /// Raw ids dropped because an earlier entry named the same subject.
    pub duplicates: Vec<String>,
}

impl Resolution {
    fn push(&mut self, raw: &str) -> Result<(), StartupError> {
        let (id, fixed) = SubjectId::normalize(raw)?;
        if self.subjects.contains(&id) {
            self.duplicates.push(raw.trim().to_string());
            return Ok(());
        }
        if fixed {
            self.normalized.push(raw.trim().to_string());
        }
        self.subjects.push(id);
        Ok(())
    }
}

/// Resolve the subject list for `mode`.
///
/// `input` is the subject id (single mode) or the list file path (list
/// mode); all mode scans `datain` and ignores `input`.
pub fn resolve_subjects(
    fs: &dyn FileSystem,
    mode: RunMode,
    input: Option<&str>,
    datain: &Path,
) -> Result<Resolution, StartupError> {
    let mut resolution = Resolution::default();

    match mode {
        RunMode::Single => {
            let raw = input
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| StartupError::InputMissing(mode.name().to_string()))?;
            resolution.push(raw)?;
        }
        RunMode::List => {
            let raw = input
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| StartupError::InputMissing(mode.name().to_string()))?;
            let path = PathBuf::from(raw);
            for line in read_list(fs, &path)? {
                resolution.push(&line)?;
            }
            if resolution.subjects.is_empty() {
                return Err(StartupError::EmptyList(path));
            }
        }
        RunMode::All => {
            if !fs.is_dir(datain) {
                return Err(StartupError::DirectoryMissing(datain.to_path_buf()));
            }
            let found = scan_subject_dirs(fs, datain).map_err(|e| StartupError::ListUnreadable {
                path: datain.to_path_buf(),
                reason: e.to_string(),
            })?;
            if found.is_empty() {
                return Err(StartupError::NoSubjects(datain.to_path_buf()));
            }
            resolution.subjects = found;
        }
    }

    Ok(resolution)
}

/// Non-blank, trimmed lines of a subject list file, in file order.
pub fn read_list(fs: &dyn FileSystem, path: &Path) -> Result<Vec<String>, StartupError> {
    if !fs.is_file(path) {
        return Err(StartupError::ListNotFound(path.to_path_buf()));
    }
    let contents = fs
        .read_to_string(path)
        .map_err(|e| StartupError::ListUnreadable {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        })?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Directories directly under `dir` whose name is a valid `sub-` id, in
/// listing order.
pub fn scan_subject_dirs(fs: &dyn FileSystem, dir: &Path) -> anyhow::Result<Vec<SubjectId>> {
    let mut out = Vec::new();
    for path in fs.read_dir(dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(SUBJECT_PREFIX) || !fs.is_dir(&path) {
            continue;
        }
        match SubjectId::normalize(name) {
            Ok((id, _)) => out.push(id),
            Err(err) => warn!(path = %path.display(), "skipping directory: {err}"),
        }
    }
    Ok(out)
}
