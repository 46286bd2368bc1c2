// src/status_log.rs

//! Per-run audit log.
//!
//! One tab-separated file per run under `logs_dir`, named
//! `<YYYYmmddHHMMSS>_<slug>.log`, plus a `_subjects.log` companion holding
//! the resolved subject list. Lines are only ever appended. Every record is
//! mirrored to `tracing`, so a disabled log still shows up on stderr.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime};
use tracing::{error, info, warn};

use crate::fs::FileSystem;
use crate::subject::SubjectId;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Subject column used for batch-level records.
pub const ALL: &str = "ALL";
/// Subject column used for startup records.
pub const INIT: &str = "INIT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Ok,
    Error,
    Warning,
    Info,
    SubStart,
    SubEnd,
    TaskEnd,
    /// Log open/close markers.
    Na,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Ok => "OK",
            LogStatus::Error => "ERROR",
            LogStatus::Warning => "WARNING",
            LogStatus::Info => "INFO",
            LogStatus::SubStart => "SUBSTART",
            LogStatus::SubEnd => "SUBEND",
            LogStatus::TaskEnd => "TASKEND",
            LogStatus::Na => "NA",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "OK" => Ok(LogStatus::Ok),
            "ERROR" => Ok(LogStatus::Error),
            "WARNING" => Ok(LogStatus::Warning),
            "INFO" => Ok(LogStatus::Info),
            "SUBSTART" => Ok(LogStatus::SubStart),
            "SUBEND" => Ok(LogStatus::SubEnd),
            "TASKEND" => Ok(LogStatus::TaskEnd),
            "NA" => Ok(LogStatus::Na),
            other => Err(format!("unknown log status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub subject: String,
    pub status: LogStatus,
    pub message: String,
}

impl LogRecord {
    pub fn to_line(&self) -> String {
        let message: String = self
            .message
            .chars()
            .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        format!(
            "{}\t{}\t{}\t{}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.subject,
            self.status,
            message
        )
    }

    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(4, '\t');
        let timestamp = NaiveDateTime::parse_from_str(parts.next()?, TIMESTAMP_FORMAT).ok()?;
        let subject = parts.next()?.to_string();
        let status = parts.next()?.parse().ok()?;
        let message = parts.next().unwrap_or_default().to_string();
        Some(Self {
            timestamp,
            subject,
            status,
            message,
        })
    }
}

/// Lower-cased task name without spaces, cut to 10 characters.
pub fn task_slug(task: &str) -> String {
    task.chars()
        .filter(|c| *c != ' ')
        .flat_map(char::to_lowercase)
        .take(10)
        .collect()
}

/// `H:MM:SS` rendering of an elapsed duration.
pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[derive(Debug)]
struct LogFiles {
    fs: Arc<dyn FileSystem>,
    log: PathBuf,
    subjects: PathBuf,
}

#[derive(Debug)]
pub struct StatusLog {
    files: Option<LogFiles>,
    subject_starts: Mutex<HashMap<String, Instant>>,
    task_start: Mutex<Option<Instant>>,
}

impl StatusLog {
    /// Create the log file for a run started at `now`.
    ///
    /// If a log with the same name already exists (two runs in the same
    /// second), a `_<n>` suffix is added rather than appending to it.
    pub fn start(
        fs: Arc<dyn FileSystem>,
        logs_dir: &Path,
        task: &str,
        now: DateTime<Local>,
    ) -> Result<Self> {
        fs.create_dir_all(logs_dir)
            .with_context(|| format!("creating log directory {:?}", logs_dir))?;

        let stem = format!("{}_{}", now.format("%Y%m%d%H%M%S"), task_slug(task));
        let opening = LogRecord {
            timestamp: now.naive_local(),
            subject: ALL.to_string(),
            status: LogStatus::Na,
            message: "StatusLog initialised.".to_string(),
        };
        let first_line = format!("{}\n", opening.to_line());

        let mut n = 0u32;
        let chosen = loop {
            let candidate = if n == 0 {
                stem.clone()
            } else {
                format!("{stem}_{n}")
            };
            let path = logs_dir.join(format!("{candidate}.log"));
            if fs.write_new(&path, first_line.as_bytes())? {
                break candidate;
            }
            n += 1;
        };

        let log = logs_dir.join(format!("{chosen}.log"));
        info!(path = %log.display(), "status log opened");

        Ok(Self {
            files: Some(LogFiles {
                subjects: logs_dir.join(format!("{chosen}_subjects.log")),
                log,
                fs,
            }),
            subject_starts: Mutex::new(HashMap::new()),
            task_start: Mutex::new(None),
        })
    }

    /// A log that only mirrors to `tracing` (`run.log = false`).
    pub fn disabled() -> Self {
        Self {
            files: None,
            subject_starts: Mutex::new(HashMap::new()),
            task_start: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.files.as_ref().map(|f| f.log.as_path())
    }

    pub fn subjects_path(&self) -> Option<&Path> {
        self.files.as_ref().map(|f| f.subjects.as_path())
    }

    pub fn record(&self, subject: &str, status: LogStatus, message: impl Into<String>) {
        let record = LogRecord {
            timestamp: Local::now().naive_local(),
            subject: subject.to_string(),
            status,
            message: message.into(),
        };

        match status {
            LogStatus::Error => error!(subject = %record.subject, "{}", record.message),
            LogStatus::Warning => warn!(subject = %record.subject, "{}", record.message),
            _ => info!(subject = %record.subject, status = %status, "{}", record.message),
        }

        if let Some(files) = &self.files {
            let line = format!("{}\n", record.to_line());
            if let Err(err) = files.fs.append(&files.log, line.as_bytes()) {
                warn!(path = %files.log.display(), error = %err, "failed to append to status log");
            }
        }
    }

    pub fn ok(&self, subject: &str, message: impl Into<String>) {
        self.record(subject, LogStatus::Ok, message);
    }

    pub fn error(&self, subject: &str, message: impl Into<String>) {
        self.record(subject, LogStatus::Error, message);
    }

    pub fn warning(&self, subject: &str, message: impl Into<String>) {
        self.record(subject, LogStatus::Warning, message);
    }

    pub fn info(&self, subject: &str, message: impl Into<String>) {
        self.record(subject, LogStatus::Info, message);
    }

    pub fn subject_start(&self, subject: &str, stage: &str) {
        if let Ok(mut starts) = self.subject_starts.lock() {
            starts.insert(subject.to_string(), Instant::now());
        }
        self.record(subject, LogStatus::SubStart, format!("{stage}: Subject started"));
    }

    /// Returns the time since the matching `subject_start`.
    pub fn subject_end(&self, subject: &str, stage: &str) -> Duration {
        let elapsed = self
            .subject_starts
            .lock()
            .ok()
            .and_then(|mut starts| starts.remove(subject))
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.record(
            subject,
            LogStatus::SubEnd,
            format!("{stage}: Subject ended, duration: {}", format_elapsed(elapsed)),
        );
        elapsed
    }

    pub fn task_start(&self) {
        if let Ok(mut start) = self.task_start.lock() {
            *start = Some(Instant::now());
        }
    }

    pub fn task_end(&self, stage: &str) -> Duration {
        let elapsed = self
            .task_start
            .lock()
            .ok()
            .and_then(|mut start| start.take())
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.record(
            ALL,
            LogStatus::TaskEnd,
            format!("{stage}: {}", format_elapsed(elapsed)),
        );
        elapsed
    }

    /// Overwrite the companion file with the subject list, one id per line.
    pub fn dump_subjects(&self, subjects: &[SubjectId]) -> Result<()> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        let mut body = String::new();
        for s in subjects {
            body.push_str(s.as_str());
            body.push('\n');
        }
        files.fs.write(&files.subjects, body.as_bytes())
    }

    pub fn close(&self) {
        self.record(ALL, LogStatus::Na, "StatusLog closed.");
    }
}

/// Parse every well-formed line of a status log file.
pub fn read_records(fs: &dyn FileSystem, path: &Path) -> Result<Vec<LogRecord>> {
    let contents = fs.read_to_string(path)?;
    Ok(contents.lines().filter_map(LogRecord::parse).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 5, 14, 7, 9)
            .single()
            .expect("valid local time")
    }

    #[test]
    fn slug_strips_spaces_and_truncates() {
        assert_eq!(task_slug("Gibbs Batch Number 1"), "gibbsbatch");
        assert_eq!(task_slug("eddy"), "eddy");
    }

    #[test]
    fn start_names_file_after_timestamp_and_slug() {
        let fs = Arc::new(MockFileSystem::new());
        let log = StatusLog::start(fs.clone(), Path::new("logs"), "Topup 2", fixed_now()).unwrap();

        assert_eq!(log.path(), Some(Path::new("logs/20240305140709_topup2.log")));
        assert_eq!(
            log.subjects_path(),
            Some(Path::new("logs/20240305140709_topup2_subjects.log"))
        );

        let records = read_records(fs.as_ref(), log.path().unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, LogStatus::Na);
        assert_eq!(records[0].subject, ALL);
    }

    #[test]
    fn start_never_reuses_an_existing_file() {
        let fs = Arc::new(MockFileSystem::new());
        let first = StatusLog::start(fs.clone(), Path::new("logs"), "eddy", fixed_now()).unwrap();
        let second = StatusLog::start(fs.clone(), Path::new("logs"), "eddy", fixed_now()).unwrap();
        assert_ne!(first.path(), second.path());
        assert_eq!(second.path(), Some(Path::new("logs/20240305140709_eddy_1.log")));
    }

    #[test]
    fn records_are_tab_separated_and_sanitised() {
        let fs = Arc::new(MockFileSystem::new());
        let log = StatusLog::start(fs.clone(), Path::new("logs"), "gibbs", fixed_now()).unwrap();
        log.error("sub-1", "copy failed:\tdisk\nfull");
        log.subject_start("sub-2", "gibbs");
        log.subject_end("sub-2", "gibbs");

        let records = read_records(fs.as_ref(), log.path().unwrap()).unwrap();
        let statuses: Vec<_> = records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![LogStatus::Na, LogStatus::Error, LogStatus::SubStart, LogStatus::SubEnd]
        );
        assert_eq!(records[1].message, "copy failed: disk full");
        assert!(records[3].message.starts_with("gibbs: Subject ended, duration: 0:00:0"));
    }

    #[test]
    fn dump_subjects_writes_one_id_per_line() {
        let fs = Arc::new(MockFileSystem::new());
        let log = StatusLog::start(fs.clone(), Path::new("logs"), "gibbs", fixed_now()).unwrap();
        log.dump_subjects(&[SubjectId::new("1"), SubjectId::new("sub-2")]).unwrap();

        let body = fs.read_to_string(log.subjects_path().unwrap()).unwrap();
        assert_eq!(body, "sub-1\nsub-2\n");
    }

    #[test]
    fn format_elapsed_pads_minutes_and_seconds() {
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "1:02:03");
        assert_eq!(format_elapsed(Duration::from_millis(999)), "0:00:00");
    }
}
