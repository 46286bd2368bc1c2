// src/workspace/lease.rs

//! Per-subject lease files under `<workspace_root>/.leases/`.
//!
//! A lease is created with exclusive-create semantics and removed when its
//! guard is dropped. Stale leases are broken by renaming them aside, which
//! only one process can do. Two processes working from overlapping subject
//! lists therefore never share a workspace directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fs::FileSystem;
use crate::subject::SubjectId;

pub const LEASE_DIR: &str = ".leases";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub owner: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A lease that was found on disk and broken during acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleLease {
    Expired(LeaseRecord),
    Unreadable(String),
}

impl fmt::Display for StaleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleLease::Expired(rec) => write!(
                f,
                "expired lease held by {} (pid {}) since {}",
                rec.owner,
                rec.pid,
                rec.acquired_at.to_rfc3339()
            ),
            StaleLease::Unreadable(reason) => write!(f, "unreadable lease ({reason})"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("subject {subject} is leased by {} (pid {}) until {}", .holder.owner, .holder.pid, .holder.expires_at.to_rfc3339())]
    Held {
        subject: String,
        holder: LeaseRecord,
    },

    #[error("subject {subject} has an unreadable lease written at {}; treated as live until it is older than the lease ttl ({reason})", .written.to_rfc3339())]
    Unreadable {
        subject: String,
        written: DateTime<Utc>,
        reason: String,
    },

    #[error("subject {subject}: lease kept changing while being acquired")]
    Contended { subject: String },

    #[error("lease io error: {0:#}")]
    Io(#[from] anyhow::Error),
}

/// Guard for an acquired lease. Dropping it removes the lease file.
#[derive(Debug)]
pub struct SubjectLease {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    record: LeaseRecord,
}

impl SubjectLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }
}

impl Drop for SubjectLease {
    fn drop(&mut self) {
        if let Err(err) = self.fs.remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove lease file");
        } else {
            debug!(path = %self.path.display(), "lease released");
        }
    }
}

pub fn lease_path(root: &Path, subject: &SubjectId) -> PathBuf {
    root.join(LEASE_DIR).join(format!("{}.lease", subject.as_str()))
}

/// `$USER@$HOSTNAME`, falling back to placeholders.
pub fn default_owner() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}")
}

/// Attempts at creating the lease file. Each failed attempt either found a
/// live holder (and returned) or broke one stale lease.
const ACQUIRE_ATTEMPTS: usize = 3;

/// Take the lease for `subject`, breaking an expired or abandoned one.
///
/// A lease whose file cannot be parsed is treated as live until its
/// modification time is older than `ttl`. Returns the guard and, if one was
/// broken, the stale lease it replaced.
pub fn acquire_lease(
    fs: Arc<dyn FileSystem>,
    root: &Path,
    subject: &SubjectId,
    owner: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<(SubjectLease, Option<StaleLease>), LeaseError> {
    let path = lease_path(root, subject);
    let record = LeaseRecord {
        owner: owner.to_string(),
        pid: std::process::id(),
        acquired_at: now,
        expires_at: now + ttl,
    };
    let payload = serde_json::to_vec(&record).map_err(anyhow::Error::from)?;

    let mut broken = None;
    for _ in 0..ACQUIRE_ATTEMPTS {
        if fs.write_new(&path, &payload)? {
            debug!(subject = %subject, path = %path.display(), "lease acquired");
            return Ok((
                SubjectLease {
                    fs,
                    path,
                    record,
                },
                broken,
            ));
        }

        let text = match fs.read_to_string(&path) {
            Ok(text) => text,
            Err(_) if !fs.exists(&path) => continue,
            Err(err) => return Err(err.into()),
        };
        let stale = match serde_json::from_str::<LeaseRecord>(&text) {
            Ok(existing) if existing.expires_at > now => {
                return Err(LeaseError::Held {
                    subject: subject.to_string(),
                    holder: existing,
                });
            }
            Ok(existing) => StaleLease::Expired(existing),
            Err(err) => {
                let written = match fs.modified(&path) {
                    Ok(time) => DateTime::<Utc>::from(time),
                    Err(_) if !fs.exists(&path) => continue,
                    Err(err) => return Err(err.into()),
                };
                if written + ttl > now {
                    return Err(LeaseError::Unreadable {
                        subject: subject.to_string(),
                        written,
                        reason: err.to_string(),
                    });
                }
                StaleLease::Unreadable(err.to_string())
            }
        };

        if break_lease(fs.as_ref(), &path, &text)? {
            warn!(subject = %subject, "breaking {}", stale);
            broken = Some(stale);
        }
    }

    let text = fs.read_to_string(&path).unwrap_or_default();
    match serde_json::from_str::<LeaseRecord>(&text) {
        Ok(holder) => Err(LeaseError::Held {
            subject: subject.to_string(),
            holder,
        }),
        Err(_) => Err(LeaseError::Contended {
            subject: subject.to_string(),
        }),
    }
}

/// Move the lease file at `path` aside, provided it still holds `judged`.
///
/// The rename is the only step that claims the file, so of several
/// processes breaking the same stale lease exactly one moves it. If what was
/// moved is no longer the judged lease, a competitor replaced it in the
/// meantime; it is put back and `Ok(false)` is returned.
fn break_lease(fs: &dyn FileSystem, path: &Path, judged: &str) -> Result<bool, LeaseError> {
    let tombstone = tombstone_path(path);
    if let Err(err) = fs.rename(path, &tombstone) {
        if fs.exists(path) {
            return Err(err.into());
        }
        return Ok(false);
    }

    let moved = fs.read_to_string(&tombstone)?;
    let same = moved == judged;
    if !same {
        debug!(path = %path.display(), "lease changed while breaking it; restoring");
        if !fs.write_new(path, moved.as_bytes())? {
            debug!(path = %path.display(), "lease recreated before restore");
        }
    }
    fs.remove_file(&tombstone)?;
    Ok(same)
}

/// `<sub>.lease.broken.<pid>.<nanos>` beside `path`.
fn tombstone_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    path.with_file_name(format!("{name}.broken.{}.{nanos}", std::process::id()))
}
