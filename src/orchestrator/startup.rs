// src/orchestrator/startup.rs

//! One-time preconditions checked before any subject is touched.

use std::path::Path;

use crate::config::{ConfigFile, EnvironmentSection, NotifySection};
use crate::errors::StartupError;
use crate::fs::FileSystem;
use crate::status_log::{StatusLog, INIT};
use crate::subject::{resolve_subjects, SubjectId};
use crate::types::RunMode;

/// What startup established for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    pub mode: RunMode,
    pub subjects: Vec<SubjectId>,
    pub notifications: bool,
}

pub fn check_environment(
    fs: &dyn FileSystem,
    env: &EnvironmentSection,
    log: &StatusLog,
) -> Result<(), StartupError> {
    if !env.check {
        log.info(INIT, "Environment check disabled.");
        return Ok(());
    }
    if !fs.is_file(&env.marker) {
        log.error(INIT, format!("Environment marker {} not found.", env.marker.display()));
        return Err(StartupError::EnvironmentMarkerMissing(env.marker.clone()));
    }
    log.ok(INIT, "Environment marker found.");
    Ok(())
}

pub fn check_workspace_root(fs: &dyn FileSystem, root: &Path) -> Result<(), StartupError> {
    fs.create_dir_all(root)
        .map_err(|e| StartupError::WorkspaceRoot {
            path: root.to_path_buf(),
            reason: format!("{e:#}"),
        })
}

/// Whether batch notifications should be sent. Never fatal.
pub fn notifications_enabled(
    fs: &dyn FileSystem,
    notify: &NotifySection,
    suppressed: bool,
    log: &StatusLog,
) -> bool {
    if suppressed || !notify.enabled {
        log.info(INIT, "Notifications disabled.");
        return false;
    }
    if let Some(required) = &notify.requires {
        if !fs.is_file(required) {
            log.info(
                INIT,
                format!("Notification setup file {} not found.", required.display()),
            );
            return false;
        }
    }
    log.ok(INIT, "Notifications enabled.");
    true
}

/// Run every startup check in order: environment, subjects, workspace
/// root, notifications.
pub fn run_startup(
    fs: &dyn FileSystem,
    config: &ConfigFile,
    mode: &str,
    input: Option<&str>,
    suppress_notifications: bool,
    log: &StatusLog,
) -> Result<Startup, StartupError> {
    let result = startup_inner(fs, config, mode, input, suppress_notifications, log);
    if let Err(err) = &result {
        log.error(INIT, err.to_string());
    }
    result
}

fn startup_inner(
    fs: &dyn FileSystem,
    config: &ConfigFile,
    mode: &str,
    input: Option<&str>,
    suppress_notifications: bool,
    log: &StatusLog,
) -> Result<Startup, StartupError> {
    check_environment(fs, &config.environment, log)?;

    let mode: RunMode = mode
        .parse()
        .map_err(|_| StartupError::ModeNotRecognised(mode.to_string()))?;
    let resolution = resolve_subjects(fs, mode, input, &config.paths.datain)?;
    for raw in &resolution.normalized {
        log.warning(INIT, format!("Subject id {raw} lacked the sub- prefix, fixed."));
    }
    for raw in &resolution.duplicates {
        log.warning(INIT, format!("Subject id {raw} is listed more than once, dropped."));
    }
    log.ok(
        INIT,
        format!("{} subject(s) resolved in {} mode.", resolution.subjects.len(), mode.name()),
    );

    check_workspace_root(fs, &config.paths.workspace_root)?;

    let notifications = notifications_enabled(fs, &config.notify, suppress_notifications, log);

    Ok(Startup {
        mode,
        subjects: resolution.subjects,
        notifications,
    })
}
