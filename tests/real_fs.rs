#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Local, Utc};
use dwiprep::checkpoint::CheckpointState;
use dwiprep::errors::StartupError;
use dwiprep::exec::ShellInvoker;
use dwiprep::fs::{FileSystem, RealFileSystem};
use dwiprep::notify::NoopNotifier;
use dwiprep::orchestrator::{Orchestrator, SubjectOutcome};
use dwiprep::status_log::{read_records, LogStatus, StatusLog};
use dwiprep::subject::{resolve_subjects, SubjectId};
use dwiprep::types::{RunMode, StageKind};
use dwiprep::workspace::{acquire_lease, LeaseError};
use dwiprep_test_utils::{seed_raw_subject, with_timeout, ConfigFileBuilder};
use tempfile::TempDir;

#[tokio::test]
async fn gibbs_runs_real_commands_end_to_end() {
    let dir = TempDir::new().unwrap();
    let config = ConfigFileBuilder::new()
        .rooted_at(dir.path())
        .with_command(StageKind::Gibbs, "unring", "cp {input} {output}")
        .build();
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    seed_raw_subject(fs.as_ref(), &config, "sub-1");

    let log = Arc::new(
        StatusLog::start(fs.clone(), &config.paths.logs_dir, &config.run.task, Local::now())
            .unwrap(),
    );
    let config = Arc::new(config);
    let orchestrator = Orchestrator::new(
        config.clone(),
        fs.clone(),
        Arc::new(ShellInvoker),
        log.clone(),
        Arc::new(NoopNotifier),
    );
    let subs = vec![SubjectId::new("1")];

    let report = with_timeout(orchestrator.run_stage(StageKind::Gibbs, &subs)).await;
    log.close();

    assert_eq!(report.outcome(&subs[0]), Some(&SubjectOutcome::Completed));
    let out = config.paths.dataout.join("sub-1");
    assert_eq!(
        std::fs::read_to_string(out.join("sub-1_AP_gib.nii.gz")).unwrap(),
        "ap image"
    );
    assert_eq!(
        std::fs::read_to_string(out.join("sub-1_PA.nii.gz")).unwrap(),
        "pa image"
    );
    assert!(!out.join("sub-1_AP_SBRef.nii.gz").exists());
    assert!(!config.paths.workspace_root.join("sub-1").exists());

    let record = orchestrator
        .checkpoints()
        .read_record(&subs[0], StageKind::Gibbs)
        .unwrap()
        .unwrap();
    assert_eq!(record.state, CheckpointState::Done);
    assert_eq!(record.artifacts.len(), 2);

    let records = read_records(fs.as_ref(), log.path().unwrap()).unwrap();
    assert_eq!(records.first().unwrap().status, LogStatus::Na);
    assert_eq!(records.last().unwrap().message, "StatusLog closed.");
    assert!(records
        .iter()
        .any(|r| r.subject == "sub-1" && r.status == LogStatus::SubEnd));
}

#[tokio::test]
async fn failing_shell_command_reports_stderr() {
    let dir = TempDir::new().unwrap();
    let config = ConfigFileBuilder::new()
        .rooted_at(dir.path())
        .with_command(StageKind::Gibbs, "unring", "echo broken header >&2; exit 4")
        .build();
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    seed_raw_subject(fs.as_ref(), &config, "sub-1");

    let orchestrator = Orchestrator::new(
        Arc::new(config),
        fs,
        Arc::new(ShellInvoker),
        Arc::new(StatusLog::disabled()),
        Arc::new(NoopNotifier),
    );
    let subs = vec![SubjectId::new("1")];
    let report = with_timeout(orchestrator.run_stage(StageKind::Gibbs, &subs)).await;

    match report.outcome(&subs[0]) {
        Some(SubjectOutcome::Failed(err)) => {
            assert_eq!(err.step, "gibbs:unring:AP");
            assert_eq!(err.message, "exited with code 4: broken header");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn lease_file_is_exclusive_and_removed_on_drop() {
    let dir = TempDir::new().unwrap();
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let sub = SubjectId::new("5");

    let (guard, stale) = acquire_lease(
        fs.clone(),
        dir.path(),
        &sub,
        "a@node1",
        Duration::hours(1),
        Utc::now(),
    )
    .unwrap();
    assert!(stale.is_none());
    assert!(guard.path().starts_with(dir.path().join(".leases")));

    let err = acquire_lease(fs.clone(), dir.path(), &sub, "b@node2", Duration::hours(1), Utc::now())
        .unwrap_err();
    assert!(matches!(err, LeaseError::Held { .. }));

    let path = guard.path().to_path_buf();
    drop(guard);
    assert!(!Path::new(&path).exists());

    assert!(acquire_lease(fs, dir.path(), &sub, "b@node2", Duration::hours(1), Utc::now()).is_ok());
}

#[test]
fn status_log_names_do_not_collide() {
    let dir = TempDir::new().unwrap();
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let now = Local::now();

    let first = StatusLog::start(fs.clone(), dir.path(), "my task", now).unwrap();
    let second = StatusLog::start(fs.clone(), dir.path(), "my task", now).unwrap();

    assert_ne!(first.path(), second.path());
    assert!(second.path().unwrap().to_string_lossy().ends_with("_1.log"));
}

#[test]
fn path_like_subject_ids_never_reach_the_filesystem() {
    let dir = TempDir::new().unwrap();
    let durable = dir.path().join("durable");
    std::fs::create_dir_all(&durable).unwrap();
    std::fs::write(durable.join("keep.nii.gz"), "data").unwrap();
    let list = dir.path().join("batch.csv");
    std::fs::write(&list, "sub-1\nsub-1/../../durable\n").unwrap();

    let err = resolve_subjects(
        &RealFileSystem,
        RunMode::List,
        Some(list.to_str().unwrap()),
        &dir.path().join("raw"),
    )
    .unwrap_err();

    assert_eq!(err, StartupError::InvalidSubject("sub-1/../../durable".into()));
    assert!(durable.join("keep.nii.gz").exists());
}

#[test]
fn exclusive_create_publishes_whole_files_only() {
    let dir = TempDir::new().unwrap();
    let fs = RealFileSystem;
    let path = dir.path().join("locks").join("a.lease");

    assert!(fs.write_new(&path, b"first").unwrap());
    assert!(!fs.write_new(&path, b"second").unwrap());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");

    let names: Vec<_> = std::fs::read_dir(dir.path().join("locks"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("a.lease")]);
}
