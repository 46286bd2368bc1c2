use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dwiprep::checkpoint::CheckpointState;
use dwiprep::errors::ErrorKind;
use dwiprep::fs::FileSystem;
use dwiprep::orchestrator::SubjectOutcome;
use dwiprep::status_log::LogStatus;
use dwiprep::subject::SubjectId;
use dwiprep::types::StageKind;
use dwiprep::workspace::acquire_lease;
use dwiprep_test_utils::{init_tracing, ConfigFileBuilder, Harness};

fn subjects(ids: &[&str]) -> Vec<SubjectId> {
    ids.iter().map(|s| SubjectId::new(s)).collect()
}

fn gibbs_harness() -> Harness {
    Harness::new(ConfigFileBuilder::new().build())
}

fn failed_kind(outcome: Option<&SubjectOutcome>) -> Option<ErrorKind> {
    match outcome {
        Some(SubjectOutcome::Failed(err)) => Some(err.kind),
        _ => None,
    }
}

#[tokio::test]
async fn copy_failure_is_isolated_to_one_subject() {
    init_tracing();
    let h = gibbs_harness();
    let subs = subjects(&["sub-1", "sub-2", "sub-3", "sub-4", "sub-5"]);
    for s in &subs {
        h.seed(s.as_str());
    }
    h.fs.fail_copies_matching("sub-3_");

    let report = h.orchestrator().run_stage(StageKind::Gibbs, &subs).await;

    assert!(!report.aborted);
    assert_eq!(report.completed(), 4);
    assert_eq!(report.failed(), 1);
    assert_eq!(failed_kind(report.outcome(&subs[2])), Some(ErrorKind::Copy));

    let errors = h.records_for("sub-3", LogStatus::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("stage_inputs"), "{}", errors[0].message);
    for ok in ["sub-1", "sub-2", "sub-4", "sub-5"] {
        assert!(h.records_for(ok, LogStatus::Error).is_empty(), "{ok}");
        assert!(h.fs.is_file(&h.durable(ok, &format!("{ok}_AP_gib.nii.gz"))));
    }

    let record = h
        .orchestrator()
        .checkpoints()
        .read_record(&subs[2], StageKind::Gibbs)
        .unwrap()
        .unwrap();
    assert_eq!(record.state, CheckpointState::Failed);
    assert!(record.detail.unwrap().contains("[copy]"));
}

#[tokio::test]
async fn abort_policy_stops_after_failing_subject() {
    let h = Harness::new(ConfigFileBuilder::new().abort_on(ErrorKind::Copy).build());
    let subs = subjects(&["1", "2", "3", "4", "5"]);
    for s in &subs {
        h.seed(s.as_str());
    }
    h.fs.fail_copies_matching("sub-3_");

    let reports = h
        .orchestrator()
        .run(&[StageKind::Gibbs, StageKind::Mppca], &subs)
        .await
        .unwrap();

    assert_eq!(reports.len(), 1, "later stages must not run after an abort");
    let report = &reports[0];
    assert!(report.aborted);
    assert_eq!(report.outcomes.len(), 3);
    assert!(report.outcome(&subs[3]).is_none());
    assert!(!h.fs.exists(&h.durable("sub-4", "sub-4_AP_gib.nii.gz")));
    assert!(
        h.invoker
            .calls()
            .iter()
            .all(|c| !c.command.contains("sub-4") && !c.command.contains("sub-5"))
    );
}

#[tokio::test]
async fn tool_exit_code_fails_subject_with_stderr_tail() {
    let h = gibbs_harness();
    let subs = subjects(&["sub-1", "sub-2"]);
    for s in &subs {
        h.seed(s.as_str());
    }
    h.invoker.fail_when("tmp/sub-2/sub-2_PA.nii.gz", 1);

    let report = h.orchestrator().run_stage(StageKind::Gibbs, &subs).await;

    match report.outcome(&subs[1]) {
        Some(SubjectOutcome::Failed(err)) => {
            assert_eq!(err.kind, ErrorKind::Tool);
            assert_eq!(err.step, "gibbs:unring:PA");
            assert!(err.message.contains("exited with code 1"));
            assert!(err.message.contains("failed on purpose"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(report.outcome(&subs[0]), Some(&SubjectOutcome::Completed));
    // nothing promoted for the failed subject
    assert!(!h.fs.exists(&h.durable("sub-2", "sub-2_AP_gib.nii.gz")));
}

#[tokio::test]
async fn empty_or_missing_output_is_missing_output() {
    let h = gibbs_harness();
    let subs = subjects(&["sub-1"]);
    h.seed("sub-1");
    h.invoker.skip_outputs_when("unring:AP");

    let report = h.orchestrator().run_stage(StageKind::Gibbs, &subs).await;
    assert_eq!(failed_kind(report.outcome(&subs[0])), Some(ErrorKind::MissingOutput));
}

#[tokio::test]
async fn spawn_failure_is_a_tool_error() {
    let h = gibbs_harness();
    let subs = subjects(&["sub-1"]);
    h.seed("sub-1");
    h.invoker.spawn_error_when("mrdegibbs");

    let report = h.orchestrator().run_stage(StageKind::Gibbs, &subs).await;
    assert_eq!(failed_kind(report.outcome(&subs[0])), Some(ErrorKind::Tool));
}

#[tokio::test]
async fn missing_inputs_are_warnings_not_errors() {
    let h = Harness::new(ConfigFileBuilder::new().build());
    let subs = subjects(&["sub-1", "sub-2"]);
    h.seed("sub-1");

    // sub-2 has no raw directory at all; sub-1 has gibbs output missing for mppca
    let report = h.orchestrator().run_stage(StageKind::Mppca, &subs).await;

    assert_eq!(report.not_ready(), 2);
    assert_eq!(report.failed(), 0);
    assert_eq!(h.records_for("sub-1", LogStatus::Warning).len(), 1);
    assert_eq!(h.records_for("sub-2", LogStatus::Warning).len(), 1);
    assert!(h.records_for("sub-1", LogStatus::SubStart).is_empty());
    assert!(h.invoker.calls().is_empty());
}

#[tokio::test]
async fn wrong_raw_file_count_is_not_ready() {
    let h = gibbs_harness();
    h.seed("sub-1");
    h.fs.add_file("raw/sub-1/dwi/sub-1_dir-PA_dwi_PA_.bval", b"5 5 5 5 5\n");

    let subs = subjects(&["sub-1"]);
    let report = h.orchestrator().run_stage(StageKind::Gibbs, &subs).await;

    match report.outcome(&subs[0]) {
        Some(SubjectOutcome::NotReady(msg)) => {
            assert_eq!(msg, "sub-1 has 7 dwi files and should have 6")
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn cleanup_failure_keeps_completed_checkpoint() {
    let h = gibbs_harness();
    let subs = subjects(&["sub-1"]);
    h.seed("sub-1");
    h.fs.fail_removes_matching("tmp/sub-1");

    let report = h.orchestrator().run_stage(StageKind::Gibbs, &subs).await;

    assert_eq!(failed_kind(report.outcome(&subs[0])), Some(ErrorKind::Cleanup));
    let record = h
        .orchestrator()
        .checkpoints()
        .read_record(&subs[0], StageKind::Gibbs)
        .unwrap()
        .unwrap();
    assert_eq!(record.state, CheckpointState::Done);
    assert!(h.fs.is_dir(Path::new("tmp/sub-1")), "workspace leaks");
}

#[tokio::test]
async fn live_lease_blocks_a_second_worker() {
    let h = gibbs_harness();
    let subs = subjects(&["sub-1", "sub-2"]);
    for s in &subs {
        h.seed(s.as_str());
    }

    let shared: Arc<dyn FileSystem> = Arc::new(h.fs.clone());
    let (_held, _) = acquire_lease(
        shared,
        Path::new("tmp"),
        &subs[0],
        "other@node7",
        Duration::hours(48),
        Utc::now(),
    )
    .unwrap();
    // the other worker's files must survive
    h.fs.add_file("tmp/sub-1/in_use.nii.gz", b"busy");

    let report = h.orchestrator().run_stage(StageKind::Gibbs, &subs).await;

    assert_eq!(failed_kind(report.outcome(&subs[0])), Some(ErrorKind::Lease));
    assert_eq!(report.outcome(&subs[1]), Some(&SubjectOutcome::Completed));
    assert!(h.fs.is_file(Path::new("tmp/sub-1/in_use.nii.gz")));
    let errors = h.records_for("sub-1", LogStatus::Error);
    assert!(errors[0].message.contains("other@node7"), "{}", errors[0].message);
}

#[tokio::test]
async fn expired_lease_is_broken_with_warning() {
    let h = gibbs_harness();
    let subs = subjects(&["sub-1"]);
    h.seed("sub-1");

    let shared: Arc<dyn FileSystem> = Arc::new(h.fs.clone());
    let (stale, _) = acquire_lease(
        shared,
        Path::new("tmp"),
        &subs[0],
        "crashed@node1",
        Duration::hours(1),
        Utc::now() - Duration::hours(3),
    )
    .unwrap();
    // simulate a crashed holder: the file stays behind
    std::mem::forget(stale);

    let report = h.orchestrator().run_stage(StageKind::Gibbs, &subs).await;

    assert_eq!(report.outcome(&subs[0]), Some(&SubjectOutcome::Completed));
    let warnings = h.records_for("sub-1", LogStatus::Warning);
    assert!(warnings.iter().any(|r| r.message.contains("stale lease")));
    assert!(h.fs.files_under("tmp/.leases").is_empty());
}

#[tokio::test]
async fn qa_failures_only_warn() {
    let h = Harness::new(
        ConfigFileBuilder::new()
            .with_qa(StageKind::Gibbs, "qa_plot {ap_gib} {imgs}")
            .build(),
    );
    let subs = subjects(&["sub-1"]);
    h.seed("sub-1");
    h.invoker.fail_when("qa_plot", 3);

    let report = h.orchestrator().run_stage(StageKind::Gibbs, &subs).await;

    assert_eq!(report.outcome(&subs[0]), Some(&SubjectOutcome::Completed));
    let warnings = h.records_for("sub-1", LogStatus::Warning);
    assert!(warnings.iter().any(|r| r.message.contains("gibbs:qa[0]")));
}

#[tokio::test]
async fn unknown_placeholder_fails_at_render_time() {
    let h = Harness::new(
        ConfigFileBuilder::new()
            .with_command(StageKind::Gibbs, "unring", "mrdegibbs {input} {outptu}")
            .build(),
    );
    let subs = subjects(&["sub-1"]);
    h.seed("sub-1");

    let report = h.orchestrator().run_stage(StageKind::Gibbs, &subs).await;

    match report.outcome(&subs[0]) {
        Some(SubjectOutcome::Failed(err)) => {
            assert_eq!(err.kind, ErrorKind::Tool);
            assert!(err.message.contains("outptu"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(h.invoker.calls().is_empty());
}
