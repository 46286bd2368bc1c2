use std::io::Write;
use std::path::PathBuf;

use dwiprep::config::{load_and_validate, load_or_default};
use dwiprep::errors::{DwiprepError, ErrorKind};
use dwiprep::types::{Denoiser, EtaMode, FailureAction, StageKind};
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn demo_config_loads() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/Dwiprep.toml");
    let cfg = load_and_validate(&path).unwrap();

    assert_eq!(cfg.run.threads, 16);
    assert!(cfg.run.skip_processed);
    assert_eq!(
        cfg.run.stages,
        vec![StageKind::Gibbs, StageKind::Mppca, StageKind::Topup, StageKind::Eddy]
    );
    assert_eq!(cfg.pipeline.denoiser, Denoiser::Mppca);
    assert_eq!(cfg.pipeline.eta, EtaMode::Median);
    assert_eq!(cfg.lease.ttl_hours, 72);
    assert!(cfg.checkpoint.verify_digests);

    assert_eq!(cfg.policy.decide(StageKind::Eddy, ErrorKind::Tool), FailureAction::Abort);
    assert_eq!(cfg.policy.decide(StageKind::Topup, ErrorKind::Tool), FailureAction::Continue);
    assert_eq!(
        cfg.policy.decide(StageKind::Gibbs, ErrorKind::Checkpoint),
        FailureAction::Abort
    );

    assert!(cfg.stage(StageKind::Eddy).commands["eddy"].starts_with("eddy_cuda10.2"));
    assert_eq!(cfg.stage(StageKind::Mppca).qa.len(), 1);
    assert!(cfg.stage(StageKind::Gibbs).commands.is_empty());
}

#[test]
fn explicit_missing_file_is_an_error() {
    let err = load_or_default(Some(std::path::Path::new("/nonexistent/Dwiprep.toml"))).unwrap_err();
    assert!(matches!(err, DwiprepError::IoError(_)));
}

#[test]
fn unknown_command_key_is_rejected_with_known_keys() {
    let file = write_config(
        r#"
[stage.topup.commands]
merge_b0 = "fslmerge -t {output} {first} {second}"
"#,
    );
    let err = load_and_validate(file.path()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("merge_b0"), "{msg}");
    assert!(msg.contains("select_ap, select_pa, merge, topup"), "{msg}");
}

#[test]
fn stage_alias_is_accepted_in_tables() {
    let file = write_config(
        r#"
[stage.p2s.commands]
denoise = "dipy_denoise_patch2self {input} {bval} --out_dir {out_dir} --out_denoised {output_name}"
"#,
    );
    let cfg = load_and_validate(file.path()).unwrap();
    assert!(cfg.stages.contains_key(&StageKind::Patch2self));
}

#[test]
fn malformed_toml_is_reported() {
    let file = write_config("[run\nthreads = 2\n");
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(matches!(err, DwiprepError::TomlError(_)));
}

#[test]
fn empty_pa_bvals_are_rejected() {
    let file = write_config("[denoise]\npa_bvals = []\n");
    let err = load_and_validate(file.path()).unwrap_err();
    assert!(err.to_string().contains("pa_bvals"));
}
