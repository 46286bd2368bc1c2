// src/stages/gibbs.rs

//! Gibbs-ringing removal on the raw AP/PA acquisitions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ConfigFile;
use crate::errors::StepError;
use crate::fs::FileSystem;
use crate::stages::{StageContext, StageFuture, StageRunner, StageSpec};
use crate::subject::SubjectId;
use crate::types::{GibbsBackend, PhaseDir, StageKind};
use crate::workspace::{OutputSpec, StagedInput};

pub const COMMAND_KEYS: &[&str] = &["unring"];

/// Extension of a raw file name, treating `.nii.gz` as one extension.
pub fn raw_extension(name: &str) -> &str {
    if name.ends_with(".nii.gz") {
        "nii.gz"
    } else {
        name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
    }
}

/// Phase direction of a raw DWI file, or `None` if it should be ignored.
pub fn classify_raw(name: &str, exclude_tokens: &[String]) -> Option<PhaseDir> {
    if exclude_tokens.iter().any(|t| name.contains(t.as_str())) {
        return None;
    }
    if name.contains("_AP_") {
        Some(PhaseDir::Ap)
    } else if name.contains("_PA_") {
        Some(PhaseDir::Pa)
    } else {
        None
    }
}

/// The staged image for `dir`, either `.nii.gz` or `.nii`.
fn staged_image(ctx: &StageContext, dir: PhaseDir) -> Result<PathBuf, StepError> {
    [".nii.gz", ".nii"]
        .iter()
        .map(|ext| ctx.ws_sub_file(&format!("_{}{}", dir.tag(), ext)))
        .find(|p| ctx.fs.is_file(p))
        .ok_or_else(|| {
            StepError::input(
                "unring",
                format!("no {} image staged for {}", dir.tag(), ctx.sub()),
            )
        })
}

pub struct GibbsRunner {
    config: Arc<ConfigFile>,
}

impl GibbsRunner {
    pub fn new(config: Arc<ConfigFile>) -> Self {
        Self { config }
    }

    fn raw_dir(&self, sub: &SubjectId) -> PathBuf {
        self.config.paths.datain.join(sub.as_str()).join("dwi")
    }
}

impl StageRunner for GibbsRunner {
    fn kind(&self) -> StageKind {
        StageKind::Gibbs
    }

    fn markers(&self, sub: &SubjectId) -> Vec<String> {
        PhaseDir::BOTH
            .iter()
            .map(|d| format!("{sub}_{}_gib.nii.gz", d.tag()))
            .collect()
    }

    fn plan(&self, sub: &SubjectId, fs: &dyn FileSystem) -> Result<StageSpec, StepError> {
        let raw_dir = self.raw_dir(sub);
        if !fs.is_dir(&raw_dir) {
            return Err(StepError::not_ready(
                "check_ready",
                format!("raw DWI directory {} does not exist", raw_dir.display()),
            ));
        }

        let listing = fs
            .read_dir(&raw_dir)
            .map_err(|e| StepError::input("check_ready", format!("{e:#}")))?;
        let mut names: Vec<String> = listing
            .iter()
            .filter(|p| fs.is_file(p))
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        names.sort();

        let gibbs = &self.config.gibbs;
        let mut inputs: Vec<StagedInput> = Vec::new();
        for name in &names {
            let Some(dir) = classify_raw(name, &gibbs.exclude_tokens) else {
                continue;
            };
            let dest = format!("{sub}_{}.{}", dir.tag(), raw_extension(name));
            if inputs.iter().any(|i| i.name == dest) {
                return Err(StepError::input(
                    "check_ready",
                    format!("more than one raw file maps to {dest}"),
                ));
            }
            inputs.push(StagedInput::new(raw_dir.join(name), dest));
        }

        if inputs.len() != gibbs.expected_raw_files {
            return Err(StepError::not_ready(
                "check_ready",
                format!(
                    "{} has {} dwi files and should have {}",
                    sub,
                    inputs.len(),
                    gibbs.expected_raw_files
                ),
            ));
        }

        let mut outputs: Vec<OutputSpec> = inputs.iter().map(|i| OutputSpec::file(&i.name)).collect();
        outputs.extend(self.markers(sub).into_iter().map(OutputSpec::File));
        outputs.push(OutputSpec::glob("imgs/gibbs/**"));

        Ok(StageSpec {
            kind: StageKind::Gibbs,
            source_dir: raw_dir,
            required_inputs: inputs,
            optional_inputs: Vec::new(),
            workspace_dirs: vec!["imgs/gibbs".to_string()],
            outputs,
            markers: self.markers(sub),
        })
    }

    fn default_commands(&self) -> BTreeMap<&'static str, String> {
        let unring = match self.config.pipeline.gibbs_backend {
            GibbsBackend::Mrtrix3 => "mrdegibbs {input} {output} -nthreads {threads}",
            GibbsBackend::Dipy => {
                "dipy_gibbs_ringing {input} --out_unring {output} --num_processes {threads}"
            }
        };
        BTreeMap::from([("unring", unring.to_string())])
    }

    fn run<'a>(&'a self, ctx: &'a StageContext) -> StageFuture<'a> {
        Box::pin(async move {
            let ap = staged_image(ctx, PhaseDir::Ap)?;
            let pa = staged_image(ctx, PhaseDir::Pa)?;
            let ap_gib = ctx.ws_sub_file("_AP_gib.nii.gz");
            let pa_gib = ctx.ws_sub_file("_PA_gib.nii.gz");

            let qa_vars = [
                ("ap", ap.display().to_string()),
                ("pa", pa.display().to_string()),
                ("ap_gib", ap_gib.display().to_string()),
                ("pa_gib", pa_gib.display().to_string()),
                ("imgs", ctx.ws_file("imgs/gibbs").display().to_string()),
            ];

            ctx.run_qa(false, &qa_vars).await;

            for (dir, input, output) in [(PhaseDir::Ap, ap, ap_gib), (PhaseDir::Pa, pa, pa_gib)] {
                ctx.run_command(
                    "unring",
                    &format!("unring:{}", dir.tag()),
                    &[
                        ("input", input.display().to_string()),
                        ("output", output.display().to_string()),
                    ],
                    vec![output],
                )
                .await?;
            }

            ctx.run_qa(true, &qa_vars).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::fs::mock::MockFileSystem;

    fn seed_raw(fs: &MockFileSystem, sub: &str) {
        let dir = format!("raw/{sub}/dwi");
        for dir_tag in ["AP", "PA"] {
            for ext in ["nii.gz", "bval", "bvec", "json"] {
                if ext == "json" && dir_tag == "PA" {
                    continue;
                }
                fs.add_file(format!("{dir}/{sub}_dir-{dir_tag}_run-1_dwi_{dir_tag}_.{ext}"), b"x");
            }
        }
        // derived maps and junk that must be ignored
        fs.add_file(format!("{dir}/{sub}_AP_SBRef_.nii.gz"), b"x");
        fs.add_file(format!("{dir}/{sub}_AP_ADC_.nii.gz"), b"x");
        fs.add_file(format!("{dir}/.DS_Store"), b"x");
    }

    fn runner(expected: usize) -> GibbsRunner {
        let mut cfg = ConfigFile::default();
        cfg.paths.datain = PathBuf::from("raw");
        cfg.gibbs.expected_raw_files = expected;
        GibbsRunner::new(Arc::new(cfg))
    }

    #[test]
    fn extension_handles_nii_gz() {
        assert_eq!(raw_extension("a_AP_.nii.gz"), "nii.gz");
        assert_eq!(raw_extension("a_AP_.bval"), "bval");
        assert_eq!(raw_extension("noext"), "");
    }

    #[test]
    fn classification_skips_derived_maps() {
        let tokens = crate::config::GibbsSection::default().exclude_tokens;
        assert_eq!(classify_raw("x_AP_.nii.gz", &tokens), Some(PhaseDir::Ap));
        assert_eq!(classify_raw("x_PA_.bval", &tokens), Some(PhaseDir::Pa));
        assert_eq!(classify_raw("x_AP_FA_.nii.gz", &tokens), None);
        assert_eq!(classify_raw("x_ColFA_AP_.nii.gz", &tokens), None);
        assert_eq!(classify_raw("x_T1w.nii.gz", &tokens), None);
    }

    #[test]
    fn plan_selects_and_renames_raw_files() {
        let fs = MockFileSystem::new();
        seed_raw(&fs, "sub-1");
        let spec = runner(7).plan(&SubjectId::new("1"), &fs).unwrap();

        let mut names: Vec<&str> = spec.required_inputs.iter().map(|i| i.name.as_str()).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "sub-1_AP.bval",
                "sub-1_AP.bvec",
                "sub-1_AP.json",
                "sub-1_AP.nii.gz",
                "sub-1_PA.bval",
                "sub-1_PA.bvec",
                "sub-1_PA.nii.gz",
            ]
        );
        assert_eq!(spec.markers, vec!["sub-1_AP_gib.nii.gz", "sub-1_PA_gib.nii.gz"]);
    }

    #[test]
    fn wrong_file_count_is_not_ready() {
        let fs = MockFileSystem::new();
        seed_raw(&fs, "sub-1");
        let err = runner(6).plan(&SubjectId::new("1"), &fs).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
        assert!(err.message.contains("has 7 dwi files"));
    }

    #[test]
    fn missing_raw_dir_is_not_ready() {
        let fs = MockFileSystem::new();
        let err = runner(6).plan(&SubjectId::new("9"), &fs).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
    }

    #[test]
    fn backend_selects_default_command() {
        let mut cfg = ConfigFile::default();
        cfg.pipeline.gibbs_backend = GibbsBackend::Dipy;
        let runner = GibbsRunner::new(Arc::new(cfg));
        assert!(runner.default_commands()["unring"].starts_with("dipy_gibbs_ringing"));
    }
}
