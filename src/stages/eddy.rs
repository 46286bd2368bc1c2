// src/stages/eddy.rs

//! Eddy-current and motion correction of the denoised AP series, followed
//! by `eddy_quad` quality control.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ConfigFile;
use crate::errors::StepError;
use crate::fs::FileSystem;
use crate::stages::acqparams::{first_row_with_polarity, parse_bvals, render_index};
use crate::stages::topup::TOPUP_BASENAME;
use crate::stages::{
    durable_inputs, glob_sub, StageContext, StageFuture, StageRunner, StageSpec,
};
use crate::subject::SubjectId;
use crate::types::StageKind;
use crate::workspace::OutputSpec;

pub const COMMAND_KEYS: &[&str] = &["extract_b0", "mask", "eddy", "quad"];

const QC_DIR: &str = "eddyqc";

pub struct EddyRunner {
    config: Arc<ConfigFile>,
}

impl EddyRunner {
    pub fn new(config: Arc<ConfigFile>) -> Self {
        Self { config }
    }

    /// Index file contents: the acqparams row of the first AP line, once
    /// per AP volume.
    fn index_text(&self, ctx: &StageContext) -> Result<String, StepError> {
        let bval_name = ctx.sub_file("_AP.bval");
        let volumes = parse_bvals(&ctx.read_ws_text(&bval_name)?)
            .map_err(|e| StepError::input("index", format!("{bval_name}: {e}")))?
            .len();

        let acqparams = ctx.read_ws_text(&ctx.sub_file("_acqparams.txt"))?;
        let polarity = self.config.topup.ap_polarity;
        let row = first_row_with_polarity(&acqparams, polarity).ok_or_else(|| {
            StepError::input(
                "index",
                format!("acqparams has no row with AP polarity {polarity}"),
            )
        })?;

        Ok(render_index(volumes, row))
    }
}

impl StageRunner for EddyRunner {
    fn kind(&self) -> StageKind {
        StageKind::Eddy
    }

    fn markers(&self, sub: &SubjectId) -> Vec<String> {
        vec![format!("{sub}_dwi.nii.gz"), format!("{sub}_index.txt")]
    }

    fn plan(&self, sub: &SubjectId, _fs: &dyn FileSystem) -> Result<StageSpec, StepError> {
        let source_dir = self.config.paths.dataout.join(sub.as_str());
        let ap_den = format!("_AP{}.nii.gz", self.config.pipeline.denoiser.suffix());
        let fieldcoef = format!("{TOPUP_BASENAME}_fieldcoef.nii.gz");
        let movpar = format!("{TOPUP_BASENAME}_movpar.txt");

        let outputs = vec![
            OutputSpec::file(format!("{sub}_dwi.nii.gz")),
            OutputSpec::glob(format!("{}_dwi.eddy_*", glob_sub(sub))),
            OutputSpec::file(format!("{sub}_brainmask.nii.gz")),
            OutputSpec::file(format!("{sub}_index.txt")),
            OutputSpec::glob(format!("{QC_DIR}/**")),
        ];

        Ok(StageSpec {
            kind: StageKind::Eddy,
            required_inputs: durable_inputs(
                &source_dir,
                sub,
                &[
                    &ap_den,
                    "_AP.bval",
                    "_AP.bvec",
                    "_AP.json",
                    "_acqparams.txt",
                    &fieldcoef,
                    &movpar,
                ],
            ),
            optional_inputs: Vec::new(),
            source_dir,
            workspace_dirs: Vec::new(),
            outputs,
            markers: self.markers(sub),
        })
    }

    fn default_commands(&self) -> BTreeMap<&'static str, String> {
        let eddy_cfg = &self.config.eddy;
        let mut eddy = "eddy_openmp --imain={dwi} --mask={mask} --acqp={acqparams} \
                        --index={index} --bvecs={bvec} --bvals={bval} --topup={topup} \
                        --out={out} --json={json} --repol --niter={niter} --cnr_maps"
            .to_string();
        let mut quad = "eddy_quad {out} -idx {index} -par {acqparams} -m {mask} -b {bval} \
                        -g {bvec} -f {fieldcoef} -o {qc_dir}"
            .to_string();
        if eddy_cfg.verbose {
            eddy.push_str(" --verbose");
            quad.push_str(" -v");
        }

        BTreeMap::from([
            ("extract_b0", "fslroi {input} {output} 0 1".to_string()),
            (
                "mask",
                "bet {input} {brain} -m -n -f 0.3 && mv {brain}_mask.nii.gz {output}".to_string(),
            ),
            ("eddy", eddy),
            ("quad", quad),
        ])
    }

    fn run<'a>(&'a self, ctx: &'a StageContext) -> StageFuture<'a> {
        Box::pin(async move {
            let suffix = self.config.pipeline.denoiser.suffix();
            let dwi = ctx.ws_sub_file(&format!("_AP{suffix}.nii.gz"));
            let b0 = ctx.ws_sub_file("_b0.nii.gz");
            let brain = ctx.ws_sub_file("_b0_brain");
            let mask = ctx.ws_sub_file("_brainmask.nii.gz");
            let acqparams = ctx.ws_sub_file("_acqparams.txt");
            let bval = ctx.ws_sub_file("_AP.bval");
            let bvec = ctx.ws_sub_file("_AP.bvec");
            let out = ctx.ws_sub_file("_dwi");
            let corrected = ctx.ws_sub_file("_dwi.nii.gz");
            let qc_dir = ctx.ws_file(QC_DIR);

            let index = ctx.write_ws_text(&ctx.sub_file("_index.txt"), &self.index_text(ctx)?)?;

            let vars = [
                ("dwi", dwi.display().to_string()),
                ("b0", b0.display().to_string()),
                ("mask", mask.display().to_string()),
                ("acqparams", acqparams.display().to_string()),
                ("index", index.display().to_string()),
                ("bval", bval.display().to_string()),
                ("bvec", bvec.display().to_string()),
                ("json", ctx.ws_sub_file("_AP.json").display().to_string()),
                ("topup", ctx.ws_sub_file(TOPUP_BASENAME).display().to_string()),
                (
                    "fieldcoef",
                    ctx.ws_sub_file(&format!("{TOPUP_BASENAME}_fieldcoef.nii.gz"))
                        .display()
                        .to_string(),
                ),
                ("out", out.display().to_string()),
                ("corrected", corrected.display().to_string()),
                ("qc_dir", qc_dir.display().to_string()),
                ("niter", self.config.eddy.niter.to_string()),
            ];

            ctx.run_qa(false, &vars).await;

            ctx.run_command(
                "extract_b0",
                "extract_b0",
                &[
                    ("input", dwi.display().to_string()),
                    ("output", b0.display().to_string()),
                ],
                vec![b0.clone()],
            )
            .await?;

            ctx.run_command(
                "mask",
                "mask",
                &[
                    ("input", b0.display().to_string()),
                    ("brain", brain.display().to_string()),
                    ("output", mask.display().to_string()),
                ],
                vec![mask.clone()],
            )
            .await?;

            ctx.run_command("eddy", "eddy", &vars, vec![corrected.clone()])
                .await?;

            // eddy_quad refuses to write into an existing directory.
            ctx.run_command("quad", "quad", &vars, vec![qc_dir.join("qc.json")])
                .await?;

            ctx.run_qa(true, &vars).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use std::path::PathBuf;

    fn config(verbose: bool) -> Arc<ConfigFile> {
        let mut cfg = ConfigFile::default();
        cfg.paths.dataout = PathBuf::from("out");
        cfg.eddy.verbose = verbose;
        Arc::new(cfg)
    }

    #[test]
    fn verbose_flag_reaches_both_tools() {
        let quiet = EddyRunner::new(config(false)).default_commands();
        let loud = EddyRunner::new(config(true)).default_commands();
        assert!(!quiet["eddy"].contains("--verbose"));
        assert!(loud["eddy"].ends_with("--verbose"));
        assert!(loud["quad"].ends_with(" -v"));
    }

    #[test]
    fn plan_requires_topup_outputs() {
        let fs = MockFileSystem::new();
        let spec = EddyRunner::new(config(false))
            .plan(&SubjectId::new("2"), &fs)
            .unwrap();
        let names: Vec<&str> = spec.required_inputs.iter().map(|i| i.name.as_str()).collect();
        assert!(names.contains(&"sub-2_acqparams.txt"));
        assert!(names.contains(&"sub-2_AP-PA_topup_fieldcoef.nii.gz"));
        assert!(names.contains(&"sub-2_AP_gib_mppca.nii.gz"));
        assert!(spec.outputs.contains(&OutputSpec::glob("sub-2_dwi.eddy_*")));
        assert_eq!(spec.markers, vec!["sub-2_dwi.nii.gz", "sub-2_index.txt"]);
    }
}
