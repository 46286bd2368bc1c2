// src/stages/denoise.rs

//! MP-PCA (`dwidenoise`) and patch2self denoising of the Gibbs-corrected
//! volumes, plus a residual map per direction.
//!
//! Both denoisers share the same inputs and layout and differ only in the
//! `denoise` command template. Noise and residual maps land in
//! `imgs/<stage>/`; the sigma-estimate QA hooks are expected to write into
//! `sigma_noise/`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ConfigFile;
use crate::errors::StepError;
use crate::fs::FileSystem;
use crate::stages::{durable_inputs, StageContext, StageFuture, StageRunner, StageSpec};
use crate::subject::SubjectId;
use crate::types::{Denoiser, PhaseDir, StageKind};
use crate::workspace::OutputSpec;

pub const COMMAND_KEYS: &[&str] = &["denoise", "residual"];

const SIGMA_DIR: &str = "sigma_noise";

pub struct DenoiseRunner {
    denoiser: Denoiser,
    config: Arc<ConfigFile>,
}

impl DenoiseRunner {
    pub fn new(denoiser: Denoiser, config: Arc<ConfigFile>) -> Self {
        Self { denoiser, config }
    }

    fn imgs_dir(&self) -> String {
        format!("imgs/{}", self.denoiser.stage())
    }

    /// Write `<sub>_PA.bval` from `[denoise].pa_bvals` when none was staged.
    fn ensure_pa_bval(&self, ctx: &StageContext) -> Result<(), StepError> {
        let path = ctx.ws_sub_file("_PA.bval");
        if ctx.fs.is_file(&path) {
            return Ok(());
        }
        let line = self
            .config
            .denoise
            .pa_bvals
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        ctx.write_ws_text(&ctx.sub_file("_PA.bval"), &format!("{line}\n"))?;
        ctx.log.info(
            ctx.sub(),
            format!("{}: no PA bval staged, wrote {} assumed b-values", ctx.stage, self.config.denoise.pa_bvals.len()),
        );
        Ok(())
    }
}

impl StageRunner for DenoiseRunner {
    fn kind(&self) -> StageKind {
        self.denoiser.stage()
    }

    fn markers(&self, sub: &SubjectId) -> Vec<String> {
        let suffix = self.denoiser.suffix();
        PhaseDir::BOTH
            .iter()
            .map(|d| format!("{sub}_{}{suffix}.nii.gz", d.tag()))
            .collect()
    }

    fn plan(&self, sub: &SubjectId, _fs: &dyn FileSystem) -> Result<StageSpec, StepError> {
        let source_dir = self.config.paths.dataout.join(sub.as_str());
        let imgs = self.imgs_dir();

        let mut outputs: Vec<OutputSpec> =
            self.markers(sub).into_iter().map(OutputSpec::File).collect();
        outputs.push(OutputSpec::glob(format!("{imgs}/**")));
        outputs.push(OutputSpec::glob(format!("{SIGMA_DIR}/**")));

        Ok(StageSpec {
            kind: self.kind(),
            required_inputs: durable_inputs(
                &source_dir,
                sub,
                &["_AP_gib.nii.gz", "_PA_gib.nii.gz", "_AP.bval", "_AP.bvec"],
            ),
            optional_inputs: durable_inputs(&source_dir, sub, &["_PA.bval", "_PA.bvec"]),
            source_dir,
            workspace_dirs: vec![imgs, SIGMA_DIR.to_string()],
            outputs,
            markers: self.markers(sub),
        })
    }

    fn default_commands(&self) -> BTreeMap<&'static str, String> {
        let denoise = match self.denoiser {
            Denoiser::Mppca => "dwidenoise -nthreads {threads} {input} {output} -noise {noise}",
            Denoiser::Patch2self => {
                "dipy_denoise_patch2self {input} {bval} --b0_threshold {b0_threshold} \
                 --out_dir {out_dir} --out_denoised {output_name}"
            }
        };
        BTreeMap::from([
            ("denoise", denoise.to_string()),
            ("residual", "mrcalc {input} {output} -subtract {residual}".to_string()),
        ])
    }

    fn run<'a>(&'a self, ctx: &'a StageContext) -> StageFuture<'a> {
        Box::pin(async move {
            self.ensure_pa_bval(ctx)?;

            let stage = self.denoiser.stage().name();
            let suffix = self.denoiser.suffix();
            let imgs = ctx.ws_file(&self.imgs_dir());

            let qa_vars = [
                ("ap_gib", ctx.ws_sub_file("_AP_gib.nii.gz").display().to_string()),
                ("pa_gib", ctx.ws_sub_file("_PA_gib.nii.gz").display().to_string()),
                ("ap_den", ctx.ws_sub_file(&format!("_AP{suffix}.nii.gz")).display().to_string()),
                ("pa_den", ctx.ws_sub_file(&format!("_PA{suffix}.nii.gz")).display().to_string()),
                ("ap_bval", ctx.ws_sub_file("_AP.bval").display().to_string()),
                ("pa_bval", ctx.ws_sub_file("_PA.bval").display().to_string()),
                ("ap_bvec", ctx.ws_sub_file("_AP.bvec").display().to_string()),
                ("sigma", ctx.ws_file(SIGMA_DIR).display().to_string()),
                ("imgs", imgs.display().to_string()),
            ];

            ctx.run_qa(false, &qa_vars).await;

            for dir in PhaseDir::BOTH {
                let tag = dir.tag();
                let input = ctx.ws_sub_file(&format!("_{tag}_gib.nii.gz"));
                let output_name = ctx.sub_file(&format!("_{tag}{suffix}.nii.gz"));
                let output = ctx.ws_file(&output_name);
                let noise = imgs.join(ctx.sub_file(&format!("_{tag}_{stage}_noise.nii.gz")));
                let residual = imgs.join(ctx.sub_file(&format!("_{tag}_{stage}_resid.nii.gz")));

                let mut expected = vec![output.clone()];
                if self.denoiser == Denoiser::Mppca {
                    expected.push(noise.clone());
                }

                ctx.run_command(
                    "denoise",
                    &format!("denoise:{tag}"),
                    &[
                        ("input", input.display().to_string()),
                        ("output", output.display().to_string()),
                        ("output_name", output_name),
                        ("out_dir", ctx.workspace.display().to_string()),
                        ("noise", noise.display().to_string()),
                        ("bval", ctx.ws_sub_file(&format!("_{tag}.bval")).display().to_string()),
                        ("b0_threshold", self.config.topup.b0_threshold.to_string()),
                    ],
                    expected,
                )
                .await?;

                ctx.run_command(
                    "residual",
                    &format!("residual:{tag}"),
                    &[
                        ("input", input.display().to_string()),
                        ("output", output.display().to_string()),
                        ("residual", residual.display().to_string()),
                    ],
                    vec![residual],
                )
                .await?;
            }

            ctx.run_qa(true, &qa_vars).await;
            Ok(())
        })
    }
}
