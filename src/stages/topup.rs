// src/stages/topup.rs

//! Susceptibility field estimation from the AP and PA b0 volumes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ConfigFile;
use crate::errors::StepError;
use crate::fs::FileSystem;
use crate::stages::acqparams::{
    acqparams_lines, b0_indices, format_vols, parse_bvals, readout_time, render_lines,
};
use crate::stages::{durable_inputs, StageContext, StageFuture, StageRunner, StageSpec};
use crate::subject::SubjectId;
use crate::types::{AcqparamsOrder, PhaseDir, StageKind};
use crate::workspace::OutputSpec;

pub const COMMAND_KEYS: &[&str] = &["select_ap", "select_pa", "merge", "topup"];

/// Basename passed to `topup --out`; topup appends `_fieldcoef` and `_movpar`.
pub const TOPUP_BASENAME: &str = "_AP-PA_topup";

pub struct TopupRunner {
    config: Arc<ConfigFile>,
}

impl TopupRunner {
    pub fn new(config: Arc<ConfigFile>) -> Self {
        Self { config }
    }

    fn b0s(&self, ctx: &StageContext, dir: PhaseDir) -> Result<Vec<usize>, StepError> {
        let name = ctx.sub_file(&format!("_{}.bval", dir.tag()));
        let threshold = self.config.topup.b0_threshold;

        let indices = if dir == PhaseDir::Pa && !ctx.fs.is_file(&ctx.ws_file(&name)) {
            (0..self.config.topup.pa_b0_count).collect()
        } else {
            let bvals = parse_bvals(&ctx.read_ws_text(&name)?)
                .map_err(|e| StepError::input("b0_indices", format!("{name}: {e}")))?;
            b0_indices(&bvals, threshold)
        };

        if indices.is_empty() {
            return Err(StepError::input(
                "b0_indices",
                format!("no {} b0 volumes (b <= {})", dir.tag(), threshold),
            ));
        }
        Ok(indices)
    }

    fn readout(&self, ctx: &StageContext, dir: PhaseDir) -> Result<f64, StepError> {
        let name = ctx.sub_file(&format!("_{}.json", dir.tag()));
        readout_time(&ctx.read_ws_text(&name)?)
            .map_err(|e| StepError::input("acqparams", format!("{name}: {e}")))
    }
}

impl StageRunner for TopupRunner {
    fn kind(&self) -> StageKind {
        StageKind::Topup
    }

    fn markers(&self, sub: &SubjectId) -> Vec<String> {
        vec![
            format!("{sub}_acqparams.txt"),
            format!("{sub}{TOPUP_BASENAME}_fieldcoef.nii.gz"),
            format!("{sub}{TOPUP_BASENAME}_movpar.txt"),
        ]
    }

    fn plan(&self, sub: &SubjectId, _fs: &dyn FileSystem) -> Result<StageSpec, StepError> {
        let source_dir = self.config.paths.dataout.join(sub.as_str());
        let suffix = self.config.pipeline.denoiser.suffix();
        let ap_den = format!("_AP{suffix}.nii.gz");
        let pa_den = format!("_PA{suffix}.nii.gz");

        let mut outputs: Vec<OutputSpec> =
            self.markers(sub).into_iter().map(OutputSpec::File).collect();
        outputs.push(OutputSpec::file(format!("{sub}_b0_corrected.nii.gz")));
        outputs.push(OutputSpec::glob("imgs/topup/**"));

        Ok(StageSpec {
            kind: StageKind::Topup,
            required_inputs: durable_inputs(
                &source_dir,
                sub,
                &[&ap_den, &pa_den, "_AP.json", "_PA.json", "_AP.bval", "_AP.bvec"],
            ),
            optional_inputs: durable_inputs(&source_dir, sub, &["_PA.bval"]),
            source_dir,
            workspace_dirs: vec!["imgs/topup".to_string()],
            outputs,
            markers: self.markers(sub),
        })
    }

    fn default_commands(&self) -> BTreeMap<&'static str, String> {
        let select = "fslselectvols -i {input} -o {output} --vols={vols}".to_string();
        BTreeMap::from([
            ("select_ap", select.clone()),
            ("select_pa", select),
            ("merge", "fslmerge -t {output} {first} {second}".to_string()),
            (
                "topup",
                "topup --imain={imain} --datain={acqparams} --config={config} \
                 --out={out} --iout={iout}"
                    .to_string(),
            ),
        ])
    }

    fn run<'a>(&'a self, ctx: &'a StageContext) -> StageFuture<'a> {
        Box::pin(async move {
            let topup = &self.config.topup;
            let suffix = self.config.pipeline.denoiser.suffix();

            let ap_b0 = self.b0s(ctx, PhaseDir::Ap)?;
            let pa_b0 = self.b0s(ctx, PhaseDir::Pa)?;
            let lines = acqparams_lines(
                ap_b0.len(),
                pa_b0.len(),
                self.readout(ctx, PhaseDir::Ap)?,
                self.readout(ctx, PhaseDir::Pa)?,
                topup.acqparams_order,
                topup.ap_polarity,
            );
            let acqparams = ctx.write_ws_text(&ctx.sub_file("_acqparams.txt"), &render_lines(&lines))?;
            ctx.log.info(
                ctx.sub(),
                format!(
                    "topup: {} AP and {} PA b0 volumes, {} acqparams rows",
                    ap_b0.len(),
                    pa_b0.len(),
                    lines.len()
                ),
            );

            let ap_b0_file = ctx.ws_sub_file("_AP_b0.nii.gz");
            let pa_b0_file = ctx.ws_sub_file("_PA_b0.nii.gz");
            let merged = ctx.ws_sub_file("_AP-PA_b0.nii.gz");
            let out = ctx.ws_sub_file(TOPUP_BASENAME);
            let iout = ctx.ws_sub_file("_b0_corrected.nii.gz");

            let qa_vars = [
                ("ap_b0", ap_b0_file.display().to_string()),
                ("pa_b0", pa_b0_file.display().to_string()),
                ("merged", merged.display().to_string()),
                ("b0_corrected", iout.display().to_string()),
                ("acqparams", acqparams.display().to_string()),
                ("imgs", ctx.ws_file("imgs/topup").display().to_string()),
            ];
            ctx.run_qa(false, &qa_vars).await;

            for (key, dir, indices, output) in [
                ("select_ap", PhaseDir::Ap, &ap_b0, &ap_b0_file),
                ("select_pa", PhaseDir::Pa, &pa_b0, &pa_b0_file),
            ] {
                let input = ctx.ws_sub_file(&format!("_{}{suffix}.nii.gz", dir.tag()));
                ctx.run_command(
                    key,
                    key,
                    &[
                        ("input", input.display().to_string()),
                        ("output", output.display().to_string()),
                        ("vols", format_vols(indices)),
                    ],
                    vec![output.clone()],
                )
                .await?;
            }

            let (first, second) = match topup.acqparams_order {
                AcqparamsOrder::ApFirst => (&ap_b0_file, &pa_b0_file),
                AcqparamsOrder::PaFirst => (&pa_b0_file, &ap_b0_file),
            };
            ctx.run_command(
                "merge",
                "merge",
                &[
                    ("output", merged.display().to_string()),
                    ("first", first.display().to_string()),
                    ("second", second.display().to_string()),
                ],
                vec![merged.clone()],
            )
            .await?;

            let fieldcoef: PathBuf = ctx.ws_sub_file(&format!("{TOPUP_BASENAME}_fieldcoef.nii.gz"));
            let movpar: PathBuf = ctx.ws_sub_file(&format!("{TOPUP_BASENAME}_movpar.txt"));
            ctx.run_command(
                "topup",
                "topup",
                &[
                    ("imain", merged.display().to_string()),
                    ("acqparams", acqparams.display().to_string()),
                    ("config", topup.config_file.clone()),
                    ("out", out.display().to_string()),
                    ("iout", iout.display().to_string()),
                ],
                vec![fieldcoef, movpar, iout.clone()],
            )
            .await?;

            ctx.run_qa(true, &qa_vars).await;
            Ok(())
        })
    }
}
