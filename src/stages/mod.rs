// src/stages/mod.rs

//! Pipeline stages.
//!
//! Each stage implements [`StageRunner`]: it describes its inputs, outputs
//! and checkpoint markers for a subject ([`StageSpec`]) and runs its tools
//! inside a prepared workspace through a [`StageContext`].
//!
//! - [`gibbs`]: Gibbs-ringing removal on the raw AP/PA acquisitions.
//! - [`denoise`]: MP-PCA and patch2self denoising.
//! - [`topup`]: susceptibility field estimation.
//! - [`eddy`]: eddy-current and motion correction plus eddy QC.
//! - [`graph`]: stage ordering.
//! - [`acqparams`]: acquisition parameters and eddy index derivation.

pub mod acqparams;
pub mod denoise;
pub mod eddy;
pub mod gibbs;
pub mod graph;
pub mod topup;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use crate::config::ConfigFile;
use crate::errors::StepError;
use crate::exec::{template, Invocation, TemplateVars, ToolInvoker, ToolOutput};
use crate::fs::FileSystem;
use crate::status_log::StatusLog;
use crate::subject::SubjectId;
use crate::types::{Denoiser, StageKind};
use crate::workspace::{OutputSpec, StagedInput};

pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StepError>> + Send + 'a>>;

/// What one stage needs and produces for one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub kind: StageKind,
    /// Durable directory the inputs come from.
    pub source_dir: PathBuf,
    pub required_inputs: Vec<StagedInput>,
    /// Staged only when present.
    pub optional_inputs: Vec<StagedInput>,
    /// Subdirectories created in the fresh workspace.
    pub workspace_dirs: Vec<String>,
    pub outputs: Vec<OutputSpec>,
    /// Files (relative to `<dataout>/<sub>/`) whose presence marks completion.
    pub markers: Vec<String>,
}

impl StageSpec {
    /// Check that the source directory and every required input exist.
    /// Returns the inputs to stage.
    pub fn check_ready(&self, fs: &dyn FileSystem) -> Result<Vec<StagedInput>, StepError> {
        if !fs.is_dir(&self.source_dir) {
            return Err(StepError::not_ready(
                "check_ready",
                format!("directory {} does not exist", self.source_dir.display()),
            ));
        }

        let missing: Vec<&str> = self
            .required_inputs
            .iter()
            .filter(|i| !fs.is_file(&i.source))
            .map(|i| i.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(StepError::not_ready(
                "check_ready",
                format!("missing required input(s): {}", missing.join(", ")),
            ));
        }

        let mut inputs = self.required_inputs.clone();
        inputs.extend(
            self.optional_inputs
                .iter()
                .filter(|i| fs.is_file(&i.source))
                .cloned(),
        );
        Ok(inputs)
    }
}

/// Durable `<dataout>/<sub>/<sub><suffix>` inputs, staged under the same name.
pub(crate) fn durable_inputs(dir: &Path, sub: &SubjectId, suffixes: &[&str]) -> Vec<StagedInput> {
    suffixes
        .iter()
        .map(|suffix| {
            let name = format!("{sub}{suffix}");
            StagedInput::new(dir.join(&name), name)
        })
        .collect()
}

/// Escape a subject id for use inside an output glob.
pub(crate) fn glob_sub(sub: &SubjectId) -> String {
    globset::escape(sub.as_str())
}

pub trait StageRunner: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Marker files for the skip check; must not touch the filesystem.
    fn markers(&self, sub: &SubjectId) -> Vec<String>;

    /// Build the subject's spec. May inspect durable storage and return
    /// `NotReady` when there is nothing to process.
    fn plan(&self, sub: &SubjectId, fs: &dyn FileSystem) -> Result<StageSpec, StepError>;

    /// Built-in command templates, keyed by command name.
    fn default_commands(&self) -> BTreeMap<&'static str, String>;

    /// Run the stage's tools in the prepared workspace.
    fn run<'a>(&'a self, ctx: &'a StageContext) -> StageFuture<'a>;
}

/// Command names that `[stage.<name>.commands]` may override.
pub fn command_keys(kind: StageKind) -> &'static [&'static str] {
    match kind {
        StageKind::Gibbs => gibbs::COMMAND_KEYS,
        StageKind::Mppca | StageKind::Patch2self => denoise::COMMAND_KEYS,
        StageKind::Topup => topup::COMMAND_KEYS,
        StageKind::Eddy => eddy::COMMAND_KEYS,
    }
}

pub fn runner_for(kind: StageKind, config: Arc<ConfigFile>) -> Box<dyn StageRunner> {
    match kind {
        StageKind::Gibbs => Box::new(gibbs::GibbsRunner::new(config)),
        StageKind::Mppca => Box::new(denoise::DenoiseRunner::new(Denoiser::Mppca, config)),
        StageKind::Patch2self => {
            Box::new(denoise::DenoiseRunner::new(Denoiser::Patch2self, config))
        }
        StageKind::Topup => Box::new(topup::TopupRunner::new(config)),
        StageKind::Eddy => Box::new(eddy::EddyRunner::new(config)),
    }
}

/// Everything a runner needs while processing one subject.
pub struct StageContext {
    pub subject: SubjectId,
    pub stage: StageKind,
    pub workspace: PathBuf,
    pub config: Arc<ConfigFile>,
    pub fs: Arc<dyn FileSystem>,
    pub invoker: Arc<dyn ToolInvoker>,
    pub log: Arc<StatusLog>,
    commands: BTreeMap<String, String>,
}

impl StageContext {
    /// Merge the runner's default commands with configured overrides.
    pub fn new(
        runner: &dyn StageRunner,
        subject: SubjectId,
        workspace: PathBuf,
        config: Arc<ConfigFile>,
        fs: Arc<dyn FileSystem>,
        invoker: Arc<dyn ToolInvoker>,
        log: Arc<StatusLog>,
    ) -> Self {
        let stage = runner.kind();
        let mut commands: BTreeMap<String, String> = runner
            .default_commands()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        commands.extend(config.stage(stage).commands);

        Self {
            subject,
            stage,
            workspace,
            config,
            fs,
            invoker,
            log,
            commands,
        }
    }

    pub fn sub(&self) -> &str {
        self.subject.as_str()
    }

    /// `<sub><suffix>`, e.g. `sub-1_AP.bval`.
    pub fn sub_file(&self, suffix: &str) -> String {
        format!("{}{}", self.subject, suffix)
    }

    pub fn ws_file(&self, name: &str) -> PathBuf {
        self.workspace.join(name)
    }

    /// Shorthand for `ws_file(sub_file(suffix))`.
    pub fn ws_sub_file(&self, suffix: &str) -> PathBuf {
        self.ws_file(&self.sub_file(suffix))
    }

    pub fn command(&self, key: &str) -> Option<&str> {
        self.commands.get(key).map(String::as_str)
    }

    /// Variables every template can use.
    pub fn vars(&self) -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.insert("sub".into(), self.sub().to_string());
        vars.insert("ws".into(), self.workspace.display().to_string());
        vars.insert("threads".into(), self.config.run.threads.to_string());
        vars.insert("datain".into(), self.config.paths.datain.display().to_string());
        vars.insert("dataout".into(), self.config.paths.dataout.display().to_string());
        vars
    }

    fn vars_with(&self, extra: &[(&str, String)]) -> TemplateVars {
        let mut vars = self.vars();
        for (k, v) in extra {
            vars.insert((*k).to_string(), v.clone());
        }
        vars
    }

    /// Render the command `key` with the base variables plus `extra`.
    pub fn render(&self, key: &str, extra: &[(&str, String)]) -> Result<String, StepError> {
        let tmpl = self.command(key).ok_or_else(|| {
            StepError::tool(key, format!("no command template named '{key}'"))
        })?;
        template::render(tmpl, &self.vars_with(extra))
            .map_err(|e| StepError::tool(key, e.to_string()))
    }

    /// Run a rendered command and check its exit code and expected outputs.
    pub async fn run_tool(
        &self,
        label: &str,
        command: String,
        expected_outputs: Vec<PathBuf>,
    ) -> Result<ToolOutput, StepError> {
        let step = format!("{}:{}", self.stage, label);
        let invocation = Invocation::new(step.clone(), command).expecting(expected_outputs);

        let output = self
            .invoker
            .invoke(&invocation)
            .await
            .map_err(|e| StepError::tool(&step, format!("could not run: {e:#}")))?;

        if !output.success() {
            let tail = output.stderr_tail.join(" | ");
            return Err(StepError::tool(
                &step,
                if tail.is_empty() {
                    format!("exited with code {}", output.exit_code)
                } else {
                    format!("exited with code {}: {}", output.exit_code, tail)
                },
            ));
        }

        for path in &invocation.expected_outputs {
            let ok = self.fs.is_file(path)
                && self.fs.file_size(path).map(|n| n > 0).unwrap_or(false);
            if !ok {
                return Err(StepError::missing_output(
                    &step,
                    format!("expected output {} missing or empty", path.display()),
                ));
            }
        }

        self.log.ok(self.sub(), format!("{step}: done"));
        Ok(output)
    }

    /// Render and run the command `key`.
    pub async fn run_command(
        &self,
        key: &str,
        label: &str,
        extra: &[(&str, String)],
        expected_outputs: Vec<PathBuf>,
    ) -> Result<ToolOutput, StepError> {
        let command = self.render(key, extra)?;
        self.run_tool(label, command, expected_outputs).await
    }

    /// Run configured QA hooks. Failures are logged as warnings only.
    pub async fn run_qa(&self, after: bool, extra: &[(&str, String)]) {
        let section = self.config.stage(self.stage);
        let (phase, hooks) = if after {
            ("qa", section.qa)
        } else {
            ("qa_before", section.qa_before)
        };
        let vars = self.vars_with(extra);

        for (i, tmpl) in hooks.iter().enumerate() {
            let label = format!("{}:{}[{}]", self.stage, phase, i);
            let command = match template::render(tmpl, &vars) {
                Ok(c) => c,
                Err(e) => {
                    self.log.warning(self.sub(), format!("{label}: {e}"));
                    continue;
                }
            };
            match self.invoker.invoke(&Invocation::new(label.clone(), command)).await {
                Ok(out) if out.success() => self.log.ok(self.sub(), format!("{label}: done")),
                Ok(out) => self.log.warning(
                    self.sub(),
                    format!("{label}: exited with code {}", out.exit_code),
                ),
                Err(e) => self.log.warning(self.sub(), format!("{label}: could not run: {e:#}")),
            }
        }
    }

    pub fn read_ws_text(&self, name: &str) -> Result<String, StepError> {
        self.fs
            .read_to_string(&self.ws_file(name))
            .map_err(|e| StepError::input("read_input", format!("{e:#}")))
    }

    pub fn write_ws_text(&self, name: &str, contents: &str) -> Result<PathBuf, StepError> {
        let path = self.ws_file(name);
        self.fs
            .write(&path, contents.as_bytes())
            .map_err(|e| StepError::workspace("write", format!("{e:#}")))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::fs::mock::MockFileSystem;

    fn spec(fs_root: &str) -> StageSpec {
        let sub = SubjectId::new("1");
        StageSpec {
            kind: StageKind::Mppca,
            source_dir: PathBuf::from(fs_root).join("sub-1"),
            required_inputs: durable_inputs(
                &PathBuf::from(fs_root).join("sub-1"),
                &sub,
                &["_AP.bval", "_AP.bvec"],
            ),
            optional_inputs: durable_inputs(&PathBuf::from(fs_root).join("sub-1"), &sub, &["_PA.bval"]),
            workspace_dirs: vec![],
            outputs: vec![],
            markers: vec![],
        }
    }

    #[test]
    fn missing_directory_is_not_ready() {
        let fs = MockFileSystem::new();
        let err = spec("out").check_ready(&fs).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
    }

    #[test]
    fn missing_input_is_named() {
        let fs = MockFileSystem::new();
        fs.add_file("out/sub-1/sub-1_AP.bval", b"0");
        let err = spec("out").check_ready(&fs).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
        assert!(err.message.contains("sub-1_AP.bvec"));
    }

    #[test]
    fn optional_inputs_staged_only_when_present() {
        let fs = MockFileSystem::new();
        fs.add_file("out/sub-1/sub-1_AP.bval", b"0");
        fs.add_file("out/sub-1/sub-1_AP.bvec", b"0");
        assert_eq!(spec("out").check_ready(&fs).unwrap().len(), 2);

        fs.add_file("out/sub-1/sub-1_PA.bval", b"0");
        assert_eq!(spec("out").check_ready(&fs).unwrap().len(), 3);
    }

    #[test]
    fn every_default_command_key_is_overridable() {
        let config = Arc::new(ConfigFile::default());
        for kind in StageKind::ALL {
            let runner = runner_for(kind, config.clone());
            let keys: Vec<&str> = runner.default_commands().keys().copied().collect();
            assert_eq!(keys.len(), command_keys(kind).len(), "{kind}");
            for key in keys {
                assert!(command_keys(kind).contains(&key), "{kind}:{key}");
            }
        }
    }
}
