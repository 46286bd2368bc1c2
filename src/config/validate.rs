// src/config/validate.rs

use std::collections::BTreeMap;

use crate::config::model::{ConfigFile, FailurePolicy, RawConfigFile, RawPolicySection};
use crate::errors::{DwiprepError, ErrorKind, Result};
use crate::stages;
use crate::types::{FailureAction, StageKind};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = DwiprepError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;

        let policy = convert_policy(&raw.policy)?;
        let stages = convert_stage_sections(&raw)?;

        Ok(ConfigFile {
            paths: raw.paths,
            run: raw.run,
            environment: raw.environment,
            pipeline: raw.pipeline,
            lease: raw.lease,
            checkpoint: raw.checkpoint,
            policy,
            notify: raw.notify,
            gibbs: raw.gibbs,
            denoise: raw.denoise,
            topup: raw.topup,
            eddy: raw.eddy,
            stages,
        })
    }
}

/// Re-check a config that was modified after loading (e.g. by CLI flags).
pub fn validate_config(cfg: &ConfigFile) -> Result<()> {
    validate_run(cfg.run.threads, &cfg.run.task)?;
    validate_topup(cfg.topup.ap_polarity, cfg.topup.b0_threshold)?;
    Ok(())
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_run(cfg.run.threads, &cfg.run.task)?;
    validate_topup(cfg.topup.ap_polarity, cfg.topup.b0_threshold)?;

    if cfg.lease.ttl_hours == 0 {
        return Err(DwiprepError::ConfigError(
            "[lease].ttl_hours must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.gibbs.expected_raw_files == 0 {
        return Err(DwiprepError::ConfigError(
            "[gibbs].expected_raw_files must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.denoise.pa_bvals.is_empty() {
        return Err(DwiprepError::ConfigError(
            "[denoise].pa_bvals must not be empty".to_string(),
        ));
    }

    if cfg.notify.enabled && cfg.notify.command.trim().is_empty() {
        return Err(DwiprepError::ConfigError(
            "[notify].command must not be empty when notifications are enabled".to_string(),
        ));
    }

    Ok(())
}

fn validate_run(threads: u32, task: &str) -> Result<()> {
    if threads == 0 {
        return Err(DwiprepError::ConfigError(
            "[run].threads must be >= 1 (got 0)".to_string(),
        ));
    }
    if task.trim().is_empty() {
        return Err(DwiprepError::ConfigError(
            "[run].task must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_topup(ap_polarity: i8, b0_threshold: f64) -> Result<()> {
    if ap_polarity != 1 && ap_polarity != -1 {
        return Err(DwiprepError::ConfigError(format!(
            "[topup].ap_polarity must be 1 or -1 (got {})",
            ap_polarity
        )));
    }
    if b0_threshold.is_nan() || b0_threshold < 0.0 {
        return Err(DwiprepError::ConfigError(format!(
            "[topup].b0_threshold must be >= 0 (got {})",
            b0_threshold
        )));
    }
    Ok(())
}

fn parse_stage(name: &str, context: &str) -> Result<StageKind> {
    name.parse::<StageKind>()
        .map_err(|e| DwiprepError::ConfigError(format!("{context}: {e}")))
}

fn parse_kinds(
    raw: &BTreeMap<String, FailureAction>,
    context: &str,
) -> Result<BTreeMap<ErrorKind, FailureAction>> {
    raw.iter()
        .map(|(key, action)| {
            key.parse::<ErrorKind>()
                .map(|kind| (kind, *action))
                .map_err(|e| DwiprepError::ConfigError(format!("{context}: {e}")))
        })
        .collect()
}

fn convert_policy(raw: &RawPolicySection) -> Result<FailurePolicy> {
    let on_error = parse_kinds(&raw.on_error, "[policy.on_error]")?;

    let mut stages = BTreeMap::new();
    for (name, overrides) in raw.stage.iter() {
        let context = format!("[policy.stage.{name}]");
        let stage = parse_stage(name, &context)?;
        stages.insert(stage, parse_kinds(overrides, &context)?);
    }

    Ok(FailurePolicy {
        default: raw.default,
        on_error,
        stages,
    })
}

fn convert_stage_sections(
    cfg: &RawConfigFile,
) -> Result<BTreeMap<StageKind, crate::config::model::StageSection>> {
    let mut out = BTreeMap::new();
    for (name, section) in cfg.stage.iter() {
        let stage = parse_stage(name, &format!("[stage.{name}]"))?;
        let known = stages::command_keys(stage);
        for key in section.commands.keys() {
            if !known.contains(&key.as_str()) {
                return Err(DwiprepError::ConfigError(format!(
                    "[stage.{}.commands] has unknown command '{}' (known: {})",
                    name,
                    key,
                    known.join(", ")
                )));
            }
        }
        out.insert(stage, section.clone());
    }
    Ok(out)
}
