// src/exec/template.rs

//! `{name}` placeholder rendering for command templates.
//!
//! Substituted values are shell-quoted; the template text itself is passed
//! to `sh -c` untouched.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::errors::{DwiprepError, Result};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|e| panic!("placeholder regex: {e}"))
});

/// Variables available to a template.
pub type TemplateVars = BTreeMap<String, String>;

/// Names of all placeholders in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute every placeholder. An unknown name is a `TemplateError`.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String> {
    if let Some(missing) = placeholders(template)
        .into_iter()
        .find(|name| !vars.contains_key(name))
    {
        let mut known: Vec<&str> = vars.keys().map(String::as_str).collect();
        known.sort_unstable();
        return Err(DwiprepError::TemplateError(format!(
            "unknown placeholder {{{}}} in `{}` (available: {})",
            missing,
            template,
            known.join(", ")
        )));
    }

    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        vars.get(&caps[1])
            .map(|v| shell_quote(v))
            .unwrap_or_default()
    });

    Ok(rendered.into_owned())
}

/// Quote `s` for POSIX `sh` unless it only contains safe characters.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_known_placeholders() {
        let out = render(
            "mrdegibbs {input} {output} -nthreads {threads}",
            &vars(&[
                ("input", "tmp/sub-1/sub-1_AP.nii.gz"),
                ("output", "tmp/sub-1/sub-1_AP_gib.nii.gz"),
                ("threads", "4"),
            ]),
        )
        .unwrap();
        assert_eq!(
            out,
            "mrdegibbs tmp/sub-1/sub-1_AP.nii.gz tmp/sub-1/sub-1_AP_gib.nii.gz -nthreads 4"
        );
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let err = render("topup --imain={imain}", &vars(&[("sub", "sub-1")])).unwrap_err();
        assert!(matches!(err, DwiprepError::TemplateError(_)));
        assert!(err.to_string().contains("{imain}"));
    }

    #[test]
    fn quotes_values_with_spaces() {
        let out = render("echo {msg}", &vars(&[("msg", "it's done")])).unwrap();
        assert_eq!(out, "echo 'it'\"'\"'s done'");
    }

    #[test]
    fn lists_placeholders_in_order() {
        assert_eq!(placeholders("{a} x {b_2} {a}"), vec!["a", "b_2", "a"]);
        assert!(placeholders("no braces {} here { x }").is_empty());
    }
}
