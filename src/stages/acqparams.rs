// src/stages/acqparams.rs

//! Acquisition-parameter and eddy-index derivation.
//!
//! Volume counts come from the `.bval` files: one whitespace-separated
//! b-value per volume.

use serde_json::Value;

use crate::types::AcqparamsOrder;

/// Parse a `.bval` file into one b-value per volume.
pub fn parse_bvals(text: &str) -> Result<Vec<f64>, String> {
    let values = text
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| format!("invalid b-value {tok:?}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if values.is_empty() {
        return Err("bval file contains no values".to_string());
    }
    Ok(values)
}

/// Indices of volumes with b <= `threshold`.
pub fn b0_indices(bvals: &[f64], threshold: f64) -> Vec<usize> {
    bvals
        .iter()
        .enumerate()
        .filter(|(_, b)| **b <= threshold)
        .map(|(i, _)| i)
        .collect()
}

/// `TotalReadoutTime` from a BIDS JSON sidecar.
pub fn readout_time(json_text: &str) -> Result<f64, String> {
    let value: Value =
        serde_json::from_str(json_text).map_err(|e| format!("invalid JSON sidecar: {e}"))?;
    value
        .get("TotalReadoutTime")
        .and_then(Value::as_f64)
        .ok_or_else(|| "TotalReadoutTime missing from JSON sidecar".to_string())
}

/// One `0 <±1> 0 <trt>` row per b0 volume, AP rows carrying `ap_polarity`
/// and PA rows its negation.
pub fn acqparams_lines(
    ap_count: usize,
    pa_count: usize,
    ap_readout: f64,
    pa_readout: f64,
    order: AcqparamsOrder,
    ap_polarity: i8,
) -> Vec<String> {
    let ap = std::iter::repeat_n(format!("0 {} 0 {}", ap_polarity, ap_readout), ap_count);
    let pa = std::iter::repeat_n(format!("0 {} 0 {}", -ap_polarity, pa_readout), pa_count);
    match order {
        AcqparamsOrder::ApFirst => ap.chain(pa).collect(),
        AcqparamsOrder::PaFirst => pa.chain(ap).collect(),
    }
}

pub fn render_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// 1-based row of the first acqparams line whose y component is `polarity`.
pub fn first_row_with_polarity(acqparams: &str, polarity: i8) -> Option<usize> {
    acqparams
        .lines()
        .filter(|l| !l.trim().is_empty())
        .position(|line| {
            line.split_whitespace()
                .nth(1)
                .and_then(|y| y.parse::<f64>().ok())
                .is_some_and(|y| y == f64::from(polarity))
        })
        .map(|i| i + 1)
}

/// Eddy index file: `row` repeated once per volume on a single line.
pub fn render_index(volumes: usize, row: usize) -> String {
    let token = row.to_string();
    let mut out = vec![token.as_str(); volumes].join(" ");
    out.push('\n');
    out
}

/// Comma-separated volume list as taken by `fslselectvols --vols=`.
pub fn format_vols(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
