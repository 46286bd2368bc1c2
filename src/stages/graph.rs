// src/stages/graph.rs

//! Stage dependency graph.
//!
//! Edge direction is upstream -> downstream:
//!
//! ```text
//! gibbs -> mppca      -> topup -> eddy
//! gibbs -> patch2self -> topup
//! ```

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

use crate::errors::{DwiprepError, Result};
use crate::types::StageKind;

pub fn stage_graph() -> DiGraphMap<StageKind, ()> {
    let mut graph = DiGraphMap::new();
    for stage in StageKind::ALL {
        graph.add_node(stage);
    }
    graph.add_edge(StageKind::Gibbs, StageKind::Mppca, ());
    graph.add_edge(StageKind::Gibbs, StageKind::Patch2self, ());
    graph.add_edge(StageKind::Mppca, StageKind::Topup, ());
    graph.add_edge(StageKind::Patch2self, StageKind::Topup, ());
    graph.add_edge(StageKind::Topup, StageKind::Eddy, ());
    graph
}

/// Stages that feed directly into `stage`.
pub fn upstream(stage: StageKind) -> Vec<StageKind> {
    let mut deps: Vec<StageKind> = stage_graph()
        .neighbors_directed(stage, Direction::Incoming)
        .collect();
    deps.sort();
    deps
}

/// Deduplicate `requested` and put it in dependency order.
pub fn order_stages(requested: &[StageKind]) -> Result<Vec<StageKind>> {
    if requested.is_empty() {
        return Err(DwiprepError::ConfigError(
            "no stages requested (use --stage or [run].stages)".to_string(),
        ));
    }

    let graph = stage_graph();
    let order = toposort(&graph, None).map_err(|cycle| {
        DwiprepError::ConfigError(format!(
            "cycle detected in stage graph involving '{}'",
            cycle.node_id()
        ))
    })?;

    Ok(order
        .into_iter()
        .filter(|s| requested.contains(s))
        .collect())
}
