// elspeth-config/src/planner.rs
// ============================================================================
// Module: ELSPETH Graph Planner
// Description: Builds the execution graph from validated settings.
// Purpose: Derive deterministic node ids and wire edges, routes, and divert
//          paths exactly as declared.
// Dependencies: elspeth-core, serde_json
// ============================================================================

//! ## Overview
//! The planner turns validated [`Settings`] into an [`ExecutionGraph`].
//! Node ids are deterministic (derived from the run id, the plugin name,
//! the config hash, and the position), so the same settings resumed under
//! the same run id reproduce the same graph, which is what the checkpoint
//! compatibility check verifies. Gate `routes` and `branches` become the
//! graph's route-resolution map; `on_error` targets become divert edges.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use elspeth_core::ExecutionGraph;
use elspeth_core::GateRouteTarget;
use elspeth_core::GraphBuilder;
use elspeth_core::GraphNode;
use elspeth_core::NodeId;
use elspeth_core::NodeType;
use elspeth_core::RoutingMode;
use elspeth_core::RunId;
use elspeth_core::error_edge_label;
use elspeth_core::stable_hash;

use crate::settings::ConfigError;
use crate::settings::Settings;
use crate::settings::StepKind;

// ============================================================================
// SECTION: Layout
// ============================================================================

/// The planned graph plus the node-id map the engine binds plugins to.
#[derive(Debug, Clone)]
pub struct PipelineLayout {
    /// The validated execution graph.
    pub graph: ExecutionGraph,
    /// Source node id.
    pub source_node: NodeId,
    /// Step node ids by declared step name, in pipeline order.
    pub step_nodes: Vec<(String, NodeId)>,
    /// Sink node ids by declared sink name.
    pub sink_nodes: BTreeMap<String, NodeId>,
}

// ============================================================================
// SECTION: Planning
// ============================================================================

/// Maps a step kind to its node type.
const fn node_type_for(kind: StepKind) -> NodeType {
    match kind {
        StepKind::Transform => NodeType::Transform,
        StepKind::Gate => NodeType::Gate,
        StepKind::Aggregation => NodeType::Aggregation,
        StepKind::Coalesce => NodeType::Coalesce,
    }
}

/// Builds the execution graph and node map for a run.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] carrying every graph problem found.
#[allow(
    clippy::too_many_lines,
    reason = "Graph wiring is one linear pass mirroring the declared pipeline order."
)]
pub fn build_layout(run_id: &RunId, settings: &Settings) -> Result<PipelineLayout, ConfigError> {
    let hash_of = |config: &serde_json::Value| -> Result<String, ConfigError> {
        stable_hash(config).map_err(|err| ConfigError::Invalid { problems: vec![err.to_string()] })
    };

    let mut builder = GraphBuilder::new();
    let mut position: usize = 0;

    // Source.
    let source_hash = hash_of(&settings.pipeline.source.config)?;
    let source_node =
        NodeId::derive(run_id, &settings.pipeline.source.plugin, &source_hash, position);
    builder = builder.add_node(GraphNode {
        node_id: source_node.clone(),
        plugin_name: settings.pipeline.source.plugin.clone(),
        node_type: NodeType::Source,
        config: settings.pipeline.source.config.clone(),
        config_hash: source_hash,
    });

    // Steps.
    let mut step_nodes: Vec<(String, NodeId)> = Vec::new();
    for step in &settings.pipeline.steps {
        position += 1;
        let plugin_name = step.plugin.clone().unwrap_or_else(|| "coalesce".to_string());
        let config_hash = hash_of(&step.config)?;
        let node_id = NodeId::derive(run_id, &plugin_name, &config_hash, position);
        builder = builder.add_node(GraphNode {
            node_id: node_id.clone(),
            plugin_name,
            node_type: node_type_for(step.kind),
            config: step.config.clone(),
            config_hash,
        });
        step_nodes.push((step.name.clone(), node_id));
    }

    // Sinks.
    let mut sink_nodes: BTreeMap<String, NodeId> = BTreeMap::new();
    for (name, sink) in &settings.pipeline.sinks {
        position += 1;
        let config_hash = hash_of(&sink.config)?;
        let node_id = NodeId::derive(run_id, &sink.plugin, &config_hash, position);
        builder = builder.add_node(GraphNode {
            node_id: node_id.clone(),
            plugin_name: sink.plugin.clone(),
            node_type: NodeType::Sink,
            config: sink.config.clone(),
            config_hash,
        });
        builder = builder.declare_sink(name.clone(), node_id.clone());
        sink_nodes.insert(name.clone(), node_id);
    }

    // Spine: source -> steps -> default sink, all labeled "continue".
    let default_sink_node = sink_nodes.get(&settings.pipeline.default_sink).cloned();
    let mut previous = source_node.clone();
    for (_, node_id) in &step_nodes {
        builder = builder.add_edge(previous.clone(), node_id.clone(), "continue", RoutingMode::Move);
        previous = node_id.clone();
    }
    if let Some(default_node) = default_sink_node {
        builder = builder.add_edge(previous, default_node, "continue", RoutingMode::Move);
    }

    // Gate routes, fork branches, and error diverts.
    let step_id_of = |name: &str| -> Option<NodeId> {
        step_nodes
            .iter()
            .find(|(step_name, _)| step_name == name)
            .map(|(_, node_id)| node_id.clone())
    };
    for (step, (_, node_id)) in settings.pipeline.steps.iter().zip(&step_nodes) {
        if step.kind == StepKind::Gate {
            for (label, target) in &step.routes {
                let route_target = match target.as_str() {
                    "continue" => GateRouteTarget::Continue,
                    "fork" => GateRouteTarget::Fork,
                    other => match other.strip_prefix("step:") {
                        Some(step_name) => {
                            let Some(target_id) = step_id_of(step_name) else {
                                continue;
                            };
                            builder = builder.add_edge(
                                node_id.clone(),
                                target_id.clone(),
                                label.clone(),
                                RoutingMode::Move,
                            );
                            GateRouteTarget::Node { node_id: target_id }
                        }
                        None => {
                            let Some(sink_id) = sink_nodes.get(other).cloned() else {
                                continue;
                            };
                            builder = builder.add_edge(
                                node_id.clone(),
                                sink_id,
                                label.clone(),
                                RoutingMode::Move,
                            );
                            GateRouteTarget::Sink { sink_name: other.to_string() }
                        }
                    },
                };
                builder = builder.gate_route(node_id.clone(), label.clone(), route_target);
            }
            for (branch, target) in &step.branches {
                let target_id = match target.strip_prefix("step:") {
                    Some(step_name) => step_id_of(step_name),
                    None => sink_nodes.get(target).cloned(),
                };
                let Some(target_id) = target_id else {
                    continue;
                };
                builder = builder.add_edge(
                    node_id.clone(),
                    target_id,
                    branch.clone(),
                    RoutingMode::Copy,
                );
                builder = builder.gate_route(node_id.clone(), branch.clone(), GateRouteTarget::Fork);
            }
        }
        if let Some(on_error) = &step.on_error {
            if let Some(sink_id) = sink_nodes.get(on_error).cloned() {
                builder = builder.add_edge(
                    node_id.clone(),
                    sink_id,
                    error_edge_label(&step.name),
                    RoutingMode::Divert,
                );
            }
        }
    }

    let graph = builder.build().map_err(|err| match err {
        elspeth_core::GraphError::Invalid { problems } => ConfigError::Invalid { problems },
        other => ConfigError::Invalid { problems: vec![other.to_string()] },
    })?;

    Ok(PipelineLayout { graph, source_node, step_nodes, sink_nodes })
}
