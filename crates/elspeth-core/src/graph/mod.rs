// elspeth-core/src/graph/mod.rs
// ============================================================================
// Module: ELSPETH Execution Graph
// Description: Typed multigraph of pipeline nodes with route resolution.
// Purpose: Validate topology at construction and hash upstream subgraphs.
// Dependencies: serde, crate::core
// ============================================================================

//! ## Overview
//! The execution graph is a directed multigraph: typed nodes joined by
//! labeled edges keyed `(from, to, label)`, so parallel edges exist. The
//! builder combines gate `routes` configuration with declared sinks and
//! discovered fork targets into a route-resolution map, then validates
//! completeness: every configured `(gate, label)` must resolve, every fork
//! branch name must be globally unique across gates, and cycles are
//! rejected. Errors surface at graph construction, never at runtime, and
//! every problem is listed, not just the first.
//!
//! A per-node topology hash covers the transitive upstream subgraph plus
//! node config hashes; the checkpoint compatibility check depends on it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::hashing;
use crate::core::hashing::HashError;
use crate::core::identifiers::NodeId;
use crate::core::records::NodeType;
use crate::core::routing::EdgeInfo;
use crate::core::routing::RouteDestination;
use crate::core::routing::RoutingMode;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised during graph construction or inspection.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The graph failed validation; every problem is listed.
    #[error("execution graph is invalid:\n  - {}", problems.join("\n  - "))]
    Invalid {
        /// All validation problems found.
        problems: Vec<String>,
    },
    /// A node id was not found in the graph.
    #[error("unknown node: {0}")]
    UnknownNode(String),
    /// Topology hashing failed.
    #[error(transparent)]
    Hash(#[from] HashError),
}

// ============================================================================
// SECTION: Node Info
// ============================================================================

/// A typed node in the execution graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Node identifier.
    pub node_id: NodeId,
    /// Plugin name for diagnostics.
    pub plugin_name: String,
    /// Node type.
    pub node_type: NodeType,
    /// Node configuration.
    pub config: Value,
    /// Stable hash of the node configuration.
    pub config_hash: String,
}

/// A configured route target for one gate label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateRouteTarget {
    /// Continue to the gate's downstream node.
    Continue,
    /// The label is a fork branch carried by a copy edge.
    Fork,
    /// Route to a declared sink.
    Sink {
        /// Declared sink name.
        sink_name: String,
    },
    /// Route to a specific processing node.
    Node {
        /// Target node identifier.
        node_id: NodeId,
    },
}

// ============================================================================
// SECTION: Graph Builder
// ============================================================================

/// Builder that accumulates nodes, edges, sinks, and gate routes.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    /// Nodes keyed by id.
    nodes: BTreeMap<NodeId, GraphNode>,
    /// Edges keyed by `(from, to, label)`.
    edges: BTreeMap<(NodeId, NodeId, String), EdgeInfo>,
    /// Declared sinks: name to node id.
    sinks: BTreeMap<String, NodeId>,
    /// Gate route configuration: `(gate, label)` to target.
    gate_routes: BTreeMap<(NodeId, String), GateRouteTarget>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node.
    #[must_use]
    pub fn add_node(mut self, node: GraphNode) -> Self {
        self.nodes.insert(node.node_id.clone(), node);
        self
    }

    /// Adds a labeled edge with a default traversal mode.
    #[must_use]
    pub fn add_edge(
        mut self,
        from: NodeId,
        to: NodeId,
        label: impl Into<String>,
        mode: RoutingMode,
    ) -> Self {
        let label = label.into();
        let info = EdgeInfo {
            from_node: from.clone(),
            to_node: to.clone(),
            label: label.clone(),
            mode,
        };
        self.edges.insert((from, to, label), info);
        self
    }

    /// Declares a named sink node.
    #[must_use]
    pub fn declare_sink(mut self, name: impl Into<String>, node_id: NodeId) -> Self {
        self.sinks.insert(name.into(), node_id);
        self
    }

    /// Configures one gate route label.
    #[must_use]
    pub fn gate_route(
        mut self,
        gate: NodeId,
        label: impl Into<String>,
        target: GateRouteTarget,
    ) -> Self {
        self.gate_routes.insert((gate, label.into()), target);
        self
    }

    /// Validates the accumulated topology and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Invalid`] listing every problem found: edges
    /// referencing unknown nodes, sinks declared on non-sink nodes, routes
    /// to unknown sinks or nodes, unresolved `(gate, label)` pairs, fork
    /// branch names reused across gates, and cycles.
    #[allow(
        clippy::too_many_lines,
        reason = "Validation deliberately reports every problem in one linear pass."
    )]
    pub fn build(self) -> Result<ExecutionGraph, GraphError> {
        let mut problems: Vec<String> = Vec::new();

        for ((from, to, label), _) in &self.edges {
            if !self.nodes.contains_key(from) {
                problems.push(format!("edge '{label}' references unknown from-node {from}"));
            }
            if !self.nodes.contains_key(to) {
                problems.push(format!("edge '{label}' references unknown to-node {to}"));
            }
        }

        for (name, node_id) in &self.sinks {
            match self.nodes.get(node_id) {
                None => problems.push(format!("sink '{name}' references unknown node {node_id}")),
                Some(node) if node.node_type != NodeType::Sink => problems.push(format!(
                    "sink '{name}' references node {node_id} of type {}",
                    node.node_type.as_str()
                )),
                Some(_) => {}
            }
        }

        // Fork branch names must be globally unique across all gates.
        let mut branch_owners: BTreeMap<String, NodeId> = BTreeMap::new();
        for info in self.edges.values() {
            let Some(from) = self.nodes.get(&info.from_node) else {
                continue;
            };
            if from.node_type == NodeType::Gate && info.mode == RoutingMode::Copy {
                if let Some(owner) = branch_owners.get(&info.label) {
                    if owner != &info.from_node {
                        problems.push(format!(
                            "fork branch name '{}' is used by both {owner} and {}",
                            info.label, info.from_node
                        ));
                    }
                } else {
                    branch_owners.insert(info.label.clone(), info.from_node.clone());
                }
            }
        }

        // Resolve every configured (gate, label) into a concrete destination.
        let mut route_map: BTreeMap<(NodeId, String), RouteDestination> = BTreeMap::new();
        for ((gate, label), target) in &self.gate_routes {
            match self.nodes.get(gate) {
                None => {
                    problems.push(format!("route '{label}' configured for unknown gate {gate}"));
                    continue;
                }
                Some(node) if node.node_type != NodeType::Gate => {
                    problems.push(format!(
                        "route '{label}' configured for non-gate node {gate} ({})",
                        node.node_type.as_str()
                    ));
                    continue;
                }
                Some(_) => {}
            }
            let destination = match target {
                GateRouteTarget::Continue => {
                    let has_continue = self
                        .edges
                        .values()
                        .any(|edge| edge.from_node == *gate && edge.label == "continue");
                    if !has_continue {
                        problems.push(format!(
                            "gate {gate} route '{label}' is 'continue' but the gate has no continue edge"
                        ));
                        continue;
                    }
                    RouteDestination::Continue
                }
                GateRouteTarget::Fork => {
                    let has_branch = self.edges.values().any(|edge| {
                        edge.from_node == *gate
                            && edge.label == *label
                            && edge.mode == RoutingMode::Copy
                    });
                    if !has_branch {
                        problems.push(format!(
                            "gate {gate} route '{label}' is a fork branch with no matching copy edge"
                        ));
                        continue;
                    }
                    RouteDestination::Fork
                }
                GateRouteTarget::Sink { sink_name } => {
                    if self.sinks.contains_key(sink_name) {
                        RouteDestination::Sink { sink_name: sink_name.clone() }
                    } else {
                        problems.push(format!(
                            "gate {gate} route '{label}' targets unknown sink '{sink_name}'"
                        ));
                        continue;
                    }
                }
                GateRouteTarget::Node { node_id } => {
                    if self.nodes.contains_key(node_id) {
                        RouteDestination::ProcessingNode { next_node_id: node_id.clone() }
                    } else {
                        problems.push(format!(
                            "gate {gate} route '{label}' targets unknown node {node_id}"
                        ));
                        continue;
                    }
                }
            };
            route_map.insert((gate.clone(), label.clone()), destination);
        }

        // Cycle detection over non-divert edges (Kahn's algorithm).
        let mut indegree: BTreeMap<&NodeId, usize> =
            self.nodes.keys().map(|id| (id, 0)).collect();
        for info in self.edges.values() {
            if info.mode != RoutingMode::Divert {
                if let Some(count) = indegree.get_mut(&info.to_node) {
                    *count += 1;
                }
            }
        }
        let mut queue: VecDeque<&NodeId> = indegree
            .iter()
            .filter_map(|(id, count)| (*count == 0).then_some(*id))
            .collect();
        let mut visited = 0_usize;
        while let Some(node_id) = queue.pop_front() {
            visited += 1;
            for info in self.edges.values() {
                if info.mode != RoutingMode::Divert && &info.from_node == node_id {
                    if let Some(count) = indegree.get_mut(&info.to_node) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(&info.to_node);
                        }
                    }
                }
            }
        }
        if visited != self.nodes.len() {
            problems.push("graph contains a cycle".to_string());
        }

        if problems.is_empty() {
            Ok(ExecutionGraph {
                nodes: self.nodes,
                edges: self.edges,
                sinks: self.sinks,
                route_map,
            })
        } else {
            Err(GraphError::Invalid { problems })
        }
    }
}

// ============================================================================
// SECTION: Execution Graph
// ============================================================================

/// A validated execution graph.
///
/// # Invariants
/// - Every route-map entry resolves to an existing destination.
/// - Fork branch names are globally unique across gates.
/// - The non-divert edge set is acyclic.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    /// Nodes keyed by id.
    nodes: BTreeMap<NodeId, GraphNode>,
    /// Edges keyed by `(from, to, label)`.
    edges: BTreeMap<(NodeId, NodeId, String), EdgeInfo>,
    /// Declared sinks: name to node id.
    sinks: BTreeMap<String, NodeId>,
    /// Route resolution map: `(gate, label)` to destination.
    route_map: BTreeMap<(NodeId, String), RouteDestination>,
}

impl Default for ExecutionGraph {
    fn default() -> Self {
        Self::empty()
    }
}

impl ExecutionGraph {
    /// Returns an empty graph (placeholder before a plan is loaded).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            sinks: BTreeMap::new(),
            route_map: BTreeMap::new(),
        }
    }

    /// Returns true when the node exists.
    #[must_use]
    pub fn has_node(&self, node_id: &NodeId) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Returns node info by id.
    #[must_use]
    pub fn get_node_info(&self, node_id: &NodeId) -> Option<&GraphNode> {
        self.nodes.get(node_id)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Returns all edges.
    #[must_use]
    pub fn get_edges(&self) -> Vec<EdgeInfo> {
        self.edges.values().cloned().collect()
    }

    /// Returns edges leaving a node, sorted by `(to, label)`.
    #[must_use]
    pub fn outgoing(&self, node_id: &NodeId) -> Vec<&EdgeInfo> {
        self.edges.values().filter(|edge| &edge.from_node == node_id).collect()
    }

    /// Returns the single `continue` successor of a node, if present.
    #[must_use]
    pub fn continue_target(&self, node_id: &NodeId) -> Option<&NodeId> {
        self.edges
            .values()
            .find(|edge| &edge.from_node == node_id && edge.label == "continue")
            .map(|edge| &edge.to_node)
    }

    /// Resolves a `(gate, label)` pair to a destination.
    #[must_use]
    pub fn resolve_route(&self, gate: &NodeId, label: &str) -> Option<&RouteDestination> {
        self.route_map.get(&(gate.clone(), label.to_string()))
    }

    /// Returns the map from fork branch name to the branch's target node.
    #[must_use]
    pub fn branch_target_map(&self) -> BTreeMap<String, NodeId> {
        let mut map = BTreeMap::new();
        for info in self.edges.values() {
            let is_gate = self
                .nodes
                .get(&info.from_node)
                .is_some_and(|node| node.node_type == NodeType::Gate);
            if is_gate && info.mode == RoutingMode::Copy {
                map.insert(info.label.clone(), info.to_node.clone());
            }
        }
        map
    }

    /// Returns the map from fork branch name to a sink name, where branches
    /// lead directly to declared sinks.
    #[must_use]
    pub fn branch_to_sink_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for (branch, target) in self.branch_target_map() {
            for (sink_name, sink_node) in &self.sinks {
                if sink_node == &target {
                    map.insert(branch.clone(), sink_name.clone());
                }
            }
        }
        map
    }

    /// Returns the map from declared sink name to its node id.
    #[must_use]
    pub const fn terminal_sink_map(&self) -> &BTreeMap<String, NodeId> {
        &self.sinks
    }

    /// Returns the stable edge identifier for an edge.
    #[must_use]
    pub fn edge_id(edge: &EdgeInfo) -> String {
        format!("{}->{}:{}", edge.from_node, edge.to_node, edge.label)
    }

    /// Computes the topology hash of the transitive upstream subgraph of a
    /// node, including the node itself and all node config hashes.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownNode`] for unknown nodes and
    /// [`GraphError::Hash`] when canonicalization fails.
    pub fn upstream_topology_hash(&self, node_id: &NodeId) -> Result<String, GraphError> {
        if !self.nodes.contains_key(node_id) {
            return Err(GraphError::UnknownNode(node_id.to_string()));
        }

        // Transitive closure over incoming edges.
        let mut members: BTreeSet<NodeId> = BTreeSet::new();
        let mut frontier: VecDeque<NodeId> = VecDeque::new();
        members.insert(node_id.clone());
        frontier.push_back(node_id.clone());
        while let Some(current) = frontier.pop_front() {
            for info in self.edges.values() {
                if info.to_node == current && !members.contains(&info.from_node) {
                    members.insert(info.from_node.clone());
                    frontier.push_back(info.from_node.clone());
                }
            }
        }

        let mut node_entries: Vec<(String, String)> = Vec::new();
        for member in &members {
            if let Some(node) = self.nodes.get(member) {
                node_entries.push((member.to_string(), node.config_hash.clone()));
            }
        }
        let mut edge_entries: Vec<(String, String, String, String)> = Vec::new();
        for info in self.edges.values() {
            if members.contains(&info.from_node) && members.contains(&info.to_node) {
                edge_entries.push((
                    info.from_node.to_string(),
                    info.to_node.to_string(),
                    info.label.clone(),
                    info.mode.as_str().to_string(),
                ));
            }
        }

        let material = serde_json::json!({
            "target": node_id.as_str(),
            "nodes": node_entries,
            "edges": edge_entries,
        });
        Ok(hashing::stable_hash(&material)?)
    }
}
