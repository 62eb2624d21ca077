// elspeth-core/src/core/routing.rs
// ============================================================================
// Module: ELSPETH Routing Primitives
// Description: Flow-control actions, resolved destinations, and edge info.
// Purpose: Answer "where does this token go next?" with enforced invariants.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! Gates return a [`RoutingAction`]; the executor resolves its semantic
//! labels through the graph's route-resolution map into concrete
//! [`RouteDestination`]s. The factory constructors are the only way to build
//! actions, so the kind/mode/destination invariants hold by construction:
//!
//! - `Continue` has no destinations and uses `Move`.
//! - `Route` has exactly one destination; `Copy` is rejected (the audit
//!   model enforces a single terminal state per token; use a fork to route
//!   to a sink and keep processing).
//! - `ForkToPaths` always uses `Copy` and requires unique destinations.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::identifiers::NodeId;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when constructing routing actions or destinations.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// A fork was requested with no destination paths.
    #[error("fork_to_paths requires at least one destination path")]
    EmptyFork,
    /// A fork was requested with duplicate path names.
    #[error("fork_to_paths requires unique path names (duplicates: {0})")]
    DuplicateForkPaths(String),
}

// ============================================================================
// SECTION: Enums
// ============================================================================

/// Mode for routing edges and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Token exits its current path and goes to the destination only.
    Move,
    /// Token clones to the destination and continues on its current path.
    Copy,
    /// Token is diverted from normal flow to an error or quarantine sink.
    ///
    /// Structurally like `Move`, but semantically distinct: divert edges are
    /// markers in the DAG. Tokens reach them through error handling, never by
    /// normal routing, and the audit trail records that fact.
    Divert,
}

impl RoutingMode {
    /// Returns the stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::Copy => "copy",
            Self::Divert => "divert",
        }
    }
}

/// Kind of routing action returned by a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingKind {
    /// Continue to the next node in the pipeline.
    Continue,
    /// Route to a single labeled destination.
    Route,
    /// Fork copies of the token to multiple parallel paths.
    ForkToPaths,
}

// ============================================================================
// SECTION: Routing Reasons
// ============================================================================

/// Audit-trail explanation for a routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingReason {
    /// A configuration-defined gate condition fired.
    ConfigGate {
        /// The condition expression as configured.
        condition: String,
        /// The evaluated boolean result.
        result: bool,
    },
    /// A plugin-defined rule fired.
    PluginGate {
        /// Rule identifier inside the plugin.
        rule: String,
        /// The value that matched.
        matched_value: serde_json::Value,
        /// Optional threshold the value was compared against.
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<serde_json::Value>,
        /// Optional field the rule examined.
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        /// Optional comparison operator label.
        #[serde(skip_serializing_if = "Option::is_none")]
        comparison: Option<String>,
    },
}

// ============================================================================
// SECTION: Routing Action
// ============================================================================

/// A routing decision from a gate.
///
/// # Invariants
/// - `Continue` has empty destinations and `Move` mode.
/// - `Route` has exactly one destination and never `Copy` mode.
/// - `ForkToPaths` has at least one unique destination and `Copy` mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingAction {
    /// Action kind.
    kind: RoutingKind,
    /// Semantic route labels; resolved via the graph's route map.
    destinations: Vec<String>,
    /// Move or copy semantics.
    mode: RoutingMode,
    /// Optional audit-trail reason, owned by the action.
    reason: Option<RoutingReason>,
}

impl RoutingAction {
    /// Continues to the next node in the pipeline.
    #[must_use]
    pub const fn continue_(reason: Option<RoutingReason>) -> Self {
        Self {
            kind: RoutingKind::Continue,
            destinations: Vec::new(),
            mode: RoutingMode::Move,
            reason,
        }
    }

    /// Routes to a single labeled destination with `Move` semantics.
    ///
    /// Gates return semantic labels (for example `"above"`); the executor
    /// resolves them through the gate's `routes` configuration.
    #[must_use]
    pub fn route(label: impl Into<String>, reason: Option<RoutingReason>) -> Self {
        Self {
            kind: RoutingKind::Route,
            destinations: vec![label.into()],
            mode: RoutingMode::Move,
            reason,
        }
    }

    /// Forks the token to multiple parallel paths (always copy mode).
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError`] when `paths` is empty or contains duplicates.
    pub fn fork_to_paths(
        paths: Vec<String>,
        reason: Option<RoutingReason>,
    ) -> Result<Self, RoutingError> {
        if paths.is_empty() {
            return Err(RoutingError::EmptyFork);
        }
        let mut seen = std::collections::BTreeSet::new();
        let mut duplicates = std::collections::BTreeSet::new();
        for path in &paths {
            if !seen.insert(path.clone()) {
                duplicates.insert(path.clone());
            }
        }
        if !duplicates.is_empty() {
            let rendered: Vec<String> = duplicates.into_iter().collect();
            return Err(RoutingError::DuplicateForkPaths(rendered.join(", ")));
        }
        Ok(Self {
            kind: RoutingKind::ForkToPaths,
            destinations: paths,
            mode: RoutingMode::Copy,
            reason,
        })
    }

    /// Returns the action kind.
    #[must_use]
    pub const fn kind(&self) -> RoutingKind {
        self.kind
    }

    /// Returns the semantic destination labels.
    #[must_use]
    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    /// Returns the routing mode.
    #[must_use]
    pub const fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// Returns the audit-trail reason, if any.
    #[must_use]
    pub const fn reason(&self) -> Option<&RoutingReason> {
        self.reason.as_ref()
    }
}

// ============================================================================
// SECTION: Route Destination
// ============================================================================

/// Resolved destination for a `(gate node, route label)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteDestination {
    /// Continue to the gate's downstream node.
    Continue,
    /// The label is a fork branch; child tokens follow the branch edge.
    Fork,
    /// Route terminates at a named sink.
    Sink {
        /// Declared sink name.
        sink_name: String,
    },
    /// Route re-enters the pipeline at a processing node.
    ProcessingNode {
        /// Identifier of the next node.
        next_node_id: NodeId,
    },
}

// ============================================================================
// SECTION: Edge Info
// ============================================================================

/// Information about one labeled edge in the execution graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeInfo {
    /// Source node id.
    pub from_node: NodeId,
    /// Target node id.
    pub to_node: NodeId,
    /// Edge label (`"continue"`, a branch name, or an error label).
    pub label: String,
    /// Default traversal mode for the edge.
    pub mode: RoutingMode,
}

/// Canonical label for a transform's error divert edge.
///
/// Shared between graph construction and error-routing audit recording so
/// the label never drifts between the two.
#[must_use]
pub fn error_edge_label(transform_name: &str) -> String {
    format!("__error_{transform_name}__")
}
