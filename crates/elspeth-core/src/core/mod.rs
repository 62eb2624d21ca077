// elspeth-core/src/core/mod.rs
// ============================================================================
// Module: ELSPETH Core Types
// Description: Canonical identifiers, values, contracts, and audit records.
// Purpose: Provide stable, serializable types for the Landscape audit trail.
// Dependencies: bigdecimal, serde, serde_jcs, sha2, time
// ============================================================================

//! ## Overview
//! Core types define the data model of ELSPETH: identifiers, timestamps,
//! canonical hashing, typed data values, schema contracts, routing
//! primitives, and every audit record the Landscape stores. These types are
//! the canonical source of truth for any derived surface (CLI, MCP, or
//! exporters).

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod contract;
pub mod hashing;
pub mod identifiers;
pub mod records;
pub mod routing;
pub mod time;
pub mod value;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use contract::CompatibilityResult;
pub use contract::ContractError;
pub use contract::ContractMode;
pub use contract::FieldContract;
pub use contract::FieldSource;
pub use contract::FieldType;
pub use contract::SchemaContract;
pub use contract::TypeMismatch;
pub use contract::normalize_field_name;
pub use hashing::HashError;
pub use hashing::REPR_TRUNCATE_CHARS;
pub use hashing::ReprFallback;
pub use hashing::canonical_json_bytes;
pub use hashing::hash_bytes;
pub use hashing::repr_hash;
pub use hashing::stable_hash;
pub use identifiers::ArtifactId;
pub use identifiers::BatchId;
pub use identifiers::CallId;
pub use identifiers::CheckpointId;
pub use identifiers::GroupId;
pub use identifiers::NodeId;
pub use identifiers::RoutingEventId;
pub use identifiers::RowId;
pub use identifiers::RunId;
pub use identifiers::StateId;
pub use identifiers::TokenId;
pub use records::ArtifactRecord;
pub use records::BatchMember;
pub use records::BatchRecord;
pub use records::BatchStatus;
pub use records::CallRecord;
pub use records::CallStatus;
pub use records::CallType;
pub use records::CheckpointRecord;
pub use records::Determinism;
pub use records::EdgeRecord;
pub use records::ExecutionError;
pub use records::ExportStatus;
pub use records::NodeRecord;
pub use records::NodeState;
pub use records::NodeType;
pub use records::OutputMode;
pub use records::RoutingEventRecord;
pub use records::RowRecord;
pub use records::RunMode;
pub use records::RunRecord;
pub use records::RunStatus;
pub use records::StateEnvelope;
pub use records::SuccessReason;
pub use records::TokenOutcome;
pub use records::TokenOutcomeRecord;
pub use records::TokenParent;
pub use records::TokenRecord;
pub use records::TransformErrorReason;
pub use records::TransformErrorRecord;
pub use records::TriggerType;
pub use records::ValidationErrorRecord;
pub use routing::EdgeInfo;
pub use routing::RouteDestination;
pub use routing::RoutingAction;
pub use routing::RoutingError;
pub use routing::RoutingKind;
pub use routing::RoutingMode;
pub use routing::RoutingReason;
pub use routing::error_edge_label;
pub use time::TimeError;
pub use time::Timestamp;
pub use value::DataValue;
pub use value::PipelineRow;
pub use value::ValueError;
pub use value::ValueKind;
