// elspeth-core/tests/routing.rs
// ============================================================================
// Module: Routing Primitive Tests
// Description: Tests for routing action invariants and destinations.
// ============================================================================
//! ## Overview
//! Validates the constructor-enforced invariants: continue has no
//! destinations, route is single-destination move-only, and forks require
//! unique non-empty path sets.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use elspeth_core::RoutingAction;
use elspeth_core::RoutingError;
use elspeth_core::RoutingKind;
use elspeth_core::RoutingMode;
use elspeth_core::RoutingReason;
use elspeth_core::error_edge_label;

// ============================================================================
// SECTION: Constructors
// ============================================================================

/// Tests continue carries no destinations and move semantics.
#[test]
fn test_continue_shape() {
    let action = RoutingAction::continue_(None);
    assert_eq!(action.kind(), RoutingKind::Continue);
    assert!(action.destinations().is_empty());
    assert_eq!(action.mode(), RoutingMode::Move);
}

/// Tests route carries exactly one destination and move semantics.
#[test]
fn test_route_shape() {
    let action = RoutingAction::route("above", None);
    assert_eq!(action.kind(), RoutingKind::Route);
    assert_eq!(action.destinations(), ["above".to_string()]);
    assert_eq!(action.mode(), RoutingMode::Move);
}

/// Tests forks always copy and keep their destination order.
#[test]
fn test_fork_shape() {
    let action = RoutingAction::fork_to_paths(
        vec!["alpha".to_string(), "beta".to_string()],
        None,
    )
    .unwrap();
    assert_eq!(action.kind(), RoutingKind::ForkToPaths);
    assert_eq!(action.mode(), RoutingMode::Copy);
    assert_eq!(action.destinations().len(), 2);
}

/// Tests empty forks are rejected.
#[test]
fn test_fork_empty_rejected() {
    let result = RoutingAction::fork_to_paths(Vec::new(), None);
    assert!(matches!(result, Err(RoutingError::EmptyFork)));
}

/// Tests duplicate fork paths are rejected and named.
#[test]
fn test_fork_duplicates_rejected() {
    let result = RoutingAction::fork_to_paths(
        vec!["alpha".to_string(), "alpha".to_string(), "beta".to_string()],
        None,
    );
    let Err(RoutingError::DuplicateForkPaths(message)) = result else {
        panic!("expected duplicate fork error");
    };
    assert!(message.contains("alpha"));
}

// ============================================================================
// SECTION: Reasons
// ============================================================================

/// Tests the reason is owned by the action and round-trips serde.
#[test]
fn test_reason_round_trip() {
    let reason = RoutingReason::PluginGate {
        rule: "amount_threshold".to_string(),
        matched_value: serde_json::json!(200),
        threshold: Some(serde_json::json!(150)),
        field: Some("amount".to_string()),
        comparison: Some(">".to_string()),
    };
    let action = RoutingAction::route("above", Some(reason.clone()));
    assert_eq!(action.reason(), Some(&reason));

    let encoded = serde_json::to_string(&reason).unwrap();
    let decoded: RoutingReason = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, reason);
}

// ============================================================================
// SECTION: Labels
// ============================================================================

/// Tests the error edge label is stable between construction and audit.
#[test]
fn test_error_edge_label() {
    assert_eq!(error_edge_label("enrich"), "__error_enrich__");
}
