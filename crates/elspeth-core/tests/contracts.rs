// elspeth-core/tests/contracts.rs
// ============================================================================
// Module: Schema Contract Tests
// Description: Tests for field normalization, resolution, and compatibility.
// ============================================================================
//! ## Overview
//! Validates name normalization and collision reporting, dual-form name
//! resolution, producer/consumer compatibility rules, observed-contract
//! inference, and order-independent hashing.

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

use std::collections::BTreeMap;

use elspeth_core::ContractError;
use elspeth_core::ContractMode;
use elspeth_core::DataValue;
use elspeth_core::FieldContract;
use elspeth_core::FieldSource;
use elspeth_core::FieldType;
use elspeth_core::SchemaContract;
use elspeth_core::ValueKind;
use elspeth_core::normalize_field_name;

/// Builds a declared field.
fn field(original: &str, kind: ValueKind, required: bool) -> FieldContract {
    FieldContract {
        normalized_name: normalize_field_name(original),
        original_name: original.to_string(),
        field_type: FieldType { kind, nullable: false },
        required,
        source: FieldSource::Declared,
    }
}

// ============================================================================
// SECTION: Normalization
// ============================================================================

/// Tests normalization lowercases and collapses separators.
#[test]
fn test_normalize_field_name() {
    assert_eq!(normalize_field_name("Total Amount"), "total_amount");
    assert_eq!(normalize_field_name("  spaced  out  "), "spaced_out");
    assert_eq!(normalize_field_name("already_normal"), "already_normal");
    assert_eq!(normalize_field_name("Mixed-Case.Name"), "mixed_case_name");
}

/// Tests every normalization collision is listed, not just the first.
#[test]
fn test_collisions_all_reported() {
    let result = SchemaContract::new(
        ContractMode::Fixed,
        vec![
            field("Total Amount", ValueKind::Integer, true),
            field("total_amount", ValueKind::Integer, true),
            field("User Id", ValueKind::Text, true),
            field("user-id", ValueKind::Text, true),
        ],
    );

    let Err(ContractError::NameCollisions(message)) = result else {
        panic!("expected collision error");
    };
    assert!(message.contains("total_amount"));
    assert!(message.contains("user_id"));
}

// ============================================================================
// SECTION: Name Resolution
// ============================================================================

/// Tests resolution accepts both original and normalized spellings.
#[test]
fn test_resolve_name_both_forms() {
    let contract = SchemaContract::new(
        ContractMode::Flexible,
        vec![field("Total Amount", ValueKind::Integer, true)],
    )
    .unwrap();

    assert_eq!(contract.resolve_name("Total Amount").as_ref(), "total_amount");
    assert_eq!(contract.resolve_name("total_amount").as_ref(), "total_amount");
    assert_eq!(contract.resolve_name("Unknown Field").as_ref(), "unknown_field");
}

// ============================================================================
// SECTION: Compatibility
// ============================================================================

/// Tests missing required fields are reported.
#[test]
fn test_compatibility_missing_required() {
    let producer =
        SchemaContract::new(ContractMode::Fixed, vec![field("id", ValueKind::Integer, true)])
            .unwrap();
    let consumer = SchemaContract::new(
        ContractMode::Fixed,
        vec![
            field("id", ValueKind::Integer, true),
            field("amount", ValueKind::Float, true),
        ],
    )
    .unwrap();

    let result = producer.is_compatible_with(&consumer);
    assert!(!result.compatible());
    assert_eq!(result.missing_fields, vec!["amount".to_string()]);
}

/// Tests an optional consumer field may be absent.
#[test]
fn test_compatibility_optional_consumer_field() {
    let producer =
        SchemaContract::new(ContractMode::Fixed, vec![field("id", ValueKind::Integer, true)])
            .unwrap();
    let consumer = SchemaContract::new(
        ContractMode::Fixed,
        vec![
            field("id", ValueKind::Integer, true),
            field("note", ValueKind::Text, false),
        ],
    )
    .unwrap();

    assert!(producer.is_compatible_with(&consumer).compatible());
}

/// Tests integer producers satisfy float consumers.
#[test]
fn test_compatibility_integer_widens_to_float() {
    let producer =
        SchemaContract::new(ContractMode::Fixed, vec![field("amount", ValueKind::Integer, true)])
            .unwrap();
    let consumer =
        SchemaContract::new(ContractMode::Fixed, vec![field("amount", ValueKind::Float, true)])
            .unwrap();

    assert!(producer.is_compatible_with(&consumer).compatible());
}

/// Tests `Any` on the consumer side accepts every producer kind.
#[test]
fn test_compatibility_any_accepts_all() {
    let producer =
        SchemaContract::new(ContractMode::Fixed, vec![field("blob", ValueKind::Json, true)])
            .unwrap();
    let consumer =
        SchemaContract::new(ContractMode::Fixed, vec![field("blob", ValueKind::Any, true)])
            .unwrap();

    assert!(producer.is_compatible_with(&consumer).compatible());
}

/// Tests nullable producers are rejected by non-nullable consumers.
#[test]
fn test_compatibility_nullable_producer_rejected() {
    let mut nullable = field("amount", ValueKind::Integer, true);
    nullable.field_type = FieldType { kind: ValueKind::Integer, nullable: true };
    let producer = SchemaContract::new(ContractMode::Fixed, vec![nullable]).unwrap();
    let consumer =
        SchemaContract::new(ContractMode::Fixed, vec![field("amount", ValueKind::Integer, true)])
            .unwrap();

    let result = producer.is_compatible_with(&consumer);
    assert_eq!(result.type_mismatches.len(), 1);
    assert_eq!(result.type_mismatches[0].field, "amount");
}

/// Tests a non-nullable producer satisfies a nullable consumer.
#[test]
fn test_compatibility_consumer_side_nullable_accepts() {
    let producer =
        SchemaContract::new(ContractMode::Fixed, vec![field("amount", ValueKind::Integer, true)])
            .unwrap();
    let mut nullable = field("amount", ValueKind::Integer, true);
    nullable.field_type = FieldType { kind: ValueKind::Integer, nullable: true };
    let consumer = SchemaContract::new(ContractMode::Fixed, vec![nullable]).unwrap();

    assert!(producer.is_compatible_with(&consumer).compatible());
}

/// Tests the error message lists every problem class.
#[test]
fn test_compatibility_error_message_lists_all() {
    let producer =
        SchemaContract::new(ContractMode::Fixed, vec![field("amount", ValueKind::Text, true)])
            .unwrap();
    let consumer = SchemaContract::new(
        ContractMode::Fixed,
        vec![
            field("amount", ValueKind::Integer, true),
            field("id", ValueKind::Integer, true),
        ],
    )
    .unwrap();

    let message = producer.is_compatible_with(&consumer).error_message().unwrap();
    assert!(message.contains("missing fields: id"));
    assert!(message.contains("type mismatches"));
    assert!(message.contains("amount"));
}

// ============================================================================
// SECTION: Observation
// ============================================================================

/// Tests observed contracts carry the union of keys across rows.
#[test]
fn test_observe_union_of_keys() {
    let mut first = BTreeMap::new();
    first.insert("id".to_string(), DataValue::Integer(1));
    let mut second = BTreeMap::new();
    second.insert("id".to_string(), DataValue::Integer(2));
    second.insert("copy_index".to_string(), DataValue::Integer(0));

    let contract = SchemaContract::observe([&first, &second]);

    assert!(contract.get_field("id").is_some());
    let copy_index = contract.get_field("copy_index").unwrap();
    assert!(!copy_index.required);
    assert_eq!(contract.get_field("id").unwrap().required, true);
}

/// Tests conflicting observed kinds widen to Any.
#[test]
fn test_observe_conflicting_kinds_widen() {
    let mut first = BTreeMap::new();
    first.insert("value".to_string(), DataValue::Integer(1));
    let mut second = BTreeMap::new();
    second.insert("value".to_string(), DataValue::Text("two".to_string()));

    let contract = SchemaContract::observe([&first, &second]);

    assert_eq!(contract.get_field("value").unwrap().field_type.kind, ValueKind::Any);
}

// ============================================================================
// SECTION: Hashing
// ============================================================================

/// Tests the contract hash is independent of declaration order.
#[test]
fn test_contract_hash_order_independent() {
    let forward = SchemaContract::new(
        ContractMode::Fixed,
        vec![
            field("id", ValueKind::Integer, true),
            field("amount", ValueKind::Float, true),
        ],
    )
    .unwrap();
    let backward = SchemaContract::new(
        ContractMode::Fixed,
        vec![
            field("amount", ValueKind::Float, true),
            field("id", ValueKind::Integer, true),
        ],
    )
    .unwrap();

    assert_eq!(forward.contract_hash().unwrap(), backward.contract_hash().unwrap());
}
