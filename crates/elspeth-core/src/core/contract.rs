// elspeth-core/src/core/contract.rs
// ============================================================================
// Module: ELSPETH Schema Contracts
// Description: Locked field contracts carried alongside pipeline rows.
// Purpose: Resolve field names, check producer/consumer compatibility, hash schemas.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! A [`SchemaContract`] is the locked description of the fields a node
//! produces or consumes: normalized and original spellings, value types,
//! requiredness, and whether each field was declared or inferred. Contracts
//! travel with rows (see [`crate::core::value::PipelineRow`]) and downstream
//! components resolve field names exclusively through them.
//!
//! Contract hashes are order-independent: two contracts with the same fields
//! in different declaration orders hash identically.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::hashing;
use crate::core::hashing::HashError;
use crate::core::value::DataValue;
use crate::core::value::ValueKind;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when constructing schema contracts.
#[derive(Debug, Error)]
pub enum ContractError {
    /// Two or more original field names normalize to the same name.
    ///
    /// Every collision is listed so callers can fix them all at once.
    #[error("field name normalization collisions: {0}")]
    NameCollisions(String),
}

// ============================================================================
// SECTION: Field Model
// ============================================================================

/// Whether a field was declared by configuration or inferred from data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// Declared in plugin or pipeline configuration.
    Declared,
    /// Inferred by observing produced rows.
    Inferred,
}

/// The type of a contract field: a value kind plus nullability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldType {
    /// Base value kind.
    pub kind: ValueKind,
    /// Whether null is an acceptable value.
    pub nullable: bool,
}

impl FieldType {
    /// Creates a non-nullable field type.
    #[must_use]
    pub const fn required(kind: ValueKind) -> Self {
        Self { kind, nullable: false }
    }

    /// Creates a nullable field type.
    #[must_use]
    pub const fn nullable(kind: ValueKind) -> Self {
        Self { kind, nullable: true }
    }

    /// Returns true when a producer of this type satisfies the consumer type.
    ///
    /// Rules: exact kinds match; `Any` on the consumer side accepts all;
    /// `Integer` producers satisfy `Float` consumers; a nullable producer
    /// only satisfies a nullable consumer.
    #[must_use]
    pub const fn accepted_by(&self, consumer: &Self) -> bool {
        if self.nullable && !consumer.nullable {
            return false;
        }
        match (self.kind, consumer.kind) {
            (_, ValueKind::Any) | (ValueKind::Integer, ValueKind::Float) => true,
            (producer, wanted) => producer as u8 == wanted as u8,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable {
            write!(f, "{} | null", self.kind)
        } else {
            self.kind.fmt(f)
        }
    }
}

/// One field of a schema contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldContract {
    /// Normalized field name used as the storage key.
    pub normalized_name: String,
    /// Original field name as written by the producer.
    pub original_name: String,
    /// Field type.
    pub field_type: FieldType,
    /// Whether consumers may rely on the field being present.
    pub required: bool,
    /// Declared or inferred provenance.
    pub source: FieldSource,
}

// ============================================================================
// SECTION: Name Normalization
// ============================================================================

/// Normalizes a field name: lowercase, non-alphanumeric runs become `_`.
///
/// Leading and trailing separators are trimmed so `" Total Amount "` and
/// `"total_amount"` normalize identically.
#[must_use]
pub fn normalize_field_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    out
}

// ============================================================================
// SECTION: Contract Mode
// ============================================================================

/// How strictly a contract constrains row shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractMode {
    /// Rows carry exactly the declared fields.
    Fixed,
    /// Rows carry at least the declared fields; extras pass through.
    Flexible,
    /// Contract was inferred by observing rows.
    Observed,
}

// ============================================================================
// SECTION: Schema Contract
// ============================================================================

/// A locked set of field contracts with a strictness mode.
///
/// # Invariants
/// - Normalized field names are unique.
/// - Fields are stored sorted by normalized name, so iteration order and
///   the contract hash are independent of declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaContract {
    /// Contract strictness mode.
    mode: ContractMode,
    /// Fields keyed by normalized name.
    fields: BTreeMap<String, FieldContract>,
}

impl SchemaContract {
    /// Creates a contract from declared fields.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::NameCollisions`] listing every pair of
    /// original names that normalize to the same key.
    pub fn new(mode: ContractMode, fields: Vec<FieldContract>) -> Result<Self, ContractError> {
        let mut keyed: BTreeMap<String, FieldContract> = BTreeMap::new();
        let mut collisions: Vec<String> = Vec::new();
        for field in fields {
            if let Some(existing) = keyed.get(&field.normalized_name) {
                collisions.push(format!(
                    "'{}' and '{}' both normalize to '{}'",
                    existing.original_name, field.original_name, field.normalized_name
                ));
            } else {
                keyed.insert(field.normalized_name.clone(), field);
            }
        }
        if collisions.is_empty() {
            Ok(Self { mode, fields: keyed })
        } else {
            Err(ContractError::NameCollisions(collisions.join("; ")))
        }
    }

    /// Creates an empty observed-mode contract.
    #[must_use]
    pub const fn empty_observed() -> Self {
        Self { mode: ContractMode::Observed, fields: BTreeMap::new() }
    }

    /// Builds an observed contract from the union of fields across rows.
    ///
    /// Every key present in any row appears in the contract. A field absent
    /// from some rows is optional; conflicting kinds widen to `Any`; fields
    /// that are null everywhere observe as nullable `Json`.
    #[must_use]
    pub fn observe<'a, I>(rows: I) -> Self
    where
        I: IntoIterator<Item = &'a BTreeMap<String, DataValue>>,
    {
        let mut fields: BTreeMap<String, FieldContract> = BTreeMap::new();
        let mut row_count: usize = 0;
        let mut seen_counts: BTreeMap<String, usize> = BTreeMap::new();
        for row in rows {
            row_count += 1;
            for (name, value) in row {
                *seen_counts.entry(name.clone()).or_insert(0) += 1;
                let observed_kind = value.kind();
                let entry = fields.entry(name.clone()).or_insert_with(|| FieldContract {
                    normalized_name: name.clone(),
                    original_name: name.clone(),
                    field_type: FieldType {
                        kind: observed_kind,
                        nullable: value.is_null(),
                    },
                    required: true,
                    source: FieldSource::Inferred,
                });
                if value.is_null() {
                    entry.field_type.nullable = true;
                } else if entry.field_type.kind != observed_kind {
                    entry.field_type.kind = ValueKind::Any;
                }
            }
        }
        for (name, field) in &mut fields {
            if seen_counts.get(name).copied().unwrap_or(0) < row_count {
                field.required = false;
            }
        }
        Self { mode: ContractMode::Observed, fields }
    }

    /// Returns the contract mode.
    #[must_use]
    pub const fn mode(&self) -> ContractMode {
        self.mode
    }

    /// Resolves a field name written in either form to its normalized form.
    ///
    /// Known normalized names pass through; known original names map to
    /// their normalized key; unknown names normalize mechanically so lookups
    /// stay predictable for flexible contracts.
    #[must_use]
    pub fn resolve_name<'a>(&self, name: &'a str) -> Cow<'a, str> {
        if self.fields.contains_key(name) {
            return Cow::Borrowed(name);
        }
        for field in self.fields.values() {
            if field.original_name == name {
                return Cow::Owned(field.normalized_name.clone());
            }
        }
        Cow::Owned(normalize_field_name(name))
    }

    /// Returns the field contract for a normalized name.
    #[must_use]
    pub fn get_field(&self, normalized: &str) -> Option<&FieldContract> {
        self.fields.get(normalized)
    }

    /// Iterates fields in normalized-name order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldContract> {
        self.fields.values()
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true when the contract declares no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Checks whether this producer contract satisfies a consumer contract.
    ///
    /// Required consumer fields missing from the producer are reported as
    /// missing; present fields with incompatible types are reported as
    /// mismatches. All problems are collected, not just the first.
    #[must_use]
    pub fn is_compatible_with(&self, consumer: &Self) -> CompatibilityResult {
        let mut missing_fields = Vec::new();
        let mut type_mismatches = Vec::new();
        for (name, consumer_field) in &consumer.fields {
            match self.fields.get(name) {
                None => {
                    if consumer_field.required {
                        missing_fields.push(name.clone());
                    }
                }
                Some(producer_field) => {
                    if !producer_field.field_type.accepted_by(&consumer_field.field_type) {
                        type_mismatches.push(TypeMismatch {
                            field: name.clone(),
                            expected: consumer_field.field_type,
                            actual: producer_field.field_type,
                        });
                    }
                }
            }
        }
        CompatibilityResult { missing_fields, type_mismatches }
    }

    /// Computes the order-independent contract hash.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] when canonicalization fails.
    pub fn contract_hash(&self) -> Result<String, HashError> {
        hashing::stable_hash(self)
    }
}

// ============================================================================
// SECTION: Compatibility Result
// ============================================================================

/// A single producer/consumer type mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMismatch {
    /// Normalized field name.
    pub field: String,
    /// Type the consumer declares.
    pub expected: FieldType,
    /// Type the producer declares.
    pub actual: FieldType,
}

/// Result of a contract compatibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    /// Required consumer fields the producer does not provide.
    pub missing_fields: Vec<String>,
    /// Fields present with incompatible types.
    pub type_mismatches: Vec<TypeMismatch>,
}

impl CompatibilityResult {
    /// Returns true when the producer satisfies the consumer.
    #[must_use]
    pub fn compatible(&self) -> bool {
        self.missing_fields.is_empty() && self.type_mismatches.is_empty()
    }

    /// Builds a human-readable summary, or `None` when compatible.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        if self.compatible() {
            return None;
        }
        let mut parts = Vec::new();
        if !self.missing_fields.is_empty() {
            parts.push(format!("missing fields: {}", self.missing_fields.join(", ")));
        }
        if !self.type_mismatches.is_empty() {
            let rendered: Vec<String> = self
                .type_mismatches
                .iter()
                .map(|mismatch| {
                    format!(
                        "{} (expected {}, got {})",
                        mismatch.field, mismatch.expected, mismatch.actual
                    )
                })
                .collect();
            parts.push(format!("type mismatches: {}", rendered.join(", ")));
        }
        Some(parts.join("; "))
    }
}
