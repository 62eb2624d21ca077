// elspeth-core/src/core/value.rs
// ============================================================================
// Module: ELSPETH Data Values
// Description: Typed cell values carried by pipeline rows.
// Purpose: Preserve value types (Decimal, Timestamp) across store and resume.
// Dependencies: bigdecimal, serde, serde_json, time
// ============================================================================

//! ## Overview
//! Pipeline rows carry [`DataValue`] cells rather than raw JSON so that
//! decimals and timestamps survive a round trip through the audit store with
//! their types intact. The JSON projection is deliberately plain (decimals as
//! strings, timestamps as RFC 3339 strings); recovery re-coerces those
//! strings back into typed values when a schema contract is available.
//!
//! Floats are validated at construction: NaN and the infinities have no
//! canonical JSON form and are rejected here rather than deep inside hashing.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::contract::FieldType;
use crate::core::contract::SchemaContract;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when constructing or coercing data values.
#[derive(Debug, Error)]
pub enum ValueError {
    /// A float with no canonical JSON form was supplied.
    #[error("non-finite float is not a valid data value: {0}")]
    NonFiniteFloat(f64),
    /// A JSON value could not be coerced to the contract's field type.
    #[error("cannot coerce field '{field}' to {expected}: {message}")]
    Coercion {
        /// Normalized field name being coerced.
        field: String,
        /// Expected value kind from the contract.
        expected: ValueKind,
        /// Human-readable coercion failure.
        message: String,
    },
}

// ============================================================================
// SECTION: Value Kinds
// ============================================================================

/// The kind of a [`DataValue`], used by schema contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Accepts any value.
    Any,
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Integer,
    /// Finite 64-bit float.
    Float,
    /// Arbitrary-precision decimal.
    Decimal,
    /// UTF-8 text.
    Text,
    /// UTC timestamp.
    Timestamp,
    /// Arbitrary nested JSON.
    Json,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
        };
        f.write_str(label)
    }
}

// ============================================================================
// SECTION: Data Value
// ============================================================================

/// A single typed cell in a pipeline row.
///
/// # Invariants
/// - `Float` values are always finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum DataValue {
    /// Absent or explicit null.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Integer(i64),
    /// Finite float value.
    Float(f64),
    /// Arbitrary-precision decimal value.
    Decimal(BigDecimal),
    /// Text value.
    Text(String),
    /// UTC timestamp value.
    Timestamp(Timestamp),
    /// Nested JSON value.
    Json(Value),
}

impl DataValue {
    /// Creates a float value, rejecting NaN and the infinities.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::NonFiniteFloat`] when the input is not finite.
    pub fn float(value: f64) -> Result<Self, ValueError> {
        if value.is_finite() {
            Ok(Self::Float(value))
        } else {
            Err(ValueError::NonFiniteFloat(value))
        }
    }

    /// Returns the kind of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Null | Self::Json(_) => ValueKind::Json,
            Self::Bool(_) => ValueKind::Bool,
            Self::Integer(_) => ValueKind::Integer,
            Self::Float(_) => ValueKind::Float,
            Self::Decimal(_) => ValueKind::Decimal,
            Self::Text(_) => ValueKind::Text,
            Self::Timestamp(_) => ValueKind::Timestamp,
        }
    }

    /// Returns true for the null value.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Projects the value into plain JSON.
    ///
    /// Decimals become strings, timestamps become RFC 3339 strings. The
    /// projection is the canonical storage form; types are restored from it
    /// via [`DataValue::from_json_typed`] when a contract is available.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => Value::Bool(*value),
            Self::Integer(value) => Value::from(*value),
            Self::Float(value) => {
                serde_json::Number::from_f64(*value).map_or(Value::Null, Value::Number)
            }
            Self::Decimal(value) => Value::String(value.normalized().to_string()),
            Self::Text(value) => Value::String(value.clone()),
            Self::Timestamp(value) => Value::String(value.to_rfc3339()),
            Self::Json(value) => value.clone(),
        }
    }

    /// Maps a JSON value to a data value without contract guidance.
    ///
    /// Strings stay strings and numbers become integers or floats; this is
    /// the explicit degradation path the recovery manager documents when no
    /// source contract is supplied.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::NonFiniteFloat`] when the JSON number has no
    /// finite float form.
    pub fn from_json_untyped(value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(flag) => Ok(Self::Bool(*flag)),
            Value::Number(number) => number.as_i64().map_or_else(
                || {
                    number
                        .as_f64()
                        .ok_or(ValueError::NonFiniteFloat(f64::NAN))
                        .and_then(Self::float)
                },
                |int| Ok(Self::Integer(int)),
            ),
            Value::String(text) => Ok(Self::Text(text.clone())),
            Value::Array(_) | Value::Object(_) => Ok(Self::Json(value.clone())),
        }
    }

    /// Coerces a JSON value to the type a contract field declares.
    ///
    /// RFC 3339 strings become timestamps, numeric strings become decimals,
    /// and integers widen to floats. Nullable fields accept JSON null.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::Coercion`] when the JSON value cannot represent
    /// the declared type.
    pub fn from_json_typed(
        field_name: &str,
        value: &Value,
        field_type: &FieldType,
    ) -> Result<Self, ValueError> {
        if value.is_null() {
            if field_type.nullable {
                return Ok(Self::Null);
            }
            return Err(coercion_error(field_name, field_type.kind, "null for non-nullable field"));
        }
        match field_type.kind {
            ValueKind::Any | ValueKind::Json => Self::from_json_untyped(value),
            ValueKind::Bool => value
                .as_bool()
                .map(Self::Bool)
                .ok_or_else(|| coercion_error(field_name, ValueKind::Bool, "expected boolean")),
            ValueKind::Integer => value
                .as_i64()
                .map(Self::Integer)
                .ok_or_else(|| coercion_error(field_name, ValueKind::Integer, "expected integer")),
            ValueKind::Float => match value {
                Value::Number(number) => number
                    .as_f64()
                    .ok_or(ValueError::NonFiniteFloat(f64::NAN))
                    .and_then(Self::float),
                _ => Err(coercion_error(field_name, ValueKind::Float, "expected number")),
            },
            ValueKind::Decimal => match value {
                Value::String(text) => BigDecimal::from_str(text).map(Self::Decimal).map_err(
                    |err| coercion_error(field_name, ValueKind::Decimal, &err.to_string()),
                ),
                Value::Number(number) => BigDecimal::from_str(&number.to_string())
                    .map(Self::Decimal)
                    .map_err(|err| {
                        coercion_error(field_name, ValueKind::Decimal, &err.to_string())
                    }),
                _ => Err(coercion_error(
                    field_name,
                    ValueKind::Decimal,
                    "expected decimal string or number",
                )),
            },
            ValueKind::Text => value
                .as_str()
                .map(|text| Self::Text(text.to_string()))
                .ok_or_else(|| coercion_error(field_name, ValueKind::Text, "expected string")),
            ValueKind::Timestamp => match value {
                Value::String(text) => Timestamp::parse(text)
                    .map(Self::Timestamp)
                    .map_err(|err| coercion_error(field_name, ValueKind::Timestamp, &err.to_string())),
                _ => Err(coercion_error(
                    field_name,
                    ValueKind::Timestamp,
                    "expected rfc3339 string",
                )),
            },
        }
    }
}

/// Builds a [`ValueError::Coercion`] with an owned message.
fn coercion_error(field: &str, expected: ValueKind, message: &str) -> ValueError {
    ValueError::Coercion {
        field: field.to_string(),
        expected,
        message: message.to_string(),
    }
}

impl TryFrom<Value> for DataValue {
    type Error = ValueError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json_untyped(&value)
    }
}

impl From<DataValue> for Value {
    fn from(value: DataValue) -> Self {
        value.to_json()
    }
}

// ============================================================================
// SECTION: Pipeline Row
// ============================================================================

/// A pipeline row: an ordered field map plus the contract that governs it.
///
/// Field access resolves names through the contract, so callers may use
/// either the original or the normalized spelling. Membership checks reflect
/// the actual data, not contract presence: a declared-but-absent field is not
/// contained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRow {
    /// Field values keyed by normalized name.
    data: BTreeMap<String, DataValue>,
    /// Contract governing name resolution and types.
    contract: SchemaContract,
}

impl PipelineRow {
    /// Creates a row from normalized-keyed data and its contract.
    #[must_use]
    pub const fn new(data: BTreeMap<String, DataValue>, contract: SchemaContract) -> Self {
        Self { data, contract }
    }

    /// Returns the contract governing this row.
    #[must_use]
    pub const fn contract(&self) -> &SchemaContract {
        &self.contract
    }

    /// Replaces the contract, keeping the data.
    #[must_use]
    pub fn with_contract(mut self, contract: SchemaContract) -> Self {
        self.contract = contract;
        self
    }

    /// Looks up a field by original or normalized name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DataValue> {
        let resolved = self.contract.resolve_name(name);
        self.data.get(resolved.as_ref())
    }

    /// Inserts a field by original or normalized name.
    pub fn insert(&mut self, name: &str, value: DataValue) {
        let resolved = self.contract.resolve_name(name).into_owned();
        self.data.insert(resolved, value);
    }

    /// Returns true when the row actually carries the field.
    #[must_use]
    pub fn contains_field(&self, name: &str) -> bool {
        let resolved = self.contract.resolve_name(name);
        self.data.contains_key(resolved.as_ref())
    }

    /// Returns the normalized field names present in the data.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// Returns the number of fields present in the data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true when the row carries no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Projects the row data into a plain JSON object.
    #[must_use]
    pub fn to_json_object(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (name, value) in &self.data {
            object.insert(name.clone(), value.to_json());
        }
        Value::Object(object)
    }

    /// Rebuilds a row from a stored JSON object using the contract's types.
    ///
    /// Fields the contract declares are coerced to their declared types;
    /// undeclared fields fall back to untyped mapping.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError`] when a declared field cannot be coerced.
    pub fn from_json_object(object: &Value, contract: SchemaContract) -> Result<Self, ValueError> {
        let mut data = BTreeMap::new();
        if let Value::Object(fields) = object {
            for (name, value) in fields {
                let resolved = contract.resolve_name(name).into_owned();
                let cell = match contract.get_field(&resolved) {
                    Some(field) => DataValue::from_json_typed(&resolved, value, &field.field_type)?,
                    None => DataValue::from_json_untyped(value)?,
                };
                data.insert(resolved, cell);
            }
        }
        Ok(Self { data, contract })
    }
}
