// elspeth-core/src/core/time.rs
// ============================================================================
// Module: ELSPETH Time Model
// Description: Canonical UTC timestamps for audit rows and checkpoints.
// Purpose: Provide explicit-zone, RFC 3339 timestamps across ELSPETH records.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! Every timestamp ELSPETH persists is UTC with an explicit offset and
//! serializes as RFC 3339. The audit trail is the legal record of a run, so
//! naive timestamps are not representable: [`Timestamp`] wraps
//! [`time::OffsetDateTime`] and refuses to parse strings without an offset.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised when parsing or formatting timestamps.
#[derive(Debug, Error)]
pub enum TimeError {
    /// The input string is not a valid RFC 3339 timestamp.
    #[error("invalid rfc3339 timestamp: {0}")]
    Parse(String),
    /// The timestamp could not be formatted as RFC 3339.
    #[error("timestamp formatting failed: {0}")]
    Format(String),
}

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// Canonical UTC timestamp used in ELSPETH audit rows.
///
/// # Invariants
/// - Values always carry an explicit offset and are normalized to UTC.
/// - The serialized form is RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    /// Returns the current wall-clock time in UTC.
    #[must_use]
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    /// Creates a timestamp from unix seconds.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::Parse`] when the value is outside the supported
    /// date range.
    pub fn from_unix_seconds(seconds: i64) -> Result<Self, TimeError> {
        OffsetDateTime::from_unix_timestamp(seconds)
            .map(Self)
            .map_err(|err| TimeError::Parse(err.to_string()))
    }

    /// Parses an RFC 3339 timestamp and normalizes it to UTC.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::Parse`] when the input has no explicit offset or
    /// is otherwise malformed.
    pub fn parse(input: &str) -> Result<Self, TimeError> {
        OffsetDateTime::parse(input, &Rfc3339)
            .map(|value| Self(value.to_offset(time::UtcOffset::UTC)))
            .map_err(|err| TimeError::Parse(format!("'{input}': {err}")))
    }

    /// Formats the timestamp as RFC 3339.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        // Rfc3339 formatting of a UTC OffsetDateTime cannot fail for the
        // year range ELSPETH operates in; fall back to the Display form.
        self.0.format(&Rfc3339).unwrap_or_else(|_| self.0.to_string())
    }

    /// Returns the unix timestamp in whole seconds.
    #[must_use]
    pub const fn unix_seconds(&self) -> i64 {
        self.0.unix_timestamp()
    }

    /// Returns whole milliseconds elapsed since an earlier timestamp.
    ///
    /// Saturates at zero when `earlier` is in the future.
    #[must_use]
    pub fn millis_since(&self, earlier: &Self) -> i64 {
        let delta = self.0 - earlier.0;
        delta.whole_milliseconds().try_into().unwrap_or(i64::MAX).max(0)
    }

    /// Returns the inner [`OffsetDateTime`].
    #[must_use]
    pub const fn inner(&self) -> OffsetDateTime {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl TryFrom<String> for Timestamp {
    type Error = TimeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Timestamp> for String {
    fn from(value: Timestamp) -> Self {
        value.to_rfc3339()
    }
}

impl From<OffsetDateTime> for Timestamp {
    fn from(value: OffsetDateTime) -> Self {
        Self(value.to_offset(time::UtcOffset::UTC))
    }
}
