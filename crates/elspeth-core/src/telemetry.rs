// elspeth-core/src/telemetry.rs
// ============================================================================
// Module: ELSPETH Telemetry
// Description: Typed telemetry events, granularity filtering, and fan-out.
// Purpose: Dispatch events to exporters with per-exporter failure isolation.
// Dependencies: serde, tracing
// ============================================================================

//! ## Overview
//! Telemetry is emitted after Landscape recording: the Landscape is the
//! legal record, telemetry is the observable one. The manager filters typed
//! events by granularity and fans them out synchronously from a single
//! caller. Exporter failures are isolated: one failing exporter never stops
//! the others, and exporter errors never crash the pipeline. Aggregate
//! logging keeps the failure stream readable (one error line per
//! [`LOG_INTERVAL`] dropped events), and repeated total failure either
//! raises or disables telemetry depending on configuration.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::identifiers::NodeId;
use crate::core::identifiers::RunId;
use crate::core::identifiers::TokenId;
use crate::core::records::CallType;
use crate::core::records::TokenOutcome;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Dropped events between aggregate error log lines.
pub const LOG_INTERVAL: u64 = 100;

/// Consecutive all-exporter failures before raising or disabling.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the telemetry subsystem.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Every exporter failed repeatedly and the run is configured to stop.
    #[error("all {exporters} telemetry exporters failed {failures} consecutive times")]
    AllExportersFailed {
        /// Number of configured exporters.
        exporters: usize,
        /// Length of the failure streak.
        failures: u32,
    },
    /// An individual exporter reported a failure.
    #[error("telemetry exporter '{exporter}' failed: {message}")]
    ExportFailed {
        /// Exporter name.
        exporter: String,
        /// Failure rendering.
        message: String,
    },
}

// ============================================================================
// SECTION: Granularity
// ============================================================================

/// Granularity of telemetry events emitted by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryGranularity {
    /// Only run lifecycle events.
    Lifecycle,
    /// Lifecycle plus row-level events.
    Rows,
    /// Rows plus external call events.
    Full,
}

// ============================================================================
// SECTION: Events
// ============================================================================

/// A typed telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A run opened.
    RunStarted {
        /// Run identifier.
        run_id: RunId,
        /// Event time.
        at: Timestamp,
    },
    /// A run closed successfully.
    RunCompleted {
        /// Run identifier.
        run_id: RunId,
        /// Event time.
        at: Timestamp,
        /// Rows processed.
        rows: u64,
    },
    /// A run failed or was interrupted.
    RunFailed {
        /// Run identifier.
        run_id: RunId,
        /// Event time.
        at: Timestamp,
        /// Failure rendering.
        message: String,
    },
    /// A token began processing at a node.
    RowStarted {
        /// Run identifier.
        run_id: RunId,
        /// Token identifier.
        token_id: TokenId,
        /// Node identifier.
        node_id: NodeId,
    },
    /// A token finished processing at a node.
    RowCompleted {
        /// Run identifier.
        run_id: RunId,
        /// Token identifier.
        token_id: TokenId,
        /// Node identifier.
        node_id: NodeId,
    },
    /// A token reached an outcome.
    TokenOutcomeRecorded {
        /// Run identifier.
        run_id: RunId,
        /// Token identifier.
        token_id: TokenId,
        /// The recorded outcome.
        outcome: TokenOutcome,
    },
    /// An external call completed.
    ExternalCall {
        /// Run identifier.
        run_id: RunId,
        /// Node identifier.
        node_id: NodeId,
        /// Call type.
        call_type: CallType,
        /// Latency in milliseconds, when measured.
        latency_ms: Option<i64>,
    },
}

impl TelemetryEvent {
    /// Returns the minimum granularity at which the event is emitted.
    #[must_use]
    pub const fn granularity(&self) -> TelemetryGranularity {
        match self {
            Self::RunStarted { .. } | Self::RunCompleted { .. } | Self::RunFailed { .. } => {
                TelemetryGranularity::Lifecycle
            }
            Self::RowStarted { .. }
            | Self::RowCompleted { .. }
            | Self::TokenOutcomeRecorded { .. } => TelemetryGranularity::Rows,
            Self::ExternalCall { .. } => TelemetryGranularity::Full,
        }
    }

    /// Returns a short label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RowStarted { .. } => "row_started",
            Self::RowCompleted { .. } => "row_completed",
            Self::TokenOutcomeRecorded { .. } => "token_outcome",
            Self::ExternalCall { .. } => "external_call",
        }
    }
}

/// Returns true when an event passes the configured granularity filter.
#[must_use]
pub const fn should_emit(event: &TelemetryEvent, granularity: TelemetryGranularity) -> bool {
    event.granularity() as u8 <= granularity as u8
}

// ============================================================================
// SECTION: Exporter Protocol
// ============================================================================

/// A telemetry exporter.
///
/// `export` must not panic; failures are returned and isolated by the
/// manager.
pub trait TelemetryExporter: Send {
    /// Stable exporter name for failure accounting.
    fn name(&self) -> &str;

    /// Exports one event.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::ExportFailed`] when delivery fails.
    fn export(&mut self, event: &TelemetryEvent) -> Result<(), TelemetryError>;

    /// Flushes buffered events.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError`] when flushing fails.
    fn flush(&mut self) -> Result<(), TelemetryError> {
        Ok(())
    }

    /// Releases exporter resources.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError`] when closing fails.
    fn close(&mut self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Runtime telemetry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Event granularity.
    pub granularity: TelemetryGranularity,
    /// Whether repeated total exporter failure stops the run.
    pub fail_on_total_exporter_failure: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            granularity: TelemetryGranularity::Lifecycle,
            fail_on_total_exporter_failure: false,
        }
    }
}

// ============================================================================
// SECTION: Health Metrics
// ============================================================================

/// Snapshot of telemetry health for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryHealth {
    /// Events delivered to at least one exporter.
    pub events_emitted: u64,
    /// Events delivered to no exporter.
    pub events_dropped: u64,
    /// Per-exporter failure counts.
    pub exporter_failures: BTreeMap<String, u64>,
    /// Current streak of all-exporter failures.
    pub consecutive_total_failures: u32,
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Coordinates event emission to configured exporters.
///
/// Dispatch is synchronous from a single caller thread; internal state is
/// not locked.
pub struct TelemetryManager {
    /// Active configuration.
    config: TelemetryConfig,
    /// Configured exporters.
    exporters: Vec<Box<dyn TelemetryExporter>>,
    /// Streak of events every exporter failed to deliver.
    consecutive_total_failures: u32,
    /// Events delivered to at least one exporter.
    events_emitted: u64,
    /// Events delivered to no exporter.
    events_dropped: u64,
    /// Per-exporter failure counts.
    exporter_failures: BTreeMap<String, u64>,
    /// Drop count at the last aggregate log line.
    last_logged_drop_count: u64,
    /// Whether telemetry was disabled after repeated total failure.
    disabled: bool,
}

impl TelemetryManager {
    /// Creates a manager; an empty exporter list makes telemetry a no-op.
    #[must_use]
    pub fn new(config: TelemetryConfig, exporters: Vec<Box<dyn TelemetryExporter>>) -> Self {
        Self {
            config,
            exporters,
            consecutive_total_failures: 0,
            events_emitted: 0,
            events_dropped: 0,
            exporter_failures: BTreeMap::new(),
            last_logged_drop_count: 0,
            disabled: false,
        }
    }

    /// Filters and dispatches one event to all exporters.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::AllExportersFailed`] only when every
    /// exporter has failed [`MAX_CONSECUTIVE_FAILURES`] times in a row and
    /// `fail_on_total_exporter_failure` is set.
    pub fn handle_event(&mut self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        if self.disabled || self.exporters.is_empty() {
            return Ok(());
        }
        if !should_emit(event, self.config.granularity) {
            return Ok(());
        }

        let mut failures = 0_usize;
        for exporter in &mut self.exporters {
            if let Err(error) = exporter.export(event) {
                failures += 1;
                *self.exporter_failures.entry(exporter.name().to_string()).or_insert(0) += 1;
                tracing::warn!(
                    exporter = exporter.name(),
                    event = event.label(),
                    error = %error,
                    "telemetry exporter failed"
                );
            }
        }

        if failures == self.exporters.len() {
            self.consecutive_total_failures += 1;
            self.events_dropped += 1;
            if self.events_dropped - self.last_logged_drop_count >= LOG_INTERVAL {
                tracing::error!(
                    dropped_since_last_log = self.events_dropped - self.last_logged_drop_count,
                    dropped_total = self.events_dropped,
                    consecutive_failures = self.consecutive_total_failures,
                    "all telemetry exporters failing; events dropped"
                );
                self.last_logged_drop_count = self.events_dropped;
            }
            if self.consecutive_total_failures >= MAX_CONSECUTIVE_FAILURES {
                if self.config.fail_on_total_exporter_failure {
                    return Err(TelemetryError::AllExportersFailed {
                        exporters: self.exporters.len(),
                        failures: self.consecutive_total_failures,
                    });
                }
                tracing::error!(
                    consecutive_failures = self.consecutive_total_failures,
                    events_dropped = self.events_dropped,
                    "telemetry disabled after repeated total failures"
                );
                self.disabled = true;
            }
        } else {
            self.events_emitted += 1;
            self.consecutive_total_failures = 0;
        }
        Ok(())
    }

    /// Returns a health snapshot.
    #[must_use]
    pub fn health(&self) -> TelemetryHealth {
        TelemetryHealth {
            events_emitted: self.events_emitted,
            events_dropped: self.events_dropped,
            exporter_failures: self.exporter_failures.clone(),
            consecutive_total_failures: self.consecutive_total_failures,
        }
    }

    /// Returns true once telemetry was disabled by repeated total failure.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Flushes all exporters; failures are logged, never raised.
    pub fn flush(&mut self) {
        for exporter in &mut self.exporters {
            if let Err(error) = exporter.flush() {
                tracing::warn!(exporter = exporter.name(), error = %error, "exporter flush failed");
            }
        }
    }

    /// Closes all exporters; failures are logged, never raised.
    pub fn close(&mut self) {
        for exporter in &mut self.exporters {
            if let Err(error) = exporter.close() {
                tracing::warn!(exporter = exporter.name(), error = %error, "exporter close failed");
            }
        }
    }
}
