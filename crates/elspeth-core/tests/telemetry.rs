// elspeth-core/tests/telemetry.rs
// ============================================================================
// Module: Telemetry Manager Tests
// Description: Tests for granularity filtering and failure isolation.
// ============================================================================
//! ## Overview
//! One failing exporter never stops the others; repeated total failure
//! either raises or disables telemetry depending on configuration; health
//! metrics track emitted and dropped counts per exporter.

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

use std::sync::Arc;
use std::sync::Mutex;

use elspeth_core::RunId;
use elspeth_core::Timestamp;
use elspeth_core::telemetry::MAX_CONSECUTIVE_FAILURES;
use elspeth_core::telemetry::TelemetryConfig;
use elspeth_core::telemetry::TelemetryError;
use elspeth_core::telemetry::TelemetryEvent;
use elspeth_core::telemetry::TelemetryExporter;
use elspeth_core::telemetry::TelemetryGranularity;
use elspeth_core::telemetry::TelemetryManager;
use elspeth_core::telemetry::should_emit;

/// An exporter recording event labels, optionally failing every call.
struct RecordingExporter {
    /// Exporter name.
    name: String,
    /// Labels of delivered events.
    seen: Arc<Mutex<Vec<String>>>,
    /// Whether every export fails.
    failing: bool,
}

impl TelemetryExporter for RecordingExporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn export(&mut self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        if self.failing {
            return Err(TelemetryError::ExportFailed {
                exporter: self.name.clone(),
                message: "down".to_string(),
            });
        }
        self.seen.lock().unwrap().push(event.label().to_string());
        Ok(())
    }
}

/// Builds a lifecycle event.
fn run_started() -> TelemetryEvent {
    TelemetryEvent::RunStarted { run_id: RunId::new("run_t"), at: Timestamp::now() }
}

/// Builds a row-level event.
fn row_started() -> TelemetryEvent {
    TelemetryEvent::RowStarted {
        run_id: RunId::new("run_t"),
        token_id: elspeth_core::TokenId::new("tok_t"),
        node_id: elspeth_core::NodeId::new("node_t"),
    }
}

// ============================================================================
// SECTION: Granularity
// ============================================================================

/// Tests the filter admits events at or below the configured granularity.
#[test]
fn test_granularity_filter() {
    assert!(should_emit(&run_started(), TelemetryGranularity::Lifecycle));
    assert!(!should_emit(&row_started(), TelemetryGranularity::Lifecycle));
    assert!(should_emit(&row_started(), TelemetryGranularity::Rows));
    assert!(should_emit(&row_started(), TelemetryGranularity::Full));
}

/// Tests the manager drops filtered events without touching exporters.
#[test]
fn test_manager_filters_by_granularity() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let exporter = RecordingExporter {
        name: "console".to_string(),
        seen: Arc::clone(&seen),
        failing: false,
    };
    let mut manager = TelemetryManager::new(
        TelemetryConfig {
            granularity: TelemetryGranularity::Lifecycle,
            fail_on_total_exporter_failure: false,
        },
        vec![Box::new(exporter)],
    );

    manager.handle_event(&run_started()).unwrap();
    manager.handle_event(&row_started()).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["run_started".to_string()]);
}

// ============================================================================
// SECTION: Failure Isolation
// ============================================================================

/// Tests one failing exporter does not block the healthy one.
#[test]
fn test_partial_failure_is_isolated() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let healthy = RecordingExporter {
        name: "healthy".to_string(),
        seen: Arc::clone(&seen),
        failing: false,
    };
    let broken = RecordingExporter {
        name: "broken".to_string(),
        seen: Arc::new(Mutex::new(Vec::new())),
        failing: true,
    };
    let mut manager = TelemetryManager::new(
        TelemetryConfig {
            granularity: TelemetryGranularity::Full,
            fail_on_total_exporter_failure: true,
        },
        vec![Box::new(broken), Box::new(healthy)],
    );

    for _ in 0..20 {
        manager.handle_event(&run_started()).unwrap();
    }

    assert_eq!(seen.lock().unwrap().len(), 20);
    let health = manager.health();
    assert_eq!(health.events_emitted, 20);
    assert_eq!(health.events_dropped, 0);
    assert_eq!(health.exporter_failures.get("broken"), Some(&20));
    assert_eq!(health.consecutive_total_failures, 0);
}

/// Tests total failure raises when configured to.
#[test]
fn test_total_failure_raises_when_configured() {
    let broken = RecordingExporter {
        name: "broken".to_string(),
        seen: Arc::new(Mutex::new(Vec::new())),
        failing: true,
    };
    let mut manager = TelemetryManager::new(
        TelemetryConfig {
            granularity: TelemetryGranularity::Full,
            fail_on_total_exporter_failure: true,
        },
        vec![Box::new(broken)],
    );

    let mut raised = None;
    for _ in 0..MAX_CONSECUTIVE_FAILURES {
        if let Err(error) = manager.handle_event(&run_started()) {
            raised = Some(error);
            break;
        }
    }
    assert!(matches!(raised, Some(TelemetryError::AllExportersFailed { .. })));
}

/// Tests total failure disables telemetry when not configured to raise.
#[test]
fn test_total_failure_disables_otherwise() {
    let broken = RecordingExporter {
        name: "broken".to_string(),
        seen: Arc::new(Mutex::new(Vec::new())),
        failing: true,
    };
    let mut manager = TelemetryManager::new(
        TelemetryConfig {
            granularity: TelemetryGranularity::Full,
            fail_on_total_exporter_failure: false,
        },
        vec![Box::new(broken)],
    );

    for _ in 0..(MAX_CONSECUTIVE_FAILURES + 5) {
        manager.handle_event(&run_started()).unwrap();
    }

    assert!(manager.is_disabled());
    let health = manager.health();
    assert_eq!(u64::from(health.consecutive_total_failures), health.events_dropped);
}

/// Tests an empty exporter list is a silent no-op.
#[test]
fn test_no_exporters_is_noop() {
    let mut manager = TelemetryManager::new(TelemetryConfig::default(), Vec::new());
    manager.handle_event(&run_started()).unwrap();
    assert_eq!(manager.health().events_emitted, 0);
    assert_eq!(manager.health().events_dropped, 0);
}
