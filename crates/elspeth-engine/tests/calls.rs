// elspeth-engine/tests/calls.rs
// ============================================================================
// Module: Call Gateway Tests
// Description: Recording, replay, verify, and header elision.
// ============================================================================
//! ## Overview
//! Live calls are recorded with their request hash as the replay key;
//! replay returns the recorded bytes without touching the transport; a
//! miss and a missing payload are distinct errors; verify compares live
//! bytes to recorded bytes and collects divergences.

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
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use elspeth_core::CallStatus;
use elspeth_core::CallType;
use elspeth_core::Determinism;
use elspeth_core::NodeId;
use elspeth_core::NodeRecord;
use elspeth_core::NodeState;
use elspeth_core::NodeType;
use elspeth_core::RowId;
use elspeth_core::RowRecord;
use elspeth_core::RunId;
use elspeth_core::RunRecord;
use elspeth_core::RunMode;
use elspeth_core::RunStatus;
use elspeth_core::StateEnvelope;
use elspeth_core::StateId;
use elspeth_core::Timestamp;
use elspeth_core::TokenId;
use elspeth_core::TokenRecord;
use elspeth_core::interfaces::PayloadStore;
use elspeth_engine::CallError;
use elspeth_engine::CallGateway;
use elspeth_engine::CallRequest;
use elspeth_engine::CallResponse;
use elspeth_engine::CallTransport;
use elspeth_engine::filter_request_headers;
use elspeth_engine::filter_response_headers;
use elspeth_landscape::FilesystemPayloadStore;
use elspeth_landscape::Landscape;
use serde_json::json;

/// A transport answering from a fixed body and counting invocations.
struct FixedTransport {
    /// Body returned to callers.
    body: Vec<u8>,
    /// Invocation counter.
    calls: Arc<AtomicU32>,
}

impl CallTransport for FixedTransport {
    fn execute(&self, _request: &CallRequest) -> Result<CallResponse, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CallResponse {
            status: CallStatus::Success,
            body: self.body.clone(),
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("set-cookie".to_string(), "secret".to_string()),
            ],
            latency_ms: None,
            error: None,
        })
    }
}

/// Seeds a run with one open state to attach calls to.
fn seeded(landscape: &Landscape, run: &str) -> StateId {
    let run_id = RunId::new(run);
    landscape
        .begin_run(&RunRecord {
            run_id: run_id.clone(),
            started_at: Timestamp::now(),
            completed_at: None,
            status: RunStatus::Running,
            config_hash: "cfg".to_string(),
            settings_json: json!({}),
            canonical_version: "jcs-sha256-1".to_string(),
            schema_contract_json: None,
            schema_contract_hash: None,
            run_mode: Some(RunMode::Live),
            source_run_id: None,
            export_status: None,
            exported_at: None,
        })
        .unwrap();
    let node_id = NodeId::new(format!("node_{run}"));
    landscape
        .register_node(&NodeRecord {
            node_id: node_id.clone(),
            run_id: run_id.clone(),
            plugin_name: "llm_enrich".to_string(),
            node_type: NodeType::Transform,
            determinism: Determinism::ExternalCall,
            plugin_version: "1".to_string(),
            config_hash: "cfg".to_string(),
            config_json: json!({}),
            input_contract_json: None,
            output_contract_json: None,
            schema_hash: None,
            sequence_index: Some(1),
        })
        .unwrap();
    let row = RowRecord {
        row_id: RowId::new(format!("row_{run}")),
        run_id: run_id.clone(),
        source_node_id: node_id.clone(),
        row_index: 0,
        source_data_hash: "hash".to_string(),
        payload_ref: None,
    };
    let token = TokenRecord {
        token_id: TokenId::new(format!("tok_{run}")),
        row_id: row.row_id.clone(),
        fork_group_id: None,
        join_group_id: None,
        expand_group_id: None,
        branch_name: None,
        step_in_pipeline: Some(0),
    };
    landscape.create_row_with_token(&row, &token).unwrap();
    let state_id = StateId::new(format!("st_{run}"));
    landscape
        .begin_node_state(&NodeState::Open {
            envelope: StateEnvelope {
                state_id: state_id.clone(),
                token_id: token.token_id,
                node_id,
                step_index: 0,
                attempt: 0,
                input_hash: "in".to_string(),
                started_at: Timestamp::now(),
                context_before: None,
            },
        })
        .unwrap();
    state_id
}

/// Builds a request with a sensitive header.
fn request() -> CallRequest {
    CallRequest {
        call_type: CallType::Llm,
        data: json!({"model": "summarizer", "prompt": "hello"}),
        headers: vec![
            ("authorization".to_string(), "Bearer secret".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ],
    }
}

// ============================================================================
// SECTION: Live Recording
// ============================================================================

/// Tests live calls are recorded and retrievable by request hash.
#[test]
fn test_live_call_recorded() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads: Arc<dyn PayloadStore> =
        Arc::new(FilesystemPayloadStore::open(dir.path()).unwrap());
    let state_id = seeded(&landscape, "live");
    let gateway =
        CallGateway::new(landscape.clone(), Arc::clone(&payloads), RunMode::Live, None);
    let transport =
        FixedTransport { body: br#"{"answer": 42}"#.to_vec(), calls: Arc::new(AtomicU32::new(0)) };

    let response = gateway.invoke(&state_id, 0, &request(), &transport).unwrap();
    assert_eq!(response.status, CallStatus::Success);
    // Response cookies are elided before recording.
    assert!(response.headers.iter().all(|(name, _)| name != "set-cookie"));

    let request_hash = elspeth_core::stable_hash(&request().data).unwrap();
    let recorded = landscape
        .find_recorded_call(&RunId::new("live"), CallType::Llm, &request_hash)
        .unwrap()
        .unwrap();
    assert_eq!(recorded.status, CallStatus::Success);
    assert_eq!(recorded.call_index, 0);
    assert!(recorded.latency_ms.is_some());
    assert!(recorded.response_ref.is_some());
}

// ============================================================================
// SECTION: Replay
// ============================================================================

/// Tests replay returns the recorded bytes without a live call.
#[test]
fn test_replay_returns_recorded_bytes() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads: Arc<dyn PayloadStore> =
        Arc::new(FilesystemPayloadStore::open(dir.path()).unwrap());
    let state_id = seeded(&landscape, "rec");

    let live =
        CallGateway::new(landscape.clone(), Arc::clone(&payloads), RunMode::Live, None);
    let transport =
        FixedTransport { body: br#"{"answer": 42}"#.to_vec(), calls: Arc::new(AtomicU32::new(0)) };
    live.invoke(&state_id, 0, &request(), &transport).unwrap();

    let replay_state = seeded(&landscape, "replay");
    let replay = CallGateway::new(
        landscape,
        payloads,
        RunMode::Replay,
        Some(RunId::new("rec")),
    );
    let counter = Arc::new(AtomicU32::new(0));
    let untouched = FixedTransport { body: b"never".to_vec(), calls: Arc::clone(&counter) };

    let response = replay.invoke(&replay_state, 0, &request(), &untouched).unwrap();
    assert_eq!(response.body, br#"{"answer": 42}"#.to_vec());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

/// Tests a replay miss carries the request hash and data.
#[test]
fn test_replay_miss() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads: Arc<dyn PayloadStore> =
        Arc::new(FilesystemPayloadStore::open(dir.path()).unwrap());
    let state_id = seeded(&landscape, "miss");
    let replay = CallGateway::new(
        landscape,
        payloads,
        RunMode::Replay,
        Some(RunId::new("nonexistent")),
    );
    let transport =
        FixedTransport { body: Vec::new(), calls: Arc::new(AtomicU32::new(0)) };

    let result = replay.invoke(&state_id, 0, &request(), &transport);
    let Err(CallError::ReplayMiss { request_hash, request, .. }) = result else {
        panic!("expected a replay miss");
    };
    assert!(!request_hash.is_empty());
    assert_eq!(request["model"], json!("summarizer"));
}

/// Tests recorded error calls replay with an empty body.
#[test]
fn test_replay_error_call_empty_body() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads: Arc<dyn PayloadStore> =
        Arc::new(FilesystemPayloadStore::open(dir.path()).unwrap());
    let state_id = seeded(&landscape, "errrec");

    struct FailingTransport;
    impl CallTransport for FailingTransport {
        fn execute(&self, _request: &CallRequest) -> Result<CallResponse, String> {
            Err("connection refused".to_string())
        }
    }
    let live =
        CallGateway::new(landscape.clone(), Arc::clone(&payloads), RunMode::Live, None);
    assert!(matches!(
        live.invoke(&state_id, 0, &request(), &FailingTransport),
        Err(CallError::Transport(_))
    ));

    let replay_state = seeded(&landscape, "errreplay");
    let replay = CallGateway::new(
        landscape,
        payloads,
        RunMode::Replay,
        Some(RunId::new("errrec")),
    );
    let transport = FixedTransport { body: Vec::new(), calls: Arc::new(AtomicU32::new(0)) };
    let response = replay.invoke(&replay_state, 0, &request(), &transport).unwrap();
    assert_eq!(response.status, CallStatus::Error);
    assert!(response.body.is_empty());
    assert_eq!(response.error.as_deref(), Some("connection refused"));
}

// ============================================================================
// SECTION: Verify
// ============================================================================

/// Tests identical environments verify with zero divergences.
#[test]
fn test_verify_no_divergence() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads: Arc<dyn PayloadStore> =
        Arc::new(FilesystemPayloadStore::open(dir.path()).unwrap());
    let state_id = seeded(&landscape, "vrec");
    let live =
        CallGateway::new(landscape.clone(), Arc::clone(&payloads), RunMode::Live, None);
    let transport =
        FixedTransport { body: b"same bytes".to_vec(), calls: Arc::new(AtomicU32::new(0)) };
    live.invoke(&state_id, 0, &request(), &transport).unwrap();

    let verify_state = seeded(&landscape, "vrun");
    let verify = CallGateway::new(
        landscape,
        payloads,
        RunMode::Verify,
        Some(RunId::new("vrec")),
    );
    verify.invoke(&verify_state, 0, &request(), &transport).unwrap();
    assert!(verify.divergences().is_empty());
}

/// Tests changed responses are reported as divergences, not raised.
#[test]
fn test_verify_reports_divergence() {
    let landscape = Landscape::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let payloads: Arc<dyn PayloadStore> =
        Arc::new(FilesystemPayloadStore::open(dir.path()).unwrap());
    let state_id = seeded(&landscape, "drec");
    let live =
        CallGateway::new(landscape.clone(), Arc::clone(&payloads), RunMode::Live, None);
    let original =
        FixedTransport { body: b"original".to_vec(), calls: Arc::new(AtomicU32::new(0)) };
    live.invoke(&state_id, 0, &request(), &original).unwrap();

    let verify_state = seeded(&landscape, "drun");
    let verify = CallGateway::new(
        landscape,
        payloads,
        RunMode::Verify,
        Some(RunId::new("drec")),
    );
    let drifted =
        FixedTransport { body: b"drifted".to_vec(), calls: Arc::new(AtomicU32::new(0)) };
    verify.invoke(&verify_state, 0, &request(), &drifted).unwrap();

    let divergences = verify.divergences();
    assert_eq!(divergences.len(), 1);
    assert_ne!(divergences[0].recorded_hash.as_deref(), Some(divergences[0].live_hash.as_str()));
}

// ============================================================================
// SECTION: Header Filtering
// ============================================================================

/// Tests the request allow-list and substring elision.
#[test]
fn test_request_header_filter() {
    let headers = vec![
        ("Authorization".to_string(), "secret".to_string()),
        ("X-Api-Key".to_string(), "secret".to_string()),
        ("My-Custom-Token".to_string(), "secret".to_string()),
        ("Session-Secret-Id".to_string(), "secret".to_string()),
        ("Content-Type".to_string(), "application/json".to_string()),
        ("Accept".to_string(), "application/json".to_string()),
    ];
    let filtered = filter_request_headers(&headers);
    let names: Vec<&str> = filtered.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["Content-Type", "Accept"]);
}

/// Tests the response elision set.
#[test]
fn test_response_header_filter() {
    let headers = vec![
        ("Set-Cookie".to_string(), "secret".to_string()),
        ("WWW-Authenticate".to_string(), "secret".to_string()),
        ("Content-Length".to_string(), "10".to_string()),
    ];
    let filtered = filter_response_headers(&headers);
    let names: Vec<&str> = filtered.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["Content-Length"]);
}
