// elspeth-engine/src/lib.rs
// ============================================================================
// Module: ELSPETH Engine Library
// Description: Public API surface for the pipeline execution engine.
// Purpose: Expose the processor, token manager, batch adapter, call gateway,
//          checkpoint/recovery managers, and rate limiter.
// Dependencies: crate::{batch, calls, checkpoint, processor, rate, tokens}
// ============================================================================

//! ## Overview
//! The engine turns a validated execution graph into a scheduled run: a
//! single coordinator drives the per-node state machine, workers execute
//! plugin calls behind per-attempt waiters, external calls flow through the
//! recording/replay gateway, and checkpoints make the whole thing
//! resumable. Every observable event is durable in the Landscape before the
//! next event is scheduled on the same token.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod batch;
pub mod calls;
pub mod checkpoint;
pub mod processor;
pub mod rate;
pub mod tokens;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use batch::RowWaiter;
pub use batch::SharedBatchAdapter;
pub use batch::WaitError;
pub use batch::WorkerResult;
pub use calls::CallError;
pub use calls::CallGateway;
pub use calls::CallRequest;
pub use calls::CallResponse;
pub use calls::CallTransport;
pub use calls::Divergence;
pub use calls::filter_request_headers;
pub use calls::filter_response_headers;
pub use checkpoint::CheckpointError;
pub use checkpoint::CheckpointManager;
pub use checkpoint::RecoveredRow;
pub use checkpoint::RecoveryManager;
pub use processor::EngineError;
pub use processor::PipelinePlan;
pub use processor::PlanStep;
pub use processor::Processor;
pub use processor::ProcessorOptions;
pub use processor::ResumeRow;
pub use processor::RunReport;
pub use processor::SinkBinding;
pub use rate::RateLimiter;
pub use tokens::TokenManager;
