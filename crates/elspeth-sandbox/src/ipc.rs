// elspeth-sandbox/src/ipc.rs
// ============================================================================
// Module: Sandbox IPC Framing
// Description: Length-prefixed msgpack frames over byte streams.
// Purpose: Carry plugin requests and results between orchestrator and worker.
// Dependencies: rmp-serde, serde
// ============================================================================

//! ## Overview
//! Worker IPC is a stream of frames: a 4-byte big-endian length followed by
//! a msgpack payload. Frames above [`MAX_FRAME_BYTES`] are rejected on both
//! ends so a corrupted length can never trigger an unbounded allocation.
//! Framework errors inside the worker travel back as
//! [`WorkerMessage::Exception`] and re-raise in the coordinator.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Read;
use std::io::Write;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum accepted frame size (16 MiB).
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by frame encoding and decoding.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Stream I/O failure.
    #[error("ipc io error: {0}")]
    Io(String),
    /// The peer announced a frame larger than [`MAX_FRAME_BYTES`].
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES}-byte limit")]
    FrameTooLarge(u32),
    /// The payload failed msgpack decoding.
    #[error("ipc decode error: {0}")]
    Decode(String),
    /// The payload failed msgpack encoding.
    #[error("ipc encode error: {0}")]
    Encode(String),
    /// The stream ended cleanly between frames.
    #[error("ipc stream closed")]
    Closed,
}

// ============================================================================
// SECTION: Messages
// ============================================================================

/// A request from the orchestrator to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorMessage {
    /// Process one row through the named plugin.
    ProcessRow {
        /// Plugin to invoke.
        plugin_name: String,
        /// Token identifier for result correlation.
        token_id: String,
        /// State identifier for result correlation.
        state_id: String,
        /// Row data as plain JSON.
        row: Value,
    },
    /// Health probe.
    Ping,
    /// Orderly shutdown request (stdin close carries the same meaning).
    Shutdown,
}

/// A response from the worker to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// A processed row result.
    RowResult {
        /// Token identifier for result correlation.
        token_id: String,
        /// State identifier for result correlation.
        state_id: String,
        /// Result row as plain JSON.
        row: Value,
    },
    /// A typed plugin failure.
    RowError {
        /// Token identifier for result correlation.
        token_id: String,
        /// State identifier for result correlation.
        state_id: String,
        /// Failure reason label.
        reason: String,
        /// Whether the attempt may be retried.
        retryable: bool,
    },
    /// Health probe response.
    Pong,
    /// A framework error inside the worker; re-raised in the coordinator.
    Exception {
        /// Error rendering.
        message: String,
        /// Error kind label.
        #[serde(rename = "error_kind")]
        kind: String,
    },
}

// ============================================================================
// SECTION: Framing
// ============================================================================

/// Writes one length-prefixed msgpack frame.
///
/// # Errors
///
/// Returns [`IpcError`] when encoding or writing fails.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), IpcError> {
    let payload = rmp_serde::to_vec_named(message).map_err(|err| IpcError::Encode(err.to_string()))?;
    let length = u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge(u32::MAX))?;
    if length > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge(length));
    }
    writer
        .write_all(&length.to_be_bytes())
        .map_err(|err| IpcError::Io(err.to_string()))?;
    writer.write_all(&payload).map_err(|err| IpcError::Io(err.to_string()))?;
    writer.flush().map_err(|err| IpcError::Io(err.to_string()))
}

/// Reads one length-prefixed msgpack frame.
///
/// # Errors
///
/// Returns [`IpcError::Closed`] on clean end of stream and [`IpcError`]
/// variants for oversized, truncated, or undecodable frames.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T, IpcError> {
    let mut length_bytes = [0_u8; 4];
    match reader.read_exact(&mut length_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(IpcError::Closed);
        }
        Err(err) => return Err(IpcError::Io(err.to_string())),
    }
    let length = u32::from_be_bytes(length_bytes);
    if length > MAX_FRAME_BYTES {
        return Err(IpcError::FrameTooLarge(length));
    }
    let mut payload = vec![0_u8; length as usize];
    reader.read_exact(&mut payload).map_err(|err| IpcError::Io(err.to_string()))?;
    rmp_serde::from_slice(&payload).map_err(|err| IpcError::Decode(err.to_string()))
}
