// elspeth-sandbox/src/worker.rs
// ============================================================================
// Module: Sandbox Worker Process
// Description: Subprocess lifecycle for isolated plugin execution.
// Purpose: Spawn plugin workers with scrubbed environments and escalating
//          shutdown, speaking length-prefixed msgpack over stdio.
// Dependencies: libc, crate::ipc
// ============================================================================

//! ## Overview
//! The optional worker sandbox runs user-supplied plugin code in a separate
//! process. The orchestrator spawns the worker with a scrubbed environment
//! (no cloud credentials, no session keys), communicates over stdin/stdout
//! frames, and shuts it down by closing stdin, waiting, then escalating
//! SIGTERM and SIGKILL. The worker opens no listening sockets.
//!
//! In production the orchestrator, sidecar, and worker run under three
//! distinct UIDs; UID provisioning is host configuration, and same-UID
//! development runs skip the UID assertions.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::BufReader;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

use crate::ipc;
use crate::ipc::IpcError;
use crate::ipc::OrchestratorMessage;
use crate::ipc::WorkerMessage;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment key substrings that must never reach a worker.
const ENV_DENY_SUBSTRINGS: &[&str] = &["session_key", "aws_", "azure_", "gcp_", "_secret"];

/// Grace period between stdin close and SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors raised by the worker handle.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker process could not be spawned.
    #[error("worker spawn failed: {0}")]
    Spawn(String),
    /// IPC with the worker failed.
    #[error(transparent)]
    Ipc(#[from] IpcError),
    /// The worker reported a framework exception; re-raised here.
    #[error("worker exception ({kind}): {message}")]
    WorkerException {
        /// Error kind label from the worker.
        kind: String,
        /// Error rendering from the worker.
        message: String,
    },
    /// The worker exited before answering.
    #[error("worker exited unexpectedly")]
    Exited,
}

// ============================================================================
// SECTION: Environment Scrubbing
// ============================================================================

/// Returns true when an environment key may be passed to a worker.
///
/// Keys are rejected when their lowercase form contains any deny substring
/// or equals the framework's own signing-key variable.
#[must_use]
pub fn env_key_allowed(key: &str, signing_key_var: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    if key == signing_key_var {
        return false;
    }
    !ENV_DENY_SUBSTRINGS.iter().any(|needle| lowered.contains(needle))
}

/// Filters a full environment down to the worker-safe subset.
#[must_use]
pub fn scrub_environment(
    env: impl IntoIterator<Item = (String, String)>,
    signing_key_var: &str,
) -> Vec<(String, String)> {
    env.into_iter().filter(|(key, _)| env_key_allowed(key, signing_key_var)).collect()
}

// ============================================================================
// SECTION: Worker Handle
// ============================================================================

/// Handle to a spawned worker subprocess.
pub struct WorkerHandle {
    /// The child process.
    child: Child,
    /// Buffered reader over the worker's stdout.
    reader: Option<BufReader<std::process::ChildStdout>>,
}

impl WorkerHandle {
    /// Spawns a worker running `program` with `args`.
    ///
    /// The child's environment is cleared and repopulated with the scrubbed
    /// subset of the orchestrator's environment. Stdio pipes are created by
    /// the standard library with close-on-exec semantics; nothing else is
    /// inherited.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Spawn`] when the process cannot start.
    pub fn spawn(program: &str, args: &[&str], signing_key_var: &str) -> Result<Self, WorkerError> {
        let safe_env = scrub_environment(std::env::vars(), signing_key_var);
        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(safe_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| WorkerError::Spawn(err.to_string()))?;
        let reader = child.stdout.take().map(BufReader::new);
        Ok(Self { child, reader })
    }

    /// Sends one message to the worker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] when the pipe is gone or encoding fails.
    pub fn send(&mut self, message: &OrchestratorMessage) -> Result<(), WorkerError> {
        let Some(stdin) = self.child.stdin.as_mut() else {
            return Err(WorkerError::Exited);
        };
        ipc::write_frame(stdin, message)?;
        Ok(())
    }

    /// Receives the next message from the worker.
    ///
    /// Worker-side framework errors arrive as exception frames and re-raise
    /// here as [`WorkerError::WorkerException`].
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] on stream closure or decode failure.
    pub fn receive(&mut self) -> Result<WorkerMessage, WorkerError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(WorkerError::Exited);
        };
        let message: WorkerMessage = ipc::read_frame(reader)?;
        if let WorkerMessage::Exception { message, kind } = message {
            return Err(WorkerError::WorkerException { kind, message });
        }
        Ok(message)
    }

    /// Shuts the worker down: close stdin, wait, escalate terminate, kill.
    ///
    /// Returns the exit success flag when the worker exited on its own.
    pub fn shutdown(mut self) -> Option<bool> {
        drop(self.child.stdin.take());
        if let Some(status) = self.wait_with_deadline(SHUTDOWN_GRACE) {
            return Some(status);
        }
        terminate(&self.child);
        if let Some(status) = self.wait_with_deadline(TERM_GRACE) {
            return Some(status);
        }
        if self.child.kill().is_ok() {
            return self.child.wait().ok().map(|status| status.success());
        }
        None
    }

    /// Polls the child until exit or deadline.
    fn wait_with_deadline(&mut self, deadline: Duration) -> Option<bool> {
        let started = Instant::now();
        while started.elapsed() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => return Some(status.success()),
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(_) => return None,
            }
        }
        None
    }
}

/// Sends SIGTERM to the child on unix targets.
#[cfg(unix)]
fn terminate(child: &Child) {
    let pid = child.id();
    if let Ok(pid) = i32::try_from(pid) {
        // SAFETY: kill(2) with a valid pid and SIGTERM mutates no memory in
        // this process; the worst outcome is ESRCH for an exited child.
        #[allow(unsafe_code, reason = "SIGTERM escalation requires the raw kill(2) syscall")]
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

/// Terminate fallback for non-unix targets: no signal escalation.
#[cfg(not(unix))]
fn terminate(_child: &Child) {}
