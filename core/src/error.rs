//! Error taxonomy for specfix operations.
//!
//! Failure classes are kept distinct on purpose: untrusted-input
//! validation failures name the offending field, lifecycle misuse is a
//! state-contract error rather than a validation error, and
//! remote-service failures carry enough detail to be surfaced terminal
//! and unretried by this crate.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// specfix result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An untrusted input failed validation. `field` names the offending
    /// parameter (`spec_location`, `commit_id`, `output_path`, ...).
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// An operation was invoked in a state its contract forbids
    /// (e.g. sending a message before the conversation exists).
    #[error("{0}")]
    State(String),

    /// A command token was rejected by the allow-list gate.
    #[error("Command '{0}' is not in the allowed commands list")]
    CommandNotAllowed(String),

    /// The executable for a sanctioned spawn could not be found.
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    /// A spawned process exceeded its timeout and was killed.
    #[error("Process '{command}' timed out after {timeout:?}")]
    ProcessTimeout { command: String, timeout: Duration },

    /// No credential source in the chain could produce a token.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The remote agents service returned an error response.
    #[error("Agents service error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// A remote run never reached a terminal state within the configured
    /// maximum wait.
    #[error("Run {run_id} did not reach a terminal state within {max_wait:?}")]
    RunTimeout { run_id: String, max_wait: Duration },

    /// A remote run reached a terminal state other than completion.
    #[error("Run {run_id} ended in terminal status {status}")]
    RunFailed { run_id: String, status: String },

    /// The remote service answered with a body this crate cannot use.
    #[error("Failed to parse service response: {0}")]
    Parse(String),

    /// The operation was cancelled via its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to load configuration from {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Convenience constructor for field-attributed validation failures.
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_field() {
        let err = Error::validation("commit_id", "must be 6-40 hexadecimal characters");
        let rendered = err.to_string();
        assert!(rendered.contains("commit_id"));
        assert!(rendered.contains("hexadecimal"));
    }

    #[test]
    fn command_gate_error_matches_allowlist_wording() {
        let err = Error::CommandNotAllowed("malicious-command".to_string());
        assert!(err.to_string().contains("not in the allowed commands list"));
    }
}
