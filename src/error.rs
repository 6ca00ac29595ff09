//! Custom error types for the diagnostics suite.
//!
//! `EmError` is the single error type surfaced by the session layer. It
//! follows the error taxonomy of the tool:
//!
//! - **Fatal / configuration** (`Connection`, `Configuration`, `Config`): raised
//!   immediately and never retried. They reach the caller before any
//!   instrument state is touched.
//! - **Remote** (`Remote`): a call into the automation server failed. Wraps the
//!   `anyhow::Error` produced by the [`Microscope`](crate::scope::Microscope)
//!   implementation so the `?` operator works across the seam.
//! - **Correction** (`Correction`): astigmatism or coma correction failed while
//!   focusing. The remote session has already been terminated when this is
//!   returned.
//! - **NotConverged**: an iterative loop exhausted its iteration budget.
//!
//! Best-effort degradations (unsupported readout mode, missing aperture
//! control) are not errors; they are reported through
//! [`Change`](crate::session::Change).

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, EmError>;

/// Errors raised by sessions and diagnostics.
#[derive(Error, Debug)]
pub enum EmError {
    /// The automation server could not be reached
    #[error("Cannot reach automation server at {address}: {reason}")]
    Connection {
        /// `host:port` that was dialled
        address: String,
        /// Underlying socket error
        reason: String,
    },

    /// Settings could not be read
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings were read but are invalid
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Run directory or log file error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server rejected or failed a call
    #[error("Remote call failed: {0:#}")]
    Remote(#[from] anyhow::Error),

    /// An autofocus or aberration correction failed
    #[error("{kind} correction failed: {reason}")]
    Correction {
        /// Which correction, e.g. `Astigmatism`
        kind: &'static str,
        /// Server or loop message
        reason: String,
    },

    /// A feedback loop ran out of iterations
    #[error("{operation} did not converge after {iterations} iterations (last value {last:.3})")]
    NotConverged {
        /// Loop name
        operation: &'static str,
        /// Iterations run
        iterations: u32,
        /// Value seen on the last iteration
        last: f64,
    },

    /// The operator cancelled or the run cannot go on
    #[error("Test aborted: {0}")]
    Aborted(String),
}

impl EmError {
    /// True for errors that must stop a run before anything else happens.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EmError::Connection { .. } | EmError::Config(_) | EmError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EmError::Configuration("camera 4 out of range".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: camera 4 out of range"
        );
    }

    #[test]
    fn test_remote_error_keeps_context() {
        let inner = anyhow::anyhow!("timeout").context("SetMag");
        let err = EmError::from(inner);
        assert_eq!(err.to_string(), "Remote call failed: SetMag: timeout");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_connection_error_is_fatal() {
        let err = EmError::Connection {
            address: "127.0.0.1:48888".into(),
            reason: "refused".into(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("127.0.0.1:48888"));
    }
}
