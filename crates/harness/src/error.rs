//! Error types for the conformance harness

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure of the command-execution transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("command timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    #[error("command exited with status {exit_code}: {stderr}")]
    CommandFailure { exit_code: i32, stderr: String },

    #[error("cannot reach endpoint {endpoint}: {reason}")]
    ConnectError { endpoint: String, reason: String },
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Validation error: {0}")]
    Validation(#[from] netcheck_common::Error),

    #[error("Invalid case: {0}")]
    InvalidCase(String),

    #[error("Suite parse error: {0}")]
    SpecParse(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error taxonomy reported on ERROR outcomes. Assertion failures are not
/// errors and never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    IoError,
    Timeout,
    SetupError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "VALIDATION"),
            ErrorKind::IoError => write!(f, "IO_ERROR"),
            ErrorKind::Timeout => write!(f, "TIMEOUT"),
            ErrorKind::SetupError => write!(f, "SETUP_ERROR"),
        }
    }
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::Timeout(_) => ErrorKind::Timeout,
            ProbeError::CommandFailure { .. } | ProbeError::ConnectError { .. } => ErrorKind::IoError,
        }
    }
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::Validation(_)
            | HarnessError::InvalidCase(_)
            | HarnessError::SpecParse(_)
            | HarnessError::Json(_)
            | HarnessError::Yaml(_) => ErrorKind::Validation,
            HarnessError::Setup(_) => ErrorKind::SetupError,
            HarnessError::Timeout(_) => ErrorKind::Timeout,
            HarnessError::Probe(e) => e.kind(),
            HarnessError::Io(_) => ErrorKind::IoError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        let timeout = HarnessError::from(ProbeError::Timeout(Duration::from_secs(1)));
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let refused = ProbeError::ConnectError {
            endpoint: "sonic1".to_string(),
            reason: "no such container".to_string(),
        };
        assert_eq!(HarnessError::from(refused).kind(), ErrorKind::IoError);

        let bad_mac = HarnessError::from(netcheck_common::Error::InvalidMac("zz".to_string()));
        assert_eq!(bad_mac.kind(), ErrorKind::Validation);
        assert_eq!(HarnessError::Setup("x".to_string()).kind(), ErrorKind::SetupError);
    }

    #[test]
    fn test_kind_serializes_as_taxonomy_name() {
        let json = serde_json::to_string(&ErrorKind::SetupError).unwrap();
        assert_eq!(json, "\"SETUP_ERROR\"");
        assert_eq!(ErrorKind::IoError.to_string(), "IO_ERROR");
    }
}
