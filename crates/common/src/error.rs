//! Error types for netcheck

use thiserror::Error;

/// Result type alias using the netcheck Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating topologies and frame specs.
///
/// Every variant here is a VALIDATION failure: it is raised before any
/// transport is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Invalid IPv4 address (expected dotted quad): {0}")]
    InvalidIpv4(String),

    #[error("Invalid {field}: {value} (expected 0..={max})")]
    OutOfRange {
        field: &'static str,
        value: i64,
        max: i64,
    },

    #[error("Invalid frame spec: {0}")]
    InvalidFrame(String),

    #[error("Unknown port {0} in topology")]
    UnknownPort(i64),

    #[error("Unknown endpoint {0} in topology")]
    UnknownEndpoint(String),

    #[error("Duplicate {kind} {id} in topology")]
    Duplicate { kind: &'static str, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn out_of_range(field: &'static str, value: i64, max: i64) -> Self {
        Error::OutOfRange { field, value, max }
    }
}
