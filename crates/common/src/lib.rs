//! Netcheck Common Library
//!
//! Shared value objects for the netcheck conformance framework: the lab
//! topology and the frame specifications used both to build injectable
//! frames and to match captured ones.

pub mod error;
pub mod frame;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use frame::{build_frame, describe, matches, FramePattern, FrameSpec, ParsedFrame};
pub use types::*;

/// Netcheck version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
