//! Core types for Hyperwire, a peer-to-peer request/response layer.
//!
//! This crate defines the data shared by the wire layer and the CLI:
//! process and node addresses, node configuration, and the error types
//! raised while parsing them. It contains no networking.

pub mod address;
pub mod config;
pub mod error;

pub use address::{parse_process_id, Address, ProcessId};
pub use config::NodeConfig;
pub use error::{ConfigError, ParseError};
