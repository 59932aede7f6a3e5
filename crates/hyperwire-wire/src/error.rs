//! Errors from the wire layer.

use crate::message::CorrelationId;
use std::time::Duration;
use thiserror::Error;

/// Failure to hand an envelope to the underlying channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Node unreachable: {0}")]
    Unreachable(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Failure to encode or decode a request or response body.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed call: {0}")]
    MalformedCall(String),
}

/// Outcome of a request that did not produce a successful response.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No matching response arrived before the deadline.
    #[error("Request {id} timed out after {after:?}")]
    Timeout { id: CorrelationId, after: Duration },

    /// The envelope could not be handed to the transport.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The remote side answered with a failure.
    #[error("Remote error: {0}")]
    Remote(String),

    /// The correlator was shut down before the request resolved.
    #[error("Correlator shut down")]
    Shutdown,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}
