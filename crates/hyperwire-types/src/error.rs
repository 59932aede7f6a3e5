//! Shared error types.

use thiserror::Error;

/// Failure to parse an address string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The input does not have the `process:package:publisher` shape, or one
    /// of its segments (or the node name) is empty.
    #[error("Malformed address: {0:?}")]
    MalformedAddress(String),
}

/// Failure to load a configuration file explicitly.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        /// Path that was parsed.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A field holds a value that cannot be used.
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid {
        /// Offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}
