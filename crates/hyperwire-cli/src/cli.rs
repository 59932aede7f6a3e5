//! Clap CLI definitions for Hyperwire.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  hyperwire parse alice.os@chat:app:alice.os    Check an address
  hyperwire serve                               Run a node with the built-in handlers
  hyperwire send bob.os@hyperwire:hyperwire:sys '\"Ping\"'
  hyperwire send bob.os@hyperwire:hyperwire:sys '{\"Echo\":\"hi\"}' --timeout 5";

/// Hyperwire: addressed request/response messaging between nodes.
#[derive(Parser)]
#[command(name = "hyperwire", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.hyperwire/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse an address of the form node@process:package:publisher.
    Parse {
        /// The address to parse.
        address: String,
    },
    /// Run a node that serves Ping and Echo until Ctrl+C.
    Serve {
        /// Override the configured listen address.
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Send a request body to a process on a peer node.
    Send {
        /// Target address (node@process:package:publisher).
        target: String,
        /// Request body, sent as-is (e.g. '"Ping"' or '{"Echo":"hi"}').
        body: String,
        /// Seconds to wait for the response (default: from config).
        #[arg(long)]
        timeout: Option<u64>,
        /// Do not wait for a response.
        #[arg(long)]
        no_response: bool,
    },
}
