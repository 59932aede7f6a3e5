//! Command implementations.

pub mod parse;
pub mod send;
pub mod serve;

use crate::ui;
use hyperwire_types::config::{load_config, try_load_config};
use hyperwire_types::NodeConfig;
use std::path::PathBuf;

/// Load the node config, exiting on an invalid explicit file.
///
/// An explicit `--config` path must load and validate. Without one the
/// default location is tried and defaults are used if it is missing.
pub fn load_node_config(path: Option<PathBuf>) -> NodeConfig {
    let config = match path {
        Some(path) => try_load_config(&path).unwrap_or_else(|e| {
            ui::error_with_fix(&e.to_string(), "Check the file path and TOML syntax");
            std::process::exit(1);
        }),
        None => load_config(None),
    };
    if let Err(e) = config.validate() {
        ui::error(&e.to_string());
        std::process::exit(1);
    }
    config
}

/// A Tokio runtime for one command.
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        ui::error(&format!("Failed to create Tokio runtime: {e}"));
        std::process::exit(1);
    })
}
