//! `hyperwire serve`: run a TCP node with the built-in handlers.

use crate::cmd::{load_node_config, runtime};
use crate::ui;
use hyperwire_wire::codec::args;
use hyperwire_wire::{handler_fn, Node, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

/// Handlers every `serve` node answers.
///
/// - `"Ping"` returns `{"uptime_secs": n}`.
/// - `{"Echo": value}` returns `value`.
pub fn builtin_router(started: Instant) -> Router {
    Router::new()
        .route(
            "Ping",
            handler_fn(move |_ctx, _raw| async move {
                Ok::<Value, String>(json!({ "uptime_secs": started.elapsed().as_secs() }))
            }),
        )
        .route(
            "Echo",
            handler_fn(|_ctx, raw| async move { args::<Value>(raw) }),
        )
}

pub fn cmd_serve(config: Option<PathBuf>, listen: Option<SocketAddr>) {
    let mut config = load_node_config(config);
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }

    let rt = runtime();
    rt.block_on(async move {
        let router = builtin_router(Instant::now());
        let (node, local_addr) = match Node::start_tcp(&config, router).await {
            Ok(started) => started,
            Err(e) => {
                ui::error(&format!("Failed to start node: {e}"));
                std::process::exit(1);
            }
        };

        ui::section("Hyperwire node");
        ui::kv("Address", &node.our().to_string());
        ui::kv_ok("Listening", &local_addr.to_string());
        ui::kv("Peers", &config.peers.len().to_string());
        if config.shared_secret.is_empty() {
            ui::hint("no shared_secret set; any peer can connect");
        }
        ui::blank();

        if let Err(e) = tokio::signal::ctrl_c().await {
            ui::error(&format!("Failed to listen for Ctrl+C: {e}"));
        }
        node.shutdown().await;
        ui::success("Node stopped");
    });
}
