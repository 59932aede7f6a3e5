//! `hyperwire send`: one request to a peer, printing the response.

use crate::cmd::{load_node_config, runtime};
use crate::ui;
use hyperwire_types::Address;
use hyperwire_wire::{Node, Router, RpcError};
use std::path::PathBuf;
use std::time::Duration;

pub fn cmd_send(
    config: Option<PathBuf>,
    target: &str,
    body: String,
    timeout: Option<u64>,
    no_response: bool,
) {
    let target = Address::parse(target).unwrap_or_else(|e| {
        ui::error_with_fix(&e.to_string(), "Use the form node@process:package:publisher");
        std::process::exit(1);
    });
    let config = load_node_config(config);
    let timeout = timeout.map(Duration::from_secs);

    let rt = runtime();
    let outcome = rt.block_on(async move {
        // Dial-only, so a `serve` on this machine keeps its listen address.
        let node = match Node::start_tcp_client(&config, Router::new()) {
            Ok(node) => node,
            Err(e) => {
                ui::error(&format!("Failed to start node: {e}"));
                std::process::exit(1);
            }
        };

        let payload = body.into_bytes();
        let outcome = if no_response {
            node.send_fire_and_forget(target, payload).await.map(|()| None)
        } else {
            node.send(target, payload, timeout).await.map(Some)
        };
        node.shutdown().await;
        outcome
    });

    match outcome {
        Ok(Some(bytes)) => println!("{}", String::from_utf8_lossy(&bytes)),
        Ok(None) => ui::success("Sent"),
        Err(RpcError::Remote(reason)) => {
            ui::error(&format!("Remote error: {reason}"));
            std::process::exit(1);
        }
        Err(e @ RpcError::Timeout { .. }) => {
            ui::error_with_fix(&e.to_string(), "Raise --timeout or check the peer is running");
            std::process::exit(1);
        }
        Err(e) => {
            ui::error(&e.to_string());
            std::process::exit(1);
        }
    }
}
