//! Hyperwire CLI: parse addresses, run a node, send requests.
//!
//! Every command that touches the network starts a short-lived TCP node from
//! the config file and shuts it down before exiting.

mod cli;
mod cmd;
mod ui;

use crate::cli::*;
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    match cli.command {
        Commands::Parse { address } => cmd::parse::cmd_parse(&address),
        Commands::Serve { listen } => cmd::serve::cmd_serve(cli.config, listen),
        Commands::Send {
            target,
            body,
            timeout,
            no_response,
        } => cmd::send::cmd_send(cli.config, &target, body, timeout, no_response),
    }
}
