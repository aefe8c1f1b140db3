//! Waypost CLI: runs a node in the foreground and manages its identity key.

mod cli;
mod keys;

use crate::cli::{Cli, Commands};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use waypost_kernel::config::{default_key_path, load_config};
use waypost_kernel::tls::load_tls_acceptor;
use waypost_kernel::Node;
use waypost_types::config::{NodeConfig, ServerRole};

/// Trace to stderr. `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Start => cmd_start(config),
        Commands::Keygen { out, force } => cmd_keygen(&config, out, force),
        Commands::Roles => cmd_roles(&config),
    }
}

fn key_path(config: &NodeConfig) -> PathBuf {
    config
        .identity
        .key_path
        .clone()
        .unwrap_or_else(default_key_path)
}

fn fail(message: &str) -> ! {
    eprintln!("error: {message}");
    std::process::exit(1);
}

fn cmd_start(config: NodeConfig) {
    let keys = match keys::load_or_create(&key_path(&config)) {
        Ok(keys) => keys,
        Err(e) => fail(&format!("cannot load node identity: {e}")),
    };

    let tls = match (&config.tls.cert_path, &config.tls.key_path) {
        (Some(cert), Some(key)) => match load_tls_acceptor(cert, key) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => fail(&e.to_string()),
        },
        (None, None) => None,
        _ => fail("tls.cert_path and tls.key_path must be set together"),
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => fail(&format!("cannot start runtime: {e}")),
    };
    runtime.block_on(async move {
        let identity = keys.identity_id();
        let node = match Node::start(config, keys, tls).await {
            Ok(node) => node,
            Err(e) => fail(&e.to_string()),
        };
        for role in ServerRole::ALL {
            if let Some(addr) = node.local_addr(role) {
                info!(%role, %addr, "Serving");
            }
        }
        info!(%identity, "Node running, press Ctrl+C to stop");

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C, stopping");
        }
        info!("Shutting down");
        node.shutdown();
        node.wait().await;
    });
}

fn cmd_keygen(config: &NodeConfig, out: Option<PathBuf>, force: bool) {
    let path = out.unwrap_or_else(|| key_path(config));
    match keys::generate(&path, force) {
        Ok(keys) => print_identity(&path, &keys),
        Err(e) => fail(&e.to_string()),
    }
}

fn print_identity(path: &Path, keys: &waypost_types::identity::NodeKeys) {
    println!("Key written to {}", path.display());
    println!("  identity id: {}", keys.identity_id());
}

fn cmd_roles(config: &NodeConfig) {
    if let Err(e) = config.validate_listeners() {
        fail(&e.to_string());
    }
    println!("{:<8} {:<22} {}", "PORT", "ROLE", "TLS");
    for listener in &config.listeners {
        for role in &listener.roles {
            let tls = if role.is_encrypted() { "yes" } else { "no" };
            println!("{:<8} {:<22} {}", listener.port, role.to_string(), tls);
        }
    }
    if config.needs_tls() && (config.tls.cert_path.is_none() || config.tls.key_path.is_none()) {
        println!();
        println!("warning: encrypted roles are configured but no TLS certificate is set");
    }
}
