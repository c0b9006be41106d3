//! Copilot CLI — run a node and administer its peers.
//!
//! `start` boots the kernel and runs until Ctrl+C. Every other command edits
//! the node directory (`core.json`) or the key material and exits.

mod cli;
mod table;
mod ui;

use crate::cli::*;
use anyhow::Context;
use clap::Parser;
use copilot_kernel::config::load_config;
use copilot_kernel::{commands, CopilotKernel};
use copilot_types::config::CopilotConfig;
use copilot_types::{NodeRecord, NodeRole};
use serde_json::json;
use std::future::Future;
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, else `fallback`.
fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

fn init_tracing(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file, then apply command-line overrides. Problems with
/// the file are reported through a temporary warn-level subscriber, since
/// the real one depends on the file's `log_level`.
fn resolve_config(cli: &Cli) -> CopilotConfig {
    let early = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_writer(std::io::stderr)
        .finish();
    let mut config =
        tracing::subscriber::with_default(early, || load_config(cli.config.as_deref()));
    if let Some(name) = &cli.node_name {
        config.node_name = name.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    config
}

fn block_on<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;
    Ok(rt.block_on(future))
}

fn main() {
    let cli = Cli::parse();
    let config = resolve_config(&cli);
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    init_tracing(&level);

    let result = match cli.command {
        Commands::Start => cmd_start(config),
        Commands::Serve { addr } => cmd_serve(&config, &addr),
        Commands::Node(sub) => match sub {
            NodeCommands::New { name } => cmd_node_new(&config, &name),
            NodeCommands::Connect { name, addr } => cmd_node_connect(&config, &name, &addr),
            NodeCommands::Accept { name } => cmd_node_accept(&config, &name),
            NodeCommands::Reject { name } => cmd_node_reject(&config, &name),
            NodeCommands::Delete { name } => cmd_node_delete(&config, &name),
            NodeCommands::List { json } => cmd_node_list(&config, json),
        },
        Commands::Identity => cmd_identity(&config),
    };

    if let Err(e) = result {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

fn cmd_start(config: CopilotConfig) -> anyhow::Result<()> {
    ui::banner();
    ui::blank();
    block_on(async move {
        let kernel = CopilotKernel::boot(config)
            .await
            .context("Failed to boot the node")?;
        ui::kv("Node", &kernel.config.node_name);
        ui::kv("Fingerprint", kernel.wire.identity.fingerprint());
        ui::kv("Directory", &kernel.config.nodes_path().display().to_string());

        let bound = kernel.start().await?;
        for addr in &bound {
            ui::kv("Listening", &addr.to_string());
        }
        ui::blank();
        ui::hint("Press Ctrl+C to stop.");

        tokio::signal::ctrl_c().await?;
        ui::blank();
        kernel.shutdown().await;
        ui::success("Stopped");
        Ok(())
    })?
}

// ---------------------------------------------------------------------------
// Node directory
// ---------------------------------------------------------------------------

fn cmd_serve(config: &CopilotConfig, addr: &str) -> anyhow::Result<()> {
    let directory = commands::open_directory(config);
    let record = block_on(commands::serve(&directory, &config.node_name, addr))??;
    ui::success(&format!(
        "'{}' will serve TLS on {}",
        record.name,
        record.address()
    ));
    Ok(())
}

fn cmd_node_new(config: &CopilotConfig, name: &str) -> anyhow::Result<()> {
    let directory = commands::open_directory(config);
    block_on(commands::allow_incoming(&directory, name))??;
    ui::success(&format!("'{name}' may connect to this node"));
    ui::hint(&format!(
        "its first connection is held for approval: copilot node accept {name}"
    ));
    Ok(())
}

fn cmd_node_connect(config: &CopilotConfig, name: &str, addr: &str) -> anyhow::Result<()> {
    let directory = commands::open_directory(config);
    let record = block_on(commands::connect_to(&directory, name, addr))??;
    ui::success(&format!("Will connect to '{name}' at {}", record.address()));
    Ok(())
}

fn cmd_node_accept(config: &CopilotConfig, name: &str) -> anyhow::Result<()> {
    let directory = commands::open_directory(config);
    let fingerprint = block_on(commands::accept(&directory, name))?
        .with_context(|| format!("Could not accept '{name}'"))?;
    ui::success(&format!("Accepted '{name}'"));
    ui::kv("Fingerprint", &fingerprint);
    Ok(())
}

fn cmd_node_reject(config: &CopilotConfig, name: &str) -> anyhow::Result<()> {
    let directory = commands::open_directory(config);
    block_on(commands::reject(&directory, name))?
        .with_context(|| format!("Could not reject '{name}'"))?;
    ui::success(&format!("Forgot every key and secret of '{name}'"));
    Ok(())
}

fn cmd_node_delete(config: &CopilotConfig, name: &str) -> anyhow::Result<()> {
    let directory = commands::open_directory(config);
    block_on(commands::delete(&directory, name))??;
    ui::success(&format!("Deleted '{name}'"));
    Ok(())
}

fn trust_label(record: &NodeRecord) -> &'static str {
    if record.is_accepted() {
        "accepted"
    } else if record.is_requested() {
        "requested"
    } else {
        "-"
    }
}

fn role_label(role: NodeRole) -> String {
    match role {
        NodeRole::Undefined => "-".to_string(),
        other => other.to_string(),
    }
}

fn cmd_node_list(config: &CopilotConfig, as_json: bool) -> anyhow::Result<()> {
    let directory = commands::open_directory(config);
    let records = commands::list(&directory)?;

    if as_json {
        // Secrets stay in core.json.
        let mut nodes = serde_json::Map::new();
        for record in &records {
            nodes.insert(
                record.name.clone(),
                json!({
                    "type": i64::from(record.role),
                    "host": record.effective_host(),
                    "port": record.effective_port(),
                    "trust": trust_label(record),
                    "fingerprint": record.pinned_fingerprint().or(record.pending_fingerprint()),
                    "secret": record.shared_secret().is_some(),
                }),
            );
        }
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }

    if records.is_empty() {
        ui::hint("No nodes yet. Try `copilot node new <name>`.");
        return Ok(());
    }
    let mut table = table::Table::new(&["Name", "Type", "Address", "Trust", "Secret"]);
    for record in &records {
        let role = role_label(record.role);
        let address = record.address();
        let secret = if record.shared_secret().is_some() {
            "yes"
        } else {
            "no"
        };
        table.add_row(&[
            record.name.as_str(),
            role.as_str(),
            address.as_str(),
            trust_label(record),
            secret,
        ]);
    }
    table.print();
    Ok(())
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

fn cmd_identity(config: &CopilotConfig) -> anyhow::Result<()> {
    let identity = commands::identity(config)?;
    ui::section("Identity");
    ui::kv("Node", identity.node_name());
    ui::kv("Fingerprint", identity.fingerprint());
    Ok(())
}
