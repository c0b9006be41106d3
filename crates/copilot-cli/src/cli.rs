//! Clap CLI definitions for copilot.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  copilot serve 0.0.0.0:4444             Accept TLS connections on port 4444
  copilot node new edge                  Allow the node 'edge' to connect
  copilot node connect hub 10.0.0.1:4444 Dial 'hub' whenever the daemon runs
  copilot start                          Run the node daemon
  copilot node accept edge               Trust the certificate 'edge' presented

\x1b[1;36mFirst contact:\x1b[0m
  The first connection from a new node is refused and its certificate
  is held for approval. Accept it, and the next attempt succeeds.";

/// Copilot — a message bus spread across machines over pinned TLS.
#[derive(Parser)]
#[command(name = "copilot", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Name of this node (default: host name).
    #[arg(long, global = true)]
    pub node_name: Option<String>,

    /// Directory holding core.json and key material.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node daemon until Ctrl+C.
    Start,
    /// Make this node a TLS server on HOST:PORT.
    Serve {
        /// Address to listen on, e.g. 0.0.0.0:4444.
        addr: String,
    },
    /// Manage peer nodes (new, connect, accept, reject, delete, list) [*].
    #[command(subcommand)]
    Node(NodeCommands),
    /// Print this node's certificate fingerprint.
    Identity,
}

#[derive(Subcommand)]
pub enum NodeCommands {
    /// Allow a node to connect to us.
    New {
        /// Node name (the CN of its certificate).
        name: String,
    },
    /// Dial a node whenever the daemon runs.
    Connect {
        /// Node name (the CN of its certificate).
        name: String,
        /// Address of the node, e.g. 10.0.0.1:4444.
        addr: String,
    },
    /// Accept the certificate a node presented.
    Accept {
        /// Node name.
        name: String,
    },
    /// Forget every key and secret of a node.
    Reject {
        /// Node name.
        name: String,
    },
    /// Remove a node record.
    Delete {
        /// Node name.
        name: String,
    },
    /// Show node records.
    List {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}
