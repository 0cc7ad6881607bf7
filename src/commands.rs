//! Command-line interface definitions, parsed with `clap`.
//!
//! ```text
//! carmatch init
//! carmatch import listings.json
//! carmatch sync --all [--force]
//! carmatch sync v-123 v-456
//! carmatch search "SUV diesel até 120 mil" -k 5
//! carmatch remove v-123
//! carmatch chat --email ana@example.com --name Ana
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Semantic vehicle matching: embeddings, search and the sales assistant.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Configuration file. Defaults to `config.yaml` in the platform config directory.
    #[arg(short = 'c', long, global = true, env = "CARMATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Write a default config and prompts file to the config directory.
    Init,

    /// Load listings from a JSON array and embed them.
    Import {
        file: PathBuf,

        /// Only store the listings; run `sync` later.
        #[arg(long)]
        no_sync: bool,
    },

    /// Bring stored embeddings up to date.
    Sync {
        /// Vehicle ids to sync.
        #[arg(required_unless_present = "all")]
        ids: Vec<String>,

        /// Sync every stored vehicle.
        #[arg(long, conflicts_with = "ids")]
        all: bool,

        /// Re-embed even when the description did not change.
        #[arg(long)]
        force: bool,
    },

    /// Find listings matching a free-text query.
    #[clap(alias = "s")]
    Search {
        query: String,

        /// Number of results (capped by `search.max_results`).
        #[arg(short = 'k', long)]
        k: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete a listing and its embedding.
    Remove { id: String },

    /// Talk to the sales assistant. `/new` starts over, `exit` quits.
    #[clap(alias = "i")]
    Chat {
        /// Email of a signed-in user; skips the email prompt.
        #[arg(long)]
        email: Option<String>,

        /// Name sent to the assistant with each request.
        #[arg(long)]
        name: Option<String>,
    },
}
