//! # carmatch
//!
//! Semantic matching for a vehicle marketplace:
//!
//! - **Embeddings** ([`embedding`], [`sync`]): each listing is rendered into a fixed-order
//!   Portuguese description ([`vehicle::describe`]) and embedded. [`sync::EmbeddingSync`]
//!   keeps the stored vector current when a listing changes, one vehicle at a time.
//! - **Search** ([`search`]): free-text queries are embedded with the same model and
//!   ranked by cosine similarity against the [`vector_store::VehicleStore`].
//! - **Assistant** ([`session`], [`stream`], [`chat`], [`assistant`]): a per-session
//!   state machine that asks anonymous visitors for an email before the first answer,
//!   then streams replies from the chat backend into the transcript, grounded in
//!   matching inventory.
//!
//! Storage is either in memory ([`vector_store::InMemoryVehicleStore`]) or SQLite
//! through Diesel ([`sqlite_store::SqliteVehicleStore`]).
//!
//! ## Configuration directory
//! [`config_dir`] resolves the per-platform location of `config.yaml` and
//! `prompts.yaml`, e.g. `~/.config/carmatch` on Linux.

use directories::ProjectDirs;
use std::path::PathBuf;

pub mod assistant;
pub mod chat;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod error;
pub mod format;
pub mod models;
pub mod prompts;
pub mod schema;
pub mod search;
pub mod session;
pub mod sqlite_store;
pub mod stream;
pub mod sync;
pub mod vector_store;
pub mod vehicle;

use error::{MatchError, Result};

/// Per-platform configuration directory. Not created here.
///
/// # Errors
/// [`MatchError::Config`] when the platform has no home directory to anchor it.
pub fn config_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "carmatch", "carmatch")
        .ok_or_else(|| MatchError::Config("unable to determine config directory".into()))?;
    Ok(proj_dirs.config_dir().to_path_buf())
}
