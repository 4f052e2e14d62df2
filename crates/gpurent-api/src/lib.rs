//! # gpurent API
//!
//! Marketplace command layer for the gpurent project: a normalizer that
//! gives every vendor command a uniform `(lines, tables)` result, and a
//! typed facade translating those results into domain calls.

pub mod args;
pub mod client;
pub mod errors;
pub mod market;
pub mod runner;

// Re-export common types for convenience
pub use args::Flags;
pub use client::{resolve_api_key, CmdClient, CmdOptions, API_KEY_ENV, API_KEY_FILE, DEFAULT_SERVER_URL};
pub use errors::{ApiError, HttpError, Result};
pub use market::{CopyPath, CreateOptions, ListMachineOptions, Marketplace};
pub use runner::{CliRunner, CmdOutput, CommandRunner, Table, DEFAULT_PROGRAM};

// Re-export core types that API consumers will need
pub use gpurent_core::{DockerTag, InstanceSnapshot, InstanceType, Offer};
