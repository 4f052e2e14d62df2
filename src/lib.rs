//! # gpurent
//!
//! Client SDK for a GPU-rental marketplace: search offers, provision an
//! instance from the best match, poll it to a usable state, move files on
//! and off it, and tear it down. Spend is tracked along the way, and
//! provider-side conditions such as being outbid on a spot instance
//! surface as typed failures.
//!
//! The [`Instance`] controller is the stateful part; everything below it
//! ([`Marketplace`], the command normalizer in `gpurent-api`) is a single
//! round trip per call.

pub mod blocking;
pub mod errors;
pub mod instance;
pub mod probe;

// Re-export commonly used types
pub use errors::{Error, Result};
pub use instance::{Instance, InstanceConfig};

// Re-export the layers below for construction and richer use
pub use gpurent_api::{
    CliRunner, CommandRunner, CopyPath, CreateOptions, Marketplace, DEFAULT_SERVER_URL,
};
pub use gpurent_core::{
    DockerTag, ErrorMatch, InstanceSnapshot, InstanceType, Offer, BID_EPSILON,
};
