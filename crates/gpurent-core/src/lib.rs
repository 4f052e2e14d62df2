//! # gpurent Core
//!
//! Core domain logic for gpurent GPU marketplace management.
//!
//! This crate contains pure business logic with no I/O dependencies:
//! - Offer, instance-snapshot and image-tag models
//! - Error definitions
//! - Bid/outbid and cost derivations
//! - Search-query assembly
//!
//! ## Design Principles
//!
//! - **Pure Functions**: No side effects, easy to test
//! - **Domain-Driven**: Models real-world GPU rental concepts
//! - **Dependency-Free**: No I/O, networking, or persistence dependencies

pub mod errors;
pub mod models;
pub mod query;

// Re-export commonly used types
pub use errors::{CoreError, Result};
pub use models::{
    accrued_cost, is_outbid, DockerTag, ErrorMatch, InstanceSnapshot, InstanceType, Offer,
    BID_EPSILON,
};
pub use query::{compatibility_query, split_query};
