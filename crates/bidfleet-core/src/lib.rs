//! bidfleet Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - the fleet reconciler and offer selector (bidfleet-orchestrator)
//! - marketplace and throughput-estimator clients
//!
//! Key types:
//! - Marketplace / ThroughputEstimator traits (interfaces for external collaborators)
//! - Machine, Offer and Descriptor records, validated once at the client boundary
//! - Error types

pub mod error;
pub mod traits;
pub mod types;

pub use error::*;
pub use traits::*;
pub use types::*;
