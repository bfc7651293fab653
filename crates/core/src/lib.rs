//! Core types for the oracle price-feed engine
//!
//! This crate provides the shared data model used by the engine and its host:
//! - Price observations and committed aggregates
//! - Update policies and aggregation methods
//! - Source health and metrics snapshots
//! - Engine configuration
//! - Error taxonomy

pub mod types;
pub mod policy;
pub mod metrics;
pub mod config;
pub mod errors;

pub use types::*;
pub use policy::*;
pub use metrics::*;
pub use config::*;
pub use errors::*;
