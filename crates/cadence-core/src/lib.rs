//! Cadence Core
//!
//! Core domain types, traits, and error handling for the Cadence scheduler.
//! This crate has minimal dependencies and defines the shared vocabulary
//! (materials, revisions, build causes, pipeline instances) used across all
//! other crates.

pub mod build_cause;
pub mod error;
pub mod events;
pub mod ids;
pub mod instance;
pub mod label;
pub mod material;
pub mod operation;
pub mod pipeline;
pub mod ports;

pub use error::{Error, Result};
pub use ids::*;
