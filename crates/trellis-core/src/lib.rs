//! Trellis Core
//!
//! Core domain types, traits, and error handling for Trellis.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates: the matrix definition, resolved job specs,
//! execution results and the ports the scheduler drives.

pub mod definition;
pub mod error;
pub mod ids;
pub mod interpolation;
pub mod job;
pub mod ports;
pub mod run;

pub use error::{DefinitionError, ProvisionError};
pub use ids::*;
