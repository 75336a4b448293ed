//! Core domain models for jobflow
//!
//! This module defines the job record, its lifecycle states, the error
//! taxonomy, and the data handed to generators.

pub mod artifact;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod params;
pub mod state;

pub use artifact::*;
pub use context::*;
pub use error::*;
pub use job::*;
pub use state::*;
