//! # tiller-core
//!
//! Core types, traits, and primitives for the Tiller orchestration core.
//! This crate defines the shared vocabulary used by every other crate in
//! the workspace.

pub mod capability;
pub mod error;
pub mod types;

pub use capability::{InferenceTier, TierConstraints, TierResponse, ToolAdapter, ToolOutcome};
pub use error::{Result, TillerError};
pub use types::*;
