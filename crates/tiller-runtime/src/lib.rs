//! # tiller-runtime
//!
//! Wires the durable store, the tiered router, the execution gateway, and
//! the autonomous scheduler into a single [`Orchestrator`]. Hosts build
//! one with their inference backends and classified tools, then drive it:
//! `route` for interactive requests, `confirm` for parked actions, `run`
//! for the scheduler loop.

pub mod orchestrator;

pub use orchestrator::{Orchestrator, OrchestratorBuilder, RuntimeStatus};
