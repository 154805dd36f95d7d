//! # tiller-gateway
//!
//! The tool-execution safety gateway. Every tool call in the system flows
//! through [`ExecutionGateway`]: free tools run immediately, cloud tools
//! are gated by the budget ledger, and hazardous tools are parked behind
//! a human confirmation token with a hard TTL. Classification is fixed at
//! registration time.

pub mod classify;
pub mod gateway;

pub use classify::{HazardClass, ToolClass};
pub use gateway::{ConfirmReply, ExecutionGateway, ExecutionOutcome};
