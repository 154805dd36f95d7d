//! # tiller-router
//!
//! The tiered inference router. Requests flow cache → local → augmented →
//! frontier, escalating only when the composite confidence score of the
//! current tier's answer falls below the configured threshold. Paid tiers
//! are gated by the budget ledger, failures absorb into confidence 0, and
//! every routing decision is durably audited before it is returned.

pub mod confidence;
pub mod fingerprint;
pub mod mock;
pub mod router;

pub use confidence::ConfidenceScorer;
pub use fingerprint::fingerprint;
pub use mock::{MockOutcome, MockTier};
pub use router::TierRouter;
