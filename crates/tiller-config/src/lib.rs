//! # tiller-config
//!
//! Configuration schema and loader for `tiller.toml`.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    validate_schedule_spec, BudgetConfig, CacheConfig, ConfidenceWeights, ConfirmationConfig,
    JobConfig, LoggingConfig, PriceTable, RouterConfig, SchedulerConfig, StoreConfig, TillerConfig,
};
