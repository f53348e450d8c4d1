//! Scheduled execution of delegated wallet operations.
//!
//! A user grants the agent a permission chain once; the keeper then derives narrowly
//! scoped sub-delegations per schedule and redeems them on a recurring basis for
//! transfers, swap series and portfolio rebalances.

pub mod collaborators;
pub mod config;
pub mod delegation;
pub mod encoder;
pub mod executor;
pub mod planner;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod store;
mod utils;

pub use config::Config;
pub use scheduler::{ExecutionScheduler, TickReport};
pub use service::AutomationService;
pub use utils::{
    error::{Error, Result},
    millis_since_unix_epoch,
};
