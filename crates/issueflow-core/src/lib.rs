pub mod action;
pub mod action_log;
pub mod collab;
pub mod config;
pub mod conversation;
pub mod error;
pub mod generation;
pub mod ingress;
pub mod orchestrator;
pub mod refine;
pub mod store;
pub mod tracker;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::{FlowError, Result};

use chrono::{DateTime, SubsecRound, Utc};

/// Current time at the precision the store persists (microseconds), so a
/// value read back compares equal to the one written.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
