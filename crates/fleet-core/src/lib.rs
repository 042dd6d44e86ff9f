//! fleet-core: shared data model and configuration for the fleet
//! coordination stack.
//!
//! Everything here is plain data: target descriptors, group definitions,
//! command requests/results, audit records, and the JSON config document
//! that seeds them. Behavior lives in `fleet-transport` and `fleet-control`.

pub mod config;
pub mod envsub;
pub mod types;

pub use config::{Config, ConfigError};
pub use types::{
    AuditRecord, CommandRequest, CommandResult, ConnectionInfo, ConnectionStatus, Decision,
    DenyReason, FailureKind, Group, GroupRestrictions, Outcome, RestrictedCategory, Target,
};
