//! fleet-control: the coordination core.
//!
//! Registry of targets and groups, the command policy engine, the
//! connection manager that owns per-target transports, the append-only
//! audit log, the command executor that chains the gates together, and the
//! `CoordinationService` facade the daemon talks to.

pub mod audit;
pub mod connection;
pub mod executor;
pub mod policy;
pub mod registry;
pub mod service;

pub use executor::{CommandExecutor, ExecutorError};
pub use service::CoordinationService;
