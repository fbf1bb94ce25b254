//! Control plane for a fleet of messaging-bot workers.
//!
//! The manager owns the instance registry and the worker processes; it never
//! speaks the messaging protocol itself. Everything it knows about a worker's
//! session comes from the files the worker publishes in its instance
//! directory.

pub mod auth;
pub mod config;
pub mod error;
pub mod launcher;
pub mod main_instance;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod source;
pub mod state;
pub mod supervisor;
pub mod telemetry;

/// Package version and source revision stamped in by the build script.
pub const BUILD_ID: &str = env!("FLEET_BUILD_ID");

#[cfg(test)]
mod testing;
