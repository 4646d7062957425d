//! Shared vocabulary for the foreman workspace: domain types, the lifecycle
//! event bus, configuration and cooperative shutdown.

pub mod config;
pub mod event_bus;
pub mod events;
pub mod shutdown;
pub mod types;
