//! Agent lifecycle, persistence and execution.
//!
//! An [`Agent`] moves through a strict [`AgentStatus`] table enforced by the
//! [`AgentRepository`] at its update boundary. Work is executed through an
//! [`AgentRunner`] chosen per [`AgentType`](fm_core::types::AgentType) from a
//! [`RunnerRegistry`].

pub mod agent;
pub mod error;
pub mod process;
pub mod repository;
pub mod runner;
pub mod service;

pub use agent::{Agent, AgentStatus, StatusChange};
pub use error::{AgentError, Result};
pub use process::ProcessRunner;
pub use repository::{AgentRepository, InMemoryAgentRepository};
pub use runner::{AgentRunner, AgentTask, RunnerRegistry};
pub use service::AgentService;
