//! Business logic behind the handlers.

pub mod agent_backend;
pub mod auth;
pub mod orders;
