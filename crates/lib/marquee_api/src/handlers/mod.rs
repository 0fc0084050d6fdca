//! Request handlers.

pub mod agents;
pub mod auth;
pub mod health;
pub mod notifications;
pub mod orders;
pub mod stream;
