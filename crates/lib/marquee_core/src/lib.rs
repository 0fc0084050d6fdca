//! # marquee_core
//!
//! Core domain logic for Marquee: identifiers, domain models, token and
//! credential primitives, tenant authorization, persistence, the notification
//! bus and the POS agent supervisor.

pub mod agent;
pub mod auth;
pub mod bus;
pub mod id;
pub mod models;
pub mod store;
pub mod tenancy;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
