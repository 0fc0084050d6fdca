//! Domain models.
//!
//! These are internal domain models, distinct from the HTTP DTOs in
//! `marquee_api::models` (which carry `#[serde(rename_all = "camelCase")]`).

pub mod agent;
pub mod auth;
pub mod order;
pub mod tenant;
