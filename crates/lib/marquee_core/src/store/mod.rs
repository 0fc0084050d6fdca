// @awa-component: DB-Store
//
//! Persistence boundary.
//!
//! All mutual exclusion is delegated to the store: one active session per
//! user, one order per `(tenant, idempotency key)`, unique usernames per
//! tenant. [`postgres::PgStore`] enforces these with unique indexes and
//! transactions; [`memory::MemoryStore`] mirrors the same semantics for tests
//! and `memory://` development runs.

pub mod memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::id::{IdempotencyKey, OrderId, TenantId, UserId};
use crate::models::auth::{Session, UserCredentials};
use crate::models::order::{NewOrder, Order};
use crate::models::tenant::{PagePermission, Tenant};

/// Poll interval when waiting for the store to become ready.
const READY_POLL: Duration = Duration::from_millis(200);

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database cannot be reached right now.
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("SQL error: {0}")]
    Sql(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
            _ => StoreError::Sql(e),
        }
    }
}

/// Shared handle to the active store.
pub type DynStore = Arc<dyn Store>;

/// Persistent state used by the order pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    // -- tenants ----------------------------------------------------------

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError>;

    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;

    /// Returns false when the tenant does not exist.
    async fn set_tenant_active(&self, id: &TenantId, active: bool) -> Result<bool, StoreError>;

    // -- users ------------------------------------------------------------

    /// Insert a user; `Conflict` when the username is taken within the tenant.
    async fn insert_user(&self, credentials: &UserCredentials) -> Result<(), StoreError>;

    /// Global administrators are looked up by email (case-insensitive).
    async fn find_admin_by_email(&self, email: &str)
    -> Result<Option<UserCredentials>, StoreError>;

    /// Tenant users sharing a username across tenants.
    async fn find_tenant_users_by_username(
        &self,
        username: &str,
    ) -> Result<Vec<UserCredentials>, StoreError>;

    async fn get_user(&self, id: &UserId) -> Result<Option<UserCredentials>, StoreError>;

    async fn set_user_active(&self, id: &UserId, active: bool) -> Result<bool, StoreError>;

    async fn record_last_login(&self, id: &UserId, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn role_permissions(&self, role: &str) -> Result<Vec<PagePermission>, StoreError>;

    async fn set_role_permissions(
        &self,
        role: &str,
        permissions: &[PagePermission],
    ) -> Result<(), StoreError>;

    // -- sessions ---------------------------------------------------------

    /// Delete every active session of `session.user_id` and insert `session`,
    /// atomically.
    async fn replace_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn find_active_session_by_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError>;

    async fn find_active_session_by_refresh(
        &self,
        refresh_hash: &str,
    ) -> Result<Option<Session>, StoreError>;

    /// Swap the token pair of an active session in place.
    /// Returns false when the session is no longer active.
    async fn rotate_session_tokens(
        &self,
        session_id: Uuid,
        token_hash: &str,
        refresh_hash: &str,
    ) -> Result<bool, StoreError>;

    async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Mark the session owning `token_hash` inactive. Returns false if none was active.
    async fn deactivate_session(&self, token_hash: &str) -> Result<bool, StoreError>;

    async fn active_sessions_for_user(&self, user_id: &UserId)
    -> Result<Vec<Session>, StoreError>;

    // -- orders -----------------------------------------------------------

    async fn find_order_by_key(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<Order>, StoreError>;

    /// Assign the next order number and insert, in one transaction.
    /// `Conflict` when `(tenant_id, idempotency_key)` already exists.
    async fn insert_order(&self, order: NewOrder) -> Result<Order, StoreError>;

    /// Most recent first.
    async fn list_orders(&self, tenant_id: &TenantId, limit: i64)
    -> Result<Vec<Order>, StoreError>;

    /// Oldest first.
    async fn list_unprinted_orders(&self, tenant_id: &TenantId)
    -> Result<Vec<Order>, StoreError>;

    async fn mark_order_printed(
        &self,
        tenant_id: &TenantId,
        order_id: &OrderId,
        at: DateTime<Utc>,
    ) -> Result<Option<Order>, StoreError>;
}

/// Wait until the store answers a ping, up to `timeout`.
pub async fn wait_until_ready(store: &dyn Store, timeout: Duration) -> Result<(), StoreError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match store.ping().await {
            Ok(()) => return Ok(()),
            Err(StoreError::Unavailable(msg)) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(StoreError::Unavailable(format!(
                        "not ready after {timeout:?}: {msg}"
                    )));
                }
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn ready_store_returns_immediately() {
        let store = MemoryStore::new();
        wait_until_ready(&store, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_store_times_out() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = wait_until_ready(&store, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn store_recovering_within_timeout_is_ready() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let recovering = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            recovering.set_available(true);
        });
        wait_until_ready(store.as_ref(), Duration::from_secs(2))
            .await
            .unwrap();
    }
}
