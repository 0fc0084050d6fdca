//! PostgreSQL store (sqlx).
//!
//! Uniqueness invariants live in the schema (`migrations/0001_init.sql`):
//! the partial unique index on active sessions, the `(tenant_id,
//! idempotency_key)` constraint on orders, and `(tenant, username)` on users.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::id::{IdempotencyKey, OrderId, TenantId, UserId, uuidv7};
use crate::models::auth::{Session, User, UserCredentials};
use crate::models::order::{NewOrder, Order, OrderStatus};
use crate::models::tenant::{PagePermission, Tenant};

const USER_COLUMNS: &str = "id, tenant_id, username, email, display_name, role, user_type, \
                            is_active, last_login_at, password_hash, pin";

const SESSION_COLUMNS: &str = "id, user_id, tenant_id, token_hash, refresh_hash, created_at, \
                               last_activity, is_active, user_agent, ip_address";

const ORDER_COLUMNS: &str = "id, tenant_id, order_number, idempotency_key, items, pricing, \
                             customer, status, placed_by, created_at, updated_at, printed_at";

type UserRow = (
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    bool,
    Option<DateTime<Utc>>,
    String,
    Option<String>,
);

type SessionRow = (
    Uuid,
    String,
    Option<String>,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    bool,
    Option<String>,
    Option<String>,
);

type OrderRow = (
    Uuid,
    String,
    i64,
    String,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
    String,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

type TenantRow = (String, String, bool, serde_json::Value, DateTime<Utc>);

fn user_from_row(row: UserRow) -> UserCredentials {
    let (id, tenant_id, username, email, display_name, role, user_type, is_active, last_login_at, password_hash, pin) =
        row;
    UserCredentials {
        user: User {
            id: UserId::new(id),
            tenant_id: tenant_id.map(TenantId::new),
            username,
            email,
            display_name,
            role,
            user_type,
            is_active,
            last_login_at,
        },
        password_hash,
        pin,
    }
}

fn session_from_row(row: SessionRow) -> Session {
    let (id, user_id, tenant_id, token_hash, refresh_hash, created_at, last_activity, is_active, user_agent, ip_address) =
        row;
    Session {
        id,
        user_id: UserId::new(user_id),
        tenant_id: tenant_id.map(TenantId::new),
        token_hash,
        refresh_hash,
        created_at,
        last_activity,
        is_active,
        user_agent,
        ip_address,
    }
}

fn order_from_row(row: OrderRow) -> Result<Order, StoreError> {
    let (id, tenant_id, order_number, key, items, pricing, customer, status, placed_by, created_at, updated_at, printed_at) =
        row;
    let corrupt = |what: &str, e: serde_json::Error| StoreError::Corrupt(format!("order {id} {what}: {e}"));
    Ok(Order {
        id: OrderId::from(id),
        tenant_id: TenantId::new(tenant_id),
        order_number,
        idempotency_key: IdempotencyKey::new(key),
        items: serde_json::from_value(items).map_err(|e| corrupt("items", e))?,
        pricing: serde_json::from_value(pricing).map_err(|e| corrupt("pricing", e))?,
        customer: serde_json::from_value(customer).map_err(|e| corrupt("customer", e))?,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("order {id} status {status}")))?,
        placed_by: UserId::new(placed_by),
        created_at,
        updated_at,
        printed_at,
    })
}

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run all embedded migrations from `marquee_core/migrations/`.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "SELECT id, name, is_active, metadata, created_at FROM tenants WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, name, is_active, metadata, created_at)| Tenant {
            id: TenantId::new(id),
            name,
            is_active,
            metadata,
            created_at,
        }))
    }

    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO tenants (id, name, is_active, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE \
             SET name = EXCLUDED.name, is_active = EXCLUDED.is_active, metadata = EXCLUDED.metadata",
        )
        .bind(tenant.id.as_str())
        .bind(&tenant.name)
        .bind(tenant.is_active)
        .bind(&tenant.metadata)
        .bind(tenant.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_tenant_active(&self, id: &TenantId, active: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE tenants SET is_active = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_user(&self, credentials: &UserCredentials) -> Result<(), StoreError> {
        let user = &credentials.user;
        sqlx::query(
            "INSERT INTO users (id, tenant_id, username, email, display_name, role, user_type, \
                                is_active, last_login_at, password_hash, pin) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(user.id.as_str())
        .bind(user.tenant_id.as_ref().map(TenantId::as_str))
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.role)
        .bind(&user.user_type)
        .bind(user.is_active)
        .bind(user.last_login_at)
        .bind(&credentials.password_hash)
        .bind(&credentials.pin)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_admin_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserCredentials>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE tenant_id IS NULL AND lower(email) = lower($1)"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn find_tenant_users_by_username(
        &self,
        username: &str,
    ) -> Result<Vec<UserCredentials>, StoreError> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE tenant_id IS NOT NULL AND username = $1 ORDER BY id"
        ))
        .bind(username.trim())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(user_from_row).collect())
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<UserCredentials>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn set_user_active(&self, id: &UserId, active: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE users SET is_active = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_last_login(&self, id: &UserId, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_login_at = $2 WHERE id = $1")
            .bind(id.as_str())
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn role_permissions(&self, role: &str) -> Result<Vec<PagePermission>, StoreError> {
        let rows = sqlx::query_as::<_, (String, bool)>(
            "SELECT page, has_access FROM role_permissions WHERE role = $1 ORDER BY page",
        )
        .bind(role)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(page, has_access)| PagePermission { page, has_access })
            .collect())
    }

    async fn set_role_permissions(
        &self,
        role: &str,
        permissions: &[PagePermission],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM role_permissions WHERE role = $1")
            .bind(role)
            .execute(&mut *tx)
            .await?;
        for permission in permissions {
            sqlx::query("INSERT INTO role_permissions (role, page, has_access) VALUES ($1, $2, $3)")
                .bind(role)
                .bind(&permission.page)
                .bind(permission.has_access)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sessions WHERE user_id = $1 AND is_active")
            .bind(session.user_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(session.id)
        .bind(session.user_id.as_str())
        .bind(session.tenant_id.as_ref().map(TenantId::as_str))
        .bind(&session.token_hash)
        .bind(&session.refresh_hash)
        .bind(session.created_at)
        .bind(session.last_activity)
        .bind(session.is_active)
        .bind(&session.user_agent)
        .bind(&session.ip_address)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_active_session_by_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE token_hash = $1 AND is_active"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(session_from_row))
    }

    async fn find_active_session_by_refresh(
        &self,
        refresh_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE refresh_hash = $1 AND is_active"
        ))
        .bind(refresh_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(session_from_row))
    }

    async fn rotate_session_tokens(
        &self,
        session_id: Uuid,
        token_hash: &str,
        refresh_hash: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET token_hash = $2, refresh_hash = $3, last_activity = now() \
             WHERE id = $1 AND is_active",
        )
        .bind(session_id)
        .bind(token_hash)
        .bind(refresh_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET last_activity = $2 WHERE id = $1")
            .bind(session_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn deactivate_session(&self, token_hash: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET is_active = FALSE WHERE token_hash = $1 AND is_active",
        )
        .bind(token_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_sessions_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 AND is_active"
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(session_from_row).collect())
    }

    async fn find_order_by_key(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id.as_str())
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(order_from_row).transpose()
    }

    async fn insert_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        let items = serde_json::to_value(&order.items)
            .map_err(|e| StoreError::Corrupt(format!("items: {e}")))?;
        let pricing = serde_json::to_value(&order.pricing)
            .map_err(|e| StoreError::Corrupt(format!("pricing: {e}")))?;
        let customer = serde_json::to_value(&order.customer)
            .map_err(|e| StoreError::Corrupt(format!("customer: {e}")))?;

        let mut tx = self.pool.begin().await?;
        let order_number = sqlx::query_scalar::<_, i64>(
            "INSERT INTO order_counters (tenant_id, last_number) VALUES ($1, 1) \
             ON CONFLICT (tenant_id) DO UPDATE SET last_number = order_counters.last_number + 1 \
             RETURNING last_number",
        )
        .bind(order.tenant_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "INSERT INTO orders (id, tenant_id, order_number, idempotency_key, items, pricing, \
                                 customer, status, placed_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(uuidv7())
        .bind(order.tenant_id.as_str())
        .bind(order_number)
        .bind(order.idempotency_key.as_str())
        .bind(items)
        .bind(pricing)
        .bind(customer)
        .bind(OrderStatus::Accepted.as_str())
        .bind(order.placed_by.as_str())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        order_from_row(row)
    }

    async fn list_orders(
        &self,
        tenant_id: &TenantId,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE tenant_id = $1 \
             ORDER BY order_number DESC LIMIT $2"
        ))
        .bind(tenant_id.as_str())
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(order_from_row).collect()
    }

    async fn list_unprinted_orders(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE tenant_id = $1 AND printed_at IS NULL \
             ORDER BY order_number ASC"
        ))
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(order_from_row).collect()
    }

    async fn mark_order_printed(
        &self,
        tenant_id: &TenantId,
        order_id: &OrderId,
        at: DateTime<Utc>,
    ) -> Result<Option<Order>, StoreError> {
        let Ok(id) = Uuid::parse_str(order_id.as_str()) else {
            return Ok(None);
        };
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "UPDATE orders \
             SET printed_at = COALESCE(printed_at, $3), status = $4, updated_at = $3 \
             WHERE tenant_id = $1 AND id = $2 \
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(tenant_id.as_str())
        .bind(id)
        .bind(at)
        .bind(OrderStatus::Printed.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(order_from_row).transpose()
    }
}
