//! In-memory store.
//!
//! Mirrors the constraint semantics of the PostgreSQL schema. Every operation
//! runs under one short mutex section (never held across an await), which
//! plays the role of a database transaction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Store, StoreError};
use crate::id::{IdempotencyKey, OrderId, TenantId, UserId, uuidv7};
use crate::models::auth::{Session, UserCredentials};
use crate::models::order::{NewOrder, Order, OrderStatus};
use crate::models::tenant::{PagePermission, Tenant};

#[derive(Default)]
struct Inner {
    tenants: HashMap<TenantId, Tenant>,
    users: HashMap<UserId, UserCredentials>,
    permissions: HashMap<String, Vec<PagePermission>>,
    sessions: Vec<Session>,
    orders: Vec<Order>,
    counters: HashMap<TenantId, i64>,
}

/// Store backed by process memory.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the database going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Run `f` against the data, failing like an unreachable database when
    /// the store is switched off.
    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T, StoreError>) -> Result<T, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".into()))?;
        f(&mut *inner)
    }
}

fn same_tenant(a: &Option<TenantId>, b: &Option<TenantId>) -> bool {
    a == b
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.with(|_| Ok(()))
    }

    async fn get_tenant(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        self.with(|inner| Ok(inner.tenants.get(id).cloned()))
    }

    async fn upsert_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        self.with(|inner| {
            inner.tenants.insert(tenant.id.clone(), tenant.clone());
            Ok(())
        })
    }

    async fn set_tenant_active(&self, id: &TenantId, active: bool) -> Result<bool, StoreError> {
        self.with(|inner| match inner.tenants.get_mut(id) {
            Some(tenant) => {
                tenant.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn insert_user(&self, credentials: &UserCredentials) -> Result<(), StoreError> {
        self.with(|inner| {
            let user = &credentials.user;
            if inner.users.contains_key(&user.id) {
                return Err(StoreError::Conflict(format!("user id {} exists", user.id)));
            }
            let taken = inner.users.values().any(|existing| {
                same_tenant(&existing.user.tenant_id, &user.tenant_id)
                    && existing.user.username == user.username
            });
            if taken {
                return Err(StoreError::Conflict(format!(
                    "username {} exists in tenant",
                    user.username
                )));
            }
            inner.users.insert(user.id.clone(), credentials.clone());
            Ok(())
        })
    }

    async fn find_admin_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserCredentials>, StoreError> {
        let email = email.trim();
        self.with(|inner| {
            Ok(inner
                .users
                .values()
                .find(|c| {
                    c.user.tenant_id.is_none()
                        && c.user
                            .email
                            .as_deref()
                            .is_some_and(|e| e.eq_ignore_ascii_case(email))
                })
                .cloned())
        })
    }

    async fn find_tenant_users_by_username(
        &self,
        username: &str,
    ) -> Result<Vec<UserCredentials>, StoreError> {
        let username = username.trim();
        self.with(|inner| {
            let mut found: Vec<UserCredentials> = inner
                .users
                .values()
                .filter(|c| c.user.tenant_id.is_some() && c.user.username == username)
                .cloned()
                .collect();
            found.sort_by(|a, b| a.user.id.cmp(&b.user.id));
            Ok(found)
        })
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<UserCredentials>, StoreError> {
        self.with(|inner| Ok(inner.users.get(id).cloned()))
    }

    async fn set_user_active(&self, id: &UserId, active: bool) -> Result<bool, StoreError> {
        self.with(|inner| match inner.users.get_mut(id) {
            Some(c) => {
                c.user.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn record_last_login(&self, id: &UserId, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with(|inner| {
            if let Some(c) = inner.users.get_mut(id) {
                c.user.last_login_at = Some(at);
            }
            Ok(())
        })
    }

    async fn role_permissions(&self, role: &str) -> Result<Vec<PagePermission>, StoreError> {
        self.with(|inner| Ok(inner.permissions.get(role).cloned().unwrap_or_default()))
    }

    async fn set_role_permissions(
        &self,
        role: &str,
        permissions: &[PagePermission],
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            inner
                .permissions
                .insert(role.to_string(), permissions.to_vec());
            Ok(())
        })
    }

    async fn replace_session(&self, session: &Session) -> Result<(), StoreError> {
        self.with(|inner| {
            if inner
                .sessions
                .iter()
                .any(|s| s.token_hash == session.token_hash || s.id == session.id)
            {
                return Err(StoreError::Conflict("session token exists".into()));
            }
            inner
                .sessions
                .retain(|s| !(s.user_id == session.user_id && s.is_active));
            inner.sessions.push(session.clone());
            Ok(())
        })
    }

    async fn find_active_session_by_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        self.with(|inner| {
            Ok(inner
                .sessions
                .iter()
                .find(|s| s.is_active && s.token_hash == token_hash)
                .cloned())
        })
    }

    async fn find_active_session_by_refresh(
        &self,
        refresh_hash: &str,
    ) -> Result<Option<Session>, StoreError> {
        self.with(|inner| {
            Ok(inner
                .sessions
                .iter()
                .find(|s| s.is_active && s.refresh_hash == refresh_hash)
                .cloned())
        })
    }

    async fn rotate_session_tokens(
        &self,
        session_id: Uuid,
        token_hash: &str,
        refresh_hash: &str,
    ) -> Result<bool, StoreError> {
        self.with(|inner| {
            match inner
                .sessions
                .iter_mut()
                .find(|s| s.id == session_id && s.is_active)
            {
                Some(session) => {
                    session.token_hash = token_hash.to_string();
                    session.refresh_hash = refresh_hash.to_string();
                    session.last_activity = Utc::now();
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    async fn touch_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with(|inner| {
            if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == session_id) {
                session.last_activity = at;
            }
            Ok(())
        })
    }

    async fn deactivate_session(&self, token_hash: &str) -> Result<bool, StoreError> {
        self.with(|inner| {
            match inner
                .sessions
                .iter_mut()
                .find(|s| s.is_active && s.token_hash == token_hash)
            {
                Some(session) => {
                    session.is_active = false;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    async fn active_sessions_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<Session>, StoreError> {
        self.with(|inner| {
            Ok(inner
                .sessions
                .iter()
                .filter(|s| s.is_active && &s.user_id == user_id)
                .cloned()
                .collect())
        })
    }

    async fn find_order_by_key(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<Order>, StoreError> {
        self.with(|inner| {
            Ok(inner
                .orders
                .iter()
                .find(|o| &o.tenant_id == tenant_id && &o.idempotency_key == key)
                .cloned())
        })
    }

    async fn insert_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        self.with(|inner| {
            if !inner.tenants.contains_key(&order.tenant_id) {
                return Err(StoreError::NotFound(format!("tenant {}", order.tenant_id)));
            }
            let duplicate = inner.orders.iter().any(|o| {
                o.tenant_id == order.tenant_id && o.idempotency_key == order.idempotency_key
            });
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "idempotency key {} exists",
                    order.idempotency_key
                )));
            }
            let counter = inner.counters.entry(order.tenant_id.clone()).or_insert(0);
            *counter += 1;
            let now = Utc::now();
            let persisted = Order {
                id: OrderId::from(uuidv7()),
                tenant_id: order.tenant_id,
                order_number: *counter,
                idempotency_key: order.idempotency_key,
                items: order.items,
                pricing: order.pricing,
                customer: order.customer,
                status: OrderStatus::Accepted,
                placed_by: order.placed_by,
                created_at: now,
                updated_at: now,
                printed_at: None,
            };
            inner.orders.push(persisted.clone());
            Ok(persisted)
        })
    }

    async fn list_orders(
        &self,
        tenant_id: &TenantId,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        self.with(|inner| {
            Ok(inner
                .orders
                .iter()
                .rev()
                .filter(|o| &o.tenant_id == tenant_id)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    async fn list_unprinted_orders(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<Order>, StoreError> {
        self.with(|inner| {
            Ok(inner
                .orders
                .iter()
                .filter(|o| &o.tenant_id == tenant_id && o.printed_at.is_none())
                .cloned()
                .collect())
        })
    }

    async fn mark_order_printed(
        &self,
        tenant_id: &TenantId,
        order_id: &OrderId,
        at: DateTime<Utc>,
    ) -> Result<Option<Order>, StoreError> {
        self.with(|inner| {
            match inner
                .orders
                .iter_mut()
                .find(|o| &o.tenant_id == tenant_id && &o.id == order_id)
            {
                Some(order) => {
                    if order.printed_at.is_none() {
                        order.printed_at = Some(at);
                        order.status = OrderStatus::Printed;
                        order.updated_at = at;
                    }
                    Ok(Some(order.clone()))
                }
                None => Ok(None),
            }
        })
    }
}
