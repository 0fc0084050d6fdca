// @awa-component: CORE-TenantAuthorizer
//
//! Tenant (theater) authorization.
//!
//! [`authorize`] decides whether a caller may act on a tenant. The rules are
//! evaluated in a fixed order and the first one that applies decides:
//!
//! 1. no caller: `AuthRequired`
//! 2. global administrator: admitted for any tenant
//! 3. unknown tenant: `TheaterNotFound`
//! 4. inactive tenant: `TheaterInactive`
//! 5. caller belongs to the tenant: admitted
//! 6. anything else: `AccessDenied`

use thiserror::Error;
use tracing::debug;

use crate::id::TenantId;
use crate::models::auth::Caller;
use crate::store::{Store, StoreError};

/// Page guarding the order list.
pub const PAGE_ONLINE_POS: &str = "online-pos";

#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("Authentication required")]
    AuthRequired,

    #[error("Theater {0} not found")]
    TheaterNotFound(TenantId),

    #[error("Theater {0} is inactive")]
    TheaterInactive(TenantId),

    #[error("Access to theater {0} denied")]
    AccessDenied(TenantId),

    #[error("No access to page {0}")]
    InsufficientPermissions(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a caller was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    GlobalAdmin,
    TenantMember,
}

/// Decide whether `caller` may act on `tenant_id`.
pub async fn authorize(
    store: &dyn Store,
    caller: Option<&Caller>,
    tenant_id: &TenantId,
) -> Result<Admission, TenancyError> {
    let Some(caller) = caller else {
        return Err(TenancyError::AuthRequired);
    };
    if caller.is_global_admin() {
        return Ok(Admission::GlobalAdmin);
    }
    let Some(tenant) = store.get_tenant(tenant_id).await? else {
        return Err(TenancyError::TheaterNotFound(tenant_id.clone()));
    };
    if !tenant.is_active {
        return Err(TenancyError::TheaterInactive(tenant_id.clone()));
    }
    if caller.tenant_id.as_ref() == Some(&tenant.id) {
        return Ok(Admission::TenantMember);
    }
    debug!(
        user_id = %caller.user_id,
        caller_tenant = ?caller.tenant_id.as_ref().map(TenantId::as_str),
        requested = %tenant_id,
        "cross-tenant access denied"
    );
    Err(TenancyError::AccessDenied(tenant_id.clone()))
}

/// Reject a tenant-scoped caller whose own tenant has been deactivated (or
/// removed). Global administrators and tenantless callers pass.
pub async fn ensure_caller_tenant_active(
    store: &dyn Store,
    caller: &Caller,
) -> Result<(), TenancyError> {
    if caller.is_global_admin() {
        return Ok(());
    }
    let Some(tenant_id) = &caller.tenant_id else {
        return Ok(());
    };
    match store.get_tenant(tenant_id).await? {
        Some(tenant) if tenant.is_active => Ok(()),
        Some(_) => Err(TenancyError::TheaterInactive(tenant_id.clone())),
        None => Err(TenancyError::TheaterNotFound(tenant_id.clone())),
    }
}

/// Deny unless the caller's role carries `{page, hasAccess: true}`.
/// Super administrators bypass the overlay.
pub async fn require_page_access(
    store: &dyn Store,
    caller: &Caller,
    page: &str,
) -> Result<(), TenancyError> {
    if caller.is_super_admin() {
        return Ok(());
    }
    let permissions = store.role_permissions(&caller.role).await?;
    if permissions
        .iter()
        .any(|p| p.page == page && p.has_access)
    {
        Ok(())
    } else {
        Err(TenancyError::InsufficientPermissions(page.to_string()))
    }
}
