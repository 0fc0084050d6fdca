//! Authentication domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{TenantId, UserId};

/// Global administrator with unrestricted tenant access.
pub const ROLE_SUPER_ADMIN: &str = "super_admin";
/// Global administrator.
pub const ROLE_ADMIN: &str = "admin";
/// Synthetic role carried by POS agent sessions.
pub const ROLE_POS_AGENT: &str = "pos_agent";

/// `userType` of global administrators.
pub const USER_TYPE_ADMIN: &str = "admin";
/// `userType` of theater staff accounts.
pub const USER_TYPE_THEATER_USER: &str = "theater_user";
/// `userType` of customer accounts (phone-identified).
pub const USER_TYPE_CUSTOMER: &str = "customer";
/// `userType` of agent principals.
pub const USER_TYPE_AGENT: &str = "agent";

/// True when either field names a global administrator (case-insensitive).
pub fn is_global_admin(role: &str, user_type: &str) -> bool {
    [role, user_type].iter().any(|value| {
        let value = value.trim();
        value.eq_ignore_ascii_case(ROLE_SUPER_ADMIN) || value.eq_ignore_ascii_case(ROLE_ADMIN)
    })
}

/// True when either field names a super administrator (case-insensitive).
pub fn is_super_admin(role: &str, user_type: &str) -> bool {
    [role, user_type]
        .iter()
        .any(|value| value.trim().eq_ignore_ascii_case(ROLE_SUPER_ADMIN))
}

/// Domain user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    /// `None` for global administrators.
    pub tenant_id: Option<TenantId>,
    pub username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: String,
    pub user_type: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_global_admin(&self) -> bool {
        is_global_admin(&self.role, &self.user_type)
    }
}

/// User with secrets (for internal auth flows only).
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user: User,
    pub password_hash: String,
    /// 4-digit secondary factor; `None` for accounts without PIN step.
    pub pin: Option<String>,
}

/// Result of a successful password step.
#[derive(Debug, Clone)]
pub struct AuthenticatedPrincipal {
    pub user: User,
    /// Tenant users must complete the PIN step before any token is issued.
    pub requires_pin: bool,
}

/// Persisted login session. At most one active session per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub user_id: UserId,
    pub tenant_id: Option<TenantId>,
    /// SHA-256 of the access token.
    pub token_hash: String,
    /// SHA-256 of the refresh token.
    pub refresh_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_active: bool,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// What a signed token may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Bearer token for protected endpoints.
    Access,
    /// Exchanged for a new token pair.
    Refresh,
    /// Envelope between the password step and the PIN step; no authority.
    Pending,
    /// Delegated credential handed to the tenant's POS agent.
    AgentGrant,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::Pending => "pending",
            TokenKind::AgentGrant => "agent_grant",
        }
    }
}

/// JWT claims embedded in every token Marquee signs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub user_id: UserId,
    pub username: String,
    pub role: String,
    pub user_type: String,
    pub tenant_id: Option<TenantId>,
    /// Session (or grant) identifier; makes every issued token unique.
    pub sid: Uuid,
    pub kind: TokenKind,
    /// Expiry (unix timestamp).
    pub exp: i64,
    /// Issued at (unix timestamp).
    pub iat: i64,
}

/// Identity fields copied into a token.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub user_id: UserId,
    pub username: String,
    pub role: String,
    pub user_type: String,
    pub tenant_id: Option<TenantId>,
}

impl From<&User> for TokenSubject {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id.clone(),
            username: user.username.clone(),
            role: user.role.clone(),
            user_type: user.user_type.clone(),
            tenant_id: user.tenant_id.clone(),
        }
    }
}

impl From<&TokenClaims> for TokenSubject {
    fn from(claims: &TokenClaims) -> Self {
        Self {
            user_id: claims.user_id.clone(),
            username: claims.username.clone(),
            role: claims.role.clone(),
            user_type: claims.user_type.clone(),
            tenant_id: claims.tenant_id.clone(),
        }
    }
}

/// Verified caller of a protected request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    pub user_id: UserId,
    pub username: String,
    pub role: String,
    pub user_type: String,
    pub tenant_id: Option<TenantId>,
    pub session_id: Uuid,
}

impl Caller {
    pub fn is_global_admin(&self) -> bool {
        is_global_admin(&self.role, &self.user_type)
    }

    pub fn is_super_admin(&self) -> bool {
        is_super_admin(&self.role, &self.user_type)
    }
}

impl From<TokenClaims> for Caller {
    fn from(claims: TokenClaims) -> Self {
        Self {
            user_id: claims.user_id,
            username: claims.username,
            role: claims.role,
            user_type: claims.user_type,
            tenant_id: claims.tenant_id,
            session_id: claims.sid,
        }
    }
}
