//! Request and response bodies.

use chrono::{DateTime, Utc};
use marquee_core::id::{IdempotencyKey, OrderId, TenantId, UserId};
use marquee_core::models::agent::{AgentRegistration, PrintJob};
use marquee_core::models::auth::{Caller, User};
use marquee_core::models::order::{CustomerInfo, Order, OrderItem, OrderStatus};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Username for theater users, email for administrators.
    #[serde(alias = "email", alias = "identifier")]
    pub username: String,
    pub password: String,
}

/// Public view of a user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub role: String,
    pub user_type: String,
    pub tenant_id: Option<TenantId>,
}

impl From<&User> for AuthUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            role: user.role.clone(),
            user_type: user.user_type.clone(),
            tenant_id: user.tenant_id.clone(),
        }
    }
}

impl From<&Caller> for AuthUser {
    fn from(caller: &Caller) -> Self {
        Self {
            id: caller.user_id.clone(),
            username: caller.username.clone(),
            email: None,
            display_name: None,
            role: caller.role.clone(),
            user_type: caller.user_type.clone(),
            tenant_id: caller.tenant_id.clone(),
        }
    }
}

/// Envelope between the password step and the PIN step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAuth {
    pub user_id: UserId,
    pub login_username: String,
    pub tenant_id: Option<TenantId>,
    /// Pending token; must be presented to `/auth/validate-pin`.
    pub ephemeral_secret: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_pin_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_auth: Option<PendingAuth>,
    #[serde(flatten)]
    pub tokens: Option<TokenResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatePinRequest {
    pub user_id: UserId,
    pub pin: String,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(alias = "pendingToken")]
    pub ephemeral_secret: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<AuthUser>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatePinResponse {
    pub success: bool,
    #[serde(flatten)]
    pub tokens: TokenResponse,
    /// Delegated credential for the tenant's POS agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_grant: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// `POST /auth/agent-token`: a grant, or password + PIN for a tenant.
#[derive(Debug, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum AgentTokenRequest {
    Grant {
        grant: String,
    },
    Password {
        username: String,
        password: String,
        #[serde(default)]
        pin: Option<String>,
        tenant_id: TenantId,
    },
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub valid: bool,
    pub session_id: uuid::Uuid,
    pub user_id: UserId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    pub user: AuthUser,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOrderRequest {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub idempotency_key: Option<IdempotencyKey>,
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub tax_cents: i64,
    #[serde(default)]
    pub customer: CustomerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOrderResponse {
    pub success: bool,
    pub order_id: OrderId,
    pub order_number: i64,
    pub status: OrderStatus,
}

impl From<&Order> for SubmitOrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            success: true,
            order_id: order.id.clone(),
            order_number: order.order_number,
            // Replays answer exactly like the original acceptance.
            status: OrderStatus::Accepted,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantQuery {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct OrderListResponse {
    pub orders: Vec<Order>,
}

#[derive(Debug, Serialize)]
pub struct UnprintedResponse {
    pub jobs: Vec<PrintJob>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantBody {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub success: bool,
    pub order: Order,
}

// ---------------------------------------------------------------------------
// Agents & notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAgentRequest {
    pub tenant_id: TenantId,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub pin: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAgentRequest {
    pub tenant_id: TenantId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusResponse {
    pub running: bool,
    pub registration: AgentRegistration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Restrict to connections of one tenant.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub db_connected: bool,
}
