//! POS agent models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{OrderId, TenantId};
use crate::models::order::{CustomerInfo, Order, OrderItem, Pricing};

/// Lifecycle state of a tenant's agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Error,
}

/// Supervisor-side record for one tenant's agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub tenant_id: TenantId,
    pub tenant_name: String,
    pub state: AgentState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Describes the credential in use, never the secret itself.
    pub credentials_ref: Option<String>,
    pub last_error: Option<String>,
    pub jobs_printed: u64,
}

/// A receipt to print, derived from a persisted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintJob {
    pub order_id: OrderId,
    pub tenant_id: TenantId,
    pub order_number: i64,
    pub items: Vec<OrderItem>,
    pub pricing: Pricing,
    pub customer: CustomerInfo,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for PrintJob {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id.clone(),
            tenant_id: order.tenant_id.clone(),
            order_number: order.order_number,
            items: order.items.clone(),
            pricing: order.pricing.clone(),
            customer: order.customer.clone(),
            created_at: order.created_at,
        }
    }
}
