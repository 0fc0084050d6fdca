//! Tenant (theater) models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::TenantId;

/// A theater.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    /// When false, no token minted for this tenant's users authorizes anything.
    pub is_active: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// A fresh, active tenant with empty metadata.
    pub fn new(id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_active: true,
            metadata: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }
}

/// One entry of a role's page permission list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagePermission {
    pub page: String,
    pub has_access: bool,
}
