//! Queue records and the persisted per-tenant blob.

use std::fmt;

use chrono::{DateTime, Utc};
use marquee_core::id::{IdempotencyKey, OrderId, TenantId};
use marquee_core::models::order::{CustomerInfo, OrderItem};
use serde::{Deserialize, Serialize};

/// What the terminal hands to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDraft {
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub tax_cents: i64,
    #[serde(default)]
    pub customer: CustomerInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Synced,
    Failed,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InFlight => "in_flight",
            QueueStatus::Synced => "synced",
            QueueStatus::Failed => "failed",
        })
    }
}

/// An order waiting for, or done with, delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOrder {
    pub idempotency_key: IdempotencyKey,
    pub tenant_id: TenantId,
    pub draft: OrderDraft,
    pub status: QueueStatus,
    pub attempts: u32,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Server-side identity once accepted.
    #[serde(default)]
    pub order_id: Option<OrderId>,
    #[serde(default)]
    pub order_number: Option<i64>,
}

impl QueuedOrder {
    pub fn new(tenant_id: TenantId, draft: OrderDraft, now: DateTime<Utc>) -> Self {
        Self {
            idempotency_key: IdempotencyKey::generate(),
            tenant_id,
            draft,
            status: QueueStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            created_at: now,
            synced_at: None,
            last_error: None,
            order_id: None,
            order_number: None,
        }
    }

    /// Pending and past its backoff.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Everything stored for one tenant, rewritten whole on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueBlob {
    #[serde(default)]
    pub queue: Vec<QueuedOrder>,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl QueueBlob {
    pub fn find_mut(&mut self, key: &IdempotencyKey) -> Option<&mut QueuedOrder> {
        self.queue.iter_mut().find(|o| &o.idempotency_key == key)
    }

    pub fn count(&self, status: QueueStatus) -> usize {
        self.queue.iter().filter(|o| o.status == status).count()
    }
}

/// Drain progress for the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

impl SyncProgress {
    pub fn idle() -> Self {
        Self {
            current: 0,
            total: 0,
            message: "idle".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> OrderDraft {
        OrderDraft {
            items: vec![OrderItem {
                product_id: None,
                name: "Popcorn".into(),
                quantity: 1,
                unit_price_cents: 450,
            }],
            tax_cents: 0,
            customer: CustomerInfo::default(),
        }
    }

    #[test]
    fn blob_uses_the_documented_field_names() {
        let now = Utc::now();
        let blob = QueueBlob {
            queue: vec![QueuedOrder::new(TenantId::new("T1"), draft(), now)],
            last_sync_time: Some(now),
        };
        let json = serde_json::to_value(&blob).unwrap();
        assert!(json["lastSyncTime"].is_string());
        assert_eq!(json["queue"][0]["status"], "pending");
        assert_eq!(json["queue"][0]["attempts"], 0);
        assert!(json["queue"][0]["idempotencyKey"].is_string());
        assert!(json["queue"][0]["nextAttemptAt"].is_null());
    }

    #[test]
    fn due_only_when_pending_and_past_backoff() {
        let now = Utc::now();
        let mut order = QueuedOrder::new(TenantId::new("T1"), draft(), now);
        assert!(order.is_due(now));

        order.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(!order.is_due(now));
        assert!(order.is_due(now + chrono::Duration::seconds(5)));

        order.next_attempt_at = None;
        order.status = QueueStatus::Failed;
        assert!(!order.is_due(now));
    }

    #[test]
    fn every_order_gets_its_own_key() {
        let now = Utc::now();
        let a = QueuedOrder::new(TenantId::new("T1"), draft(), now);
        let b = QueuedOrder::new(TenantId::new("T1"), draft(), now);
        assert_ne!(a.idempotency_key, b.idempotency_key);
    }
}
