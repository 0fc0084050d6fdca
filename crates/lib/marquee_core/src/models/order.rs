//! Order ledger models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{IdempotencyKey, OrderId, TenantId, UserId};

/// One line of an order. Amounts are minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    #[serde(default)]
    pub product_id: Option<String>,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl OrderItem {
    pub fn line_total_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }
}

/// Server-computed pricing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

impl Pricing {
    /// Sum the items and add the supplied tax.
    pub fn compute(items: &[OrderItem], tax_cents: i64) -> Self {
        let subtotal_cents = items.iter().map(OrderItem::line_total_cents).sum();
        Self {
            subtotal_cents,
            tax_cents,
            total_cents: subtotal_cents + tax_cents,
        }
    }
}

/// Who the order is for. Seat and QR name come from the per-seat QR code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub seat: Option<String>,
    #[serde(default)]
    pub qr_name: Option<String>,
}

/// Lifecycle of a persisted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Accepted,
    Printed,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Accepted => "accepted",
            OrderStatus::Printed => "printed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(OrderStatus::Accepted),
            "printed" => Some(OrderStatus::Printed),
            _ => None,
        }
    }
}

/// An order as persisted in the tenant's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub tenant_id: TenantId,
    /// Monotonically unique within the tenant.
    pub order_number: i64,
    pub idempotency_key: IdempotencyKey,
    pub items: Vec<OrderItem>,
    pub pricing: Pricing,
    pub customer: CustomerInfo,
    pub status: OrderStatus,
    pub placed_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub printed_at: Option<DateTime<Utc>>,
}

/// An order about to be inserted; the store assigns id and number.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub tenant_id: TenantId,
    pub idempotency_key: IdempotencyKey,
    pub items: Vec<OrderItem>,
    pub pricing: Pricing,
    pub customer: CustomerInfo,
    pub placed_by: UserId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(quantity: u32, unit_price_cents: i64) -> OrderItem {
        OrderItem {
            product_id: None,
            name: "Popcorn".into(),
            quantity,
            unit_price_cents,
        }
    }

    #[test]
    fn pricing_sums_line_totals_and_tax() {
        let pricing = Pricing::compute(&[item(2, 450), item(1, 300)], 120);
        assert_eq!(pricing.subtotal_cents, 1200);
        assert_eq!(pricing.total_cents, 1320);
    }

    #[test]
    fn status_parses_its_own_strings() {
        for status in [OrderStatus::Accepted, OrderStatus::Printed] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("shipped"), None);
    }
}
