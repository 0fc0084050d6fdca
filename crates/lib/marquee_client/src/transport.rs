//! Delivery of queued orders to the server.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use marquee_core::id::{IdempotencyKey, OrderId, TenantId};
use marquee_core::models::order::{CustomerInfo, OrderItem};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{QueueError, QueueResult};
use crate::model::QueuedOrder;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// `POST /orders` body. The key travels in the header too.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload<'a> {
    pub tenant_id: &'a TenantId,
    pub idempotency_key: &'a IdempotencyKey,
    pub items: &'a [OrderItem],
    pub tax_cents: i64,
    pub customer: &'a CustomerInfo,
}

impl<'a> From<&'a QueuedOrder> for OrderPayload<'a> {
    fn from(order: &'a QueuedOrder) -> Self {
        Self {
            tenant_id: &order.tenant_id,
            idempotency_key: &order.idempotency_key,
            items: &order.draft.items,
            tax_cents: order.draft.tax_cents,
            customer: &order.draft.customer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub order_id: OrderId,
    pub order_number: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// How the server answered one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// 2xx.
    Accepted(Option<Receipt>),
    /// 409: the server already holds this key.
    Duplicate,
    /// 5xx: try again later.
    Unavailable(String),
    /// Any other 4xx: needs user action.
    Rejected { status: u16, reason: String },
}

impl Delivery {
    /// Classify a response by status and body.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        match status {
            200..=299 => Delivery::Accepted(serde_json::from_slice(body).ok()),
            409 => Delivery::Duplicate,
            500..=599 => Delivery::Unavailable(reason(status, body)),
            _ => Delivery::Rejected {
                status,
                reason: reason(status, body),
            },
        }
    }
}

fn reason(status: u16, body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            code: Some(code), ..
        }) => format!("{status} {code}"),
        Ok(ErrorEnvelope {
            error: Some(error), ..
        }) => format!("{status} {error}"),
        _ => format!("HTTP {status}"),
    }
}

#[async_trait]
pub trait OrderTransport: Send + Sync {
    /// One delivery attempt. `Err` means the server was never reached.
    async fn submit(&self, order: &QueuedOrder) -> QueueResult<Delivery>;
}

/// Submits orders to a Marquee server over HTTP.
#[derive(Debug)]
pub struct HttpOrderTransport {
    base_url: Url,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl HttpOrderTransport {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self {
            base_url,
            client,
            token: RwLock::new(None),
        }
    }

    /// Access token sent with every submission.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|p| p.into_inner()) = token;
    }

    fn token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl OrderTransport for HttpOrderTransport {
    async fn submit(&self, order: &QueuedOrder) -> QueueResult<Delivery> {
        let url = self
            .base_url
            .join("orders")
            .map_err(|e| QueueError::Protocol(format!("bad url: {e}")))?;
        let mut request = self
            .client
            .post(url)
            .timeout(REQUEST_TIMEOUT)
            .header(IDEMPOTENCY_KEY_HEADER, order.idempotency_key.as_str())
            .json(&OrderPayload::from(order));
        if let Some(token) = self.token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(Delivery::from_response(status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_classified() {
        let ok = br#"{"success":true,"orderId":"o-1","orderNumber":7,"status":"accepted"}"#;
        assert_eq!(
            Delivery::from_response(200, ok),
            Delivery::Accepted(Some(Receipt {
                order_id: OrderId::new("o-1"),
                order_number: 7,
            }))
        );
        assert_eq!(Delivery::from_response(409, b""), Delivery::Duplicate);
        assert!(matches!(
            Delivery::from_response(503, br#"{"error":"x","code":"DATABASE_NOT_READY"}"#),
            Delivery::Unavailable(reason) if reason == "503 DATABASE_NOT_READY"
        ));
        assert!(matches!(
            Delivery::from_response(403, br#"{"error":"x","code":"THEATER_ACCESS_DENIED"}"#),
            Delivery::Rejected { status: 403, .. }
        ));
        assert!(matches!(
            Delivery::from_response(400, b"<html>"),
            Delivery::Rejected { status: 400, reason } if reason == "HTTP 400"
        ));
    }

    #[test]
    fn payload_carries_the_key() {
        let order = QueuedOrder::new(
            TenantId::new("T1"),
            crate::model::OrderDraft {
                items: Vec::new(),
                tax_cents: 12,
                customer: CustomerInfo::default(),
            },
            chrono::Utc::now(),
        );
        let json = serde_json::to_value(OrderPayload::from(&order)).unwrap();
        assert_eq!(json["idempotencyKey"], order.idempotency_key.as_str());
        assert_eq!(json["tenantId"], "T1");
        assert_eq!(json["taxCents"], 12);
    }
}
