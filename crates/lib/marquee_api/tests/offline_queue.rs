//! The client order queue against the real router: offline enqueue, drain
//! on reconnect, outages and lost responses.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request};
use common::*;
use marquee_client::transport::OrderPayload;
use marquee_client::{
    Connectivity, Delivery, FileStorage, OrderDraft, OrderQueue, OrderTransport, QueueConfig,
    QueueError, QueueResult, QueueStatus, QueuedOrder, ReachabilityProbe,
};
use marquee_core::id::{IdempotencyKey, TenantId};
use marquee_core::models::order::{CustomerInfo, OrderItem};
use marquee_core::store::Store;
use tower::ServiceExt;

/// The terminal's link to the server, which can be cut.
struct Link {
    router: Router,
    token: String,
    up: AtomicBool,
    /// Responses to swallow after the server handled the request.
    lose_responses: AtomicUsize,
}

impl Link {
    fn new(router: Router, token: String) -> Arc<Self> {
        Arc::new(Self {
            router,
            token,
            up: AtomicBool::new(false),
            lose_responses: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ReachabilityProbe for Link {
    async fn is_reachable(&self) -> bool {
        if !self.up.load(Ordering::SeqCst) {
            return false;
        }
        let request = Request::get("/health").body(Body::empty()).unwrap();
        match self.router.clone().oneshot(request).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl OrderTransport for Link {
    async fn submit(&self, order: &QueuedOrder) -> QueueResult<Delivery> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("network is down".into()));
        }
        let body = serde_json::to_vec(&OrderPayload::from(order)).unwrap();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/orders")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.token))
            .header("idempotency-key", order.idempotency_key.as_str())
            .body(Body::from(body))
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status().as_u16();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let lost = self
            .lose_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(QueueError::Transport("connection reset".into()));
        }
        Ok(Delivery::from_response(status, &bytes))
    }
}

fn draft(seat: &str) -> OrderDraft {
    OrderDraft {
        items: vec![OrderItem {
            product_id: Some("P1".into()),
            name: "Popcorn".into(),
            quantity: 1,
            unit_price_cents: 450,
        }],
        tax_cents: 45,
        customer: CustomerInfo {
            seat: Some(seat.into()),
            ..CustomerInfo::default()
        },
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        settle_delay: Duration::from_millis(10),
        poll_interval: Duration::from_secs(60),
        synced_ttl: Duration::from_secs(24 * 60 * 60),
    }
}

async fn open(link: &Arc<Link>, storage: FileStorage) -> OrderQueue {
    OrderQueue::open(
        TenantId::new("T1"),
        Arc::new(storage),
        link.clone(),
        Connectivity::new(link.clone()),
        queue_config(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn offline_orders_drain_once_reachable() {
    let app = app().await;
    let (token, _) = pin_login(&app.router, "cashier1", CASHIER1_PIN).await;
    let link = Link::new(app.router.clone(), token);
    let dir = tempfile::tempdir().unwrap();
    let queue = open(&link, FileStorage::new(dir.path())).await;
    let tenant = TenantId::new("T1");

    let mut keys = Vec::new();
    for seat in ["A1", "A2", "A3"] {
        keys.push(queue.enqueue(draft(seat)).await.unwrap().idempotency_key);
    }
    let report = queue.drain().await.unwrap();
    assert!(!report.online);

    // Survives a terminal restart.
    let reopened = open(&link, FileStorage::new(dir.path())).await;
    let stored = reopened.orders().await.unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|o| o.status == QueueStatus::Pending));
    assert!(app.store.list_orders(&tenant, 10).await.unwrap().is_empty());

    link.up.store(true, Ordering::SeqCst);
    let report = reopened.drain().await.unwrap();
    assert_eq!(report.synced, 3);

    let synced = reopened.orders().await.unwrap();
    assert!(synced.iter().all(|o| o.status == QueueStatus::Synced));
    let orders = app.store.list_orders(&tenant, 10).await.unwrap();
    assert_eq!(orders.len(), 3);
    let numbers: HashSet<_> = orders.iter().map(|o| o.order_number).collect();
    assert_eq!(numbers.len(), 3);
    let server_keys: HashSet<_> = orders.iter().map(|o| o.idempotency_key.clone()).collect();
    assert_eq!(server_keys, keys.into_iter().collect());
}

#[tokio::test]
async fn lost_responses_never_duplicate_orders() {
    let app = app().await;
    let (token, _) = pin_login(&app.router, "cashier1", CASHIER1_PIN).await;
    let link = Link::new(app.router.clone(), token);
    link.up.store(true, Ordering::SeqCst);
    let dir = tempfile::tempdir().unwrap();
    let queue = open(&link, FileStorage::new(dir.path())).await;
    let tenant = TenantId::new("T1");

    link.lose_responses.store(3, Ordering::SeqCst);
    let order = queue.enqueue(draft("B7")).await.unwrap();
    for _ in 0..3 {
        let report = queue
            .drain_at(chrono::Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.retrying, 1);
    }
    let report = queue
        .drain_at(chrono::Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.synced, 1);

    let orders = app.store.list_orders(&tenant, 10).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].idempotency_key, order.idempotency_key);
    let queued = &queue.orders().await.unwrap()[0];
    assert_eq!(queued.attempts, 3);
    assert_eq!(queued.order_number, Some(orders[0].order_number));
}

#[tokio::test]
async fn server_outage_is_retried_and_rejections_are_not() {
    let app = app().await;
    let (token, _) = pin_login(&app.router, "cashier1", CASHIER1_PIN).await;
    let link = Link::new(app.router.clone(), token);
    link.up.store(true, Ordering::SeqCst);
    let dir = tempfile::tempdir().unwrap();
    let queue = open(&link, FileStorage::new(dir.path())).await;

    let good = queue.enqueue(draft("C1")).await.unwrap();
    let bad = queue
        .enqueue(OrderDraft {
            items: Vec::new(),
            tax_cents: 0,
            customer: CustomerInfo::default(),
        })
        .await
        .unwrap();

    // Validation happens before the database is touched.
    app.store.set_available(false);
    let report = queue.drain().await.unwrap();
    assert_eq!((report.retrying, report.failed), (1, 1));

    app.store.set_available(true);
    let report = queue
        .drain_at(chrono::Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!((report.attempted, report.synced), (1, 1));

    let orders = queue.orders().await.unwrap();
    let find = |key: &IdempotencyKey| {
        orders
            .iter()
            .find(|o| &o.idempotency_key == key)
            .unwrap()
            .clone()
    };
    let good = find(&good.idempotency_key);
    assert_eq!((good.status, good.attempts), (QueueStatus::Synced, 1));
    let bad = find(&bad.idempotency_key);
    assert_eq!(bad.status, QueueStatus::Failed);
    assert_eq!(bad.last_error.as_deref(), Some("400 VALIDATION_ERROR"));
}
