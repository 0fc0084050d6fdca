// @awa-component: ORDERS-Ingest
//
//! Order ingest.
//!
//! Exactly-once persistence keyed by `(tenantId, idempotencyKey)`: a replay
//! returns the original order, and a concurrent insert that loses the unique
//! index race falls back to the lookup path. After commit the order is pushed
//! to the customer's stream and to the tenant's agent; delivery failures are
//! logged and never undo the order.

use chrono::Utc;
use marquee_core::bus::{BusEvent, NotificationBus, SubscriberKey};
use marquee_core::id::{IdempotencyKey, OrderId, TenantId};
use marquee_core::models::agent::PrintJob;
use marquee_core::models::auth::Caller;
use marquee_core::models::order::{NewOrder, Order, OrderStatus, Pricing};
use marquee_core::store::{DynStore, StoreError};
use marquee_core::tenancy::{PAGE_ONLINE_POS, authorize, require_page_access};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::SubmitOrderRequest;

/// Default page size of `GET /orders`.
pub const DEFAULT_LIST_LIMIT: i64 = 50;
/// Upper bound of `GET /orders` page size.
pub const MAX_LIST_LIMIT: i64 = 500;

/// Outcome of a submission.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub order: Order,
    /// False when an earlier submission with the same key was returned.
    pub created: bool,
}

#[derive(Clone)]
pub struct OrderService {
    store: DynStore,
    bus: NotificationBus,
}

impl OrderService {
    pub fn new(store: DynStore, bus: NotificationBus) -> Self {
        Self { store, bus }
    }

    /// Persist an order at most once per idempotency key.
    ///
    /// The key may arrive in the body, the `Idempotency-Key` header, or both
    /// (then they must agree). The tenant defaults to the caller's.
    pub async fn submit(
        &self,
        caller: &Caller,
        header_key: Option<IdempotencyKey>,
        request: SubmitOrderRequest,
    ) -> AppResult<Submitted> {
        let key = resolve_key(header_key, request.idempotency_key.clone())?;
        let tenant_id = target_tenant(caller, request.tenant_id.clone())?;
        validate_order(&request)?;

        authorize(self.store.as_ref(), Some(caller), &tenant_id).await?;

        if let Some(existing) = self.store.find_order_by_key(&tenant_id, &key).await? {
            debug!(tenant_id = %tenant_id, order_id = %existing.id, "idempotent replay");
            return Ok(Submitted {
                order: existing,
                created: false,
            });
        }

        let new_order = NewOrder {
            tenant_id: tenant_id.clone(),
            idempotency_key: key.clone(),
            pricing: Pricing::compute(&request.items, request.tax_cents),
            items: request.items,
            customer: request.customer,
            placed_by: caller.user_id.clone(),
        };
        let order = match self.store.insert_order(new_order).await {
            Ok(order) => order,
            Err(StoreError::Conflict(msg)) => {
                // Lost the race against a concurrent submission of the same key.
                return match self.store.find_order_by_key(&tenant_id, &key).await? {
                    Some(existing) => {
                        debug!(tenant_id = %tenant_id, order_id = %existing.id, "concurrent duplicate resolved");
                        Ok(Submitted {
                            order: existing,
                            created: false,
                        })
                    }
                    None => Err(AppError::Duplicate(msg)),
                };
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            tenant_id = %tenant_id,
            order_id = %order.id,
            order_number = order.order_number,
            "order accepted"
        );
        self.emit(&order);
        Ok(Submitted {
            order,
            created: true,
        })
    }

    fn emit(&self, order: &Order) {
        if let Some(phone) = order.customer.phone.as_deref().filter(|p| !p.trim().is_empty()) {
            let delivered = self.bus.send_to(
                &SubscriberKey::customer(phone),
                BusEvent::OrderAccepted {
                    order_id: order.id.clone(),
                    order_number: order.order_number,
                    tenant_id: order.tenant_id.clone(),
                    status: OrderStatus::Accepted,
                },
            );
            if !delivered {
                debug!(order_id = %order.id, "customer not connected");
            }
        }

        let delivered = self.bus.send_to(
            &SubscriberKey::Tenant(order.tenant_id.clone()),
            BusEvent::PrintJob {
                job: PrintJob::from(order),
            },
        );
        if !delivered {
            warn!(
                tenant_id = %order.tenant_id,
                order_id = %order.id,
                "agent not connected, print deferred until it reconnects"
            );
        }
    }

    /// Most recent orders of a tenant, for callers with the `online-pos` page.
    pub async fn list(
        &self,
        caller: &Caller,
        tenant_id: Option<TenantId>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Order>> {
        let tenant_id = target_tenant(caller, tenant_id)?;
        authorize(self.store.as_ref(), Some(caller), &tenant_id).await?;
        require_page_access(self.store.as_ref(), caller, PAGE_ONLINE_POS).await?;
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.list_orders(&tenant_id, limit).await?)
    }

    /// Orders not yet acknowledged by the tenant's printer, oldest first.
    pub async fn unprinted(
        &self,
        caller: &Caller,
        tenant_id: Option<TenantId>,
    ) -> AppResult<Vec<PrintJob>> {
        let tenant_id = target_tenant(caller, tenant_id)?;
        authorize(self.store.as_ref(), Some(caller), &tenant_id).await?;
        let orders = self.store.list_unprinted_orders(&tenant_id).await?;
        Ok(orders.iter().map(PrintJob::from).collect())
    }

    /// Record that the receipt for `order_id` was printed. Idempotent.
    pub async fn mark_printed(
        &self,
        caller: &Caller,
        tenant_id: Option<TenantId>,
        order_id: &OrderId,
    ) -> AppResult<Order> {
        let tenant_id = target_tenant(caller, tenant_id)?;
        authorize(self.store.as_ref(), Some(caller), &tenant_id).await?;
        self.store
            .mark_order_printed(&tenant_id, order_id, Utc::now())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))
    }
}

fn target_tenant(caller: &Caller, requested: Option<TenantId>) -> AppResult<TenantId> {
    requested
        .filter(|t| !t.is_empty())
        .or_else(|| caller.tenant_id.clone())
        .ok_or_else(|| AppError::validation("tenantId is required"))
}

fn resolve_key(
    header: Option<IdempotencyKey>,
    body: Option<IdempotencyKey>,
) -> AppResult<IdempotencyKey> {
    let header = header.filter(|k| !k.is_empty());
    let body = body.filter(|k| !k.is_empty());
    match (header, body) {
        (Some(h), Some(b)) if h != b => Err(AppError::Validation {
            message: "Idempotency key mismatch".into(),
            details: vec!["Idempotency-Key header and idempotencyKey differ".into()],
        }),
        (Some(key), _) | (None, Some(key)) => Ok(key),
        (None, None) => Err(AppError::Validation {
            message: "Idempotency key required".into(),
            details: vec!["send an Idempotency-Key header or idempotencyKey field".into()],
        }),
    }
}

fn validate_order(request: &SubmitOrderRequest) -> AppResult<()> {
    let mut details = Vec::new();
    if request.items.is_empty() {
        details.push("items must not be empty".to_string());
    }
    for (i, item) in request.items.iter().enumerate() {
        if item.name.trim().is_empty() {
            details.push(format!("items[{i}].name must not be empty"));
        }
        if item.quantity == 0 {
            details.push(format!("items[{i}].quantity must be positive"));
        }
        if item.unit_price_cents < 0 {
            details.push(format!("items[{i}].unitPriceCents must not be negative"));
        }
    }
    if request.tax_cents < 0 {
        details.push("taxCents must not be negative".to_string());
    }
    if details.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation {
            message: "Invalid order".into(),
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use marquee_core::bus::ConnectionMeta;
    use marquee_core::id::UserId;
    use marquee_core::models::order::{CustomerInfo, OrderItem};
    use marquee_core::models::tenant::Tenant;
    use marquee_core::store::Store;
    use marquee_core::store::memory::MemoryStore;
    use uuid::Uuid;

    use super::*;

    fn cashier(tenant: &str) -> Caller {
        Caller {
            user_id: UserId::new("U1"),
            username: "cashier1".into(),
            role: "cashier".into(),
            user_type: "theater_user".into(),
            tenant_id: Some(TenantId::new(tenant)),
            session_id: Uuid::new_v4(),
        }
    }

    fn request(key: &str) -> SubmitOrderRequest {
        SubmitOrderRequest {
            tenant_id: Some(TenantId::new("T1")),
            idempotency_key: Some(IdempotencyKey::new(key)),
            items: vec![OrderItem {
                product_id: Some("P1".into()),
                name: "Popcorn".into(),
                quantity: 2,
                unit_price_cents: 450,
            }],
            tax_cents: 90,
            customer: CustomerInfo {
                phone: Some("+1 555 0100".into()),
                ..Default::default()
            },
        }
    }

    async fn service() -> (OrderService, Arc<MemoryStore>, NotificationBus) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_tenant(&Tenant::new(TenantId::new("T1"), "Grand"))
            .await
            .unwrap();
        let bus = NotificationBus::new();
        (OrderService::new(store.clone(), bus.clone()), store, bus)
    }

    #[tokio::test]
    async fn replay_returns_the_original_order() {
        let (svc, store, _) = service().await;
        let caller = cashier("T1");
        let first = svc.submit(&caller, None, request("K1")).await.unwrap();
        assert!(first.created);
        assert_eq!(first.order.pricing.total_cents, 990);

        for _ in 0..3 {
            let again = svc.submit(&caller, None, request("K1")).await.unwrap();
            assert!(!again.created);
            assert_eq!(again.order.id, first.order.id);
            assert_eq!(again.order.order_number, first.order.order_number);
        }
        let orders = store.list_orders(&TenantId::new("T1"), 10).await.unwrap();
        assert_eq!(orders.len(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_numbers() {
        let (svc, _, _) = service().await;
        let caller = cashier("T1");
        let a = svc.submit(&caller, None, request("K1")).await.unwrap();
        let b = svc.submit(&caller, None, request("K2")).await.unwrap();
        assert_ne!(a.order.order_number, b.order.order_number);
    }

    #[tokio::test]
    async fn header_key_is_used_and_must_match_body() {
        let (svc, _, _) = service().await;
        let caller = cashier("T1");
        let mut req = request("K1");
        req.idempotency_key = None;
        let order = svc
            .submit(&caller, Some(IdempotencyKey::new("H1")), req)
            .await
            .unwrap();
        assert_eq!(order.order.idempotency_key.as_str(), "H1");

        let err = svc
            .submit(&caller, Some(IdempotencyKey::new("H2")), request("K2"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn missing_key_and_bad_items_are_validation_errors() {
        let (svc, _, _) = service().await;
        let caller = cashier("T1");
        let mut req = request("K1");
        req.idempotency_key = None;
        assert_eq!(
            svc.submit(&caller, None, req).await.unwrap_err().code(),
            "VALIDATION_ERROR"
        );

        let mut req = request("K1");
        req.items[0].quantity = 0;
        req.items.push(OrderItem {
            product_id: None,
            name: " ".into(),
            quantity: 1,
            unit_price_cents: -1,
        });
        match svc.submit(&caller, None, req).await.unwrap_err() {
            AppError::Validation { details, .. } => assert_eq!(details.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cross_tenant_submission_is_denied_and_not_persisted() {
        let (svc, store, _) = service().await;
        store
            .upsert_tenant(&Tenant::new(TenantId::new("T2"), "Roxy"))
            .await
            .unwrap();
        let mut req = request("K1");
        req.tenant_id = Some(TenantId::new("T2"));
        let err = svc.submit(&cashier("T1"), None, req).await.unwrap_err();
        assert_eq!(err.code(), "THEATER_ACCESS_DENIED");
        assert!(store.list_orders(&TenantId::new("T2"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acceptance_is_pushed_to_customer_and_agent() {
        let (svc, _, bus) = service().await;
        let caller = cashier("T1");
        let mut customer = bus.subscribe(
            SubscriberKey::customer("+15550100"),
            ConnectionMeta::from(&caller),
        );
        let mut agent = bus.subscribe(
            SubscriberKey::Tenant(TenantId::new("T1")),
            ConnectionMeta::from(&caller),
        );
        let submitted = svc.submit(&caller, None, request("K1")).await.unwrap();

        assert_eq!(customer.recv().await, Some(BusEvent::Connected));
        match customer.recv().await {
            Some(BusEvent::OrderAccepted { order_id, .. }) => assert_eq!(order_id, submitted.order.id),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(agent.recv().await, Some(BusEvent::Connected));
        match agent.recv().await {
            Some(BusEvent::PrintJob { job }) => assert_eq!(job.order_number, submitted.order.order_number),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unavailable_store_is_database_not_ready_and_no_event_is_sent() {
        let (svc, store, bus) = service().await;
        let caller = cashier("T1");
        let mut agent = bus.subscribe(
            SubscriberKey::Tenant(TenantId::new("T1")),
            ConnectionMeta::from(&caller),
        );
        store.set_available(false);
        let err = svc.submit(&caller, None, request("K1")).await.unwrap_err();
        assert_eq!(err.code(), "DATABASE_NOT_READY");
        assert_eq!(agent.recv().await, Some(BusEvent::Connected));
        let marker = BusEvent::Notice {
            message: "marker".into(),
            data: None,
        };
        assert!(bus.send_to(&SubscriberKey::Tenant(TenantId::new("T1")), marker.clone()));
        assert_eq!(agent.recv().await, Some(marker));
    }

    #[tokio::test]
    async fn printed_orders_leave_the_unprinted_list() {
        let (svc, _, _) = service().await;
        let caller = cashier("T1");
        let a = svc.submit(&caller, None, request("K1")).await.unwrap().order;
        svc.submit(&caller, None, request("K2")).await.unwrap();

        assert_eq!(svc.unprinted(&caller, None).await.unwrap().len(), 2);
        let printed = svc.mark_printed(&caller, None, &a.id).await.unwrap();
        assert_eq!(printed.status, OrderStatus::Printed);
        let remaining = svc.unprinted(&caller, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0].order_id, a.id);

        let missing = svc
            .mark_printed(&caller, None, &OrderId::new("nope"))
            .await
            .unwrap_err();
        assert_eq!(missing.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn listing_requires_the_online_pos_page() {
        let (svc, store, _) = service().await;
        let caller = cashier("T1");
        svc.submit(&caller, None, request("K1")).await.unwrap();
        assert_eq!(
            svc.list(&caller, None, None).await.unwrap_err().code(),
            "INSUFFICIENT_PERMISSIONS"
        );

        store
            .set_role_permissions(
                "cashier",
                &[marquee_core::models::tenant::PagePermission {
                    page: PAGE_ONLINE_POS.into(),
                    has_access: true,
                }],
            )
            .await
            .unwrap();
        assert_eq!(svc.list(&caller, None, Some(0)).await.unwrap().len(), 1);
    }
}
