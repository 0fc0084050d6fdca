// @awa-component: ORDERS-Endpoints
//
//! Order request handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Extension, Path, State};
use axum::http::HeaderMap;
use marquee_core::id::{IdempotencyKey, OrderId};

use crate::AppState;
use crate::error::{ApiJson, ApiQuery, AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{
    OrderListResponse, OrderResponse, SubmitOrderRequest, SubmitOrderResponse, TenantBody,
    TenantQuery, UnprintedResponse,
};

/// Header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

fn idempotency_header(headers: &HeaderMap) -> Result<Option<IdempotencyKey>, AppError> {
    match headers.get(IDEMPOTENCY_KEY_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(IdempotencyKey::new(v)))
            .map_err(|_| AppError::validation("Idempotency-Key header is not valid text")),
    }
}

/// The body of `POST /orders/{orderId}/printed` is optional.
fn tenant_body(body: &[u8]) -> Result<TenantBody, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(TenantBody::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::Validation {
        message: "Malformed request body".into(),
        details: vec![e.to_string()],
    })
}

/// `POST /orders`: ingest an order. Replays answer like the original.
pub async fn submit_order_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<SubmitOrderRequest>,
) -> AppResult<Json<SubmitOrderResponse>> {
    let key = idempotency_header(&headers)?;
    let submitted = state.orders.submit(&caller, key, body).await?;
    Ok(Json(SubmitOrderResponse::from(&submitted.order)))
}

/// `GET /orders?tenantId=&limit=`
pub async fn list_orders_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
    ApiQuery(query): ApiQuery<TenantQuery>,
) -> AppResult<Json<OrderListResponse>> {
    let orders = state
        .orders
        .list(&caller, query.tenant_id, query.limit)
        .await?;
    Ok(Json(OrderListResponse { orders }))
}

/// `GET /orders/unprinted?tenantId=`
pub async fn unprinted_orders_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
    ApiQuery(query): ApiQuery<TenantQuery>,
) -> AppResult<Json<UnprintedResponse>> {
    let jobs = state.orders.unprinted(&caller, query.tenant_id).await?;
    Ok(Json(UnprintedResponse { jobs }))
}

/// `POST /orders/{orderId}/printed`
pub async fn mark_printed_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
    Path(order_id): Path<String>,
    body: Bytes,
) -> AppResult<Json<OrderResponse>> {
    let tenant_id = tenant_body(&body)?.tenant_id;
    let order = state
        .orders
        .mark_printed(&caller, tenant_id, &OrderId::new(order_id))
        .await?;
    Ok(Json(OrderResponse {
        success: true,
        order,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn empty_printed_body_means_caller_tenant() {
        assert!(tenant_body(b"").unwrap().tenant_id.is_none());
        assert!(tenant_body(b" \n").unwrap().tenant_id.is_none());
        assert_eq!(
            tenant_body(br#"{"tenantId":"T1"}"#).unwrap().tenant_id.unwrap().as_str(),
            "T1"
        );
        assert!(tenant_body(b"{nope").is_err());
    }

    #[test]
    fn idempotency_header_is_canonicalized() {
        let mut headers = HeaderMap::new();
        assert!(idempotency_header(&headers).unwrap().is_none());
        headers.insert(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static(" \"K1\" "));
        assert_eq!(idempotency_header(&headers).unwrap().unwrap().as_str(), "K1");
    }
}
