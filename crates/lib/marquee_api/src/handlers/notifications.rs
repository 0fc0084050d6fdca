//! Administrative notifications.

use axum::Json;
use axum::extract::{Extension, State};
use marquee_core::bus::BusEvent;
use tracing::info;

use crate::AppState;
use crate::error::{ApiJson, AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{BroadcastRequest, BroadcastResponse};

/// `POST /notifications/broadcast`: global administrators only.
pub async fn broadcast_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
    ApiJson(body): ApiJson<BroadcastRequest>,
) -> AppResult<Json<BroadcastResponse>> {
    if !caller.is_global_admin() {
        return Err(AppError::InsufficientPermissions("notifications".into()));
    }
    if body.message.trim().is_empty() {
        return Err(AppError::validation("message must not be empty"));
    }
    let event = BusEvent::Notice {
        message: body.message,
        data: body.data,
    };
    let tenant = body.tenant_id;
    let delivered = state.bus.broadcast(
        |_, meta| tenant.is_none() || meta.tenant_id == tenant,
        &event,
    );
    info!(user_id = %caller.user_id, tenant_id = ?tenant.as_ref().map(|t| t.as_str()), delivered, "broadcast sent");
    Ok(Json(BroadcastResponse { delivered }))
}
