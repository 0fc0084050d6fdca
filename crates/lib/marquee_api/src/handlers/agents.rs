// @awa-component: AGENT-ControlEndpoints
//
//! Agent control handlers.

use axum::Json;
use axum::extract::{Extension, Path, State};
use marquee_core::agent::AgentCredentials;
use marquee_core::id::TenantId;
use marquee_core::models::auth::Caller;
use marquee_core::tenancy::authorize;

use crate::AppState;
use crate::error::{ApiJson, AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{AgentStatusResponse, StartAgentRequest, StopAgentRequest};

async fn admit(state: &AppState, caller: &Caller, tenant_id: &TenantId) -> AppResult<()> {
    authorize(state.store.as_ref(), Some(caller), tenant_id).await?;
    Ok(())
}

fn status(state: &AppState, tenant_id: &TenantId) -> AppResult<Json<AgentStatusResponse>> {
    let registration = state
        .agents
        .registration(tenant_id)
        .ok_or_else(|| AppError::NotFound(format!("agent for {tenant_id}")))?;
    Ok(Json(AgentStatusResponse {
        running: state.agents.is_running(tenant_id),
        registration,
    }))
}

/// `POST /agents/start`: start the tenant's agent with password + PIN.
pub async fn start_agent_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
    ApiJson(body): ApiJson<StartAgentRequest>,
) -> AppResult<Json<AgentStatusResponse>> {
    admit(&state, &caller, &body.tenant_id).await?;
    let tenant_name = state
        .store
        .get_tenant(&body.tenant_id)
        .await?
        .map(|t| t.name)
        .unwrap_or_else(|| body.tenant_id.to_string());
    let credentials = AgentCredentials::Password {
        username: body.username,
        password: body.password,
        pin: body.pin,
    };
    state
        .agents
        .start(&body.tenant_id, &tenant_name, credentials)
        .await?;
    status(&state, &body.tenant_id)
}

/// `POST /agents/stop`
pub async fn stop_agent_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
    ApiJson(body): ApiJson<StopAgentRequest>,
) -> AppResult<Json<AgentStatusResponse>> {
    admit(&state, &caller, &body.tenant_id).await?;
    let registration = state
        .agents
        .stop(&body.tenant_id)
        .ok_or_else(|| AppError::NotFound(format!("agent for {}", body.tenant_id)))?;
    Ok(Json(AgentStatusResponse {
        running: false,
        registration,
    }))
}

/// `GET /agents/{tenantId}`
pub async fn agent_status_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<AgentStatusResponse>> {
    let tenant_id = TenantId::new(tenant_id);
    admit(&state, &caller, &tenant_id).await?;
    status(&state, &tenant_id)
}
