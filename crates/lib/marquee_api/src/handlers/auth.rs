// @awa-component: AUTH-LoginEndpoint
// @awa-component: AUTH-PinEndpoint
// @awa-component: AUTH-TokenRefreshEndpoint
//
//! Authentication request handlers.

use axum::extract::{Extension, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, Uri};
use axum::Json;
use marquee_core::agent::AgentCredentials;
use marquee_core::id::TenantId;
use tracing::{debug, warn};

use crate::AppState;
use crate::error::{ApiJson, AppResult};
use crate::middleware::auth::{AuthenticatedUser, extract_token};
use crate::models::{
    AgentTokenRequest, AuthUser, LoginRequest, LoginResponse, PendingAuth, RefreshRequest,
    SessionStatusResponse, SuccessResponse, TokenResponse, ValidatePinRequest,
    ValidatePinResponse, ValidateResponse,
};
use crate::services::auth::{ClientInfo, LoginOutcome, TokenBundle};

fn token_response(bundle: TokenBundle, user: Option<AuthUser>) -> TokenResponse {
    TokenResponse {
        expires_at: bundle.expires_at(),
        token: bundle.access.token,
        refresh_token: bundle.refresh.token,
        user,
    }
}

fn client_info(headers: &HeaderMap) -> ClientInfo {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ClientInfo {
        user_agent: header(USER_AGENT.as_str()),
        ip_address: header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string())),
    }
}

/// `POST /auth/login`: password step.
pub async fn login_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let response = match state.auth.login(&body.username, &body.password).await? {
        LoginOutcome::PinRequired { user, pending } => LoginResponse {
            success: true,
            is_pin_required: true,
            pending_auth: Some(PendingAuth {
                user_id: user.id,
                login_username: user.username,
                tenant_id: user.tenant_id,
                ephemeral_secret: pending.token,
                expires_at: pending.expires_at,
            }),
            tokens: None,
        },
        LoginOutcome::Authenticated { user, tokens } => LoginResponse {
            success: true,
            is_pin_required: false,
            pending_auth: None,
            tokens: Some(token_response(tokens, Some(AuthUser::from(&user)))),
        },
    };
    Ok(Json(response))
}

/// `POST /auth/validate-pin`: PIN step. Schedules the tenant's agent after
/// the response has been produced.
pub async fn validate_pin_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<ValidatePinRequest>,
) -> AppResult<Json<ValidatePinResponse>> {
    let outcome = state
        .auth
        .validate_pin(
            &body.ephemeral_secret,
            &body.user_id,
            body.tenant_id.as_ref(),
            &body.pin,
            client_info(&headers),
        )
        .await?;

    let agent_grant = outcome.agent_grant.map(|grant| grant.token);
    if state.config.agent_autostart
        && let (Some(tenant_id), Some(grant)) = (&outcome.user.tenant_id, &agent_grant)
    {
        schedule_agent_start(
            &state,
            tenant_id.clone(),
            outcome.tenant_name.clone().unwrap_or_else(|| tenant_id.to_string()),
            grant.clone(),
        );
    }

    Ok(Json(ValidatePinResponse {
        success: true,
        tokens: token_response(outcome.tokens, Some(AuthUser::from(&outcome.user))),
        agent_grant,
    }))
}

/// Start the agent on a later scheduler tick. Never delays or fails the
/// login; errors end up in the log.
fn schedule_agent_start(state: &AppState, tenant_id: TenantId, tenant_name: String, grant: String) {
    let agents = state.agents.clone();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        if agents.is_running(&tenant_id) {
            debug!(tenant_id = %tenant_id, "agent already running");
            return;
        }
        match agents
            .start(&tenant_id, &tenant_name, AgentCredentials::Grant { token: grant })
            .await
        {
            Ok(registration) => {
                debug!(tenant_id = %tenant_id, state = ?registration.state, "agent auto-start finished")
            }
            Err(e) => warn!(tenant_id = %tenant_id, "agent auto-start failed: {e}"),
        }
    });
}

/// `POST /auth/refresh`: exchange a refresh token for a new pair.
pub async fn refresh_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RefreshRequest>,
) -> AppResult<Json<TokenResponse>> {
    let bundle = state.auth.refresh(&body.refresh_token).await?;
    Ok(Json(token_response(bundle, None)))
}

/// `POST /auth/logout`: always succeeds.
pub async fn logout_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Json<SuccessResponse> {
    let token = extract_token(&headers, &uri).ok();
    state.auth.logout(token.as_deref()).await;
    Json(SuccessResponse { success: true })
}

/// `GET /auth/check-session`: the middleware already verified the session.
pub async fn check_session_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
) -> Json<SessionStatusResponse> {
    state.auth.touch(&caller).await;
    Json(SessionStatusResponse {
        valid: true,
        session_id: caller.session_id,
        user_id: caller.user_id,
    })
}

/// `GET /auth/validate`: current user.
pub async fn validate_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(caller)): Extension<AuthenticatedUser>,
) -> AppResult<Json<ValidateResponse>> {
    let user = match state.store.get_user(&caller.user_id).await {
        Ok(Some(credentials)) => AuthUser::from(&credentials.user),
        Ok(None) => AuthUser::from(&caller),
        Err(e) => {
            debug!(user_id = %caller.user_id, "user lookup failed, answering from token: {e}");
            AuthUser::from(&caller)
        }
    };
    Ok(Json(ValidateResponse { valid: true, user }))
}

/// `POST /auth/agent-token`: session for a tenant's agent.
pub async fn agent_token_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<AgentTokenRequest>,
) -> AppResult<Json<TokenResponse>> {
    let bundle = match body {
        AgentTokenRequest::Grant { grant } => state.auth.exchange_agent_grant(&grant).await?,
        AgentTokenRequest::Password {
            username,
            password,
            pin,
            tenant_id,
        } => {
            state
                .auth
                .agent_login_with_password(&username, &password, pin.as_deref(), &tenant_id)
                .await?
        }
    };
    Ok(Json(token_response(bundle, None)))
}
