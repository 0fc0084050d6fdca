//! In-process agent backend.
//!
//! Agents started by the API server talk to the services and the bus
//! directly instead of looping back over HTTP.

use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::StreamExt;
use futures_util::stream;
use marquee_core::agent::{AgentBackend, AgentCredentials, AgentError, AgentSession, EventStream};
use marquee_core::bus::{ConnectionMeta, NotificationBus, SubscriberKey};
use marquee_core::id::{OrderId, TenantId};
use marquee_core::models::agent::PrintJob;
use marquee_core::models::auth::Caller;

use super::auth::{AuthService, TokenBundle};
use super::orders::OrderService;
use crate::error::AppError;

pub struct LocalAgentBackend {
    auth: AuthService,
    orders: OrderService,
    bus: NotificationBus,
}

impl LocalAgentBackend {
    pub fn new(auth: AuthService, orders: OrderService, bus: NotificationBus) -> Self {
        Self { auth, orders, bus }
    }

    async fn caller(&self, session: &AgentSession) -> Result<Caller, AgentError> {
        self.auth
            .authenticate(&session.access_token)
            .await
            .map_err(agent_error)
    }
}

fn agent_session(bundle: TokenBundle) -> AgentSession {
    AgentSession {
        access_token: bundle.access.token,
        refresh_token: bundle.refresh.token,
    }
}

/// Same mapping the HTTP backend applies to response statuses.
fn agent_error(e: AppError) -> AgentError {
    let status = e.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        AgentError::Unauthorized(e.to_string())
    } else if status.is_server_error() {
        AgentError::Transport(e.to_string())
    } else {
        AgentError::Protocol(e.to_string())
    }
}

#[async_trait]
impl AgentBackend for LocalAgentBackend {
    async fn authenticate(
        &self,
        tenant_id: &TenantId,
        credentials: &AgentCredentials,
    ) -> Result<AgentSession, AgentError> {
        let bundle = match credentials {
            AgentCredentials::Grant { token } => self.auth.exchange_agent_grant(token).await,
            AgentCredentials::Password {
                username,
                password,
                pin,
            } => {
                self.auth
                    .agent_login_with_password(username, password, pin.as_deref(), tenant_id)
                    .await
            }
        }
        .map_err(agent_error)?;
        Ok(agent_session(bundle))
    }

    async fn refresh(&self, session: &AgentSession) -> Result<AgentSession, AgentError> {
        let bundle = self
            .auth
            .refresh(&session.refresh_token)
            .await
            .map_err(agent_error)?;
        Ok(agent_session(bundle))
    }

    async fn subscribe(&self, session: &AgentSession) -> Result<EventStream, AgentError> {
        let caller = self.caller(session).await?;
        let key = SubscriberKey::for_caller(&caller);
        let subscription = self.bus.subscribe(key, ConnectionMeta::from(&caller));
        let events = stream::unfold(subscription, |mut subscription| async move {
            let event = subscription.recv().await?;
            Some((Ok(event), subscription))
        });
        Ok(events.boxed())
    }

    async fn fetch_unprinted(
        &self,
        session: &AgentSession,
        tenant_id: &TenantId,
    ) -> Result<Vec<PrintJob>, AgentError> {
        let caller = self.caller(session).await?;
        self.orders
            .unprinted(&caller, Some(tenant_id.clone()))
            .await
            .map_err(agent_error)
    }

    async fn ack_printed(
        &self,
        session: &AgentSession,
        tenant_id: &TenantId,
        order_id: &OrderId,
    ) -> Result<(), AgentError> {
        let caller = self.caller(session).await?;
        self.orders
            .mark_printed(&caller, Some(tenant_id.clone()), order_id)
            .await
            .map(|_| ())
            .map_err(agent_error)
    }
}
