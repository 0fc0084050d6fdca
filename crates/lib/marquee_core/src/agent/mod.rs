// @awa-component: AGENT-Supervisor
//
//! POS agent: one per tenant, holding its own session, listening on the
//! tenant's print stream and driving the receipt printer.
//!
//! The agent talks to the backend through [`AgentBackend`], implemented over
//! HTTP + SSE for the stand-alone agent ([`http_backend::HttpAgentBackend`])
//! and in-process by the API server. Receipts go to a [`printer::PrintSink`].

pub mod http_backend;
pub mod printer;
pub mod supervisor;

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::bus::BusEvent;
use crate::id::{OrderId, TenantId};
use crate::models::agent::PrintJob;

pub use supervisor::{AgentSupervisor, SupervisorConfig};

#[derive(Debug, Error)]
pub enum AgentError {
    /// The backend refused the credentials; retrying will not help.
    #[error("Agent credentials rejected: {0}")]
    Unauthorized(String),

    #[error("Backend unreachable: {0}")]
    Transport(String),

    /// The event stream broke; the source keeps the transport error when there is one.
    #[error("Event stream failed: {0}")]
    Stream(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Printer error: {0}")]
    Print(String),

    #[error("Unexpected backend response: {0}")]
    Protocol(String),
}

impl AgentError {
    /// Worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AgentError::Unauthorized(_))
    }
}

/// What the agent authenticates with.
#[derive(Clone)]
pub enum AgentCredentials {
    /// The password + PIN flow on behalf of a theater user.
    Password {
        username: String,
        password: String,
        pin: Option<String>,
    },
    /// Short-lived delegated grant minted at PIN validation.
    Grant { token: String },
}

impl AgentCredentials {
    /// Non-secret description stored on the registration.
    pub fn describe(&self) -> String {
        match self {
            AgentCredentials::Password { username, .. } => format!("password:{username}"),
            AgentCredentials::Grant { .. } => "grant".to_string(),
        }
    }
}

impl fmt::Debug for AgentCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AgentCredentials")
            .field(&self.describe())
            .finish()
    }
}

/// Token pair held by a running agent.
#[derive(Clone)]
pub struct AgentSession {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSession").finish_non_exhaustive()
    }
}

/// Stream of bus events delivered to the agent.
pub type EventStream = BoxStream<'static, Result<BusEvent, AgentError>>;

/// The backend as seen by an agent.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Obtain an agent session for `tenant_id`.
    async fn authenticate(
        &self,
        tenant_id: &TenantId,
        credentials: &AgentCredentials,
    ) -> Result<AgentSession, AgentError>;

    /// Exchange the refresh token for a new pair.
    async fn refresh(&self, session: &AgentSession) -> Result<AgentSession, AgentError>;

    /// Open the tenant's print stream.
    async fn subscribe(&self, session: &AgentSession) -> Result<EventStream, AgentError>;

    /// Orders not yet printed, oldest first.
    async fn fetch_unprinted(
        &self,
        session: &AgentSession,
        tenant_id: &TenantId,
    ) -> Result<Vec<PrintJob>, AgentError>;

    async fn ack_printed(
        &self,
        session: &AgentSession,
        tenant_id: &TenantId,
        order_id: &OrderId,
    ) -> Result<(), AgentError>;
}
