//! Agent backend over HTTP, with the print stream read as Server-Sent Events.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::{AgentBackend, AgentCredentials, AgentError, AgentSession, EventStream};
use crate::bus::{BusEvent, find_io_error};
use crate::id::{OrderId, TenantId};
use crate::models::agent::PrintJob;

/// Reachability probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for ordinary (non-stream) requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
enum AgentTokenRequest<'a> {
    Grant {
        grant: &'a str,
    },
    Password {
        username: &'a str,
        password: &'a str,
        pin: Option<&'a str>,
        tenant_id: &'a TenantId,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPair {
    token: String,
    refresh_token: String,
}

#[derive(Deserialize)]
struct UnprintedResponse {
    jobs: Vec<PrintJob>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TenantQuery<'a> {
    tenant_id: &'a TenantId,
}

/// Talks to a Marquee server at `base_url`.
#[derive(Debug, Clone)]
pub struct HttpAgentBackend {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpAgentBackend {
    pub fn new(base_url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self { base_url, client }
    }

    fn url(&self, path: &str) -> Result<Url, AgentError> {
        self.base_url
            .join(path)
            .map_err(|e| AgentError::Protocol(format!("bad url {path}: {e}")))
    }

    /// `GET /health` within [`PROBE_TIMEOUT`].
    pub async fn probe(&self) -> Result<(), AgentError> {
        let response = self
            .client
            .get(self.url("health")?)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("health probe: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgentError::Transport(format!(
                "health probe returned {}",
                response.status()
            )))
        }
    }

    async fn token_pair(&self, response: reqwest::Response) -> Result<AgentSession, AgentError> {
        let response = check_status(response).await?;
        let pair: TokenPair = response
            .json()
            .await
            .map_err(|e| AgentError::Protocol(format!("token response: {e}")))?;
        Ok(AgentSession {
            access_token: pair.token,
            refresh_token: pair.refresh_token,
        })
    }
}

/// Map non-success statuses onto agent errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AgentError::Unauthorized(format!("{status}: {body}"))
        }
        s if s.is_server_error() => AgentError::Transport(format!("{status}: {body}")),
        _ => AgentError::Protocol(format!("{status}: {body}")),
    })
}

fn transport(what: &str) -> impl Fn(reqwest::Error) -> AgentError + '_ {
    move |e| AgentError::Transport(format!("{what}: {e}"))
}

#[async_trait]
impl AgentBackend for HttpAgentBackend {
    async fn authenticate(
        &self,
        tenant_id: &TenantId,
        credentials: &AgentCredentials,
    ) -> Result<AgentSession, AgentError> {
        self.probe().await?;
        let body = match credentials {
            AgentCredentials::Grant { token } => AgentTokenRequest::Grant { grant: token },
            AgentCredentials::Password {
                username,
                password,
                pin,
            } => AgentTokenRequest::Password {
                username,
                password,
                pin: pin.as_deref(),
                tenant_id,
            },
        };
        let response = self
            .client
            .post(self.url("auth/agent-token")?)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(transport("agent-token"))?;
        self.token_pair(response).await
    }

    async fn refresh(&self, session: &AgentSession) -> Result<AgentSession, AgentError> {
        let response = self
            .client
            .post(self.url("auth/refresh")?)
            .timeout(REQUEST_TIMEOUT)
            .json(&RefreshRequest {
                refresh_token: &session.refresh_token,
            })
            .send()
            .await
            .map_err(transport("refresh"))?;
        self.token_pair(response).await
    }

    async fn subscribe(&self, session: &AgentSession) -> Result<EventStream, AgentError> {
        let response = self
            .client
            .get(self.url("stream")?)
            .bearer_auth(&session.access_token)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(transport("stream"))?;
        let response = check_status(response).await?;

        let fault = StreamFault::default();
        let recorder = fault.clone();
        let body = response.bytes_stream().inspect_err(move |e| recorder.record(e));
        let events = sse_stream::SseStream::from_byte_stream(body).filter_map(move |item| {
            let fault = fault.clone();
            async move {
                match item {
                    Ok(sse) => parse_event(&sse).map(Ok),
                    Err(e) => Some(Err(fault.take_error(e))),
                }
            }
        });
        Ok(events.boxed())
    }

    async fn fetch_unprinted(
        &self,
        session: &AgentSession,
        tenant_id: &TenantId,
    ) -> Result<Vec<PrintJob>, AgentError> {
        let response = self
            .client
            .get(self.url("orders/unprinted")?)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&session.access_token)
            .query(&TenantQuery { tenant_id })
            .send()
            .await
            .map_err(transport("unprinted"))?;
        let response = check_status(response).await?;
        let body: UnprintedResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Protocol(format!("unprinted response: {e}")))?;
        Ok(body.jobs)
    }

    async fn ack_printed(
        &self,
        session: &AgentSession,
        tenant_id: &TenantId,
        order_id: &OrderId,
    ) -> Result<(), AgentError> {
        let response = self
            .client
            .post(self.url(&format!("orders/{order_id}/printed"))?)
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(&session.access_token)
            .json(&TenantQuery { tenant_id })
            .send()
            .await
            .map_err(transport("ack"))?;
        check_status(response).await?;
        debug!(order_id = %order_id, "print acknowledged");
        Ok(())
    }
}

/// Transport error seen under the SSE decoder.
///
/// The decoder flattens body errors into its own type, so the `io::Error` is
/// captured on the byte stream and attached to the decoder's error.
#[derive(Clone, Default)]
struct StreamFault(Arc<Mutex<Option<io::Error>>>);

impl StreamFault {
    fn record(&self, err: &(dyn std::error::Error + 'static)) {
        if let Some(io_err) = find_io_error(err) {
            let copy = io::Error::new(io_err.kind(), io_err.to_string());
            *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(copy);
        }
    }

    fn take_error(&self, decoder: impl std::fmt::Display) -> AgentError {
        match self.0.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(io_err) => AgentError::Stream(Box::new(io_err)),
            None => AgentError::Stream(decoder.to_string().into()),
        }
    }
}

/// Parse a `data:` frame into a bus event. Comments and unknown events are skipped.
fn parse_event(sse: &sse_stream::Sse) -> Option<BusEvent> {
    match sse.event.as_deref() {
        None | Some("message") => {}
        _ => return None,
    }
    let data = sse.data.as_deref()?;
    match serde_json::from_str::<BusEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("ignoring unparseable stream frame: {e}");
            None
        }
    }
}
