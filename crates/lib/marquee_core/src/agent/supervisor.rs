//! Per-tenant agent lifecycle.
//!
//! The supervisor owns a table of [`AgentRegistration`]s keyed by tenant and
//! one worker task per started agent. A worker authenticates, subscribes to
//! the tenant stream, prints whatever was missed while it was away, then
//! prints live jobs until the stream ends. It then re-authenticates (refresh
//! first, original credentials second) and re-subscribes with capped
//! exponential backoff.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};

use super::printer::PrintSink;
use super::{AgentBackend, AgentCredentials, AgentError, AgentSession, EventStream};
use crate::bus::{BusEvent, disconnect_level, find_io_error};
use crate::id::{OrderId, TenantId};
use crate::models::agent::{AgentRegistration, AgentState, PrintJob};

/// Order ids remembered to avoid printing a job twice (catch-up and live).
const RECENTLY_PRINTED: usize = 256;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Reconnect delay cap.
    pub max_backoff: Duration,
    /// How long `start` waits for the first connection.
    pub start_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            start_timeout: Duration::from_secs(30),
        }
    }
}

impl SupervisorConfig {
    fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

struct AgentEntry {
    registration: AgentRegistration,
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    backend: Arc<dyn AgentBackend>,
    printer: Arc<dyn PrintSink>,
    config: SupervisorConfig,
    agents: DashMap<TenantId, AgentEntry>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl Inner {
    /// Apply `f` to the registration if it still belongs to this worker.
    fn update(&self, tenant_id: &TenantId, generation: u64, f: impl FnOnce(&mut AgentRegistration)) {
        if let Some(mut entry) = self.agents.get_mut(tenant_id)
            && entry.generation == generation
            && !entry.cancel.is_cancelled()
        {
            f(&mut entry.registration);
        }
    }
}

/// Starts, stops and tracks one agent per tenant.
#[derive(Clone)]
pub struct AgentSupervisor {
    inner: Arc<Inner>,
}

impl AgentSupervisor {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        printer: Arc<dyn PrintSink>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                printer,
                config,
                agents: DashMap::new(),
                next_generation: std::sync::atomic::AtomicU64::new(1),
            }),
        }
    }

    /// Start the tenant's agent. Idempotent: an agent that is already
    /// starting or running is left alone and its registration returned.
    ///
    /// Returns once the first connection succeeded or failed. A first
    /// failure leaves the agent in `error`; later disconnects are retried.
    pub async fn start(
        &self,
        tenant_id: &TenantId,
        tenant_name: &str,
        credentials: AgentCredentials,
    ) -> Result<AgentRegistration, AgentError> {
        let generation = self
            .inner
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let registration = AgentRegistration {
            tenant_id: tenant_id.clone(),
            tenant_name: tenant_name.to_string(),
            state: AgentState::Starting,
            started_at: Some(Utc::now()),
            last_heartbeat: None,
            credentials_ref: Some(credentials.describe()),
            last_error: None,
            jobs_printed: 0,
        };
        let fresh = AgentEntry {
            registration,
            generation,
            cancel: cancel.clone(),
            task: None,
        };

        match self.inner.agents.entry(tenant_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = &occupied.get().registration;
                if matches!(current.state, AgentState::Starting | AgentState::Running) {
                    debug!(tenant_id = %tenant_id, state = ?current.state, "agent already active");
                    return Ok(current.clone());
                }
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }

        info!(tenant_id = %tenant_id, tenant_name, "starting agent");
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run_agent(
            Arc::clone(&self.inner),
            tenant_id.clone(),
            generation,
            credentials,
            cancel,
            ready_tx,
        ));
        if let Some(mut entry) = self.inner.agents.get_mut(tenant_id)
            && entry.generation == generation
        {
            entry.task = Some(task);
        }

        match tokio::time::timeout(self.inner.config.start_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(AgentError::Transport("agent worker exited".into())),
            Err(_) => {
                warn!(tenant_id = %tenant_id, "agent still connecting after start timeout");
            }
        }
        self.registration(tenant_id)
            .ok_or_else(|| AgentError::Transport("agent registration vanished".into()))
    }

    /// Stop the tenant's agent. Returns the final registration, if any.
    pub fn stop(&self, tenant_id: &TenantId) -> Option<AgentRegistration> {
        let mut entry = self.inner.agents.get_mut(tenant_id)?;
        entry.cancel.cancel();
        entry.task = None;
        entry.registration.state = AgentState::Stopped;
        info!(tenant_id = %tenant_id, "agent stopped");
        Some(entry.registration.clone())
    }

    pub fn is_running(&self, tenant_id: &TenantId) -> bool {
        self.inner
            .agents
            .get(tenant_id)
            .is_some_and(|e| e.registration.state == AgentState::Running)
    }

    pub fn registration(&self, tenant_id: &TenantId) -> Option<AgentRegistration> {
        self.inner
            .agents
            .get(tenant_id)
            .map(|e| e.registration.clone())
    }

    pub fn registrations(&self) -> Vec<AgentRegistration> {
        let mut all: Vec<_> = self
            .inner
            .agents
            .iter()
            .map(|e| e.registration.clone())
            .collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        all
    }

    /// Stop every agent and wait for the workers to exit.
    pub async fn shutdown(&self) {
        let mut tasks = Vec::new();
        for mut entry in self.inner.agents.iter_mut() {
            entry.cancel.cancel();
            entry.registration.state = AgentState::Stopped;
            if let Some(task) = entry.task.take() {
                tasks.push(task);
            }
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!("agent worker ended abnormally: {e}");
            }
        }
    }
}

/// Bounded memory of printed order ids.
#[derive(Default)]
struct RecentlyPrinted {
    order: VecDeque<OrderId>,
    seen: HashSet<OrderId>,
}

impl RecentlyPrinted {
    fn contains(&self, id: &OrderId) -> bool {
        self.seen.contains(id)
    }

    fn insert(&mut self, id: OrderId) {
        if self.seen.insert(id.clone()) {
            self.order.push_back(id);
            if self.order.len() > RECENTLY_PRINTED
                && let Some(old) = self.order.pop_front()
            {
                self.seen.remove(&old);
            }
        }
    }
}

enum StreamEnd {
    Cancelled,
    Closed(Option<AgentError>),
}

/// Log level for a print stream that ended with `reason`.
///
/// Resets, broken pipes and aborts are ordinary; any other failure is an error.
fn stream_end_level(reason: Option<&AgentError>) -> Level {
    match reason {
        None => Level::DEBUG,
        Some(err) => match find_io_error(err) {
            Some(io_err) => disconnect_level(Some(io_err)),
            None => Level::ERROR,
        },
    }
}

async fn run_agent(
    inner: Arc<Inner>,
    tenant_id: TenantId,
    generation: u64,
    credentials: AgentCredentials,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), AgentError>>,
) {
    let mut ready = Some(ready);
    let mut session: Option<AgentSession> = None;
    let mut failures: u32 = 0;
    let mut printed = RecentlyPrinted::default();

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect(inner.backend.as_ref(), &tenant_id, &credentials, session.take()) => result,
        };

        match attempt {
            Ok((current, stream)) => {
                failures = 0;
                inner.update(&tenant_id, generation, |reg| {
                    reg.state = AgentState::Running;
                    reg.last_heartbeat = Some(Utc::now());
                    reg.last_error = None;
                });
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
                info!(tenant_id = %tenant_id, "agent subscribed");

                catch_up(&inner, &tenant_id, generation, &current, &mut printed).await;
                let end = pump(&inner, &tenant_id, generation, &current, stream, &cancel, &mut printed).await;
                session = Some(current);
                match end {
                    StreamEnd::Cancelled => return,
                    StreamEnd::Closed(reason) => {
                        let message = reason
                            .as_ref()
                            .map_or_else(|| "stream ended".to_string(), ToString::to_string);
                        if stream_end_level(reason.as_ref()) == Level::ERROR {
                            error!(tenant_id = %tenant_id, reason = %message, "agent stream failed, reconnecting");
                        } else {
                            debug!(tenant_id = %tenant_id, reason = %message, "agent stream closed, reconnecting");
                        }
                        inner.update(&tenant_id, generation, |reg| {
                            reg.state = AgentState::Starting;
                            reg.last_error = Some(message);
                        });
                    }
                }
            }
            Err(e) => {
                if let Some(tx) = ready.take() {
                    warn!(tenant_id = %tenant_id, "agent failed to start: {e}");
                    inner.update(&tenant_id, generation, |reg| {
                        reg.state = AgentState::Error;
                        reg.last_error = Some(e.to_string());
                    });
                    let _ = tx.send(Err(e));
                    return;
                }
                if !e.is_retryable() {
                    warn!(tenant_id = %tenant_id, "agent credentials rejected, giving up: {e}");
                    inner.update(&tenant_id, generation, |reg| {
                        reg.state = AgentState::Error;
                        reg.last_error = Some(e.to_string());
                    });
                    return;
                }
                failures = failures.saturating_add(1);
                warn!(tenant_id = %tenant_id, failures, "agent reconnect failed: {e}");
                inner.update(&tenant_id, generation, |reg| {
                    reg.state = AgentState::Starting;
                    reg.last_error = Some(e.to_string());
                });
            }
        }

        let delay = inner.config.backoff(failures.max(1));
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Refresh the previous session if there is one, fall back to the original
/// credentials, then subscribe.
async fn connect(
    backend: &dyn AgentBackend,
    tenant_id: &TenantId,
    credentials: &AgentCredentials,
    previous: Option<AgentSession>,
) -> Result<(AgentSession, EventStream), AgentError> {
    let session = match previous {
        Some(previous) => match backend.refresh(&previous).await {
            Ok(session) => session,
            Err(e) => {
                debug!(tenant_id = %tenant_id, "agent refresh failed, re-authenticating: {e}");
                backend.authenticate(tenant_id, credentials).await?
            }
        },
        None => backend.authenticate(tenant_id, credentials).await?,
    };
    let stream = backend.subscribe(&session).await?;
    Ok((session, stream))
}

async fn catch_up(
    inner: &Inner,
    tenant_id: &TenantId,
    generation: u64,
    session: &AgentSession,
    printed: &mut RecentlyPrinted,
) {
    match inner.backend.fetch_unprinted(session, tenant_id).await {
        Ok(jobs) => {
            if !jobs.is_empty() {
                info!(tenant_id = %tenant_id, count = jobs.len(), "printing missed jobs");
            }
            for job in jobs {
                print_and_ack(inner, tenant_id, generation, session, &job, printed).await;
            }
        }
        Err(e) => warn!(tenant_id = %tenant_id, "could not fetch missed prints: {e}"),
    }
}

async fn pump(
    inner: &Inner,
    tenant_id: &TenantId,
    generation: u64,
    session: &AgentSession,
    mut stream: EventStream,
    cancel: &CancellationToken,
    printed: &mut RecentlyPrinted,
) -> StreamEnd {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                inner.update(tenant_id, generation, |reg| {
                    reg.last_heartbeat = Some(Utc::now());
                });
                match event {
                    BusEvent::PrintJob { job } if &job.tenant_id == tenant_id => {
                        print_and_ack(inner, tenant_id, generation, session, &job, printed).await;
                    }
                    BusEvent::PrintJob { job } => {
                        warn!(tenant_id = %tenant_id, job_tenant = %job.tenant_id, "ignoring print job for another tenant");
                    }
                    other => debug!(tenant_id = %tenant_id, event = ?other, "agent event"),
                }
            }
            Some(Err(e)) => return StreamEnd::Closed(Some(e)),
            None => return StreamEnd::Closed(None),
        }
    }
}

async fn print_and_ack(
    inner: &Inner,
    tenant_id: &TenantId,
    generation: u64,
    session: &AgentSession,
    job: &PrintJob,
    printed: &mut RecentlyPrinted,
) {
    if printed.contains(&job.order_id) {
        debug!(order_id = %job.order_id, "already printed");
        return;
    }
    if let Err(e) = inner.printer.print(job).await {
        // Left unacknowledged; the next catch-up retries it.
        warn!(tenant_id = %tenant_id, order_id = %job.order_id, "print failed: {e}");
        return;
    }
    printed.insert(job.order_id.clone());
    inner.update(tenant_id, generation, |reg| reg.jobs_printed += 1);
    if let Err(e) = inner.backend.ack_printed(session, tenant_id, &job.order_id).await {
        warn!(tenant_id = %tenant_id, order_id = %job.order_id, "could not mark order printed: {e}");
    }
}
