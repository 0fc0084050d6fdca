// @awa-component: CORE-NotificationBus
//
//! In-process notification bus.
//!
//! One long-lived connection per subscriber key. A connection is a bounded
//! channel drained by the transport (an SSE response, or the in-process
//! agent). Writes never wait: a full or closed channel means the connection
//! is dead and it is removed from the table.
//!
//! The table is process-local; running several replicas needs sticky routing
//! on the subscriber key or a shared pub/sub layer.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{Level, debug, info};

use crate::id::{OrderId, TenantId, UserId};
use crate::models::agent::PrintJob;
use crate::models::auth::{Caller, ROLE_POS_AGENT, USER_TYPE_CUSTOMER};
use crate::models::order::OrderStatus;

/// Frames buffered per connection before it is considered stalled.
const CONNECTION_BUFFER: usize = 64;

/// Addresses one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SubscriberKey {
    User(UserId),
    /// The tenant's POS agent.
    Tenant(TenantId),
    /// Phone-identified customer.
    Customer(String),
}

impl SubscriberKey {
    /// The stream a verified caller subscribes to.
    pub fn for_caller(caller: &Caller) -> Self {
        if caller.role.eq_ignore_ascii_case(ROLE_POS_AGENT)
            && let Some(tenant_id) = &caller.tenant_id
        {
            return SubscriberKey::Tenant(tenant_id.clone());
        }
        if caller.user_type.eq_ignore_ascii_case(USER_TYPE_CUSTOMER) {
            return SubscriberKey::Customer(normalize_phone(&caller.username));
        }
        SubscriberKey::User(caller.user_id.clone())
    }

    pub fn customer(phone: &str) -> Self {
        SubscriberKey::Customer(normalize_phone(phone))
    }
}

impl std::fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriberKey::User(id) => write!(f, "user:{id}"),
            SubscriberKey::Tenant(id) => write!(f, "tenant:{id}"),
            SubscriberKey::Customer(phone) => write!(f, "customer:{phone}"),
        }
    }
}

/// Keep digits and a leading `+`.
fn normalize_phone(raw: &str) -> String {
    let raw = raw.trim();
    let mut out = String::with_capacity(raw.len());
    if raw.starts_with('+') {
        out.push('+');
    }
    out.extend(raw.chars().filter(char::is_ascii_digit));
    out
}

/// Events carried on the bus. Serialized as `{"type": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BusEvent {
    /// First frame of every stream.
    Connected,
    /// Customer-facing order confirmation.
    OrderAccepted {
        order_id: OrderId,
        order_number: i64,
        tenant_id: TenantId,
        status: OrderStatus,
    },
    /// Receipt for the tenant's agent.
    PrintJob { job: PrintJob },
    /// Administrative broadcast.
    Notice {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMeta {
    pub user_id: UserId,
    pub tenant_id: Option<TenantId>,
    pub role: String,
    pub connected_at: DateTime<Utc>,
}

impl From<&Caller> for ConnectionMeta {
    fn from(caller: &Caller) -> Self {
        Self {
            user_id: caller.user_id.clone(),
            tenant_id: caller.tenant_id.clone(),
            role: caller.role.clone(),
            connected_at: Utc::now(),
        }
    }
}

struct Connection {
    conn_id: u64,
    tx: mpsc::Sender<BusEvent>,
    meta: ConnectionMeta,
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// Client went away (reset, broken pipe, aborted, closed).
    Normal,
    Abnormal,
}

/// Classify a transport error seen on a stream.
pub fn classify_disconnect(err: &io::Error) -> DisconnectKind {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionAborted => DisconnectKind::Normal,
        _ if err.to_string().trim().eq_ignore_ascii_case("aborted") => DisconnectKind::Normal,
        _ => DisconnectKind::Abnormal,
    }
}

/// Log level for a stream that ended with `err` (`None`: orderly close).
pub fn disconnect_level(err: Option<&io::Error>) -> Level {
    match err.map(classify_disconnect) {
        None | Some(DisconnectKind::Normal) => Level::DEBUG,
        Some(DisconnectKind::Abnormal) => Level::ERROR,
    }
}

/// Find an `io::Error` anywhere in an error's source chain.
pub fn find_io_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a io::Error> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = e.source();
    }
    None
}

struct BusInner {
    connections: DashMap<SubscriberKey, Connection>,
    next_conn_id: AtomicU64,
}

/// Shared handle to the connection table.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                connections: DashMap::new(),
                next_conn_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a connection for `key`, evicting any previous one.
    ///
    /// The `connected` frame is already queued on the returned subscription.
    pub fn subscribe(&self, key: SubscriberKey, meta: ConnectionMeta) -> Subscription {
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        // Capacity is non-zero and the receiver is alive.
        let _ = tx.try_send(BusEvent::Connected);
        let previous = self
            .inner
            .connections
            .insert(key.clone(), Connection { conn_id, tx, meta });
        if let Some(previous) = previous {
            info!(key = %key, evicted = previous.conn_id, conn_id, "stream replaced by newer subscriber");
        } else {
            debug!(key = %key, conn_id, "stream opened");
        }
        Subscription {
            bus: self.clone(),
            key,
            conn_id,
            rx,
        }
    }

    /// Deliver to one subscriber. Returns false when nobody is listening or the
    /// connection turned out to be dead (it is removed).
    pub fn send_to(&self, key: &SubscriberKey, event: BusEvent) -> bool {
        let (conn_id, result) = match self.inner.connections.get(key) {
            Some(conn) => (conn.conn_id, conn.tx.try_send(event)),
            None => return false,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(key = %key, conn_id, "dropping dead stream: {e}");
                self.remove(key, conn_id);
                false
            }
        }
    }

    /// Deliver to the stream of one user.
    pub fn send_to_user(&self, user_id: &UserId, event: BusEvent) -> bool {
        self.send_to(&SubscriberKey::User(user_id.clone()), event)
    }

    /// Deliver to every connection matching `filter`, pruning dead ones.
    /// Returns the number of successful deliveries.
    pub fn broadcast<F>(&self, filter: F, event: &BusEvent) -> usize
    where
        F: Fn(&SubscriberKey, &ConnectionMeta) -> bool,
    {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.inner.connections.iter() {
            if !filter(entry.key(), &entry.meta) {
                continue;
            }
            match entry.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => dead.push((entry.key().clone(), entry.conn_id)),
            }
        }
        for (key, conn_id) in dead {
            debug!(key = %key, conn_id, "pruning dead stream during broadcast");
            self.remove(&key, conn_id);
        }
        delivered
    }

    pub fn is_connected(&self, key: &SubscriberKey) -> bool {
        self.inner.connections.contains_key(key)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Drop every connection; open streams end. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let count = self.inner.connections.len();
        self.inner.connections.clear();
        if count > 0 {
            info!(count, "closed all streams");
        }
        count
    }

    /// Remove `key` only if it still belongs to `conn_id`.
    fn remove(&self, key: &SubscriberKey, conn_id: u64) -> bool {
        self.inner
            .connections
            .remove_if(key, |_, conn| conn.conn_id == conn_id)
            .is_some()
    }

}

/// Receiving half of a connection. Dropping it closes the connection.
pub struct Subscription {
    bus: NotificationBus,
    key: SubscriberKey,
    conn_id: u64,
    rx: mpsc::Receiver<BusEvent>,
}

impl Subscription {
    pub fn key(&self) -> &SubscriberKey {
        &self.key
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Next event; `None` once the connection was evicted or removed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The HTTP body is dropped on client disconnect; no transport error reaches here.
        let removed = self.bus.remove(&self.key, self.conn_id);
        debug!(key = %self.key, conn_id = self.conn_id, removed, "stream closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(user: &str) -> ConnectionMeta {
        ConnectionMeta {
            user_id: UserId::new(user),
            tenant_id: Some(TenantId::new("T1")),
            role: "cashier".into(),
            connected_at: Utc::now(),
        }
    }

    fn notice(message: &str) -> BusEvent {
        BusEvent::Notice {
            message: message.into(),
            data: None,
        }
    }

    #[tokio::test]
    async fn first_frame_is_connected() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe(SubscriberKey::User(UserId::new("U1")), meta("U1"));
        assert_eq!(sub.recv().await, Some(BusEvent::Connected));
        let json = serde_json::to_value(BusEvent::Connected).unwrap();
        assert_eq!(json, serde_json::json!({"type": "connected"}));
    }

    #[tokio::test]
    async fn second_subscribe_evicts_the_first() {
        let bus = NotificationBus::new();
        let key = SubscriberKey::User(UserId::new("U1"));
        let mut first = bus.subscribe(key.clone(), meta("U1"));
        let mut second = bus.subscribe(key.clone(), meta("U1"));
        assert_eq!(bus.connection_count(), 1);

        assert_eq!(first.recv().await, Some(BusEvent::Connected));
        assert_eq!(first.recv().await, None);

        assert!(bus.send_to(&key, notice("hi")));
        assert_eq!(second.recv().await, Some(BusEvent::Connected));
        assert_eq!(second.recv().await, Some(notice("hi")));

        // Dropping the evicted subscription must not remove the newer one.
        drop(first);
        assert!(bus.is_connected(&key));
        drop(second);
        assert!(!bus.is_connected(&key));
    }

    #[tokio::test]
    async fn send_to_unknown_key_returns_false() {
        let bus = NotificationBus::new();
        assert!(!bus.send_to_user(&UserId::new("nobody"), notice("x")));
    }

    #[tokio::test]
    async fn stalled_connection_is_removed_on_write() {
        let bus = NotificationBus::new();
        let key = SubscriberKey::Tenant(TenantId::new("T1"));
        let _sub = bus.subscribe(key.clone(), meta("agent"));
        let mut delivered = 0;
        while bus.send_to(&key, notice("fill")) {
            delivered += 1;
        }
        assert_eq!(delivered, CONNECTION_BUFFER - 1);
        assert!(!bus.is_connected(&key));
    }

    #[tokio::test]
    async fn close_all_ends_every_stream() {
        let bus = NotificationBus::new();
        let mut a = bus.subscribe(SubscriberKey::User(UserId::new("A")), meta("A"));
        let _b = bus.subscribe(SubscriberKey::User(UserId::new("B")), meta("B"));
        assert_eq!(bus.close_all(), 2);
        assert_eq!(bus.connection_count(), 0);
        assert_eq!(a.recv().await, Some(BusEvent::Connected));
        assert_eq!(a.recv().await, None);
    }

    #[tokio::test]
    async fn broadcast_filters_and_prunes() {
        let bus = NotificationBus::new();
        let mut a = bus.subscribe(SubscriberKey::User(UserId::new("A")), meta("A"));
        let mut other_tenant = meta("B");
        other_tenant.tenant_id = Some(TenantId::new("T2"));
        let mut b = bus.subscribe(SubscriberKey::User(UserId::new("B")), other_tenant);
        let stalled = bus.subscribe(SubscriberKey::User(UserId::new("C")), meta("C"));
        let stalled_key = stalled.key().clone();
        for _ in 1..CONNECTION_BUFFER {
            assert!(bus.send_to(&stalled_key, notice("backlog")));
        }

        let t1 = TenantId::new("T1");
        let delivered = bus.broadcast(|_, m| m.tenant_id.as_ref() == Some(&t1), &notice("t1 only"));
        assert_eq!(delivered, 1);
        assert!(!bus.is_connected(&stalled_key));

        assert_eq!(a.recv().await, Some(BusEvent::Connected));
        assert_eq!(a.recv().await, Some(notice("t1 only")));
        assert_eq!(b.recv().await, Some(BusEvent::Connected));
        assert!(b.rx.try_recv().is_err());
    }

    #[test]
    fn reset_pipe_and_aborted_are_normal_disconnects() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionAborted,
        ] {
            let err = io::Error::from(kind);
            assert_eq!(classify_disconnect(&err), DisconnectKind::Normal);
            assert_eq!(disconnect_level(Some(&err)), Level::DEBUG);
        }
        let aborted = io::Error::other("aborted");
        assert_eq!(classify_disconnect(&aborted), DisconnectKind::Normal);

        let other = io::Error::other("disk on fire");
        assert_eq!(classify_disconnect(&other), DisconnectKind::Abnormal);
        assert_eq!(disconnect_level(Some(&other)), Level::ERROR);
        assert_eq!(disconnect_level(None), Level::DEBUG);
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed_from_table() {
        let bus = NotificationBus::new();
        let key = SubscriberKey::User(UserId::new("U1"));
        let sub = bus.subscribe(key.clone(), meta("U1"));
        assert!(bus.is_connected(&key));
        drop(sub);
        assert!(!bus.is_connected(&key));
        assert!(!bus.send_to(&key, notice("late")));
    }

    #[test]
    fn io_error_is_found_in_source_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("wrapped")]
        struct Wrapped(#[source] io::Error);

        let err = Wrapped(io::Error::from(io::ErrorKind::BrokenPipe));
        let found = find_io_error(&err).unwrap();
        assert_eq!(found.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn subscriber_key_follows_caller_kind() {
        let mut caller = Caller {
            user_id: UserId::new("agent:T1"),
            username: "agent".into(),
            role: ROLE_POS_AGENT.into(),
            user_type: "agent".into(),
            tenant_id: Some(TenantId::new("T1")),
            session_id: uuid::Uuid::new_v4(),
        };
        assert_eq!(
            SubscriberKey::for_caller(&caller),
            SubscriberKey::Tenant(TenantId::new("T1"))
        );
        caller.role = "customer".into();
        caller.user_type = USER_TYPE_CUSTOMER.into();
        caller.username = "+1 (555) 010-2030".into();
        assert_eq!(
            SubscriberKey::for_caller(&caller),
            SubscriberKey::Customer("+15550102030".into())
        );
        caller.user_type = "theater_user".into();
        assert_eq!(
            SubscriberKey::for_caller(&caller),
            SubscriberKey::User(UserId::new("agent:T1"))
        );
    }
}
