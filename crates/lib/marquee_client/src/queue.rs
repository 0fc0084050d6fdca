// @awa-component: CLIENT-OrderQueue
//
//! Per-tenant offline order queue.
//!
//! Orders are persisted before anything is sent. A single send loop per
//! tenant drains due orders in FIFO order whenever the terminal is online
//! (platform signal plus reachability probe), backing off exponentially on
//! outages. The idempotency key assigned at enqueue time is what keeps
//! retries from duplicating orders server-side.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use marquee_core::id::{IdempotencyKey, TenantId};
use rand::Rng;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::error::{QueueError, QueueResult};
use crate::model::{OrderDraft, QueueBlob, QueueStatus, QueuedOrder, SyncProgress};
use crate::storage::QueueStorage;
use crate::transport::{Delivery, OrderTransport};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Pause after coming back online before probing.
    pub settle_delay: Duration,
    /// Longest the send loop sleeps without a trigger.
    pub poll_interval: Duration,
    /// How long synced orders are kept for audit.
    pub synced_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(30),
            synced_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    /// Exponential delay for the given attempt count, with up to 25% jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let spread = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::rng().random_range(0..=spread));
        (base + jitter).min(self.max_backoff)
    }
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub online: bool,
    /// Another drain was already running.
    pub busy: bool,
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    pub retrying: usize,
}

struct Inner {
    tenant_id: TenantId,
    storage: Arc<dyn QueueStorage>,
    transport: Arc<dyn OrderTransport>,
    connectivity: Connectivity,
    config: QueueConfig,
    blob_lock: Mutex<()>,
    draining: AtomicBool,
    progress: watch::Sender<SyncProgress>,
    wake: Notify,
}

/// Clears the drain flag when the cycle ends.
struct DrainGate<'a>(&'a AtomicBool);

impl<'a> DrainGate<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct OrderQueue {
    inner: Arc<Inner>,
}

impl OrderQueue {
    /// Open the tenant's queue. Orders left `in_flight` by an interrupted
    /// run go back to `pending`; expired synced orders are pruned.
    pub async fn open(
        tenant_id: TenantId,
        storage: Arc<dyn QueueStorage>,
        transport: Arc<dyn OrderTransport>,
        connectivity: Connectivity,
        config: QueueConfig,
    ) -> QueueResult<Self> {
        let (progress, _) = watch::channel(SyncProgress::idle());
        let queue = Self {
            inner: Arc::new(Inner {
                tenant_id,
                storage,
                transport,
                connectivity,
                config,
                blob_lock: Mutex::new(()),
                draining: AtomicBool::new(false),
                progress,
                wake: Notify::new(),
            }),
        };
        let recovered = queue
            .update(|blob| {
                let mut recovered = 0;
                for order in &mut blob.queue {
                    if order.status == QueueStatus::InFlight {
                        order.status = QueueStatus::Pending;
                        recovered += 1;
                    }
                }
                Ok(recovered)
            })
            .await?;
        if recovered > 0 {
            info!(tenant_id = %queue.inner.tenant_id, recovered, "re-queued interrupted orders");
        }
        queue.prune(Utc::now()).await?;
        Ok(queue)
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.inner.tenant_id
    }

    /// Load, modify and rewrite the blob under the queue lock.
    async fn update<T>(&self, f: impl FnOnce(&mut QueueBlob) -> QueueResult<T>) -> QueueResult<T> {
        let _guard = self.inner.blob_lock.lock().await;
        let mut blob = self.inner.storage.load(&self.inner.tenant_id).await?;
        let out = f(&mut blob)?;
        self.inner.storage.save(&self.inner.tenant_id, &blob).await?;
        Ok(out)
    }

    pub async fn snapshot(&self) -> QueueResult<QueueBlob> {
        let _guard = self.inner.blob_lock.lock().await;
        self.inner.storage.load(&self.inner.tenant_id).await
    }

    pub async fn orders(&self) -> QueueResult<Vec<QueuedOrder>> {
        Ok(self.snapshot().await?.queue)
    }

    /// Persist the order as `pending` and nudge the send loop.
    pub async fn enqueue(&self, draft: OrderDraft) -> QueueResult<QueuedOrder> {
        let order = QueuedOrder::new(self.inner.tenant_id.clone(), draft, Utc::now());
        let stored = order.clone();
        self.update(move |blob| {
            blob.queue.push(stored);
            Ok(())
        })
        .await?;
        info!(
            tenant_id = %self.inner.tenant_id,
            idempotency_key = %order.idempotency_key,
            "order queued"
        );
        self.inner.wake.notify_one();
        Ok(order)
    }

    /// Withdraw a `pending` order.
    pub async fn cancel(&self, key: &IdempotencyKey) -> QueueResult<QueuedOrder> {
        let removed = self
            .update(|blob| {
                let index = blob
                    .queue
                    .iter()
                    .position(|o| &o.idempotency_key == key)
                    .ok_or_else(|| QueueError::NotFound(key.clone()))?;
                let status = blob.queue[index].status;
                if status != QueueStatus::Pending {
                    return Err(QueueError::NotCancellable {
                        key: key.clone(),
                        status,
                    });
                }
                Ok(blob.queue.remove(index))
            })
            .await?;
        info!(tenant_id = %self.inner.tenant_id, idempotency_key = %key, "queued order withdrawn");
        Ok(removed)
    }

    /// Re-arm every `failed` order. Returns how many.
    pub async fn retry_failed(&self) -> QueueResult<usize> {
        let count = self
            .update(|blob| {
                let mut count = 0;
                for order in blob.queue.iter_mut().filter(|o| o.status == QueueStatus::Failed) {
                    order.status = QueueStatus::Pending;
                    order.attempts = 0;
                    order.next_attempt_at = None;
                    order.last_error = None;
                    count += 1;
                }
                Ok(count)
            })
            .await?;
        if count > 0 {
            self.inner.wake.notify_one();
        }
        Ok(count)
    }

    /// Drop synced orders older than the audit TTL.
    pub async fn prune(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let ttl = chrono::Duration::from_std(self.inner.config.synced_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        self.update(|blob| {
            let before = blob.queue.len();
            blob.queue.retain(|o| {
                o.status != QueueStatus::Synced || o.synced_at.is_some_and(|at| at + ttl > now)
            });
            Ok(before - blob.queue.len())
        })
        .await
    }

    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.inner.progress.subscribe()
    }

    fn report_progress(&self, current: usize, total: usize, message: String) {
        self.inner.progress.send_replace(SyncProgress {
            current,
            total,
            message,
        });
    }

    pub async fn drain(&self) -> QueueResult<DrainReport> {
        self.drain_at(Utc::now()).await
    }

    /// One drain cycle as of `now`.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> QueueResult<DrainReport> {
        let Some(_gate) = DrainGate::acquire(&self.inner.draining) else {
            return Ok(DrainReport {
                busy: true,
                ..DrainReport::default()
            });
        };
        let mut report = DrainReport::default();
        if !self.inner.connectivity.check().await {
            debug!(tenant_id = %self.inner.tenant_id, "offline, not draining");
            self.report_progress(0, 0, "offline".into());
            return Ok(report);
        }
        report.online = true;

        let due: Vec<IdempotencyKey> = self
            .snapshot()
            .await?
            .queue
            .iter()
            .filter(|o| o.is_due(now))
            .map(|o| o.idempotency_key.clone())
            .collect();
        let total = due.len();

        for (index, key) in due.into_iter().enumerate() {
            let claimed = self
                .update(|blob| {
                    Ok(blob.find_mut(&key).filter(|o| o.is_due(now)).map(|o| {
                        o.status = QueueStatus::InFlight;
                        o.clone()
                    }))
                })
                .await?;
            // Withdrawn since the cycle started.
            let Some(order) = claimed else { continue };

            self.report_progress(
                index + 1,
                total,
                format!("Sending order {} of {total}", index + 1),
            );
            report.attempted += 1;
            let delivery = self.inner.transport.submit(&order).await;
            let unreachable = delivery.is_err();
            match self.settle(&key, delivery, now).await? {
                Some(QueueStatus::Synced) => report.synced += 1,
                Some(QueueStatus::Failed) => report.failed += 1,
                Some(_) => report.retrying += 1,
                None => {
                    warn!(tenant_id = %self.inner.tenant_id, idempotency_key = %key, "order left the queue while in flight");
                }
            }
            if unreachable {
                break;
            }
        }

        self.prune(now).await?;
        self.report_progress(
            report.attempted,
            total,
            format!("Synced {} of {total} orders", report.synced),
        );
        if report.attempted > 0 {
            info!(
                tenant_id = %self.inner.tenant_id,
                synced = report.synced,
                failed = report.failed,
                retrying = report.retrying,
                "queue drained"
            );
        }
        Ok(report)
    }

    /// Record the result of one delivery attempt. `None` if the order is gone.
    async fn settle(
        &self,
        key: &IdempotencyKey,
        delivery: QueueResult<Delivery>,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<QueueStatus>> {
        let tenant_id = &self.inner.tenant_id;
        let config = &self.inner.config;
        self.update(|blob| {
            let Some(order) = blob.find_mut(key) else {
                return Ok(None);
            };
            match delivery {
                Ok(Delivery::Accepted(receipt)) => {
                    order.status = QueueStatus::Synced;
                    order.synced_at = Some(now);
                    order.last_error = None;
                    if let Some(receipt) = receipt {
                        order.order_id = Some(receipt.order_id);
                        order.order_number = Some(receipt.order_number);
                    }
                }
                Ok(Delivery::Duplicate) => {
                    debug!(tenant_id = %tenant_id, idempotency_key = %key, "server already had order");
                    order.status = QueueStatus::Synced;
                    order.synced_at = Some(now);
                    order.last_error = None;
                }
                Ok(Delivery::Rejected { status, reason }) => {
                    warn!(tenant_id = %tenant_id, idempotency_key = %key, status, "order rejected: {reason}");
                    order.status = QueueStatus::Failed;
                    order.last_error = Some(reason);
                }
                Ok(Delivery::Unavailable(reason)) => schedule_retry(order, config, now, reason),
                Err(e) => schedule_retry(order, config, now, e.to_string()),
            }
            let status = order.status;
            if status == QueueStatus::Synced {
                blob.last_sync_time = Some(now);
            }
            Ok(Some(status))
        })
        .await
    }

    /// Time until the next order becomes due, capped by the poll interval.
    async fn next_wake_in(&self) -> Duration {
        let poll = self.inner.config.poll_interval;
        let Ok(blob) = self.snapshot().await else {
            return poll;
        };
        let now = Utc::now();
        blob.queue
            .iter()
            .filter(|o| o.status == QueueStatus::Pending)
            .filter_map(|o| o.next_attempt_at)
            .min()
            .map_or(poll, |at| (at - now).to_std().unwrap_or(Duration::ZERO).min(poll))
    }

    /// The send loop. Drains on enqueue, on retry, when a backoff expires
    /// and after the terminal comes back online.
    pub async fn run(self, cancel: CancellationToken) {
        let mut online_rx = self.inner.connectivity.watch();
        let mut was_online = *online_rx.borrow_and_update();
        info!(tenant_id = %self.inner.tenant_id, "order queue running");
        loop {
            if let Err(e) = self.drain().await {
                warn!(tenant_id = %self.inner.tenant_id, "drain failed: {e}");
            }
            let wait = self.next_wake_in().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && !was_online {
                        info!(tenant_id = %self.inner.tenant_id, "network back, settling before drain");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.inner.config.settle_delay) => {}
                        }
                    }
                    was_online = online;
                }
            }
        }
        info!(tenant_id = %self.inner.tenant_id, "order queue stopped");
    }

    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(cancel))
    }
}

fn schedule_retry(order: &mut QueuedOrder, config: &QueueConfig, now: DateTime<Utc>, reason: String) {
    order.attempts = order.attempts.saturating_add(1);
    let delay = config.backoff(order.attempts);
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
    order.status = QueueStatus::Pending;
    order.next_attempt_at = Some(now + delay);
    debug!(
        idempotency_key = %order.idempotency_key,
        attempts = order.attempts,
        "delivery failed, retrying later: {reason}"
    );
    order.last_error = Some(reason);
}
