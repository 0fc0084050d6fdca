//! Queue errors.

use marquee_core::id::IdempotencyKey;
use thiserror::Error;

use crate::model::QueueStatus;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Queue blob is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Server unreachable: {0}")]
    Transport(String),

    #[error("Unexpected server response: {0}")]
    Protocol(String),

    #[error("No queued order with key {0}")]
    NotFound(IdempotencyKey),

    #[error("Order {key} is {status} and can no longer be withdrawn")]
    NotCancellable {
        key: IdempotencyKey,
        status: QueueStatus,
    },
}
