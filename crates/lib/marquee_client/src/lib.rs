//! # marquee_client
//!
//! Client side of the order pipeline: an offline-first, per-tenant order
//! queue that gets every order to the server at least once while the
//! idempotency key keeps it in the ledger at most once.

pub mod connectivity;
pub mod error;
pub mod model;
pub mod queue;
pub mod storage;
pub mod transport;

pub use connectivity::{Connectivity, HttpProbe, ReachabilityProbe};
pub use error::{QueueError, QueueResult};
pub use model::{OrderDraft, QueueBlob, QueueStatus, QueuedOrder, SyncProgress};
pub use queue::{DrainReport, OrderQueue, QueueConfig};
pub use storage::{FileStorage, MemoryStorage, QueueStorage};
pub use transport::{Delivery, HttpOrderTransport, OrderTransport};
