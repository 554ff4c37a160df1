//! # cardsync engine
//!
//! Offline-first synchronization between a device-local card store and a
//! remote store.
//!
//! Local mutations are recorded as [`SyncOperation`]s in a durable
//! [`OperationLog`] the moment they are enqueued. A [`SyncEngine`] session
//! pulls remote changes, detects divergence, resolves it according to the
//! configured [`ConflictPolicy`], and pushes the queue in batches shaped by
//! the current network quality.
//!
//! ## Guarantees
//!
//! - An acknowledged enqueue survives a crash; in-flight operations return
//!   to the queue when the journal is reopened.
//! - At most one operation per entity is in flight at any time.
//! - Operations exhausting their retry budget move to a dead-letter set
//!   instead of being dropped.
//! - At most one sync session is active per engine.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cardsync_engine::{
//!     MemoryLocalStore, MemoryRemoteStore, SyncConfig, SyncEngine, Journal,
//! };
//! use cardsync_protocol::{EntityKind, EntitySnapshot, SyncOperation};
//! use std::sync::Arc;
//!
//! # async fn demo() -> cardsync_engine::SyncResult<()> {
//! let engine = SyncEngine::new(
//!     SyncConfig::new("laptop"),
//!     Journal::in_memory()?,
//!     Arc::new(MemoryLocalStore::new()),
//!     Arc::new(MemoryRemoteStore::new()),
//! );
//!
//! let card = EntitySnapshot::new(EntityKind::Card, "c1").with_field("front", "Ohm's law");
//! engine.enqueue(SyncOperation::create(card))?;
//! let session = engine.sync().await?;
//! println!("{} after {} operations", session.state, session.completed_ops);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod clock;
mod config;
mod conflicts;
mod detector;
mod engine;
mod error;
mod events;
mod journal;
mod memory;
mod metrics;
mod network;
mod oplog;
mod resolver;
mod session;
mod store;
mod transfer;
mod worker;

pub use config::{RetryConfig, SyncConfig};
pub use conflicts::{ConflictSet, Upsert};
pub use detector::{check, classify, ConflictDetector};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, EventSubscription, SyncEvent};
pub use journal::{CompactionStats, Journal, JournalRecord, JournalState, SyncCheckpoint};
pub use memory::{MemoryLocalStore, MemoryRemoteStore};
pub use metrics::{MetricsRecorder, SyncMetrics};
pub use network::{NetworkMonitor, NetworkProbe, NetworkQuality, NetworkStatus, TransferParams};
pub use oplog::{FailureOutcome, OperationLog};
pub use resolver::{merge, resolve, value_for, ResolvedValue};
pub use session::{SessionState, SyncMode, SyncSession};
pub use store::{BackupHook, CacheInvalidator, LocalRecord, LocalStore, RemoteStore};
pub use transfer::{
    BatchTransferEngine, ConflictedOperation, DeliveredOperation, FailedOperation, TransferResult,
};
pub use worker::BackgroundSync;

// Re-export protocol types for convenience
pub use cardsync_protocol::{
    ConflictKind, ConflictPolicy, EntityKind, EntitySnapshot, OperationStatus, OperationType,
    Priority, Resolution, SyncConflict, SyncOperation,
};
