//! # cardsync protocol
//!
//! Data types exchanged between the cardsync engine, the local card store
//! and the remote store.
//!
//! This crate provides:
//! - [`EntitySnapshot`] and [`EntityKind`] for versioned entity state
//! - [`SyncOperation`] for queued local mutations
//! - [`SyncConflict`] and [`ConflictPolicy`] for divergence handling
//! - [`BatchRequest`], [`BatchAck`] and [`RemoteChange`] for the wire
//!
//! It is a pure protocol crate with no I/O. Every type derives serde so
//! the engine can journal it and transports can encode it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entity;
mod error;
mod messages;
mod operation;

pub use conflict::{ConflictKind, ConflictPolicy, Resolution, SyncConflict};
pub use entity::{EntityKind, EntitySnapshot};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{AckOutcome, BatchAck, BatchRequest, Direction, OperationAck, RemoteChange};
pub use operation::{OperationStatus, OperationType, Priority, SyncOperation};
