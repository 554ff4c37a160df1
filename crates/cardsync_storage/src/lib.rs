//! # cardsync storage
//!
//! Append-only byte stores for the cardsync sync journal.
//!
//! Backends never interpret the bytes they hold. The engine's journal
//! owns framing, checksums and replay; a backend only has to append,
//! read back, make data durable and, for compaction, swap its whole
//! content in one step.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - ephemeral store for tests and throwaway engines
//! - [`FileBackend`] - durable store on the local file system
//!
//! ## Example
//!
//! ```rust
//! use cardsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.append(b"frame-1").unwrap();
//! backend.append(b"frame-2").unwrap();
//! assert_eq!(backend.read_all().unwrap(), b"frame-1frame-2");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
