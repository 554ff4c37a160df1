//! The storage backend contract.

use crate::error::StorageResult;

/// An opaque, append-only byte store.
///
/// # Invariants
///
/// - `append` returns the offset the data landed at, which is the size
///   before the call
/// - `read_at` returns exactly the bytes previously appended there
/// - after `sync` returns, everything appended so far survives a crash
/// - `rewrite` replaces the whole content atomically: a reader after a
///   crash sees either the old bytes or the new bytes, never a mix
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is not
    /// fully inside the store.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes all appended data and metadata durable.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the number of bytes held.
    fn size(&self) -> StorageResult<u64>;

    /// Drops every byte after `new_size`.
    ///
    /// Used by journal recovery to cut off a torn tail frame.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Replaces the entire content with `data` in one atomic step.
    fn rewrite(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Reads the whole store.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = usize::try_from(size).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("store of {size} bytes does not fit in memory"),
            )
        })?;
        self.read_at(0, len)
    }
}
