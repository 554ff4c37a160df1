//! Durable sync journal.
//!
//! The Operation Log, the open-conflict set, the conflict archive and the
//! sync checkpoint persist as a sequence of framed records on a
//! [`StorageBackend`]:
//!
//! ```text
//! | magic "CSJL" (4) | version u16 (2) | kind u8 (1) | len u32 (4) | CBOR payload (len) | crc32 (4) |
//! ```
//!
//! Integers are little endian and the CRC covers everything before it.
//! Every append is synced before it returns. On open the frames are
//! replayed in order; a frame that runs past the end of the store or whose
//! checksum fails as the last frame is an interrupted write and is cut off.
//! Damage anywhere else is reported as [`SyncError::JournalCorrupted`].

use crate::error::{SyncError, SyncResult};
use cardsync_protocol::{OperationStatus, SyncConflict, SyncOperation};
use cardsync_storage::{InMemoryBackend, StorageBackend};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic bytes opening every journal frame.
pub const JOURNAL_MAGIC: [u8; 4] = *b"CSJL";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordKind {
    OperationUpserted = 1,
    OperationRemoved = 2,
    ConflictUpserted = 3,
    ConflictArchived = 4,
    Checkpoint = 5,
}

impl RecordKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::OperationUpserted),
            2 => Some(Self::OperationRemoved),
            3 => Some(Self::ConflictUpserted),
            4 => Some(Self::ConflictArchived),
            5 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// Persisted sync timestamps and the remote delta cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// Completion time of the last successful full sync.
    pub last_full_sync_ms: Option<u64>,
    /// Completion time of the last successful incremental sync.
    pub last_incremental_sync_ms: Option<u64>,
    /// Highest remote `changed_at_ms` already pulled.
    pub remote_cursor: u64,
}

impl SyncCheckpoint {
    /// Returns the completion time of the most recent successful sync of either mode.
    pub fn last_successful_sync_ms(&self) -> Option<u64> {
        match (self.last_full_sync_ms, self.last_incremental_sync_ms) {
            (Some(full), Some(incremental)) => Some(full.max(incremental)),
            (full, incremental) => full.or(incremental),
        }
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    /// An operation was enqueued or its state changed.
    OperationUpserted(SyncOperation),
    /// An operation left the log.
    OperationRemoved {
        /// Removed operation.
        op_id: u64,
    },
    /// An open conflict was created or refreshed.
    ConflictUpserted(SyncConflict),
    /// A conflict was resolved and moved to the archive.
    ConflictArchived(SyncConflict),
    /// The sync checkpoint changed.
    Checkpoint(SyncCheckpoint),
}

impl JournalRecord {
    fn kind(&self) -> RecordKind {
        match self {
            Self::OperationUpserted(_) => RecordKind::OperationUpserted,
            Self::OperationRemoved { .. } => RecordKind::OperationRemoved,
            Self::ConflictUpserted(_) => RecordKind::ConflictUpserted,
            Self::ConflictArchived(_) => RecordKind::ConflictArchived,
            Self::Checkpoint(_) => RecordKind::Checkpoint,
        }
    }

    fn encode_payload(&self) -> SyncResult<Vec<u8>> {
        match self {
            Self::OperationUpserted(op) => to_cbor(op),
            Self::OperationRemoved { op_id } => to_cbor(op_id),
            Self::ConflictUpserted(conflict) | Self::ConflictArchived(conflict) => {
                to_cbor(conflict)
            }
            Self::Checkpoint(checkpoint) => to_cbor(checkpoint),
        }
    }

    fn decode_payload(kind: RecordKind, payload: &[u8]) -> SyncResult<Self> {
        Ok(match kind {
            RecordKind::OperationUpserted => Self::OperationUpserted(from_cbor(payload)?),
            RecordKind::OperationRemoved => Self::OperationRemoved {
                op_id: from_cbor(payload)?,
            },
            RecordKind::ConflictUpserted => Self::ConflictUpserted(from_cbor(payload)?),
            RecordKind::ConflictArchived => Self::ConflictArchived(from_cbor(payload)?),
            RecordKind::Checkpoint => Self::Checkpoint(from_cbor(payload)?),
        })
    }

    /// Encodes the record as one frame.
    fn encode_frame(&self) -> SyncResult<Vec<u8>> {
        let payload = self.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| SyncError::Codec("journal record larger than 4 GiB".into()))?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.extend_from_slice(&JOURNAL_MAGIC);
        frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        frame.push(self.kind() as u8);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = compute_crc32(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }
}

fn to_cbor<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(bytes)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::Codec(e.to_string()))
}

/// The state rebuilt from a journal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalState {
    /// Live operations by id, dead letters included.
    pub operations: BTreeMap<u64, SyncOperation>,
    /// Open conflicts keyed by entity id.
    pub open_conflicts: BTreeMap<String, SyncConflict>,
    /// Resolved conflicts in resolution order.
    pub archived_conflicts: Vec<SyncConflict>,
    /// Sync checkpoint.
    pub checkpoint: SyncCheckpoint,
}

impl JournalState {
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::OperationUpserted(op) => {
                self.operations.insert(op.op_id, op);
            }
            JournalRecord::OperationRemoved { op_id } => {
                self.operations.remove(&op_id);
            }
            JournalRecord::ConflictUpserted(conflict) => {
                self.open_conflicts
                    .insert(conflict.entity_id.clone(), conflict);
            }
            JournalRecord::ConflictArchived(conflict) => {
                if self
                    .open_conflicts
                    .get(&conflict.entity_id)
                    .is_some_and(|open| open.id == conflict.id)
                {
                    self.open_conflicts.remove(&conflict.entity_id);
                }
                self.archived_conflicts.push(conflict);
            }
            JournalRecord::Checkpoint(checkpoint) => {
                self.checkpoint = checkpoint;
            }
        }
    }

    /// Returns the minimal record sequence that rebuilds this state.
    fn records(&self) -> Vec<JournalRecord> {
        let mut records = Vec::with_capacity(
            self.operations.len() + self.open_conflicts.len() + self.archived_conflicts.len() + 1,
        );
        records.extend(
            self.archived_conflicts
                .iter()
                .cloned()
                .map(JournalRecord::ConflictArchived),
        );
        records.extend(
            self.open_conflicts
                .values()
                .cloned()
                .map(JournalRecord::ConflictUpserted),
        );
        records.extend(
            self.operations
                .values()
                .cloned()
                .map(JournalRecord::OperationUpserted),
        );
        if self.checkpoint != SyncCheckpoint::default() {
            records.push(JournalRecord::Checkpoint(self.checkpoint));
        }
        records
    }

    /// Reverts operations that were in flight when the process stopped.
    fn revert_in_flight(&mut self) -> usize {
        let mut reverted = 0;
        for op in self.operations.values_mut() {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
                reverted += 1;
            }
        }
        reverted
    }
}

/// Statistics of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    /// Journal size before compaction.
    pub bytes_before: u64,
    /// Journal size after compaction.
    pub bytes_after: u64,
    /// Records written.
    pub records: usize,
}

struct JournalInner {
    backend: Box<dyn StorageBackend>,
    state: JournalState,
}

/// Shared handle to the sync journal.
///
/// Clones share one backend. The journal mirrors the state its records
/// describe, so compaction never races with a concurrent append.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<Mutex<JournalInner>>,
}

impl Journal {
    /// Opens a journal, replaying and repairing it.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> SyncResult<Self> {
        let data = backend.read_all()?;
        let mut state = JournalState::default();
        let mut offset = 0usize;
        let mut replayed = 0usize;

        while offset < data.len() {
            match decode_frame(&data[offset..], offset as u64)? {
                Frame::Complete { record, len } => {
                    state.apply(record);
                    offset += len;
                    replayed += 1;
                }
                Frame::Torn { reason } => {
                    warn!(
                        offset,
                        dropped = data.len() - offset,
                        reason,
                        "truncating torn journal tail"
                    );
                    backend.truncate(offset as u64)?;
                    break;
                }
            }
        }

        let reverted = state.revert_in_flight();
        info!(
            records = replayed,
            operations = state.operations.len(),
            open_conflicts = state.open_conflicts.len(),
            reverted_in_flight = reverted,
            "journal replayed"
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(JournalInner { backend, state })),
        })
    }

    /// Opens an empty journal held in memory.
    pub fn in_memory() -> SyncResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()))
    }

    /// Appends a record and syncs it.
    pub fn append(&self, record: JournalRecord) -> SyncResult<()> {
        let frame = record.encode_frame()?;
        let mut inner = self.inner.lock();
        inner.backend.append(&frame)?;
        inner.backend.flush()?;
        inner.backend.sync()?;
        inner.state.apply(record);
        Ok(())
    }

    /// Returns a copy of the current state.
    pub fn state(&self) -> JournalState {
        self.inner.lock().state.clone()
    }

    /// Returns the current checkpoint.
    pub fn checkpoint(&self) -> SyncCheckpoint {
        self.inner.lock().state.checkpoint
    }

    /// Returns the journal size in bytes.
    pub fn size(&self) -> SyncResult<u64> {
        Ok(self.inner.lock().backend.size()?)
    }

    /// Rewrites the journal as one record per live object.
    pub fn compact(&self) -> SyncResult<CompactionStats> {
        let mut inner = self.inner.lock();
        let bytes_before = inner.backend.size()?;
        let records = inner.state.records();

        let mut data = Vec::new();
        for record in &records {
            data.extend_from_slice(&record.encode_frame()?);
        }
        inner.backend.rewrite(&data)?;

        let stats = CompactionStats {
            bytes_before,
            bytes_after: data.len() as u64,
            records: records.len(),
        };
        debug!(?stats, "journal compacted");
        Ok(stats)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Journal")
            .field("operations", &inner.state.operations.len())
            .field("open_conflicts", &inner.state.open_conflicts.len())
            .finish_non_exhaustive()
    }
}

enum Frame {
    Complete { record: JournalRecord, len: usize },
    Torn { reason: &'static str },
}

fn decode_frame(data: &[u8], offset: u64) -> SyncResult<Frame> {
    if data.len() < HEADER_SIZE {
        return Ok(Frame::Torn {
            reason: "incomplete header",
        });
    }

    if data[0..4] != JOURNAL_MAGIC {
        return Err(SyncError::JournalCorrupted {
            offset,
            reason: "invalid magic".into(),
        });
    }

    let version = u16::from_le_bytes([data[4], data[5]]);
    if version > JOURNAL_VERSION {
        return Err(SyncError::JournalCorrupted {
            offset,
            reason: format!("unsupported version {version}"),
        });
    }

    let payload_len = u32::from_le_bytes([data[7], data[8], data[9], data[10]]) as usize;
    let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
    if data.len() < total_len {
        return Ok(Frame::Torn {
            reason: "incomplete frame",
        });
    }

    let payload_end = HEADER_SIZE + payload_len;
    let stored_crc = u32::from_le_bytes([
        data[payload_end],
        data[payload_end + 1],
        data[payload_end + 2],
        data[payload_end + 3],
    ]);
    if stored_crc != compute_crc32(&data[..payload_end]) {
        if data.len() == total_len {
            return Ok(Frame::Torn {
                reason: "checksum mismatch",
            });
        }
        return Err(SyncError::JournalCorrupted {
            offset,
            reason: "checksum mismatch".into(),
        });
    }

    let kind = RecordKind::from_byte(data[6]).ok_or_else(|| SyncError::JournalCorrupted {
        offset,
        reason: format!("unknown record kind {}", data[6]),
    })?;
    let record = JournalRecord::decode_payload(kind, &data[HEADER_SIZE..payload_end])?;

    Ok(Frame::Complete {
        record,
        len: total_len,
    })
}

/// Computes a CRC32 checksum (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsync_protocol::{ConflictKind, EntityKind, EntitySnapshot, Resolution};
    use cardsync_storage::FileBackend;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn op(op_id: u64, entity: &str) -> SyncOperation {
        let mut op = SyncOperation::update(
            EntitySnapshot::new(EntityKind::Card, entity).with_field("front", "Q"),
        );
        op.op_id = op_id;
        op
    }

    fn conflict(entity: &str) -> SyncConflict {
        SyncConflict::new(
            EntitySnapshot::new(EntityKind::Card, entity).with_field("front", "local"),
            EntitySnapshot::new(EntityKind::Card, entity)
                .with_field("front", "remote")
                .with_version(3),
            ConflictKind::Content,
            1_000,
        )
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn records_survive_reopen() {
        let backend = InMemoryBackend::new();
        let journal = Journal::open(Box::new(backend.clone())).unwrap();

        journal
            .append(JournalRecord::OperationUpserted(op(1, "c1")))
            .unwrap();
        journal
            .append(JournalRecord::OperationUpserted(op(2, "c2")))
            .unwrap();
        journal
            .append(JournalRecord::OperationRemoved { op_id: 1 })
            .unwrap();
        journal
            .append(JournalRecord::ConflictUpserted(conflict("c3")))
            .unwrap();
        journal
            .append(JournalRecord::Checkpoint(SyncCheckpoint {
                last_full_sync_ms: Some(10),
                last_incremental_sync_ms: Some(20),
                remote_cursor: 7,
            }))
            .unwrap();
        let before = journal.state();
        drop(journal);

        let reopened = Journal::open(Box::new(backend)).unwrap();
        let state = reopened.state();
        assert_eq!(state, before);
        assert_eq!(state.operations.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert!(state.open_conflicts.contains_key("c3"));
        assert_eq!(state.checkpoint.remote_cursor, 7);
        assert_eq!(state.checkpoint.last_successful_sync_ms(), Some(20));
    }

    #[test]
    fn archiving_moves_conflict_out_of_open_set() {
        let journal = Journal::in_memory().unwrap();
        let mut c = conflict("c1");
        journal
            .append(JournalRecord::ConflictUpserted(c.clone()))
            .unwrap();

        let remote = c.remote_snapshot.clone();
        c.close(Resolution::RemoteWins, remote, true, 2_000).unwrap();
        journal
            .append(JournalRecord::ConflictArchived(c.clone()))
            .unwrap();

        let state = journal.state();
        assert!(state.open_conflicts.is_empty());
        assert_eq!(state.archived_conflicts, vec![c]);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let backend = InMemoryBackend::new();
        {
            let journal = Journal::open(Box::new(backend.clone())).unwrap();
            journal
                .append(JournalRecord::OperationUpserted(op(1, "c1")))
                .unwrap();
            journal
                .append(JournalRecord::OperationUpserted(op(2, "c2")))
                .unwrap();
        }
        let full = backend.data();
        let first_len = JournalRecord::OperationUpserted(op(1, "c1"))
            .encode_frame()
            .unwrap()
            .len();

        let torn = InMemoryBackend::with_data(full[..full.len() - 3].to_vec());
        let journal = Journal::open(Box::new(torn.clone())).unwrap();

        assert_eq!(journal.state().operations.len(), 1);
        assert_eq!(torn.data().len(), first_len);

        journal
            .append(JournalRecord::OperationUpserted(op(3, "c3")))
            .unwrap();
        let reopened = Journal::open(Box::new(torn)).unwrap();
        assert_eq!(
            reopened.state().operations.keys().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn checksum_failure_in_last_frame_is_torn_write() {
        let backend = InMemoryBackend::new();
        {
            let journal = Journal::open(Box::new(backend.clone())).unwrap();
            journal
                .append(JournalRecord::OperationUpserted(op(1, "c1")))
                .unwrap();
            journal
                .append(JournalRecord::OperationUpserted(op(2, "c2")))
                .unwrap();
        }
        let mut data = backend.data();
        let last = data.len() - 1;
        data[last] ^= 0xFF;

        let journal = Journal::open(Box::new(InMemoryBackend::with_data(data))).unwrap();
        assert_eq!(journal.state().operations.len(), 1);
    }

    #[test]
    fn damage_before_tail_is_corruption() {
        let backend = InMemoryBackend::new();
        {
            let journal = Journal::open(Box::new(backend.clone())).unwrap();
            journal
                .append(JournalRecord::OperationUpserted(op(1, "c1")))
                .unwrap();
            journal
                .append(JournalRecord::OperationUpserted(op(2, "c2")))
                .unwrap();
        }

        let mut flipped = backend.data();
        flipped[HEADER_SIZE + 2] ^= 0xFF;
        assert!(matches!(
            Journal::open(Box::new(InMemoryBackend::with_data(flipped))),
            Err(SyncError::JournalCorrupted { offset: 0, .. })
        ));

        let mut bad_magic = backend.data();
        bad_magic[0] = b'X';
        assert!(matches!(
            Journal::open(Box::new(InMemoryBackend::with_data(bad_magic))),
            Err(SyncError::JournalCorrupted { .. })
        ));
    }

    #[test]
    fn in_flight_operations_revert_to_pending() {
        let backend = InMemoryBackend::new();
        {
            let journal = Journal::open(Box::new(backend.clone())).unwrap();
            let mut in_flight = op(1, "c1");
            in_flight.status = OperationStatus::InFlight;
            journal
                .append(JournalRecord::OperationUpserted(in_flight))
                .unwrap();
        }

        let journal = Journal::open(Box::new(backend)).unwrap();
        assert_eq!(
            journal.state().operations[&1].status,
            OperationStatus::Pending
        );
    }

    #[test]
    fn compaction_keeps_state_and_shrinks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.journal");
        let journal = Journal::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();

        for id in 1..=20 {
            journal
                .append(JournalRecord::OperationUpserted(op(id, "c1")))
                .unwrap();
        }
        for id in 1..=19 {
            journal
                .append(JournalRecord::OperationRemoved { op_id: id })
                .unwrap();
        }
        let before = journal.state();

        let stats = journal.compact().unwrap();
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(stats.records, 1);
        assert_eq!(journal.size().unwrap(), stats.bytes_after);
        drop(journal);

        let reopened = Journal::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
        assert_eq!(reopened.state(), before);
    }

    proptest! {
        #[test]
        fn any_truncation_replays_a_prefix(count in 1usize..8, cut in 0usize..2048) {
            let backend = InMemoryBackend::new();
            {
                let journal = Journal::open(Box::new(backend.clone())).unwrap();
                for id in 1..=count as u64 {
                    journal.append(JournalRecord::OperationUpserted(op(id, "c"))).unwrap();
                }
            }
            let data = backend.data();
            let cut = cut.min(data.len());

            let backend = InMemoryBackend::with_data(data[..cut].to_vec());
            let journal = Journal::open(Box::new(backend)).unwrap();
            let ids: Vec<u64> = journal.state().operations.keys().copied().collect();
            let expected: Vec<u64> = (1..=ids.len() as u64).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
