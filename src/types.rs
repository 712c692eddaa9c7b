//! Core types for the redo log.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::util::crc::crc32;
use crate::util::now_millis;
use crate::{Error, Result};

/// Identifier of one redo transaction.
///
/// `time` is the generator's start time in seconds; `counter` increases
/// from 1 within that epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TransactionId {
    pub time: i32,
    pub counter: i32,
}

impl TransactionId {
    /// Create a transaction id.
    pub fn new(time: i32, counter: i32) -> Self {
        Self { time, counter }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.time, self.counter)
    }
}

/// Generates unique transaction ids.
#[derive(Debug)]
pub struct TxnIdGenerator {
    state: Mutex<TransactionId>,
}

impl Default for TxnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnIdGenerator {
    /// Create a generator seeded with the current time.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Self::epoch()),
        }
    }

    fn epoch() -> TransactionId {
        TransactionId::new((now_millis() / 1000) as i32, 1)
    }

    /// Return the next id.
    pub fn next_id(&self) -> TransactionId {
        let mut state = self.state.lock();
        let id = *state;
        if state.counter < i32::MAX {
            state.counter += 1;
        } else {
            *state = Self::epoch();
        }
        id
    }
}

/// Identifies a committed transaction: file sequence plus transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId {
    pub sequence: u64,
    pub txn_id: TransactionId,
}

impl CommitId {
    /// Create a commit id.
    pub fn new(sequence: u64, txn_id: TransactionId) -> Self {
        Self { sequence, txn_id }
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.sequence, self.txn_id)
    }
}

/// Result returned by a commit callback.
pub type CallbackResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback fired once a commit record is durable.
///
/// Runs on whichever thread performed the fsync, after the writer's lock
/// is released, so it may log further entries. It should not block.
pub type CommitCallback = Arc<dyn Fn(CommitId) -> CallbackResult + Send + Sync>;

/// Kind of a log entry, as far as the log itself cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    /// A mutation inside an already started transaction.
    Op = 0,
    /// First record of a transaction.
    Start = 1,
    /// Closes a transaction successfully.
    Commit = 2,
    /// Closes a transaction without effect.
    Abort = 3,
    /// Lists the transactions active at a point in time.
    Checkpoint = 4,
}

impl EntryKind {
    /// Create from byte value.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(EntryKind::Op),
            1 => Some(EntryKind::Start),
            2 => Some(EntryKind::Commit),
            3 => Some(EntryKind::Abort),
            4 => Some(EntryKind::Checkpoint),
            _ => None,
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Frame prefix: length (4) + CRC (4).
pub const FRAME_PREFIX_LEN: usize = 8;

/// Fixed body fields: kind (1) + txn (4 + 4) + mailbox (4) + timestamp (8).
const FRAME_FIXED_LEN: usize = 21;

/// One serialized mutation.
///
/// The payload is opaque to the log. The entry is framed as:
///
/// ```text
/// [len: u32][crc: u32][kind: u8][txn time: i32][txn counter: i32][mailbox: i32][timestamp: i64][payload]
/// ```
///
/// `len` counts the bytes after the CRC field, and the CRC covers the same
/// bytes. All integers are big-endian.
#[derive(Clone)]
pub struct LogEntry {
    kind: EntryKind,
    txn_id: TransactionId,
    mailbox_id: i32,
    timestamp: i64,
    payload: Bytes,
    callback: Option<CommitCallback>,
}

impl LogEntry {
    /// Create an entry of the given kind, timestamped now.
    pub fn new(
        kind: EntryKind,
        txn_id: TransactionId,
        mailbox_id: i32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            kind,
            txn_id,
            mailbox_id,
            timestamp: now_millis(),
            payload: payload.into(),
            callback: None,
        }
    }

    /// Create the start record of a transaction.
    pub fn start(txn_id: TransactionId, mailbox_id: i32, payload: impl Into<Bytes>) -> Self {
        Self::new(EntryKind::Start, txn_id, mailbox_id, payload)
    }

    /// Create a commit record for a transaction.
    pub fn commit(txn_id: TransactionId, mailbox_id: i32) -> Self {
        Self::new(EntryKind::Commit, txn_id, mailbox_id, Bytes::new())
    }

    /// Create an abort record for a transaction.
    pub fn abort(txn_id: TransactionId, mailbox_id: i32) -> Self {
        Self::new(EntryKind::Abort, txn_id, mailbox_id, Bytes::new())
    }

    /// Create a checkpoint record listing the transactions still active.
    pub fn checkpoint(active: &[TransactionId]) -> Self {
        let mut payload = BytesMut::with_capacity(4 + active.len() * 8);
        payload.put_u32(active.len() as u32);
        for txn_id in active {
            payload.put_i32(txn_id.time);
            payload.put_i32(txn_id.counter);
        }
        Self::new(
            EntryKind::Checkpoint,
            TransactionId::default(),
            0,
            payload.freeze(),
        )
    }

    /// Transaction ids listed by a checkpoint record.
    ///
    /// `None` for other kinds or a malformed payload.
    pub fn checkpoint_txn_ids(&self) -> Option<Vec<TransactionId>> {
        if self.kind != EntryKind::Checkpoint || self.payload.len() < 4 {
            return None;
        }
        let mut buf = &self.payload[..];
        let count = buf.get_u32() as usize;
        if buf.len() != count * 8 {
            return None;
        }
        let ids = (0..count)
            .map(|_| TransactionId::new(buf.get_i32(), buf.get_i32()))
            .collect();
        Some(ids)
    }

    /// Override the timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach a callback fired when this record is durable.
    pub fn with_commit_callback(mut self, callback: CommitCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn txn_id(&self) -> TransactionId {
        self.txn_id
    }

    pub fn mailbox_id(&self) -> i32 {
        self.mailbox_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn commit_callback(&self) -> Option<&CommitCallback> {
        self.callback.as_ref()
    }

    /// Whether this entry opens a transaction.
    pub fn is_start_marker(&self) -> bool {
        self.kind == EntryKind::Start
    }

    /// Whether this entry closes a transaction.
    pub fn is_end_marker(&self) -> bool {
        matches!(self.kind, EntryKind::Commit | EntryKind::Abort)
    }

    /// Size of the encoded frame in bytes.
    pub fn encoded_len(&self) -> usize {
        FRAME_PREFIX_LEN + FRAME_FIXED_LEN + self.payload.len()
    }

    /// Encode the entry into its on-disk frame.
    pub fn encode(&self) -> Bytes {
        let body_len = FRAME_FIXED_LEN + self.payload.len();
        let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u32(0);
        buf.put_u8(self.kind.to_byte());
        buf.put_i32(self.txn_id.time);
        buf.put_i32(self.txn_id.counter);
        buf.put_i32(self.mailbox_id);
        buf.put_i64(self.timestamp);
        buf.put_slice(&self.payload);

        let crc = crc32(&buf[FRAME_PREFIX_LEN..]);
        buf[4..8].copy_from_slice(&crc.to_be_bytes());
        buf.freeze()
    }

    /// Read the body length from a frame prefix.
    pub fn frame_body_len(prefix: &[u8; FRAME_PREFIX_LEN]) -> usize {
        u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize
    }

    /// Decode one complete frame (prefix included).
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < FRAME_PREFIX_LEN + FRAME_FIXED_LEN {
            return Err(Error::corruption(format!(
                "entry frame too short: {} bytes",
                frame.len()
            )));
        }

        let mut buf = frame;
        let body_len = buf.get_u32() as usize;
        let expected_crc = buf.get_u32();
        if body_len != buf.len() {
            return Err(Error::corruption(format!(
                "entry frame length {} does not match body of {} bytes",
                body_len,
                buf.len()
            )));
        }

        let actual_crc = crc32(buf);
        if actual_crc != expected_crc {
            return Err(Error::corruption(format!(
                "entry CRC mismatch: expected {:#x}, got {:#x}",
                expected_crc, actual_crc
            )));
        }

        let kind_byte = buf.get_u8();
        let kind = EntryKind::from_byte(kind_byte)
            .ok_or_else(|| Error::corruption(format!("unknown entry kind {}", kind_byte)))?;
        let txn_id = TransactionId::new(buf.get_i32(), buf.get_i32());
        let mailbox_id = buf.get_i32();
        let timestamp = buf.get_i64();

        Ok(Self {
            kind,
            txn_id,
            mailbox_id,
            timestamp,
            payload: Bytes::copy_from_slice(buf),
            callback: None,
        })
    }
}

impl fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEntry")
            .field("kind", &self.kind)
            .field("txn_id", &self.txn_id)
            .field("mailbox_id", &self.mailbox_id)
            .field("timestamp", &self.timestamp)
            .field("payload_len", &self.payload.len())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl PartialEq for LogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.txn_id == other.txn_id
            && self.mailbox_id == other.mailbox_id
            && self.timestamp == other.timestamp
            && self.payload == other.payload
    }
}

impl Eq for LogEntry {}

/// In-flight transactions in the order they started.
///
/// Re-inserting a transaction replaces its entry but keeps its position.
#[derive(Debug, Default)]
pub struct ActiveTransactions {
    entries: BTreeMap<u64, LogEntry>,
    index: HashMap<TransactionId, u64>,
    next_slot: u64,
}

impl ActiveTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an active transaction.
    pub fn insert(&mut self, entry: LogEntry) {
        let txn_id = entry.txn_id();
        match self.index.get(&txn_id) {
            Some(slot) => {
                self.entries.insert(*slot, entry);
            }
            None => {
                let slot = self.next_slot;
                self.next_slot += 1;
                self.index.insert(txn_id, slot);
                self.entries.insert(slot, entry);
            }
        }
    }

    /// Remove a transaction, returning its start entry.
    pub fn remove(&mut self, txn_id: &TransactionId) -> Option<LogEntry> {
        let slot = self.index.remove(txn_id)?;
        self.entries.remove(&slot)
    }

    /// Update the set for an entry about to be logged.
    pub fn track(&mut self, entry: &LogEntry) {
        if entry.is_start_marker() {
            self.insert(entry.clone());
        }
        if entry.is_end_marker() {
            self.remove(&entry.txn_id());
        }
    }

    pub fn contains(&self, txn_id: &TransactionId) -> bool {
        self.index.contains_key(txn_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Transaction ids in start order.
    pub fn ids(&self) -> Vec<TransactionId> {
        self.entries.values().map(|e| e.txn_id()).collect()
    }

    /// Start entries in start order.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}
