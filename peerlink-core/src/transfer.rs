//! File transfer state: sender and receiver halves, and the table that owns them.
//!
//! The sender keeps at most one chunk in flight. Chunk `n + 1` (the lowest unacknowledged
//! index, really) goes out only after the receiver acknowledges the previous one, and the
//! in-flight chunk is resent on the retry schedule until acknowledged. The receiver stores
//! chunks by index, counts bytes exactly (duplicates do not count twice) and reassembles in
//! index order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::{Bytes, BytesMut};

use crate::chunk::Chunker;
use crate::protocol::{AckChunk, FileChunk};
use crate::store::FileProgress;
use crate::timer::{RetrySchedule, Throttle, Timer};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("refusing to transfer an empty file")]
    Empty,
    #[error("too many active transfers (limit {limit})")]
    TooManyTransfers { limit: usize },
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),
    #[error("chunk {index} out of range for {file_id} ({total} chunks)")]
    ChunkOutOfRange {
        file_id: String,
        index: u32,
        total: u32,
    },
    #[error("received more bytes than announced for {0}")]
    Overflow(String),
}

/// Render a byte count for people, e.g. `1.50 MB`.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn progress_of(file_name: &str, done: u64, total: u64, now: u64) -> FileProgress {
    let percent = if total == 0 {
        100
    } else {
        ((done.min(total) * 100) / total) as u8
    };
    FileProgress {
        percent,
        message: format!("{} {} / {}", file_name, format_size(done), format_size(total)),
        updated_at: now,
    }
}

/// What an acknowledgement changed on the sender side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Index was not outstanding (duplicate or late ack).
    Duplicate,
    /// Send this chunk next.
    Next(u32),
    /// Another chunk is still in flight.
    Waiting,
    /// Every chunk is acknowledged.
    Done,
}

/// Sender half of one file transfer.
pub struct OutgoingTransfer {
    pub file_id: String,
    pub file_name: String,
    pub sender_id: String,
    pub created_at: u64,
    chunker: Chunker,
    unacked: BTreeSet<u32>,
    in_flight: Option<u32>,
    bytes_acked: u64,
    retry: Timer,
    attempt: usize,
    finished_at: Option<u64>,
    progress: Throttle<FileProgress>,
}

impl OutgoingTransfer {
    pub fn new(
        file_id: String,
        file_name: String,
        sender_id: String,
        created_at: u64,
        blob: Bytes,
        chunk_size: usize,
        progress_interval: u64,
    ) -> Result<Self, TransferError> {
        if blob.is_empty() {
            return Err(TransferError::Empty);
        }
        let chunker = Chunker::new(blob, chunk_size);
        let unacked = (0..chunker.len()).collect();
        Ok(Self {
            file_id,
            file_name,
            sender_id,
            created_at,
            chunker,
            unacked,
            in_flight: None,
            bytes_acked: 0,
            retry: Timer::new(),
            attempt: 0,
            finished_at: None,
            progress: Throttle::new(progress_interval),
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunker.total_bytes() as u64
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunker.len()
    }

    pub fn bytes_acked(&self) -> u64 {
        self.bytes_acked
    }

    pub fn in_flight(&self) -> Option<u32> {
        self.in_flight
    }

    pub fn unacked(&self) -> impl Iterator<Item = u32> + '_ {
        self.unacked.iter().copied()
    }

    pub fn is_done(&self) -> bool {
        self.unacked.is_empty()
    }

    /// Lowest unacknowledged chunk index.
    pub fn next_pending(&self) -> Option<u32> {
        self.unacked.first().copied()
    }

    /// Wire payload for chunk `index`.
    pub fn chunk_message(&self, index: u32) -> Option<FileChunk> {
        let chunk = self.chunker.get(index)?;
        Some(FileChunk {
            sender_id: self.sender_id.clone(),
            created_at: self.created_at,
            msg: self.file_name.clone(),
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            chunk_index: chunk.index,
            chunk: chunk.bytes,
            total_bytes: self.total_bytes(),
            total_chunks: self.total_chunks(),
        })
    }

    /// Record that `index` went out at `now` and start its retry timer. Resending the
    /// chunk already in flight keeps the backoff armed by [`Self::due_retry`].
    pub fn mark_sent(&mut self, index: u32, now: u64, schedule: &RetrySchedule) {
        if self.in_flight == Some(index) && self.retry.is_armed() {
            return;
        }
        self.in_flight = Some(index);
        self.attempt = 0;
        self.retry.arm(now, schedule.delay(0));
    }

    pub fn on_ack(&mut self, index: u32, bytes_received: u64, now: u64) -> AckOutcome {
        if !self.unacked.remove(&index) {
            return AckOutcome::Duplicate;
        }
        self.bytes_acked = self.bytes_acked.max(bytes_received.min(self.total_bytes()));
        if self.in_flight == Some(index) {
            self.in_flight = None;
            self.retry.cancel();
        }
        if self.unacked.is_empty() {
            self.bytes_acked = self.total_bytes();
            self.finished_at = Some(now);
            return AckOutcome::Done;
        }
        match (self.in_flight, self.next_pending()) {
            (None, Some(next)) => AckOutcome::Next(next),
            _ => AckOutcome::Waiting,
        }
    }

    /// Index to resend if the in-flight chunk's retry timer fired.
    pub fn due_retry(&mut self, now: u64, schedule: &RetrySchedule) -> Option<u32> {
        let index = self.in_flight?;
        if !self.retry.fire(now) {
            return None;
        }
        self.attempt += 1;
        self.retry.arm(now, schedule.delay(self.attempt));
        Some(index)
    }

    pub fn cancel_retry(&mut self) {
        self.retry.cancel();
    }

    pub fn retry_armed(&self) -> bool {
        self.retry.is_armed()
    }

    /// Progress for the sender's view, throttled unless the transfer just finished.
    pub fn offer_progress(&mut self, now: u64) -> Option<FileProgress> {
        let p = progress_of(&self.file_name, self.bytes_acked, self.total_bytes(), now);
        let force = self.is_done();
        self.progress.offer(now, p, force)
    }
}

/// Receiver half of one file transfer.
pub struct IncomingTransfer {
    pub file_id: String,
    pub file_name: String,
    pub sender_id: String,
    pub created_at: u64,
    pub total_bytes: u64,
    pub total_chunks: u32,
    chunks: BTreeMap<u32, Bytes>,
    received_bytes: u64,
    finished_at: Option<u64>,
    progress: Throttle<FileProgress>,
}

/// Result of storing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Duplicate,
    Completed,
}

impl IncomingTransfer {
    pub fn from_chunk(chunk: &FileChunk, progress_interval: u64) -> Self {
        Self {
            file_id: chunk.file_id.clone(),
            file_name: chunk.file_name.clone(),
            sender_id: chunk.sender_id.clone(),
            created_at: chunk.created_at,
            total_bytes: chunk.total_bytes,
            total_chunks: chunk.total_chunks,
            chunks: BTreeMap::new(),
            received_bytes: 0,
            finished_at: None,
            progress: Throttle::new(progress_interval),
        }
    }

    /// Check that `chunk` can open a transfer: its metadata announces a non-empty file and
    /// the chunk itself fits in it.
    pub fn admits(chunk: &FileChunk) -> Result<(), TransferError> {
        if chunk.total_bytes == 0 || chunk.total_chunks == 0 {
            return Err(TransferError::Empty);
        }
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                file_id: chunk.file_id.clone(),
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }
        if chunk.chunk.len() as u64 > chunk.total_bytes {
            return Err(TransferError::Overflow(chunk.file_id.clone()));
        }
        Ok(())
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn received_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_done(&self) -> bool {
        self.received_bytes == self.total_bytes
    }

    pub fn store(&mut self, index: u32, bytes: Bytes, now: u64) -> Result<StoreOutcome, TransferError> {
        if index >= self.total_chunks {
            return Err(TransferError::ChunkOutOfRange {
                file_id: self.file_id.clone(),
                index,
                total: self.total_chunks,
            });
        }
        if self.chunks.contains_key(&index) {
            return Ok(StoreOutcome::Duplicate);
        }
        let received = self.received_bytes + bytes.len() as u64;
        if received > self.total_bytes {
            return Err(TransferError::Overflow(self.file_id.clone()));
        }
        self.chunks.insert(index, bytes);
        self.received_bytes = received;
        if self.is_done() {
            self.finished_at = Some(now);
            return Ok(StoreOutcome::Completed);
        }
        Ok(StoreOutcome::Stored)
    }

    pub fn ack(&self, index: u32) -> AckChunk {
        AckChunk {
            file_id: self.file_id.clone(),
            chunk_index_received: index,
            bytes_received: self.received_bytes,
        }
    }

    /// Concatenate the chunks in index order. `None` until every byte has arrived.
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_done() {
            return None;
        }
        let mut out = BytesMut::with_capacity(self.total_bytes as usize);
        for chunk in self.chunks.values() {
            out.extend_from_slice(chunk);
        }
        Some(out.freeze())
    }

    /// Progress for the receiver's view, throttled unless the transfer just finished.
    pub fn offer_progress(&mut self, now: u64) -> Option<FileProgress> {
        let p = progress_of(&self.file_name, self.received_bytes, self.total_bytes, now);
        let force = self.is_done();
        self.progress.offer(now, p, force)
    }
}

/// All transfers of one session. Caps the number of unfinished transfers and evicts
/// finished ones after a grace period.
pub struct Transfers {
    outgoing: HashMap<String, OutgoingTransfer>,
    incoming: HashMap<String, IncomingTransfer>,
    max_active: usize,
    grace: u64,
}

impl Transfers {
    pub fn new(max_active: usize, grace: u64) -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            max_active,
            grace,
        }
    }

    /// Unfinished transfers in either direction.
    pub fn active_count(&self) -> usize {
        self.outgoing.values().filter(|t| !t.is_done()).count()
            + self.incoming.values().filter(|t| !t.is_done()).count()
    }

    pub fn len(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.outgoing.contains_key(file_id) || self.incoming.contains_key(file_id)
    }

    fn check_capacity(&self) -> Result<(), TransferError> {
        if self.active_count() >= self.max_active {
            return Err(TransferError::TooManyTransfers {
                limit: self.max_active,
            });
        }
        Ok(())
    }

    pub fn insert_outgoing(&mut self, transfer: OutgoingTransfer) -> Result<(), TransferError> {
        self.check_capacity()?;
        self.outgoing.insert(transfer.file_id.clone(), transfer);
        Ok(())
    }

    pub fn outgoing_mut(&mut self, file_id: &str) -> Option<&mut OutgoingTransfer> {
        self.outgoing.get_mut(file_id)
    }

    pub fn outgoing(&self, file_id: &str) -> Option<&OutgoingTransfer> {
        self.outgoing.get(file_id)
    }

    pub fn incoming(&self, file_id: &str) -> Option<&IncomingTransfer> {
        self.incoming.get(file_id)
    }

    pub fn incoming_mut(&mut self, file_id: &str) -> Option<&mut IncomingTransfer> {
        self.incoming.get_mut(file_id)
    }

    /// Receiver state for `chunk`'s file, created from its metadata if unseen.
    /// Returns the state and whether it was just created. A chunk that could not be
    /// stored never opens a transfer.
    pub fn incoming_for(
        &mut self,
        chunk: &FileChunk,
        progress_interval: u64,
    ) -> Result<(&mut IncomingTransfer, bool), TransferError> {
        let created = !self.incoming.contains_key(&chunk.file_id);
        if created {
            IncomingTransfer::admits(chunk)?;
            self.check_capacity()?;
        }
        let transfer = self
            .incoming
            .entry(chunk.file_id.clone())
            .or_insert_with(|| IncomingTransfer::from_chunk(chunk, progress_interval));
        Ok((transfer, created))
    }

    /// Sender-side chunks whose retry timer fired, as `(file_id, index)`.
    pub fn due_retries(&mut self, now: u64, schedule: &RetrySchedule) -> Vec<(String, u32)> {
        let mut due: Vec<(String, u32)> = self
            .outgoing
            .values_mut()
            .filter_map(|t| t.due_retry(now, schedule).map(|i| (t.file_id.clone(), i)))
            .collect();
        due.sort();
        due
    }

    /// Pending throttled progress updates that may be shown now.
    pub fn flush_progress(&mut self, now: u64) -> Vec<(String, FileProgress)> {
        let out = self
            .outgoing
            .values_mut()
            .filter_map(|t| t.progress.flush(now).map(|p| (t.file_id.clone(), p)));
        let inc = self
            .incoming
            .values_mut()
            .filter_map(|t| t.progress.flush(now).map(|p| (t.file_id.clone(), p)));
        out.chain(inc).collect()
    }

    /// Drop finished transfers whose grace period has passed. Returns their ids.
    pub fn evict_finished(&mut self, now: u64) -> Vec<String> {
        let grace = self.grace;
        let expired = |finished_at: Option<u64>| {
            finished_at.is_some_and(|at| now.saturating_sub(at) >= grace)
        };
        let mut evicted = Vec::new();
        self.outgoing.retain(|id, t| {
            let keep = !expired(t.finished_at);
            if !keep {
                evicted.push(id.clone());
            }
            keep
        });
        self.incoming.retain(|id, t| {
            let keep = !expired(t.finished_at);
            if !keep {
                evicted.push(id.clone());
            }
            keep
        });
        evicted
    }

    /// Drop everything, stopping all retry timers.
    pub fn clear(&mut self) {
        for t in self.outgoing.values_mut() {
            t.cancel_retry();
        }
        self.outgoing.clear();
        self.incoming.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing(len: usize, chunk: usize) -> OutgoingTransfer {
        let blob = Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>());
        OutgoingTransfer::new(
            "me-1".into(),
            "a.bin".into(),
            "me".into(),
            1,
            blob,
            chunk,
            0,
        )
        .unwrap()
    }

    #[test]
    fn empty_file_rejected() {
        let r = OutgoingTransfer::new("x".into(), "x".into(), "me".into(), 0, Bytes::new(), 10, 0);
        assert!(matches!(r, Err(TransferError::Empty)));
    }

    #[test]
    fn acks_drive_lowest_pending_next() {
        let schedule = RetrySchedule::new(vec![1000, 4000]);
        let mut t = outgoing(100, 30);
        assert_eq!(t.total_chunks(), 4);
        assert_eq!(t.next_pending(), Some(0));
        t.mark_sent(0, 0, &schedule);
        assert_eq!(t.on_ack(0, 30, 10), AckOutcome::Next(1));
        t.mark_sent(1, 10, &schedule);
        assert_eq!(t.on_ack(1, 60, 20), AckOutcome::Next(2));
        assert_eq!(t.on_ack(1, 60, 21), AckOutcome::Duplicate);
        t.mark_sent(2, 20, &schedule);
        assert_eq!(t.on_ack(2, 90, 30), AckOutcome::Next(3));
        t.mark_sent(3, 30, &schedule);
        assert_eq!(t.on_ack(3, 100, 40), AckOutcome::Done);
        assert!(t.is_done());
        assert_eq!(t.bytes_acked(), 100);
        assert!(!t.retry_armed());
    }

    #[test]
    fn retry_follows_schedule_until_acked() {
        let schedule = RetrySchedule::new(vec![1000, 4000]);
        let mut t = outgoing(100, 30);
        t.mark_sent(0, 0, &schedule);
        assert_eq!(t.due_retry(999, &schedule), None);
        assert_eq!(t.due_retry(1000, &schedule), Some(0));
        assert_eq!(t.due_retry(4999, &schedule), None);
        assert_eq!(t.due_retry(5000, &schedule), Some(0));
        assert_eq!(t.due_retry(9000, &schedule), Some(0));
        t.on_ack(0, 30, 9001);
        assert_eq!(t.due_retry(100_000, &schedule), None);
    }

    #[test]
    fn ack_bytes_never_decrease() {
        let schedule = RetrySchedule::new(vec![1000]);
        let mut t = outgoing(100, 30);
        t.mark_sent(0, 0, &schedule);
        t.on_ack(0, 30, 1);
        t.mark_sent(1, 1, &schedule);
        t.on_ack(1, 10, 2);
        assert_eq!(t.bytes_acked(), 30);
    }

    fn chunk(file_id: &str, index: u32, len: usize, total_bytes: u64, total_chunks: u32) -> FileChunk {
        FileChunk {
            sender_id: "peer".into(),
            created_at: 5,
            msg: "f.bin".into(),
            file_id: file_id.into(),
            file_name: "f.bin".into(),
            chunk_index: index,
            chunk: Bytes::from(vec![index as u8; len]),
            total_bytes,
            total_chunks,
        }
    }

    #[test]
    fn receiver_counts_exact_bytes_and_reassembles_in_order() {
        let c2 = chunk("f", 2, 10, 70, 3);
        let mut t = IncomingTransfer::from_chunk(&c2, 0);
        assert_eq!(t.store(2, c2.chunk.clone(), 0).unwrap(), StoreOutcome::Stored);
        assert_eq!(t.received_bytes(), 10);
        assert_eq!(t.store(0, Bytes::from(vec![0u8; 30]), 1).unwrap(), StoreOutcome::Stored);
        assert_eq!(t.store(0, Bytes::from(vec![0u8; 30]), 2).unwrap(), StoreOutcome::Duplicate);
        assert_eq!(t.received_bytes(), 40);
        assert!(t.assemble().is_none());
        assert_eq!(t.store(1, Bytes::from(vec![1u8; 30]), 3).unwrap(), StoreOutcome::Completed);
        assert!(t.is_done());
        let bytes = t.assemble().unwrap();
        assert_eq!(bytes.len(), 70);
        assert_eq!(&bytes[..30], &[0u8; 30][..]);
        assert_eq!(&bytes[30..60], &[1u8; 30][..]);
        assert_eq!(&bytes[60..], &[2u8; 10][..]);
    }

    #[test]
    fn receiver_rejects_out_of_range_and_overflow() {
        let c = chunk("f", 0, 10, 15, 2);
        let mut t = IncomingTransfer::from_chunk(&c, 0);
        assert!(matches!(
            t.store(2, Bytes::from_static(b"x"), 0),
            Err(TransferError::ChunkOutOfRange { index: 2, .. })
        ));
        t.store(0, c.chunk.clone(), 0).unwrap();
        assert!(matches!(
            t.store(1, Bytes::from(vec![0u8; 10]), 0),
            Err(TransferError::Overflow(_))
        ));
        assert_eq!(t.received_bytes(), 10);
    }

    #[test]
    fn table_caps_unfinished_transfers() {
        let mut table = Transfers::new(1, 1000);
        table.insert_outgoing(outgoing(10, 5)).unwrap();
        let second = chunk("other", 0, 5, 10, 2);
        assert!(matches!(
            table.incoming_for(&second, 0),
            Err(TransferError::TooManyTransfers { limit: 1 })
        ));
    }

    #[test]
    fn bad_first_chunk_opens_no_transfer() {
        let mut table = Transfers::new(2, 1000);
        assert!(matches!(
            table.incoming_for(&chunk("big", 0, 10, 5, 1), 0),
            Err(TransferError::Overflow(_))
        ));
        assert!(matches!(
            table.incoming_for(&chunk("far", 3, 5, 10, 2), 0),
            Err(TransferError::ChunkOutOfRange { index: 3, total: 2, .. })
        ));
        assert!(matches!(
            table.incoming_for(&chunk("nil", 0, 0, 0, 0), 0),
            Err(TransferError::Empty)
        ));
        assert!(table.is_empty());
        assert_eq!(table.active_count(), 0);

        let good = chunk("ok", 0, 5, 10, 2);
        let (t, created) = table.incoming_for(&good, 0).unwrap();
        assert!(created);
        assert_eq!(t.store(0, good.chunk.clone(), 0).unwrap(), StoreOutcome::Stored);
    }

    #[test]
    fn finished_transfers_evicted_after_grace() {
        let schedule = RetrySchedule::new(vec![1000]);
        let mut table = Transfers::new(4, 1000);
        table.insert_outgoing(outgoing(10, 10)).unwrap();
        let t = table.outgoing_mut("me-1").unwrap();
        t.mark_sent(0, 0, &schedule);
        assert_eq!(t.on_ack(0, 10, 100), AckOutcome::Done);
        assert!(table.evict_finished(1099).is_empty());
        assert_eq!(table.evict_finished(1100), vec!["me-1".to_string()]);
        assert!(table.is_empty());
    }

    #[test]
    fn unfinished_transfers_are_never_evicted() {
        let mut table = Transfers::new(4, 0);
        table.insert_outgoing(outgoing(10, 5)).unwrap();
        assert!(table.evict_finished(u64::MAX).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn progress_throttled_except_final() {
        let schedule = RetrySchedule::new(vec![1000]);
        let blob = Bytes::from(vec![0u8; 40]);
        let mut t = OutgoingTransfer::new("f".into(), "f".into(), "me".into(), 0, blob, 10, 100)
            .unwrap();
        t.mark_sent(0, 0, &schedule);
        t.on_ack(0, 10, 0);
        assert_eq!(t.offer_progress(0).map(|p| p.percent), Some(25));
        t.on_ack(1, 20, 10);
        assert!(t.offer_progress(10).is_none());
        t.on_ack(2, 30, 20);
        t.on_ack(3, 40, 30);
        let last = t.offer_progress(30).unwrap();
        assert_eq!(last.percent, 100);
    }

    #[test]
    fn format_size_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }
}
