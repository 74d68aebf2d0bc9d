use std::sync::atomic::{AtomicU64, Ordering};

use super::defs::{MAX_PCM_XFER_BYTES, MAX_SG_SEGMENTS};
use super::virtio_sound::{
    VIRTIO_SND_S_BAD_MSG, VIRTIO_SND_S_IO_ERR, VIRTIO_SND_S_NOT_SUPP, VIRTIO_SND_S_OK,
};
use super::{Error, Result};

/// Singly-linked free list over the slot indices of a buffer pool.
///
/// A slot is either on the list or owned by exactly one in-flight chain.
pub(crate) struct FreeList {
    next: Vec<Option<usize>>,
    on_list: Vec<bool>,
    head: Option<usize>,
    free: usize,
}

impl FreeList {
    pub fn new(capacity: usize) -> Self {
        let next = (0..capacity)
            .map(|slot| (slot + 1 < capacity).then_some(slot + 1))
            .collect();
        FreeList {
            next,
            on_list: vec![true; capacity],
            head: (capacity > 0).then_some(0),
            free: capacity,
        }
    }

    pub fn pop(&mut self) -> Option<usize> {
        let slot = self.head?;
        self.head = self.next[slot].take();
        self.on_list[slot] = false;
        self.free -= 1;
        Some(slot)
    }

    /// Returns `slot` to the list. Refuses out of range slots and slots that
    /// are already free, so a duplicated completion cannot corrupt the list.
    pub fn push(&mut self, slot: usize) -> bool {
        match self.on_list.get(slot) {
            Some(false) => {}
            _ => return false,
        }
        self.next[slot] = self.head;
        self.head = Some(slot);
        self.on_list[slot] = true;
        self.free += 1;
        true
    }

    pub fn is_free(&self, slot: usize) -> bool {
        self.on_list.get(slot).copied().unwrap_or(false)
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    pub fn capacity(&self) -> usize {
        self.on_list.len()
    }
}

/// One caller-owned region of a scatter/gather transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SgSegment {
    pub addr: u64,
    pub len: u32,
}

/// Checks a payload size against the per-transfer limits and returns it.
pub(crate) fn check_payload(total: usize, frame_bytes: usize, max_period: usize) -> Result<usize> {
    if total == 0 {
        return Err(Error::InvalidParameter("empty transfer"));
    }
    if total % frame_bytes != 0 {
        return Err(Error::InvalidParameter("transfer not frame aligned"));
    }
    if total > max_period || total > MAX_PCM_XFER_BYTES {
        return Err(Error::InvalidParameter("transfer too large"));
    }
    Ok(total)
}

/// Validates a scatter/gather list and returns its total payload.
pub(crate) fn check_segments(
    segments: &[SgSegment],
    frame_bytes: usize,
    max_period: usize,
) -> Result<usize> {
    if segments.is_empty() || segments.len() > MAX_SG_SEGMENTS {
        return Err(Error::InvalidParameter("bad segment count"));
    }
    if segments.iter().any(|s| s.len == 0) {
        return Err(Error::InvalidParameter("empty segment"));
    }
    let total = segments
        .iter()
        .try_fold(0usize, |acc, s| acc.checked_add(s.len as usize))
        .ok_or(Error::InvalidParameter("transfer too large"))?;
    check_payload(total, frame_bytes, max_period)
}

/// Per-engine counters shared by the TX and RX engines.
#[derive(Default)]
pub(crate) struct TransferCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    bytes: AtomicU64,
    ok: AtomicU64,
    io_err: AtomicU64,
    bad_msg: AtomicU64,
    not_supp: AtomicU64,
    unknown_status: AtomicU64,
    malformed: AtomicU64,
    no_buffer: AtomicU64,
    bad_cookie: AtomicU64,
}

/// Snapshot of an engine's counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TransferStats {
    pub submitted: u64,
    pub completed: u64,
    /// Payload bytes submitted (TX) or received (RX).
    pub bytes: u64,
    pub ok: u64,
    pub io_err: u64,
    pub bad_msg: u64,
    pub not_supp: u64,
    pub unknown_status: u64,
    pub malformed: u64,
    pub no_buffer: u64,
    pub bad_cookie: u64,
}

impl TransferCounters {
    pub fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes(&self, count: usize) {
        self.bytes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn no_buffer(&self) {
        self.no_buffer.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bad_cookie(&self) {
        self.bad_cookie.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one completion. Returns true when `status` must latch the
    /// engine fatal.
    pub fn completed(&self, status: u32) -> bool {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            VIRTIO_SND_S_OK => &self.ok,
            VIRTIO_SND_S_IO_ERR => &self.io_err,
            VIRTIO_SND_S_BAD_MSG => &self.bad_msg,
            VIRTIO_SND_S_NOT_SUPP => &self.not_supp,
            _ => &self.unknown_status,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        matches!(status, VIRTIO_SND_S_BAD_MSG | VIRTIO_SND_S_NOT_SUPP)
    }

    pub fn snapshot(&self) -> TransferStats {
        TransferStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            ok: self.ok.load(Ordering::Relaxed),
            io_err: self.io_err.load(Ordering::Relaxed),
            bad_msg: self.bad_msg.load(Ordering::Relaxed),
            not_supp: self.not_supp.load(Ordering::Relaxed),
            unknown_status: self.unknown_status.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            no_buffer: self.no_buffer.load(Ordering::Relaxed),
            bad_cookie: self.bad_cookie.load(Ordering::Relaxed),
        }
    }
}
