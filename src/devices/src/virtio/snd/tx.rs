use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::defs::{DEFAULT_PERIOD_BYTES, MAX_PCM_XFER_BYTES, MAX_SG_SEGMENTS, TX_POOL_SIZE};
use super::pool::{check_payload, check_segments, FreeList, SgSegment, TransferCounters, TransferStats};
use super::virtio_sound::{
    VIRTIO_SND_PCM_STATUS_SIZE, VIRTIO_SND_PCM_XFER_SIZE, VIRTIO_SND_S_BAD_MSG, VIRTIO_SND_S_UNSET,
};
use super::wire;
use super::{lock, Error, Result};
use crate::virtio::dma::{CachePolicy, DmaAllocator, DmaBuffer};
use crate::virtio::queue::{Descriptor, DeviceQueue};

pub type TxStats = TransferStats;

#[derive(Clone, Debug)]
pub struct TxConfig {
    pub pool_size: usize,
    /// Largest period a single pool buffer carries.
    pub max_period_bytes: usize,
    /// Frame size used until the stream's parameters are set.
    pub frame_bytes: usize,
    pub stream_id: u32,
}

impl Default for TxConfig {
    fn default() -> Self {
        TxConfig {
            pool_size: TX_POOL_SIZE,
            max_period_bytes: DEFAULT_PERIOD_BYTES,
            frame_bytes: 4,
            stream_id: 0,
        }
    }
}

/// First part of a period: PCM to copy, or a run of silence.
#[derive(Copy, Clone, Debug)]
pub enum Segment<'a> {
    Pcm(&'a [u8]),
    Silence(usize),
}

impl Segment<'_> {
    pub fn len(&self) -> usize {
        match self {
            Segment::Pcm(data) => data.len(),
            Segment::Silence(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Playback engine: a pool of `[header][payload][status]` buffers cycled
/// through the TX queue.
pub struct TxEngine {
    config: TxConfig,
    queue: Arc<dyn DeviceQueue>,
    allocator: Arc<dyn DmaAllocator>,
    slots: Vec<DmaBuffer>,
    free: Mutex<FreeList>,
    frame_bytes: AtomicUsize,
    fatal: AtomicBool,
    counters: TransferCounters,
}

impl TxEngine {
    pub fn new(
        queue: Arc<dyn DeviceQueue>,
        allocator: Arc<dyn DmaAllocator>,
        config: TxConfig,
    ) -> Result<Self> {
        if config.pool_size == 0 || config.frame_bytes == 0 || config.max_period_bytes == 0 {
            return Err(Error::InvalidParameter("empty TX pool configuration"));
        }
        if config.max_period_bytes % config.frame_bytes != 0
            || config.max_period_bytes > MAX_PCM_XFER_BYTES
        {
            return Err(Error::InvalidParameter("bad TX period size"));
        }

        let size = VIRTIO_SND_PCM_XFER_SIZE + config.max_period_bytes + VIRTIO_SND_PCM_STATUS_SIZE;
        let header = wire::encode_xfer_header(config.stream_id);
        let mut slots = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            let slot = allocator
                .alloc(size, CachePolicy::Cached)
                .map_err(Error::from)
                .and_then(|buffer| match buffer.write_at(0, &header) {
                    Ok(()) => Ok(buffer),
                    Err(e) => {
                        allocator.free(buffer);
                        Err(e.into())
                    }
                });
            match slot {
                Ok(buffer) => slots.push(buffer),
                Err(e) => {
                    error!("snd: failed to allocate TX pool: {}", e);
                    for buffer in slots.drain(..) {
                        allocator.free(buffer);
                    }
                    return Err(e);
                }
            }
        }

        Ok(TxEngine {
            free: Mutex::new(FreeList::new(config.pool_size)),
            frame_bytes: AtomicUsize::new(config.frame_bytes),
            config,
            queue,
            allocator,
            slots,
            fatal: AtomicBool::new(false),
            counters: TransferCounters::default(),
        })
    }

    pub(crate) fn queue(&self) -> &Arc<dyn DeviceQueue> {
        &self.queue
    }

    pub fn max_period_bytes(&self) -> usize {
        self.config.max_period_bytes
    }

    /// Alignment every transfer must keep.
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes.load(Ordering::Acquire)
    }

    /// Follows the frame size of the format the device accepted.
    pub fn set_frame_bytes(&self, frame_bytes: usize) -> Result<()> {
        if frame_bytes == 0 {
            return Err(Error::InvalidParameter("zero frame size"));
        }
        self.frame_bytes.store(frame_bytes, Ordering::Release);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        lock(&self.free).free_count()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TxStats {
        self.counters.snapshot()
    }

    fn status_offset(&self) -> usize {
        VIRTIO_SND_PCM_XFER_SIZE + self.config.max_period_bytes
    }

    fn check_fatal(&self) -> Result<()> {
        if self.is_fatal() {
            return Err(Error::Fatal);
        }
        Ok(())
    }

    fn take_slot(&self) -> Result<usize> {
        lock(&self.free).pop().ok_or_else(|| {
            self.counters.no_buffer();
            Error::NoFreeBuffer
        })
    }

    fn put_slot(&self, slot: usize) {
        if !lock(&self.free).push(slot) {
            warn!("snd: TX slot {} returned twice", slot);
        }
    }

    /// Submits `chain` for `slot`, handing the slot back if the queue refuses it.
    fn submit_slot(&self, slot: usize, chain: &[Descriptor], payload: usize) -> Result<()> {
        if let Err(e) = self.queue.submit(chain, slot as u64) {
            self.put_slot(slot);
            return Err(e.into());
        }
        self.counters.submitted();
        self.counters.bytes(payload);
        self.queue.kick();
        Ok(())
    }

    fn fill_period(&self, buffer: &DmaBuffer, first: Segment<'_>, second: Option<&[u8]>) -> Result<()> {
        let mut offset = VIRTIO_SND_PCM_XFER_SIZE;
        match first {
            Segment::Pcm(data) => buffer.write_at(offset, data)?,
            Segment::Silence(len) => buffer.fill_zero(offset, len)?,
        }
        offset += first.len();
        if let Some(data) = second {
            buffer.write_at(offset, data)?;
        }
        buffer.write_le32(self.status_offset(), VIRTIO_SND_S_UNSET)?;
        buffer.write_le32(self.status_offset() + 4, 0)?;
        Ok(())
    }

    /// Queues one period assembled from up to two segments, as when a period
    /// wraps around the end of a cyclic buffer. `Segment::Silence` is only
    /// accepted with `allow_silence_fill`.
    pub fn submit_period(
        &self,
        first: Segment<'_>,
        second: Option<&[u8]>,
        allow_silence_fill: bool,
    ) -> Result<()> {
        self.check_fatal()?;
        if matches!(first, Segment::Silence(_)) && !allow_silence_fill {
            return Err(Error::InvalidParameter("silence fill not allowed"));
        }
        let total = first.len() + second.map_or(0, <[u8]>::len);
        check_payload(total, self.frame_bytes(), self.config.max_period_bytes)?;

        let slot = self.take_slot()?;
        let buffer = &self.slots[slot];
        if let Err(e) = self.fill_period(buffer, first, second) {
            self.put_slot(slot);
            return Err(e);
        }

        let chain = [
            Descriptor::readable(
                buffer.device_address(),
                (VIRTIO_SND_PCM_XFER_SIZE + total) as u32,
            ),
            Descriptor::writable(
                buffer.device_address_at(self.status_offset()),
                VIRTIO_SND_PCM_STATUS_SIZE as u32,
            ),
        ];
        self.submit_slot(slot, &chain, total)
    }

    /// Queues one period that lives in caller-owned device memory.
    pub fn submit_sg(&self, segments: &[SgSegment]) -> Result<()> {
        self.check_fatal()?;
        let total = check_segments(segments, self.frame_bytes(), self.config.max_period_bytes)?;

        let slot = self.take_slot()?;
        let buffer = &self.slots[slot];
        let preset = buffer
            .write_le32(self.status_offset(), VIRTIO_SND_S_UNSET)
            .and_then(|()| buffer.write_le32(self.status_offset() + 4, 0));
        if let Err(e) = preset {
            self.put_slot(slot);
            return Err(e.into());
        }

        let mut chain = Vec::with_capacity(MAX_SG_SEGMENTS + 2);
        chain.push(Descriptor::readable(
            buffer.device_address(),
            VIRTIO_SND_PCM_XFER_SIZE as u32,
        ));
        chain.extend(
            segments
                .iter()
                .map(|segment| Descriptor::readable(segment.addr, segment.len)),
        );
        chain.push(Descriptor::writable(
            buffer.device_address_at(self.status_offset()),
            VIRTIO_SND_PCM_STATUS_SIZE as u32,
        ));
        self.submit_slot(slot, &chain, total)
    }

    fn latch_fatal(&self, status: u32) {
        if !self.fatal.swap(true, Ordering::AcqRel) {
            error!("snd: TX stream latched fatal on status {:#x}", status);
        }
    }

    /// Reclaims every completed period. Safe from either context.
    pub fn drain(&self) -> usize {
        let mut count = 0;
        while let Some((cookie, used_len)) = self.queue.pop_completed() {
            let Some(slot) = usize::try_from(cookie)
                .ok()
                .filter(|slot| *slot < self.slots.len())
            else {
                warn!("snd: TX completion with bad cookie {:#x}", cookie);
                self.counters.bad_cookie();
                continue;
            };
            if lock(&self.free).is_free(slot) {
                warn!("snd: TX completion for idle slot {}", slot);
                self.counters.bad_cookie();
                continue;
            }
            count += 1;

            // Only a lower bound is enforced on the used length.
            let status = if (used_len as usize) < VIRTIO_SND_PCM_STATUS_SIZE {
                warn!("snd: TX completion with used length {}", used_len);
                self.counters.malformed();
                VIRTIO_SND_S_BAD_MSG
            } else {
                self.slots[slot]
                    .read_le32(self.status_offset())
                    .unwrap_or(VIRTIO_SND_S_BAD_MSG)
            };
            if self.counters.completed(status) {
                self.latch_fatal(status);
            } else if status != 0 {
                debug!("snd: TX period completed with status {:#x}", status);
            }
            self.put_slot(slot);
        }
        count
    }
}

impl Drop for TxEngine {
    fn drop(&mut self) {
        for buffer in self.slots.drain(..) {
            self.allocator.free(buffer);
        }
    }
}
