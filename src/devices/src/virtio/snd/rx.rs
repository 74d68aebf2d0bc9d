use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::defs::{DEFAULT_PERIOD_BYTES, MAX_PCM_XFER_BYTES, MAX_SG_SEGMENTS, RX_POOL_SIZE};
use super::pool::{check_segments, FreeList, SgSegment, TransferCounters, TransferStats};
use super::virtio_sound::{
    VIRTIO_SND_PCM_STATUS_SIZE, VIRTIO_SND_PCM_XFER_SIZE, VIRTIO_SND_S_BAD_MSG, VIRTIO_SND_S_UNSET,
};
use super::wire;
use super::{lock, Error, Result};
use crate::virtio::dma::{CachePolicy, DmaAllocator, DmaBuffer};
use crate::virtio::queue::{Descriptor, DeviceQueue};

pub type RxStats = TransferStats;

const STATUS_OFFSET: usize = VIRTIO_SND_PCM_XFER_SIZE;

#[derive(Clone, Debug)]
pub struct RxConfig {
    pub pool_size: usize,
    pub max_period_bytes: usize,
    /// Frame size used until the stream's parameters are set.
    pub frame_bytes: usize,
    pub stream_id: u32,
}

impl Default for RxConfig {
    fn default() -> Self {
        RxConfig {
            pool_size: RX_POOL_SIZE,
            max_period_bytes: DEFAULT_PERIOD_BYTES,
            frame_bytes: 2,
            stream_id: 1,
        }
    }
}

/// A finished capture transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RxCompletion {
    /// Cookie given to `submit_sg`.
    pub cookie: u64,
    pub status: u32,
    /// Bytes the device wrote, never more than were requested.
    pub payload_bytes: usize,
    pub latency_bytes: u32,
}

#[derive(Copy, Clone)]
struct Inflight {
    cookie: u64,
    requested: usize,
}

struct RxPool {
    free: FreeList,
    inflight: Vec<Option<Inflight>>,
}

/// Capture engine. Pool requests only carry the header and the status, the
/// device writes audio straight into the caller's segments.
pub struct RxEngine {
    config: RxConfig,
    queue: Arc<dyn DeviceQueue>,
    allocator: Arc<dyn DmaAllocator>,
    slots: Vec<DmaBuffer>,
    pool: Mutex<RxPool>,
    frame_bytes: AtomicUsize,
    fatal: AtomicBool,
    counters: TransferCounters,
}

impl RxEngine {
    pub fn new(
        queue: Arc<dyn DeviceQueue>,
        allocator: Arc<dyn DmaAllocator>,
        config: RxConfig,
    ) -> Result<Self> {
        if config.pool_size == 0 || config.frame_bytes == 0 || config.max_period_bytes == 0 {
            return Err(Error::InvalidParameter("empty RX pool configuration"));
        }
        if config.max_period_bytes > MAX_PCM_XFER_BYTES {
            return Err(Error::InvalidParameter("bad RX period size"));
        }

        let header = wire::encode_xfer_header(config.stream_id);
        let mut slots = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            let buffer = match allocator.alloc(
                VIRTIO_SND_PCM_XFER_SIZE + VIRTIO_SND_PCM_STATUS_SIZE,
                CachePolicy::Cached,
            ) {
                Ok(buffer) => buffer,
                Err(e) => {
                    error!("snd: failed to allocate RX pool: {}", e);
                    for buffer in slots.drain(..) {
                        allocator.free(buffer);
                    }
                    return Err(e.into());
                }
            };
            if let Err(e) = buffer.write_at(0, &header) {
                allocator.free(buffer);
                for buffer in slots.drain(..) {
                    allocator.free(buffer);
                }
                return Err(e.into());
            }
            slots.push(buffer);
        }

        Ok(RxEngine {
            pool: Mutex::new(RxPool {
                free: FreeList::new(config.pool_size),
                inflight: vec![None; config.pool_size],
            }),
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
        lock(&self.pool).free.free_count()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RxStats {
        self.counters.snapshot()
    }

    fn put_slot(&self, slot: usize) -> Option<Inflight> {
        let mut pool = lock(&self.pool);
        let inflight = pool.inflight.get_mut(slot).and_then(Option::take);
        if !pool.free.push(slot) {
            warn!("snd: RX slot {} returned twice", slot);
        }
        inflight
    }

    /// Posts `destination` for the device to fill. `cookie` comes back in the
    /// matching [`RxCompletion`].
    pub fn submit_sg(&self, destination: &[SgSegment], cookie: u64) -> Result<()> {
        if self.is_fatal() {
            return Err(Error::Fatal);
        }
        let requested = check_segments(
            destination,
            self.frame_bytes(),
            self.config.max_period_bytes,
        )?;

        let slot = {
            let mut pool = lock(&self.pool);
            let Some(slot) = pool.free.pop() else {
                drop(pool);
                self.counters.no_buffer();
                return Err(Error::NoFreeBuffer);
            };
            pool.inflight[slot] = Some(Inflight { cookie, requested });
            slot
        };

        let buffer = &self.slots[slot];
        let preset = buffer
            .write_le32(STATUS_OFFSET, VIRTIO_SND_S_UNSET)
            .and_then(|()| buffer.write_le32(STATUS_OFFSET + 4, 0));
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
            destination
                .iter()
                .map(|segment| Descriptor::writable(segment.addr, segment.len)),
        );
        chain.push(Descriptor::writable(
            buffer.device_address_at(STATUS_OFFSET),
            VIRTIO_SND_PCM_STATUS_SIZE as u32,
        ));

        if let Err(e) = self.queue.submit(&chain, slot as u64) {
            self.put_slot(slot);
            return Err(e.into());
        }
        self.counters.submitted();
        self.queue.kick();
        Ok(())
    }

    /// Reclaims every completed capture request and reports it to
    /// `on_complete`. Safe from either context.
    pub fn drain<F>(&self, mut on_complete: F) -> usize
    where
        F: FnMut(RxCompletion),
    {
        let mut count = 0;
        while let Some((cookie, used_len)) = self.queue.pop_completed() {
            let Some(slot) = usize::try_from(cookie)
                .ok()
                .filter(|slot| *slot < self.slots.len())
            else {
                warn!("snd: RX completion with bad cookie {:#x}", cookie);
                self.counters.bad_cookie();
                continue;
            };

            let (status, latency_bytes, written) = match (used_len as usize)
                .checked_sub(VIRTIO_SND_PCM_STATUS_SIZE)
            {
                Some(written) => {
                    let buffer = &self.slots[slot];
                    let status = buffer
                        .read_le32(STATUS_OFFSET)
                        .unwrap_or(VIRTIO_SND_S_BAD_MSG);
                    let latency = buffer.read_le32(STATUS_OFFSET + 4).unwrap_or(0);
                    (status, latency, written)
                }
                None => {
                    warn!("snd: RX completion with used length {}", used_len);
                    self.counters.malformed();
                    (VIRTIO_SND_S_BAD_MSG, 0, 0)
                }
            };

            let Some(inflight) = self.put_slot(slot) else {
                warn!("snd: RX completion for idle slot {}", slot);
                self.counters.bad_cookie();
                continue;
            };
            count += 1;

            if self.counters.completed(status) && !self.fatal.swap(true, Ordering::AcqRel) {
                error!("snd: RX stream latched fatal on status {:#x}", status);
            }
            let payload_bytes = written.min(inflight.requested);
            self.counters.bytes(payload_bytes);
            on_complete(RxCompletion {
                cookie: inflight.cookie,
                status,
                payload_bytes,
                latency_bytes,
            });
        }
        count
    }
}

impl Drop for RxEngine {
    fn drop(&mut self) {
        for buffer in self.slots.drain(..) {
            self.allocator.free(buffer);
        }
    }
}
