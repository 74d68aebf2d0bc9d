use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::defs::{EVENT_BUFFERS, EVENT_BUFFER_SIZE, EVENT_JACKS};
use super::jack::JackTable;
use super::notify::{SignalHook, SndListener};
use super::virtio_sound::{
    VIRTIO_SND_EVENT_SIZE, VIRTIO_SND_EVT_JACK_CONNECTED, VIRTIO_SND_EVT_JACK_DISCONNECTED,
    VIRTIO_SND_EVT_PCM_PERIOD_ELAPSED, VIRTIO_SND_EVT_PCM_XRUN,
};
use super::wire;
use super::{Error, Result};
use crate::virtio::dma::{CachePolicy, DmaAllocator, DmaBuffer};
use crate::virtio::queue::{Descriptor, DeviceQueue};

#[derive(Clone, Debug)]
pub struct EventConfig {
    /// Number of posted buffers, at most 64.
    pub buffers: usize,
    pub buffer_size: usize,
    pub jacks: usize,
    /// Tell the listener about jack events that did not change anything.
    pub notify_unchanged_jacks: bool,
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig {
            buffers: EVENT_BUFFERS,
            buffer_size: EVENT_BUFFER_SIZE,
            jacks: EVENT_JACKS,
            notify_unchanged_jacks: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EventStats {
    pub received: u64,
    pub jack_connected: u64,
    pub jack_disconnected: u64,
    /// Indexed by stream id.
    pub period_elapsed: [u64; 2],
    pub xrun: [u64; 2],
    pub short: u64,
    pub unknown: u64,
    pub bad_cookie: u64,
    pub repost_failures: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    jack_connected: AtomicU64,
    jack_disconnected: AtomicU64,
    period_elapsed: [AtomicU64; 2],
    xrun: [AtomicU64; 2],
    short: AtomicU64,
    unknown: AtomicU64,
    bad_cookie: AtomicU64,
    repost_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn bump_stream(counters: &[AtomicU64; 2], stream_id: u32) {
    if let Some(counter) = counters.get(stream_id as usize) {
        bump(counter);
    }
}

/// Keeps the event queue stocked with writable buffers and dispatches the
/// notifications the device puts in them.
///
/// Nothing else in the driver depends on this path: dropping events only
/// loses jack and period notifications.
pub struct EventDrain {
    config: EventConfig,
    queue: Arc<dyn DeviceQueue>,
    allocator: Arc<dyn DmaAllocator>,
    buffer: Option<DmaBuffer>,
    jacks: Arc<JackTable>,
    listener: RwLock<Option<Arc<dyn SndListener>>>,
    signal_hook: RwLock<Option<SignalHook>>,
    counters: Counters,
}

impl EventDrain {
    pub fn new(
        queue: Arc<dyn DeviceQueue>,
        allocator: Arc<dyn DmaAllocator>,
        config: EventConfig,
    ) -> Result<Self> {
        if config.buffers == 0 || config.buffers > u64::BITS as usize {
            return Err(Error::InvalidParameter("event buffer count"));
        }
        if config.buffer_size < VIRTIO_SND_EVENT_SIZE {
            return Err(Error::InvalidParameter("event buffer size"));
        }
        let mut buffer = allocator.alloc(config.buffers * config.buffer_size, CachePolicy::Cached)?;
        buffer.set_writable_by_device(true);
        let jacks = Arc::new(JackTable::new(config.jacks));

        Ok(EventDrain {
            config,
            queue,
            allocator,
            buffer: Some(buffer),
            jacks,
            listener: RwLock::new(None),
            signal_hook: RwLock::new(None),
            counters: Counters::default(),
        })
    }

    pub(crate) fn queue(&self) -> &Arc<dyn DeviceQueue> {
        &self.queue
    }

    pub fn jacks(&self) -> &Arc<JackTable> {
        &self.jacks
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn SndListener>>) {
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    pub fn set_signal_hook(&self, hook: Option<SignalHook>) {
        *self.signal_hook.write().unwrap_or_else(|e| e.into_inner()) = hook;
    }

    fn buffer(&self) -> Result<&DmaBuffer> {
        self.buffer
            .as_ref()
            .ok_or(Error::InvalidParameter("event pool released"))
    }

    /// Maps a completion cookie back to its slot. The cookie must be the
    /// exact start address of one of the buffers.
    fn slot_for(&self, cookie: u64) -> Option<usize> {
        let base = self.buffer.as_ref()?.device_address();
        let stride = self.config.buffer_size as u64;
        let offset = cookie.checked_sub(base)?;
        if offset % stride != 0 {
            return None;
        }
        let slot = offset / stride;
        (slot < self.config.buffers as u64).then_some(slot as usize)
    }

    fn post(&self, slot: usize) -> Result<()> {
        let buffer = self.buffer()?;
        let offset = slot * self.config.buffer_size;
        buffer.fill_zero(offset, VIRTIO_SND_EVENT_SIZE)?;
        let addr = buffer.device_address_at(offset);
        let chain = [Descriptor::writable(addr, self.config.buffer_size as u32)];
        self.queue.submit(&chain, addr).map_err(|e| {
            bump(&self.counters.repost_failures);
            Error::from(e)
        })
    }

    /// Posts every buffer. Called once at bring-up.
    pub fn post_all(&self) -> Result<()> {
        for slot in 0..self.config.buffers {
            self.post(slot)?;
        }
        self.queue.kick();
        Ok(())
    }

    /// Reposts the buffers whose bits are set in `mask`.
    pub fn repost_mask(&self, mask: u64) {
        let mut posted = false;
        for slot in (0..self.config.buffers).filter(|slot| mask & (1 << slot) != 0) {
            match self.post(slot) {
                Ok(()) => posted = true,
                Err(e) => warn!("snd: failed to repost event buffer {}: {}", slot, e),
            }
        }
        if posted {
            self.queue.kick();
        }
    }

    fn dispatch(&self, event: wire::Event) {
        let listener = self
            .listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match event.kind {
            VIRTIO_SND_EVT_JACK_CONNECTED | VIRTIO_SND_EVT_JACK_DISCONNECTED => {
                let connected = event.kind == VIRTIO_SND_EVT_JACK_CONNECTED;
                bump(if connected {
                    &self.counters.jack_connected
                } else {
                    &self.counters.jack_disconnected
                });
                let Some(changed) = self.jacks.set_connected(event.data, connected) else {
                    debug!("snd: event for unknown jack {}", event.data);
                    bump(&self.counters.unknown);
                    return;
                };
                if changed || self.config.notify_unchanged_jacks {
                    if let Some(listener) = listener {
                        listener.jack_changed(event.data, connected, changed);
                    }
                }
            }
            VIRTIO_SND_EVT_PCM_PERIOD_ELAPSED | VIRTIO_SND_EVT_PCM_XRUN => {
                let xrun = event.kind == VIRTIO_SND_EVT_PCM_XRUN;
                if xrun {
                    bump_stream(&self.counters.xrun, event.data);
                } else {
                    bump_stream(&self.counters.period_elapsed, event.data);
                }
                match listener {
                    Some(listener) if xrun => listener.xrun(event.data),
                    Some(listener) => listener.period_elapsed(event.data),
                    None => {
                        let hook = self.signal_hook.read().unwrap_or_else(|e| e.into_inner());
                        if let Some(hook) = hook.as_ref() {
                            hook(event.data);
                        }
                    }
                }
            }
            other => {
                trace!("snd: ignoring event {:#x}", other);
                bump(&self.counters.unknown);
            }
        }
    }

    fn handle(&self, cookie: u64, used_len: u32, repost: Option<&mut u64>) -> bool {
        let Some(slot) = self.slot_for(cookie) else {
            warn!("snd: event completion with bad cookie {:#x}", cookie);
            bump(&self.counters.bad_cookie);
            return false;
        };
        bump(&self.counters.received);

        if (used_len as usize) < VIRTIO_SND_EVENT_SIZE {
            bump(&self.counters.short);
        } else {
            let mut raw = [0u8; VIRTIO_SND_EVENT_SIZE];
            let offset = slot * self.config.buffer_size;
            match self.buffer().and_then(|b| b.read_at(offset, &mut raw).map_err(Error::from)) {
                Ok(()) => {
                    if let Some(event) = wire::decode_event(&raw) {
                        self.dispatch(event);
                    }
                }
                Err(e) => warn!("snd: failed to read event buffer {}: {}", slot, e),
            }
        }

        match repost {
            Some(mask) => *mask |= 1 << slot,
            None => {
                if let Err(e) = self.post(slot) {
                    warn!("snd: failed to repost event buffer {}: {}", slot, e);
                }
            }
        }
        true
    }

    /// Handles one completion. With `repost` the buffer is only marked in the
    /// mask, otherwise it is posted again right away. Returns false for a
    /// cookie that does not name one of the buffers.
    pub fn process_completion(&self, cookie: u64, used_len: u32, repost: Option<&mut u64>) -> bool {
        let immediate = repost.is_none();
        let handled = self.handle(cookie, used_len, repost);
        if handled && immediate {
            self.queue.kick();
        }
        handled
    }

    /// Handles every pending completion. With `batch` all buffers are
    /// reposted together once the queue is empty.
    pub fn drain(&self, batch: bool) -> usize {
        let mut mask = 0u64;
        let mut count = 0;
        let mut reposted = false;
        while let Some((cookie, used_len)) = self.queue.pop_completed() {
            count += 1;
            let repost = if batch { Some(&mut mask) } else { None };
            reposted |= self.handle(cookie, used_len, repost) && !batch;
        }
        if batch && mask != 0 {
            self.repost_mask(mask);
        } else if reposted {
            self.queue.kick();
        }
        count
    }

    pub fn stats(&self) -> EventStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        EventStats {
            received: load(&c.received),
            jack_connected: load(&c.jack_connected),
            jack_disconnected: load(&c.jack_disconnected),
            period_elapsed: [load(&c.period_elapsed[0]), load(&c.period_elapsed[1])],
            xrun: [load(&c.xrun[0]), load(&c.xrun[1])],
            short: load(&c.short),
            unknown: load(&c.unknown),
            bad_cookie: load(&c.bad_cookie),
            repost_failures: load(&c.repost_failures),
        }
    }
}

impl Drop for EventDrain {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.allocator.free(buffer);
        }
    }
}
