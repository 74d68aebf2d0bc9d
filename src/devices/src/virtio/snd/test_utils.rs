//! In-memory stand-ins for the device queue and the DMA allocator.

use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::device::{Snd, SndConfig, SndQueues};
use super::event::EventConfig;
use super::rx::RxConfig;
use super::tx::TxConfig;
use super::virtio_sound::{VIRTIO_SND_HDR_SIZE, VIRTIO_SND_S_OK};
use crate::virtio::dma::{CachePolicy, DmaAllocator, DmaBuffer, DmaError};
use crate::virtio::queue::{Descriptor, DeviceQueue, QueueError};

struct Region {
    cpu: usize,
    size: usize,
}

/// Heap-backed DMA memory with a fake device address space.
pub(crate) struct FakeDma {
    regions: Mutex<HashMap<u64, Region>>,
    next_addr: AtomicU64,
    allocs: AtomicUsize,
    frees: AtomicUsize,
    fail: AtomicBool,
}

impl FakeDma {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeDma {
            regions: Mutex::new(HashMap::new()),
            next_addr: AtomicU64::new(0x1000_0000),
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.regions.lock().unwrap().len()
    }

    fn locate(&self, addr: u64, len: usize) -> Option<*mut u8> {
        let regions = self.regions.lock().unwrap();
        regions.iter().find_map(|(base, region)| {
            (addr >= *base && addr + len as u64 <= base + region.size as u64)
                .then(|| (region.cpu + (addr - base) as usize) as *mut u8)
        })
    }

    /// Reads memory the way the device would, `None` if it is not allocated.
    pub fn try_read(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let src = self.locate(addr, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: `locate` checked the range lies inside a live allocation.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len) };
        Some(out)
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        self.try_read(addr, len)
            .unwrap_or_else(|| panic!("device address {:#x}+{} not backed by DMA memory", addr, len))
    }

    /// Writes memory the way the device would.
    pub fn write(&self, addr: u64, data: &[u8]) {
        let dst = self
            .locate(addr, data.len())
            .unwrap_or_else(|| panic!("device address {:#x}+{} not backed by DMA memory", addr, data.len()));
        // SAFETY: `locate` checked the range lies inside a live allocation.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }
}

impl DmaAllocator for FakeDma {
    fn alloc(&self, size: usize, _cache: CachePolicy) -> Result<DmaBuffer, DmaError> {
        if size == 0 {
            return Err(DmaError::InvalidSize(size));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DmaError::OutOfMemory(size));
        }
        let memory: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        let cpu = Box::into_raw(memory) as *mut u8;
        let span = (size as u64 + 0xfff) & !0xfff;
        let device_address = self.next_addr.fetch_add(span, Ordering::SeqCst);
        self.regions.lock().unwrap().insert(
            device_address,
            Region {
                cpu: cpu as usize,
                size,
            },
        );
        self.allocs.fetch_add(1, Ordering::SeqCst);
        let cpu = NonNull::new(cpu).ok_or(DmaError::OutOfMemory(size))?;
        // SAFETY: The boxed slice stays alive until `free` reclaims it.
        Ok(unsafe { DmaBuffer::from_raw_parts(cpu, device_address, size, false) })
    }

    fn free(&self, buffer: DmaBuffer) {
        let region = self
            .regions
            .lock()
            .unwrap()
            .remove(&buffer.device_address())
            .expect("double free of DMA buffer");
        assert_eq!(region.size, buffer.size());
        // SAFETY: The pointer and size come from the boxed slice leaked in `alloc`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                region.cpu as *mut u8,
                region.size,
            )));
        }
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Submission {
    pub chain: Vec<Descriptor>,
    pub cookie: u64,
    /// Device-readable bytes as they were at submit time. Only filled for
    /// descriptors backed by the attached memory.
    pub readable: Vec<u8>,
}

/// Decides on kick whether a pending submission completes, and with which
/// used length.
pub(crate) type Responder = Box<dyn Fn(&Submission) -> Option<u32> + Send + Sync>;

/// Queue that records chains and completes them on demand.
pub(crate) struct FakeQueue {
    pending: Mutex<VecDeque<Submission>>,
    history: Mutex<Vec<Submission>>,
    completed: Mutex<VecDeque<(u64, u32)>>,
    responder: Mutex<Option<Responder>>,
    memory: Mutex<Option<Arc<FakeDma>>>,
    fail_submit: Mutex<Option<QueueError>>,
    kicks: AtomicUsize,
    interrupts_enabled: AtomicBool,
}

impl FakeQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeQueue {
            pending: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            completed: Mutex::new(VecDeque::new()),
            responder: Mutex::new(None),
            memory: Mutex::new(None),
            fail_submit: Mutex::new(None),
            kicks: AtomicUsize::new(0),
            interrupts_enabled: AtomicBool::new(true),
        })
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock().unwrap() = Some(responder);
    }

    /// Snapshots readable descriptors out of `dma` on every submit.
    pub fn attach_memory(&self, dma: Arc<FakeDma>) {
        *self.memory.lock().unwrap() = Some(dma);
    }

    pub fn set_fail_submit(&self, error: Option<QueueError>) {
        *self.fail_submit.lock().unwrap() = error;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.history.lock().unwrap().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    pub fn pending(&self) -> Vec<Submission> {
        self.pending.lock().unwrap().iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    pub fn kicks(&self) -> usize {
        self.kicks.load(Ordering::SeqCst)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst)
    }

    /// Completes the oldest pending submission.
    pub fn complete_next(&self, used_len: u32) -> Option<Submission> {
        let submission = self.pending.lock().unwrap().pop_front()?;
        self.completed
            .lock()
            .unwrap()
            .push_back((submission.cookie, used_len));
        Some(submission)
    }

    /// Completes the pending submission carrying `cookie`.
    pub fn complete(&self, cookie: u64, used_len: u32) -> Option<Submission> {
        let mut pending = self.pending.lock().unwrap();
        let index = pending.iter().position(|s| s.cookie == cookie)?;
        let submission = pending.remove(index)?;
        self.completed.lock().unwrap().push_back((cookie, used_len));
        Some(submission)
    }

    /// Injects a raw completion, valid or not.
    pub fn push_completion(&self, cookie: u64, used_len: u32) {
        self.completed.lock().unwrap().push_back((cookie, used_len));
    }
}

impl DeviceQueue for FakeQueue {
    fn submit(&self, chain: &[Descriptor], cookie: u64) -> Result<(), QueueError> {
        if let Some(error) = *self.fail_submit.lock().unwrap() {
            return Err(error);
        }
        let readable = match self.memory.lock().unwrap().as_ref() {
            Some(dma) => chain
                .iter()
                .filter(|desc| !desc.device_writable)
                .filter_map(|desc| dma.try_read(desc.addr, desc.len as usize))
                .flatten()
                .collect(),
            None => Vec::new(),
        };
        let submission = Submission {
            chain: chain.to_vec(),
            cookie,
            readable,
        };
        self.history.lock().unwrap().push(submission.clone());
        self.pending.lock().unwrap().push_back(submission);
        Ok(())
    }

    fn pop_completed(&self) -> Option<(u64, u32)> {
        self.completed.lock().unwrap().pop_front()
    }

    fn kick(&self) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
        let responder = self.responder.lock().unwrap();
        let Some(responder) = responder.as_ref() else {
            return;
        };
        let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for submission in pending {
            match responder(&submission) {
                Some(used_len) => self
                    .completed
                    .lock()
                    .unwrap()
                    .push_back((submission.cookie, used_len)),
                None => self.pending.lock().unwrap().push_back(submission),
            }
        }
    }

    fn disable_interrupts(&self) {
        self.interrupts_enabled.store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.interrupts_enabled.store(true, Ordering::SeqCst);
    }
}

/// Emulates the control side of a device: reads the request from the first
/// descriptor, writes what `respond` returns into the second one.
pub(crate) fn control_device<F>(dma: Arc<FakeDma>, respond: F) -> Responder
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    Box::new(move |submission: &Submission| {
        let request = &submission.chain[0];
        let response = &submission.chain[1];
        let bytes = dma.read(request.addr, request.len as usize);
        let mut reply = respond(&bytes);
        reply.truncate(response.len as usize);
        dma.write(response.addr, &reply);
        Some(reply.len() as u32)
    })
}

/// A device that answers every control request with `status` alone.
pub(crate) fn status_device(dma: Arc<FakeDma>, status: u32) -> Responder {
    control_device(dma, move |_| {
        let mut reply = status.to_le_bytes().to_vec();
        reply.resize(VIRTIO_SND_HDR_SIZE, 0);
        reply
    })
}

/// A whole device: one fake queue per virtqueue over shared fake memory. The
/// control queue answers OK to everything until told otherwise.
pub(crate) struct Harness {
    pub control: Arc<FakeQueue>,
    pub event: Arc<FakeQueue>,
    pub tx: Arc<FakeQueue>,
    pub rx: Arc<FakeQueue>,
    pub dma: Arc<FakeDma>,
}

impl Harness {
    pub fn new() -> Self {
        let dma = FakeDma::new();
        let control = FakeQueue::new();
        control.attach_memory(dma.clone());
        control.set_responder(status_device(dma.clone(), VIRTIO_SND_S_OK));
        Harness {
            control,
            event: FakeQueue::new(),
            tx: FakeQueue::new(),
            rx: FakeQueue::new(),
            dma,
        }
    }

    pub fn queues(&self) -> SndQueues {
        SndQueues {
            control: self.control.clone(),
            event: self.event.clone(),
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }

    /// Small pools with 64-byte periods and no bring-up query.
    pub fn snd(&self, pool_size: usize) -> Snd {
        let config = SndConfig {
            tx: TxConfig {
                pool_size,
                max_period_bytes: 64,
                ..Default::default()
            },
            rx: RxConfig {
                pool_size,
                max_period_bytes: 64,
                ..Default::default()
            },
            event: EventConfig {
                buffers: 4,
                ..Default::default()
            },
            query_on_init: false,
            ..Default::default()
        };
        Snd::new(self.queues(), self.dma.clone(), config).unwrap()
    }
}
