use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use super::defs::{
    CONTROL_POLL_INTERVAL, CONTROL_TIMEOUT, MAX_BUFFER_BYTES, MAX_CONTROL_MSG_BYTES,
};
use super::stream::{self, PcmCapabilities, PcmFormat, PcmParams, Stream, StreamId};
use super::virtio_sound::{
    VIRTIO_SND_HDR_SIZE, VIRTIO_SND_PCM_INFO_SIZE, VIRTIO_SND_R_PCM_PREPARE,
    VIRTIO_SND_R_PCM_RELEASE, VIRTIO_SND_R_PCM_START, VIRTIO_SND_R_PCM_STOP,
};
use super::wire::{self, PcmInfo, SetParams};
use super::{lock, ControlMessageKind, DeviceStatus, Error, ExecContext, Result};
use crate::virtio::dma::{CachePolicy, DmaAllocator, DmaBuffer};
use crate::virtio::queue::{Descriptor, DeviceQueue};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELED: u8 = 2;

#[derive(Clone, Debug)]
pub struct ControlConfig {
    /// Interval between completion polls while a request is outstanding.
    pub poll_interval: Duration,
    /// Timeout used by the stream operations.
    pub default_timeout: Duration,
    /// Largest response a caller may ask for.
    pub max_response_bytes: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            poll_interval: CONTROL_POLL_INTERVAL,
            default_timeout: CONTROL_TIMEOUT,
            max_response_bytes: MAX_CONTROL_MSG_BYTES,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlStats {
    pub submitted: u64,
    pub completed: u64,
    pub timed_out: u64,
    /// Completions that arrived after their caller gave up.
    pub late_completions: u64,
    pub canceled: u64,
    pub unknown_completions: u64,
    pub deferred_releases: u64,
    pub device_errors: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    late_completions: AtomicU64,
    canceled: AtomicU64,
    unknown_completions: AtomicU64,
    deferred_releases: AtomicU64,
    device_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// One request/response exchange on the control queue.
///
/// Owned by the caller of `send_sync` and by the in-flight table. The DMA
/// region is released when the last of the two owners lets go.
struct ControlRequest {
    id: u64,
    kind: Option<ControlMessageKind>,
    state: AtomicU8,
    timed_out: AtomicBool,
    used_len: AtomicU32,
    response_offset: usize,
    response_capacity: usize,
    buffer: DmaBuffer,
    done: Sender<()>,
}

impl std::fmt::Debug for ControlRequest {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(ControlRequest))
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

/// Counts live request buffers and wakes `uninit` once all are gone.
#[derive(Default)]
struct ReleaseTracker {
    outstanding: Mutex<usize>,
    all_released: Condvar,
}

impl ReleaseTracker {
    fn acquired(&self) {
        *lock(&self.outstanding) += 1;
    }

    fn released(&self) {
        let mut outstanding = lock(&self.outstanding);
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.all_released.notify_all();
        }
    }

    fn outstanding(&self) -> usize {
        *lock(&self.outstanding)
    }

    fn wait_all_released(&self) {
        let mut outstanding = lock(&self.outstanding);
        while *outstanding > 0 {
            outstanding = self
                .all_released
                .wait(outstanding)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

enum ReleaseMessage {
    Free(DmaBuffer),
    Exit,
}

fn spawn_release_worker(
    allocator: Arc<dyn DmaAllocator>,
    tracker: Arc<ReleaseTracker>,
) -> Result<(Sender<ReleaseMessage>, JoinHandle<()>)> {
    let (sender, receiver): (Sender<ReleaseMessage>, Receiver<ReleaseMessage>) = unbounded();
    let handle = thread::Builder::new()
        .name("snd-ctl-release".into())
        .spawn(move || {
            while let Ok(ReleaseMessage::Free(buffer)) = receiver.recv() {
                trace!("snd: deferred release of {:?}", buffer);
                allocator.free(buffer);
                tracker.released();
            }
            debug!("snd: release worker exiting");
        })
        .map_err(Error::WorkerSpawn)?;
    Ok((sender, handle))
}

/// Request/response engine of the control queue, and owner of the stream
/// state machine.
pub struct ControlEngine {
    config: ControlConfig,
    queue: Arc<dyn DeviceQueue>,
    allocator: Arc<dyn DmaAllocator>,
    send_lock: Mutex<()>,
    inflight: Mutex<HashMap<u64, Arc<ControlRequest>>>,
    streams: Mutex<[Stream; 2]>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    tracker: Arc<ReleaseTracker>,
    releaser: Sender<ReleaseMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl ControlEngine {
    pub fn new(
        queue: Arc<dyn DeviceQueue>,
        allocator: Arc<dyn DmaAllocator>,
        config: ControlConfig,
    ) -> Result<Self> {
        if config.poll_interval.is_zero() {
            return Err(Error::InvalidParameter("zero poll interval"));
        }
        let tracker = Arc::new(ReleaseTracker::default());
        let (releaser, worker) = spawn_release_worker(allocator.clone(), tracker.clone())?;

        Ok(ControlEngine {
            config,
            queue,
            allocator,
            send_lock: Mutex::new(()),
            inflight: Mutex::new(HashMap::new()),
            streams: Mutex::new([
                Stream::new(StreamId::Playback),
                Stream::new(StreamId::Capture),
            ]),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            tracker,
            releaser,
            worker: Mutex::new(Some(worker)),
            counters: Counters::default(),
        })
    }

    pub(crate) fn queue(&self) -> &Arc<dyn DeviceQueue> {
        &self.queue
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Drops one owner of `request`. The last owner frees the DMA region:
    /// inline in caller context, through the release worker otherwise.
    fn drop_owner(&self, request: Arc<ControlRequest>, ctx: ExecContext) {
        let Some(request) = Arc::into_inner(request) else {
            return;
        };
        let buffer = request.buffer;
        match ctx {
            ExecContext::Caller => {
                self.allocator.free(buffer);
                self.tracker.released();
            }
            ExecContext::Completion => {
                bump(&self.counters.deferred_releases);
                if let Err(e) = self.releaser.send(ReleaseMessage::Free(buffer)) {
                    // Only reachable after uninit stopped the worker.
                    if let ReleaseMessage::Free(buffer) = e.into_inner() {
                        warn!("snd: release worker gone, freeing request buffer inline");
                        self.allocator.free(buffer);
                        self.tracker.released();
                    }
                }
            }
        }
    }

    fn complete(&self, request: Arc<ControlRequest>, used_len: u32, ctx: ExecContext) {
        request.used_len.store(used_len, Ordering::Release);
        if request
            .state
            .compare_exchange(PENDING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            bump(&self.counters.completed);
            if request.timed_out.load(Ordering::Acquire) {
                debug!("snd: late completion of control request {}", request.id);
                bump(&self.counters.late_completions);
            }
            let _ = request.done.try_send(());
        }
        self.drop_owner(request, ctx);
    }

    /// Drains every completed control request. Safe from either context.
    pub fn on_completion(&self, ctx: ExecContext) -> usize {
        let mut count = 0;
        while let Some((cookie, used_len)) = self.queue.pop_completed() {
            count += 1;
            let request = lock(&self.inflight).remove(&cookie);
            match request {
                Some(request) => self.complete(request, used_len, ctx),
                None => {
                    warn!("snd: control completion for unknown cookie {:#x}", cookie);
                    bump(&self.counters.unknown_completions);
                }
            }
        }
        count
    }

    /// Cancels every tracked request. Completions already in the ring are
    /// applied first so none of them is left pointing at a freed request.
    pub fn cancel_all(&self) {
        self.on_completion(ExecContext::Caller);

        let requests: Vec<_> = lock(&self.inflight).drain().map(|(_, r)| r).collect();
        for request in requests {
            if request
                .state
                .compare_exchange(PENDING, CANCELED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!("snd: canceled control request {}", request.id);
                bump(&self.counters.canceled);
                let _ = request.done.try_send(());
            }
            self.drop_owner(request, ExecContext::Caller);
        }
    }

    /// Stops accepting requests, cancels the outstanding ones and waits until
    /// every request buffer went back to the allocator. Idempotent.
    pub fn uninit(&self) {
        self.shutting_down.store(true, Ordering::Release);
        {
            // Wait out a send_sync that is still polling.
            let _guard = lock(&self.send_lock);
            self.cancel_all();
        }
        self.tracker.wait_all_released();

        let worker = lock(&self.worker).take();
        if let Some(handle) = worker {
            let _ = self.releaser.send(ReleaseMessage::Exit);
            if handle.join().is_err() {
                error!("snd: release worker panicked");
            }
        }
    }

    /// Number of request buffers not yet returned to the allocator.
    pub fn outstanding_requests(&self) -> usize {
        self.tracker.outstanding()
    }

    pub fn stats(&self) -> ControlStats {
        let c = &self.counters;
        ControlStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            late_completions: c.late_completions.load(Ordering::Relaxed),
            canceled: c.canceled.load(Ordering::Relaxed),
            unknown_completions: c.unknown_completions.load(Ordering::Relaxed),
            deferred_releases: c.deferred_releases.load(Ordering::Relaxed),
            device_errors: c.device_errors.load(Ordering::Relaxed),
        }
    }

    /// Sends one request and blocks until the device answers or `timeout`
    /// expires. Returns the response, leading status included.
    ///
    /// A timed out request stays tracked: its completion is still applied
    /// whenever it shows up.
    pub fn send_sync(
        &self,
        request: &[u8],
        response_capacity: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if request.is_empty() || request.len() > MAX_CONTROL_MSG_BYTES {
            return Err(Error::InvalidParameter("bad control request length"));
        }
        if response_capacity < VIRTIO_SND_HDR_SIZE
            || response_capacity > self.config.max_response_bytes
        {
            return Err(Error::InvalidParameter("bad control response capacity"));
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let _guard = lock(&self.send_lock);
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }

        let response_offset = (request.len() + 3) & !3;
        let buffer = self
            .allocator
            .alloc(response_offset + response_capacity, CachePolicy::Cached)?;
        let filled = buffer.write_at(0, request).and_then(|()| {
            let tail = response_offset + response_capacity - request.len();
            buffer.fill_zero(request.len(), tail)
        });
        if let Err(e) = filled {
            self.allocator.free(buffer);
            return Err(e.into());
        }
        self.tracker.acquired();

        let kind = wire::decode_status(request)
            .and_then(|code| ControlMessageKind::try_from(code).ok());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = bounded(1);
        let chain = [
            Descriptor::readable(buffer.device_address(), request.len() as u32),
            Descriptor::writable(
                buffer.device_address_at(response_offset),
                response_capacity as u32,
            ),
        ];
        let request = Arc::new(ControlRequest {
            id,
            kind,
            state: AtomicU8::new(PENDING),
            timed_out: AtomicBool::new(false),
            used_len: AtomicU32::new(0),
            response_offset,
            response_capacity,
            buffer,
            done: done_tx,
        });

        lock(&self.inflight).insert(id, request.clone());
        if let Err(e) = self.queue.submit(&chain, id) {
            error!("snd: failed to submit control request {:?}: {}", kind, e);
            if let Some(tracked) = lock(&self.inflight).remove(&id) {
                self.drop_owner(tracked, ExecContext::Caller);
            }
            self.drop_owner(request, ExecContext::Caller);
            return Err(e.into());
        }
        bump(&self.counters.submitted);
        self.queue.kick();
        trace!("snd: control request {} {:?} submitted", id, kind);

        let deadline = Instant::now() + timeout;
        let outcome = loop {
            self.on_completion(ExecContext::Caller);
            match request.state.load(Ordering::Acquire) {
                COMPLETED => break Ok(()),
                CANCELED => break Err(Error::Canceled),
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                request.timed_out.store(true, Ordering::Release);
                // The completion may have landed between the two checks.
                if request.state.load(Ordering::Acquire) == COMPLETED {
                    break Ok(());
                }
                warn!("snd: control request {} {:?} timed out", id, kind);
                bump(&self.counters.timed_out);
                break Err(Error::Timeout);
            }
            let _ = done_rx.recv_timeout((deadline - now).min(self.config.poll_interval));
        };

        let result = outcome.and_then(|()| self.read_response(&request));
        self.drop_owner(request, ExecContext::Caller);
        result
    }

    fn read_response(&self, request: &ControlRequest) -> Result<Vec<u8>> {
        let used_len = request.used_len.load(Ordering::Acquire);
        if (used_len as usize) < VIRTIO_SND_HDR_SIZE {
            error!(
                "snd: control request {} completed with used length {}",
                request.id, used_len
            );
            return Err(Error::MalformedResponse(used_len));
        }
        let len = (used_len as usize).min(request.response_capacity);
        let mut response = vec![0u8; len];
        request
            .buffer
            .read_at(request.response_offset, &mut response)?;

        let code = wire::decode_status(&response).ok_or(Error::MalformedResponse(used_len))?;
        if let Some(status) = DeviceStatus::from_code(code) {
            debug!("snd: returned {} for ctrl msg {:?}", status, request.kind);
            bump(&self.counters.device_errors);
            return Err(Error::DeviceStatus(status));
        }
        Ok(response)
    }

    pub fn stream(&self, id: StreamId) -> Stream {
        lock(&self.streams)[id.index()]
    }

    pub fn capabilities(&self, id: StreamId) -> Option<PcmCapabilities> {
        lock(&self.streams)[id.index()].caps
    }

    /// Queries both streams, fills the capability cache and picks each
    /// stream's format. Returns the entry of `stream`.
    pub fn query_capabilities(&self, stream: StreamId) -> Result<PcmInfo> {
        let mut streams = lock(&self.streams);
        let count = StreamId::ALL.len();
        let request = wire::encode_query_info(0, count as u32);
        let response = self.send_sync(
            &request,
            VIRTIO_SND_HDR_SIZE + count * VIRTIO_SND_PCM_INFO_SIZE,
            self.config.default_timeout,
        )?;

        let mut infos = [PcmInfo::default(); 2];
        for id in StreamId::ALL {
            let offset = VIRTIO_SND_HDR_SIZE + id.index() * VIRTIO_SND_PCM_INFO_SIZE;
            infos[id.index()] = response
                .get(offset..)
                .and_then(wire::decode_pcm_info)
                .ok_or(Error::MalformedResponse(response.len() as u32))?;
        }

        let mut selected = [PcmFormat::baseline(StreamId::Playback); 2];
        for id in StreamId::ALL {
            let caps = PcmCapabilities::from(&infos[id.index()]);
            selected[id.index()] = stream::select_format(id, &caps).ok_or_else(|| {
                error!("snd: no usable format for {:?}: {:?}", id, caps);
                Error::NoSupportedFormat(id)
            })?;
        }

        for id in StreamId::ALL {
            let entry = &mut streams[id.index()];
            entry.caps = Some(PcmCapabilities::from(&infos[id.index()]));
            entry.format = selected[id.index()];
            info!("snd: {:?} stream selected {}", id, entry.format);
        }
        Ok(infos[stream.index()])
    }

    /// Chooses the format used by the next SET_PARAMS. Checked against the
    /// capability cache once it is populated.
    pub fn select_format(&self, stream: StreamId, channels: u8, format: u8, rate: u8) -> Result<()> {
        let candidate = PcmFormat {
            channels,
            format,
            rate,
        };
        if !candidate.is_known() {
            return Err(Error::UnsupportedFormat);
        }
        let mut streams = lock(&self.streams);
        let entry = &mut streams[stream.index()];
        if let Some(caps) = entry.caps {
            if !caps.supports(&candidate) {
                return Err(Error::UnsupportedFormat);
            }
        }
        entry.format = candidate;
        Ok(())
    }

    pub fn set_params(&self, stream: StreamId, buffer_bytes: u32, period_bytes: u32) -> Result<()> {
        let mut streams = lock(&self.streams);
        let entry = &mut streams[stream.index()];
        entry.state.check_set_parameters()?;

        let format = entry.format;
        let frame_bytes = format.frame_bytes().ok_or(Error::UnsupportedFormat)?;
        if buffer_bytes == 0 || period_bytes == 0 {
            return Err(Error::InvalidParameter("zero buffer or period size"));
        }
        if period_bytes > buffer_bytes || buffer_bytes as usize > MAX_BUFFER_BYTES {
            return Err(Error::InvalidParameter("buffer or period size out of range"));
        }
        if buffer_bytes as usize % frame_bytes != 0 || period_bytes as usize % frame_bytes != 0 {
            return Err(Error::InvalidParameter("sizes not frame aligned"));
        }

        let request = wire::encode_set_params(&SetParams {
            stream_id: stream as u32,
            buffer_bytes,
            period_bytes,
            features: 0,
            channels: format.channels,
            format: format.format,
            rate: format.rate,
        });
        self.send_sync(&request, VIRTIO_SND_HDR_SIZE, self.config.default_timeout)?;

        entry.state.set_parameters()?;
        entry.params = Some(PcmParams {
            buffer_bytes,
            period_bytes,
            format,
        });
        debug!("snd: {:?} params set: {:?}", stream, entry.params);
        Ok(())
    }

    fn send_command(&self, code: u32, stream: StreamId) -> Result<()> {
        let request = wire::encode_pcm_command(code, stream as u32);
        self.send_sync(&request, VIRTIO_SND_HDR_SIZE, self.config.default_timeout)
            .map(|_| ())
    }

    pub fn prepare(&self, stream: StreamId) -> Result<()> {
        let mut streams = lock(&self.streams);
        let entry = &mut streams[stream.index()];
        entry.state.check_prepare()?;
        self.send_command(VIRTIO_SND_R_PCM_PREPARE, stream)?;
        entry.state.prepare()?;
        Ok(())
    }

    pub fn start(&self, stream: StreamId) -> Result<()> {
        let mut streams = lock(&self.streams);
        let entry = &mut streams[stream.index()];
        entry.state.check_start()?;
        self.send_command(VIRTIO_SND_R_PCM_START, stream)?;
        entry.state.start()?;
        Ok(())
    }

    /// Leaves the stream prepared even when the device rejects the command.
    pub fn stop(&self, stream: StreamId) -> Result<()> {
        let mut streams = lock(&self.streams);
        let entry = &mut streams[stream.index()];
        entry.state.check_stop()?;
        let result = self.send_command(VIRTIO_SND_R_PCM_STOP, stream);
        entry.state.stop()?;
        result
    }

    /// Returns the stream to idle even when the device rejects the command.
    pub fn release(&self, stream: StreamId) -> Result<()> {
        let mut streams = lock(&self.streams);
        let entry = &mut streams[stream.index()];
        let result = self.send_command(VIRTIO_SND_R_PCM_RELEASE, stream);
        entry.state.release();
        entry.params = None;
        result
    }
}

impl Drop for ControlEngine {
    fn drop(&mut self) {
        self.uninit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::queue::QueueError;
    use crate::virtio::snd::stream::StreamState;
    use crate::virtio::snd::test_utils::{
        control_device, status_device, FakeDma, FakeQueue, Responder,
    };
    use crate::virtio::snd::virtio_sound::*;
    use crate::virtio::snd::wire::encode_pcm_info;

    fn engine(queue: &Arc<FakeQueue>, dma: &Arc<FakeDma>) -> ControlEngine {
        queue.attach_memory(dma.clone());
        ControlEngine::new(
            queue.clone(),
            dma.clone(),
            ControlConfig {
                poll_interval: Duration::from_millis(1),
                default_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn ok_engine() -> (Arc<FakeQueue>, Arc<FakeDma>, ControlEngine) {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        queue.set_responder(status_device(dma.clone(), VIRTIO_SND_S_OK));
        let control = engine(&queue, &dma);
        (queue, dma, control)
    }

    fn info(direction: u8, formats: u64, rates: u64, min: u8, max: u8) -> PcmInfo {
        PcmInfo {
            hda_fn_nid: 0,
            features: 0,
            formats,
            rates,
            direction,
            channels_min: min,
            channels_max: max,
        }
    }

    fn pcm_info_device(dma: Arc<FakeDma>, infos: [PcmInfo; 2]) -> Responder {
        control_device(dma, move |request| {
            let mut reply = VIRTIO_SND_S_OK.to_le_bytes().to_vec();
            if wire::decode_status(request) == Some(VIRTIO_SND_R_PCM_INFO) {
                for entry in infos.iter() {
                    reply.extend_from_slice(&encode_pcm_info(entry));
                }
            }
            reply
        })
    }

    fn request_bytes(queue: &FakeQueue, index: usize) -> Vec<u8> {
        queue.submissions()[index].readable.clone()
    }

    #[test]
    fn test_send_sync_layout() {
        let (queue, dma, control) = ok_engine();
        let response = control
            .send_sync(&[1, 2, 3, 4, 5], 8, Duration::from_millis(100))
            .unwrap();
        assert_eq!(response, vec![0, 0, 0, 0]);

        let submission = &queue.submissions()[0];
        assert_eq!(submission.chain.len(), 2);
        assert!(!submission.chain[0].device_writable);
        assert_eq!(submission.chain[0].len, 5);
        assert!(submission.chain[1].device_writable);
        assert_eq!(submission.chain[1].len, 8);
        assert_eq!(submission.chain[1].addr, submission.chain[0].addr + 8);
        assert_eq!(queue.kicks(), 1);

        assert_eq!(control.outstanding_requests(), 0);
        assert_eq!(dma.allocs(), dma.frees());
        assert_eq!(control.stats().completed, 1);
        // What the device saw, captured before the buffer went back.
        assert_eq!(submission.readable, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_send_sync_rejects_bad_arguments() {
        let (queue, _dma, control) = ok_engine();
        let timeout = Duration::from_millis(10);
        assert!(matches!(
            control.send_sync(&[], 4, timeout),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            control.send_sync(&[0; 8], 0, timeout),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            control.send_sync(&[0; 8], MAX_CONTROL_MSG_BYTES + 1, timeout),
            Err(Error::InvalidParameter(_))
        ));
        assert_eq!(queue.submit_count(), 0);
    }

    #[test]
    fn test_device_status_mapping() {
        for (status, expected) in [
            (VIRTIO_SND_S_BAD_MSG, DeviceStatus::BadMsg),
            (VIRTIO_SND_S_NOT_SUPP, DeviceStatus::NotSupp),
            (VIRTIO_SND_S_IO_ERR, DeviceStatus::IoErr),
            (7, DeviceStatus::Unknown(7)),
        ] {
            let queue = FakeQueue::new();
            let dma = FakeDma::new();
            queue.set_responder(status_device(dma.clone(), status));
            let control = engine(&queue, &dma);
            match control.send_sync(&[0; 8], 4, Duration::from_millis(100)) {
                Err(Error::DeviceStatus(s)) => assert_eq!(s, expected),
                other => panic!("unexpected {:?}", other),
            }
            control.uninit();
            assert_eq!(dma.live(), 0);
        }
    }

    #[test]
    fn test_short_response_is_malformed() {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        queue.set_responder(control_device(dma.clone(), |_| vec![0, 0]));
        let control = engine(&queue, &dma);
        assert!(matches!(
            control.send_sync(&[0; 8], 4, Duration::from_millis(100)),
            Err(Error::MalformedResponse(2))
        ));
    }

    #[test]
    fn test_submit_failure_releases_request() {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        queue.set_fail_submit(Some(QueueError::Full));
        let control = engine(&queue, &dma);
        let err = control
            .send_sync(&[0; 8], 4, Duration::from_millis(100))
            .unwrap_err();
        assert!(err.is_resource_exhaustion());
        assert_eq!(control.outstanding_requests(), 0);
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn test_completion_from_other_thread() {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        let control = Arc::new(engine(&queue, &dma));

        let completer = {
            let queue = queue.clone();
            let dma = dma.clone();
            let control = control.clone();
            thread::spawn(move || {
                while queue.pending_count() == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
                let submission = queue.pending()[0].clone();
                dma.write(submission.chain[1].addr, &VIRTIO_SND_S_OK.to_le_bytes());
                queue.complete(submission.cookie, 4).unwrap();
                control.on_completion(ExecContext::Completion);
            })
        };

        let response = control
            .send_sync(&[0; 8], 4, Duration::from_secs(5))
            .unwrap();
        assert_eq!(response, vec![0, 0, 0, 0]);
        completer.join().unwrap();

        control.uninit();
        assert_eq!(dma.live(), 0);
        assert_eq!(control.stats().timed_out, 0);
    }

    #[test]
    fn test_timeout_then_late_completion() {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        let control = engine(&queue, &dma);

        assert!(matches!(
            control.send_sync(&[0; 8], 4, Duration::from_millis(20)),
            Err(Error::Timeout)
        ));
        // The in-flight table still owns the request.
        assert_eq!(control.outstanding_requests(), 1);
        assert_eq!(dma.live(), 1);

        let submission = queue.pending()[0].clone();
        dma.write(submission.chain[1].addr, &VIRTIO_SND_S_OK.to_le_bytes());
        queue.complete(submission.cookie, 4).unwrap();
        assert_eq!(control.on_completion(ExecContext::Completion), 1);

        control.uninit();
        let stats = control.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.late_completions, 1);
        assert_eq!(stats.canceled, 0);
        assert_eq!(stats.deferred_releases, 1);
        assert_eq!(dma.live(), 0);
        assert_eq!(dma.allocs(), dma.frees());
    }

    #[test]
    fn test_uninit_stops_release_worker() {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        let control = engine(&queue, &dma);
        assert!(matches!(
            control.send_sync(&[0; 8], 4, Duration::from_millis(5)),
            Err(Error::Timeout)
        ));
        queue.complete_next(4).unwrap();
        control.on_completion(ExecContext::Completion);

        control.uninit();
        assert!(lock(&control.worker).is_none());
        // The worker dropped its receiver on the way out.
        assert!(control.releaser.send(ReleaseMessage::Exit).is_err());
        assert_eq!(control.stats().deferred_releases, 1);
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn test_cancel_all_drains_completions_first() {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        let control = engine(&queue, &dma);

        // Two requests left behind by timeouts.
        for _ in 0..2 {
            assert!(matches!(
                control.send_sync(&[0; 8], 4, Duration::from_millis(5)),
                Err(Error::Timeout)
            ));
        }
        let first = queue.pending()[0].clone();
        dma.write(first.chain[1].addr, &VIRTIO_SND_S_OK.to_le_bytes());
        queue.complete(first.cookie, 4).unwrap();

        control.cancel_all();
        assert_eq!(queue.completed_count(), 0);
        let stats = control.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.canceled, 1);
        assert_eq!(control.outstanding_requests(), 0);
        assert_eq!(dma.live(), 0);

        // Canceling again is a no-op, and a stale completion is ignored.
        control.cancel_all();
        let second = queue.pending()[0].clone();
        queue.complete(second.cookie, 4).unwrap();
        assert_eq!(control.on_completion(ExecContext::Completion), 1);
        let stats = control.stats();
        assert_eq!(stats.canceled, 1);
        assert_eq!(stats.unknown_completions, 1);
    }

    #[test]
    fn test_send_after_uninit() {
        let (_queue, dma, control) = ok_engine();
        control.uninit();
        control.uninit();
        assert!(matches!(
            control.send_sync(&[0; 8], 4, Duration::from_millis(5)),
            Err(Error::ShuttingDown)
        ));
        assert_eq!(dma.live(), 0);
    }

    #[test]
    fn test_set_params_bytes() {
        let (queue, _dma, control) = ok_engine();
        control.set_params(StreamId::Playback, 4096, 1024).unwrap();
        assert_eq!(
            request_bytes(&queue, 0),
            vec![
                0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x04,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x05, 0x07, 0x00,
            ]
        );
        let stream = control.stream(StreamId::Playback);
        assert_eq!(stream.state, StreamState::ParamsSet);
        assert_eq!(
            stream.params,
            Some(PcmParams {
                buffer_bytes: 4096,
                period_bytes: 1024,
                format: PcmFormat::baseline(StreamId::Playback),
            })
        );
    }

    #[test]
    fn test_commands_bytes() {
        let (queue, _dma, control) = ok_engine();
        control.set_params(StreamId::Capture, 2048, 512).unwrap();
        control.prepare(StreamId::Capture).unwrap();
        control.start(StreamId::Capture).unwrap();
        control.stop(StreamId::Capture).unwrap();
        control.release(StreamId::Capture).unwrap();

        let expected: [[u8; 8]; 4] = [
            [0x02, 0x01, 0, 0, 1, 0, 0, 0],
            [0x04, 0x01, 0, 0, 1, 0, 0, 0],
            [0x05, 0x01, 0, 0, 1, 0, 0, 0],
            [0x03, 0x01, 0, 0, 1, 0, 0, 0],
        ];
        for (index, bytes) in expected.iter().enumerate() {
            assert_eq!(request_bytes(&queue, index + 1), bytes.to_vec());
        }
        let stream = control.stream(StreamId::Capture);
        assert_eq!(stream.state, StreamState::Idle);
        assert_eq!(stream.params, None);
    }

    #[test]
    fn test_illegal_transitions_do_no_io() {
        let (queue, _dma, control) = ok_engine();
        for op in [
            ControlEngine::prepare,
            ControlEngine::start,
            ControlEngine::stop,
        ] {
            assert!(matches!(
                op(&control, StreamId::Playback),
                Err(Error::Stream(stream::Error::InvalidStateTransition(..)))
            ));
        }
        assert_eq!(queue.submit_count(), 0);

        control.set_params(StreamId::Playback, 4096, 1024).unwrap();
        control.prepare(StreamId::Playback).unwrap();
        control.start(StreamId::Playback).unwrap();
        assert!(control.set_params(StreamId::Playback, 4096, 1024).is_err());
        assert!(control.prepare(StreamId::Playback).is_err());
        assert_eq!(queue.submit_count(), 3);
        control.start(StreamId::Playback).unwrap();
        assert_eq!(queue.submit_count(), 4);
    }

    #[test]
    fn test_set_params_validation() {
        let (queue, _dma, control) = ok_engine();
        for (buffer, period) in [(0, 0), (4096, 0), (1024, 4096), (4098, 1024), (8 << 20, 1024)] {
            assert!(matches!(
                control.set_params(StreamId::Playback, buffer, period),
                Err(Error::InvalidParameter(_))
            ));
        }
        assert_eq!(queue.submit_count(), 0);
    }

    #[test]
    fn test_device_error_keeps_state() {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        queue.set_responder(status_device(dma.clone(), VIRTIO_SND_S_IO_ERR));
        let control = engine(&queue, &dma);
        assert!(matches!(
            control.set_params(StreamId::Playback, 4096, 1024),
            Err(Error::DeviceStatus(DeviceStatus::IoErr))
        ));
        assert_eq!(control.stream(StreamId::Playback).state, StreamState::Idle);
    }

    #[test]
    fn test_stop_and_release_always_move() {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        queue.set_responder(status_device(dma.clone(), VIRTIO_SND_S_OK));
        let control = engine(&queue, &dma);
        control.set_params(StreamId::Playback, 4096, 1024).unwrap();
        control.prepare(StreamId::Playback).unwrap();
        control.start(StreamId::Playback).unwrap();

        queue.set_responder(status_device(dma.clone(), VIRTIO_SND_S_IO_ERR));
        assert!(control.stop(StreamId::Playback).is_err());
        assert_eq!(
            control.stream(StreamId::Playback).state,
            StreamState::Prepared
        );
        assert!(control.release(StreamId::Playback).is_err());
        assert_eq!(control.stream(StreamId::Playback).state, StreamState::Idle);
    }

    #[test]
    fn test_query_capabilities_selects_formats() {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        let playback = info(
            VIRTIO_SND_D_OUTPUT,
            1 << VIRTIO_SND_PCM_FMT_S16,
            1 << VIRTIO_SND_PCM_RATE_48000,
            1,
            1,
        );
        let capture = info(
            VIRTIO_SND_D_INPUT,
            1 << VIRTIO_SND_PCM_FMT_S24,
            1 << VIRTIO_SND_PCM_RATE_44100,
            1,
            2,
        );
        queue.set_responder(pcm_info_device(dma.clone(), [playback, capture]));
        let control = engine(&queue, &dma);

        let entry = control.query_capabilities(StreamId::Playback).unwrap();
        assert_eq!(entry, playback);
        assert_eq!(
            request_bytes(&queue, 0),
            wire::encode_query_info(0, 2).to_vec()
        );
        assert_eq!(queue.submissions()[0].chain[1].len, 4 + 2 * 32);

        assert_eq!(
            control.stream(StreamId::Playback).format,
            PcmFormat {
                channels: 1,
                format: VIRTIO_SND_PCM_FMT_S16,
                rate: VIRTIO_SND_PCM_RATE_48000,
            }
        );
        assert_eq!(
            control.stream(StreamId::Capture).format,
            PcmFormat {
                channels: 1,
                format: VIRTIO_SND_PCM_FMT_S24,
                rate: VIRTIO_SND_PCM_RATE_44100,
            }
        );
        assert_eq!(
            control.capabilities(StreamId::Capture),
            Some(PcmCapabilities::from(&capture))
        );

        control.set_params(StreamId::Playback, 4096, 1024).unwrap();
        let bytes = request_bytes(&queue, 1);
        assert_eq!(&bytes[20..23], &[1, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_48000]);
    }

    #[test]
    fn test_query_capabilities_without_usable_format() {
        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        let playback = info(
            VIRTIO_SND_D_OUTPUT,
            1 << VIRTIO_SND_PCM_FMT_S16,
            1 << VIRTIO_SND_PCM_RATE_48000,
            2,
            2,
        );
        let capture = info(VIRTIO_SND_D_INPUT, 1 << VIRTIO_SND_PCM_FMT_U8, 1, 1, 1);
        queue.set_responder(pcm_info_device(dma.clone(), [playback, capture]));
        let control = engine(&queue, &dma);

        assert!(matches!(
            control.query_capabilities(StreamId::Playback),
            Err(Error::NoSupportedFormat(StreamId::Capture))
        ));
        assert_eq!(control.capabilities(StreamId::Playback), None);
        assert_eq!(control.capabilities(StreamId::Capture), None);
    }

    #[test]
    fn test_select_format() {
        let (_queue, _dma, control) = ok_engine();
        // Accepted unconditionally before the capability query.
        control
            .select_format(StreamId::Playback, 6, VIRTIO_SND_PCM_FMT_S32, VIRTIO_SND_PCM_RATE_96000)
            .unwrap();
        assert_eq!(control.stream(StreamId::Playback).format.channels, 6);
        assert!(matches!(
            control.select_format(StreamId::Playback, 2, 0x3f, VIRTIO_SND_PCM_RATE_48000),
            Err(Error::UnsupportedFormat)
        ));

        let queue = FakeQueue::new();
        let dma = FakeDma::new();
        let caps = info(
            VIRTIO_SND_D_OUTPUT,
            1 << VIRTIO_SND_PCM_FMT_S16,
            1 << VIRTIO_SND_PCM_RATE_48000,
            1,
            2,
        );
        queue.set_responder(pcm_info_device(dma.clone(), [caps, caps]));
        let control = engine(&queue, &dma);
        control.query_capabilities(StreamId::Playback).unwrap();
        assert!(matches!(
            control.select_format(StreamId::Playback, 2, VIRTIO_SND_PCM_FMT_S32, VIRTIO_SND_PCM_RATE_48000),
            Err(Error::UnsupportedFormat)
        ));
        assert!(matches!(
            control.select_format(StreamId::Playback, 4, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_48000),
            Err(Error::UnsupportedFormat)
        ));
        control
            .select_format(StreamId::Playback, 1, VIRTIO_SND_PCM_FMT_S16, VIRTIO_SND_PCM_RATE_48000)
            .unwrap();
    }
}
