use std::sync::{Arc, RwLock};

use super::control::{ControlConfig, ControlEngine};
use super::defs;
use super::event::{EventConfig, EventDrain};
use super::jack::JackTable;
use super::notify::{SignalHook, SndListener};
use super::pacer::{PeriodSegments, RingPacer};
use super::pool::SgSegment;
use super::rx::{RxConfig, RxEngine};
use super::stream::{self, PcmCapabilities, Stream, StreamId};
use super::tx::{Segment, TxConfig, TxEngine};
use super::wire::PcmInfo;
use super::{Error, ExecContext, Result};
use crate::virtio::dma::DmaAllocator;
use crate::virtio::queue::DeviceQueue;

/// The four virtqueues of a sound device, in device order.
pub struct SndQueues {
    pub control: Arc<dyn DeviceQueue>,
    pub event: Arc<dyn DeviceQueue>,
    pub tx: Arc<dyn DeviceQueue>,
    pub rx: Arc<dyn DeviceQueue>,
}

#[derive(Clone, Debug)]
pub struct SndConfig {
    pub control: ControlConfig,
    pub tx: TxConfig,
    pub rx: RxConfig,
    pub event: EventConfig,
    /// Ask the device for its capabilities during bring-up.
    pub query_on_init: bool,
}

impl Default for SndConfig {
    fn default() -> Self {
        SndConfig {
            control: ControlConfig::default(),
            tx: TxConfig::default(),
            rx: RxConfig::default(),
            event: EventConfig::default(),
            query_on_init: true,
        }
    }
}

pub struct Snd {
    control: ControlEngine,
    tx: TxEngine,
    rx: RxEngine,
    events: EventDrain,
    listener: RwLock<Option<Arc<dyn SndListener>>>,
}

impl Snd {
    /// Brings the driver up on queues the device already accepted. The event
    /// queue is stocked before anything else so no notification is missed.
    pub fn new(
        queues: SndQueues,
        allocator: Arc<dyn DmaAllocator>,
        config: SndConfig,
    ) -> Result<Snd> {
        let control = ControlEngine::new(queues.control, allocator.clone(), config.control)?;
        let tx = TxEngine::new(queues.tx, allocator.clone(), config.tx)?;
        let rx = RxEngine::new(queues.rx, allocator.clone(), config.rx)?;
        let events = EventDrain::new(queues.event, allocator, config.event)?;
        events.post_all()?;

        let snd = Snd {
            control,
            tx,
            rx,
            events,
            listener: RwLock::new(None),
        };

        if config.query_on_init {
            if let Err(e) = snd.control.query_capabilities(StreamId::Playback) {
                warn!("snd: capability query failed, keeping baseline formats: {}", e);
            }
        }
        debug!("snd: device ready");
        Ok(snd)
    }

    pub fn id(&self) -> &str {
        defs::SND_DEV_ID
    }

    pub fn control(&self) -> &ControlEngine {
        &self.control
    }

    pub fn tx(&self) -> &TxEngine {
        &self.tx
    }

    pub fn rx(&self) -> &RxEngine {
        &self.rx
    }

    pub fn events(&self) -> &EventDrain {
        &self.events
    }

    pub fn jacks(&self) -> &Arc<JackTable> {
        self.events.jacks()
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn SndListener>>) {
        self.events.set_listener(listener.clone());
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    pub fn set_signal_hook(&self, hook: Option<SignalHook>) {
        self.events.set_signal_hook(hook);
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn SndListener>> {
        self.listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn stream(&self, id: StreamId) -> Stream {
        self.control.stream(id)
    }

    pub fn capabilities(&self, id: StreamId) -> Option<PcmCapabilities> {
        self.control.capabilities(id)
    }

    pub fn query_capabilities(&self, id: StreamId) -> Result<PcmInfo> {
        self.control.query_capabilities(id)
    }

    pub fn select_format(&self, id: StreamId, channels: u8, format: u8, rate: u8) -> Result<()> {
        self.control.select_format(id, channels, format, rate)
    }

    /// Sends SET_PARAMS and aligns the stream's transfers to the frame size
    /// of the format the device accepted.
    pub fn set_params(&self, id: StreamId, buffer_bytes: u32, period_bytes: u32) -> Result<()> {
        self.control.set_params(id, buffer_bytes, period_bytes)?;
        let frame_bytes = self
            .control
            .stream(id)
            .params
            .and_then(|params| params.format.frame_bytes())
            .ok_or(Error::UnsupportedFormat)?;
        match id {
            StreamId::Playback => self.tx.set_frame_bytes(frame_bytes),
            StreamId::Capture => self.rx.set_frame_bytes(frame_bytes),
        }
    }

    pub fn prepare(&self, id: StreamId) -> Result<()> {
        self.control.prepare(id)
    }

    pub fn start(&self, id: StreamId) -> Result<()> {
        self.control.start(id)
    }

    pub fn stop(&self, id: StreamId) -> Result<()> {
        self.control.stop(id)
    }

    pub fn release(&self, id: StreamId) -> Result<()> {
        self.control.release(id)
    }

    fn start_stream(
        &self,
        id: StreamId,
        buffer_bytes: u32,
        period_bytes: u32,
        max_period_bytes: usize,
    ) -> Result<()> {
        if period_bytes as usize > max_period_bytes {
            return Err(Error::InvalidParameter("period larger than a pool buffer"));
        }
        self.set_params(id, buffer_bytes, period_bytes)?;
        self.control.prepare(id)?;
        self.control.start(id)
    }

    /// Stops the stream if it runs, then releases it. Both commands are sent
    /// even if the first one fails.
    fn stop_stream(&self, id: StreamId) -> Result<()> {
        let stopped = match self.control.stop(id) {
            // Not running: nothing to stop.
            Err(Error::Stream(stream::Error::InvalidStateTransition(..))) => Ok(()),
            other => other,
        };
        let released = self.control.release(id);
        stopped.and(released)
    }

    /// Runs SET_PARAMS, PREPARE and START on the playback stream.
    pub fn start_playback(&self, buffer_bytes: u32, period_bytes: u32) -> Result<()> {
        self.start_stream(
            StreamId::Playback,
            buffer_bytes,
            period_bytes,
            self.tx.max_period_bytes(),
        )
    }

    pub fn stop_playback(&self) -> Result<()> {
        self.stop_stream(StreamId::Playback)
    }

    /// Runs SET_PARAMS, PREPARE and START on the capture stream.
    pub fn start_capture(&self, buffer_bytes: u32, period_bytes: u32) -> Result<()> {
        self.start_stream(
            StreamId::Capture,
            buffer_bytes,
            period_bytes,
            self.rx.max_period_bytes(),
        )
    }

    pub fn stop_capture(&self) -> Result<()> {
        self.stop_stream(StreamId::Capture)
    }

    /// Queues as much of `pcm` as the free pool buffers hold, one period per
    /// buffer. Trailing bytes that do not form a whole frame are left alone.
    pub fn write(&self, pcm: &[u8]) -> Result<usize> {
        let stream = self.control.stream(StreamId::Playback);
        stream.state.check_running()?;
        let frame_bytes = stream
            .params
            .and_then(|params| params.format.frame_bytes())
            .unwrap_or(self.tx.frame_bytes());

        self.tx.drain();

        let chunk = self.tx.max_period_bytes() / frame_bytes * frame_bytes;
        if chunk == 0 {
            return Err(Error::InvalidParameter("period shorter than a frame"));
        }
        let usable = pcm.len() / frame_bytes * frame_bytes;
        if usable == 0 {
            return Ok(0);
        }

        let mut written = 0;
        for period in pcm[..usable].chunks(chunk) {
            match self.tx.submit_period(Segment::Pcm(period), None, false) {
                Ok(()) => written += period.len(),
                Err(e) if e.is_resource_exhaustion() => break,
                Err(e) if written == 0 => return Err(e),
                Err(e) => {
                    warn!("snd: playback write stopped after {} bytes: {}", written, e);
                    break;
                }
            }
        }

        if written == 0 {
            return Err(Error::DeviceBusy);
        }
        trace!("snd: queued {} of {} playback bytes", written, pcm.len());
        Ok(written)
    }

    /// Queues the next period of the cyclic buffer `ring` and advances
    /// `pacer` once the device took it.
    pub fn play_period(&self, pacer: &mut RingPacer, ring: &[u8]) -> Result<PeriodSegments> {
        self.control
            .stream(StreamId::Playback)
            .state
            .check_running()?;

        let segments = pacer.peek();
        let (first, second) = segments
            .slices(ring)
            .ok_or(Error::InvalidParameter("ring shorter than the paced buffer"))?;
        self.tx.submit_period(Segment::Pcm(first), second, false)?;
        pacer.advance();
        Ok(segments)
    }

    /// Posts caller memory for the device to fill with captured audio.
    pub fn capture(&self, destination: &[SgSegment], cookie: u64) -> Result<()> {
        self.control
            .stream(StreamId::Capture)
            .state
            .check_running()?;
        self.rx.submit_sg(destination, cookie)
    }

    pub(crate) fn drain_rx(&self) -> usize {
        let listener = self.listener();
        self.rx.drain(|completion| {
            if let Some(listener) = &listener {
                listener.capture_complete(completion);
            }
        })
    }

    /// Processes every completion on every queue from caller context, for
    /// setups that run without interrupts.
    pub fn service(&self) -> usize {
        self.control.on_completion(ExecContext::Caller)
            + self.tx.drain()
            + self.drain_rx()
            + self.events.drain(true)
    }

    /// Cancels outstanding control requests and waits for their buffers.
    /// Pool memory goes back to the allocator when `Snd` is dropped.
    pub fn shutdown(&self) {
        debug!("snd: shutting down");
        self.control.uninit();
    }
}
