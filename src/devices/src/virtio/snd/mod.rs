use std::io::Error as IoError;
use std::sync::{Mutex, MutexGuard, PoisonError};

mod control;
mod device;
mod event;
mod event_handler;
pub mod jack;
mod notify;
pub mod pacer;
mod pool;
mod rx;
pub mod stream;
mod tx;
pub mod virtio_sound;
pub mod wire;

#[cfg(test)]
mod test_utils;

use thiserror::Error as ThisError;

pub use self::control::{ControlConfig, ControlEngine, ControlStats};
pub use self::defs::uapi::VIRTIO_ID_SND as TYPE_SND;
pub use self::device::{Snd, SndConfig, SndQueues};
pub use self::event::{EventConfig, EventDrain, EventStats};
pub use self::jack::JackTable;
pub use self::notify::{SignalHook, SndListener};
pub use self::pacer::{PeriodSegments, RingPacer};
pub use self::pool::{SgSegment, TransferStats};
pub use self::rx::{RxCompletion, RxConfig, RxEngine, RxStats};
pub use self::stream::{PcmCapabilities, PcmFormat, PcmParams, Stream, StreamId, StreamState};
pub use self::tx::{Segment, TxConfig, TxEngine, TxStats};

use self::virtio_sound::{
    VIRTIO_SND_R_PCM_INFO, VIRTIO_SND_R_PCM_PREPARE, VIRTIO_SND_R_PCM_RELEASE,
    VIRTIO_SND_R_PCM_SET_PARAMS, VIRTIO_SND_R_PCM_START, VIRTIO_SND_R_PCM_STOP,
    VIRTIO_SND_S_BAD_MSG, VIRTIO_SND_S_IO_ERR, VIRTIO_SND_S_NOT_SUPP, VIRTIO_SND_S_OK,
};
use super::dma::DmaError;
use super::queue::QueueError;

mod defs {
    use std::time::Duration;

    pub const SND_DEV_ID: &str = "virtio_snd";

    // Virtqueues.
    pub const CTL_INDEX: usize = 0;
    pub const EVT_INDEX: usize = 1;
    pub const TXQ_INDEX: usize = 2;
    pub const RXQ_INDEX: usize = 3;
    pub const NUM_QUEUES: usize = 4;

    /// Hard ceiling for the payload of a single TX or RX transfer.
    pub const MAX_PCM_XFER_BYTES: usize = 256 * 1024;
    /// Hard ceiling for the cyclic buffer negotiated with SET_PARAMS.
    pub const MAX_BUFFER_BYTES: usize = 4 * 1024 * 1024;
    pub const MAX_SG_SEGMENTS: usize = 16;
    pub const MAX_CONTROL_MSG_BYTES: usize = 4096;

    pub const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(10);
    pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

    pub const TX_POOL_SIZE: usize = 64;
    pub const RX_POOL_SIZE: usize = 16;
    pub const DEFAULT_PERIOD_BYTES: usize = 8192;

    pub const EVENT_BUFFERS: usize = 16;
    pub const EVENT_BUFFER_SIZE: usize = 64;
    pub const EVENT_JACKS: usize = 8;

    pub mod uapi {
        pub const VIRTIO_ID_SND: u32 = 25;
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Custom error types
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Stream error: {0}")]
    Stream(stream::Error),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("Control request timed out")]
    Timeout,
    #[error("Device returned {0}")]
    DeviceStatus(DeviceStatus),
    #[error("Malformed completion, used length {0}")]
    MalformedResponse(u32),
    #[error("Engine latched a fatal device status")]
    Fatal,
    #[error("No free pool buffer")]
    NoFreeBuffer,
    #[error("Queue error: {0}")]
    Queue(QueueError),
    #[error("DMA error: {0}")]
    Dma(DmaError),
    #[error("Control request canceled")]
    Canceled,
    #[error("Control engine is shutting down")]
    ShuttingDown,
    #[error("Device advertises no usable format for stream {0:?}")]
    NoSupportedFormat(StreamId),
    #[error("Format not advertised by the device")]
    UnsupportedFormat,
    #[error("Device busy, nothing queued")]
    DeviceBusy,
    #[error("Failed to spawn release worker: {0}")]
    WorkerSpawn(IoError),
}

impl Error {
    /// Errors after which the device will never accept the same request.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Fatal | Error::MalformedResponse(_) => true,
            Error::DeviceStatus(status) => status.is_fatal(),
            _ => false,
        }
    }

    /// Errors caused by caller pacing rather than by the device or protocol.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            Error::NoFreeBuffer | Error::DeviceBusy | Error::Queue(QueueError::Full)
        )
    }
}

impl From<stream::Error> for Error {
    fn from(val: stream::Error) -> Self {
        Self::Stream(val)
    }
}

impl From<QueueError> for Error {
    fn from(val: QueueError) -> Self {
        Self::Queue(val)
    }
}

impl From<DmaError> for Error {
    fn from(val: DmaError) -> Self {
        Self::Dma(val)
    }
}

/// A non-OK status word written by the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceStatus {
    BadMsg,
    NotSupp,
    IoErr,
    Unknown(u32),
}

impl DeviceStatus {
    /// Classifies a raw status word. `None` means OK.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            VIRTIO_SND_S_OK => None,
            VIRTIO_SND_S_BAD_MSG => Some(Self::BadMsg),
            VIRTIO_SND_S_NOT_SUPP => Some(Self::NotSupp),
            VIRTIO_SND_S_IO_ERR => Some(Self::IoErr),
            other => Some(Self::Unknown(other)),
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, Self::BadMsg | Self::NotSupp)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::BadMsg => write!(fmt, "VIRTIO_SND_S_BAD_MSG"),
            Self::NotSupp => write!(fmt, "VIRTIO_SND_S_NOT_SUPP"),
            Self::IoErr => write!(fmt, "VIRTIO_SND_S_IO_ERR"),
            Self::Unknown(code) => write!(fmt, "unknown status {:#x}", code),
        }
    }
}

/// The context a driver entry point runs in.
///
/// `Caller` may block and poll. `Completion` is where queue interrupts are
/// delivered: it must never block and may run concurrently with callers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecContext {
    Caller,
    Completion,
}

#[derive(Debug)]
pub struct InvalidControlMessage(u32);

impl std::fmt::Display for InvalidControlMessage {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "Invalid control message code {}", self.0)
    }
}

impl std::error::Error for InvalidControlMessage {}

#[derive(Copy, Debug, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum ControlMessageKind {
    PcmInfo = 0x0100,
    PcmSetParams = 0x0101,
    PcmPrepare = 0x0102,
    PcmRelease = 0x0103,
    PcmStart = 0x0104,
    PcmStop = 0x0105,
}

impl TryFrom<u32> for ControlMessageKind {
    type Error = InvalidControlMessage;

    fn try_from(val: u32) -> std::result::Result<Self, Self::Error> {
        Ok(match val {
            VIRTIO_SND_R_PCM_INFO => Self::PcmInfo,
            VIRTIO_SND_R_PCM_SET_PARAMS => Self::PcmSetParams,
            VIRTIO_SND_R_PCM_PREPARE => Self::PcmPrepare,
            VIRTIO_SND_R_PCM_RELEASE => Self::PcmRelease,
            VIRTIO_SND_R_PCM_START => Self::PcmStart,
            VIRTIO_SND_R_PCM_STOP => Self::PcmStop,
            other => return Err(InvalidControlMessage(other)),
        })
    }
}

/// Locks a mutex, recovering the data from a poisoned lock. Every structure
/// guarded in this module is left consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
