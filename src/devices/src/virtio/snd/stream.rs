// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use thiserror::Error as ThisError;

use super::virtio_sound::*;
use super::wire::PcmInfo;

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid stream state transition from {0} to {1}")]
    InvalidStateTransition(StreamState, StreamState),
    #[error("Stream is not running, state is {0}")]
    NotRunning(StreamState),
    #[error("Invalid stream id: {0}")]
    InvalidStreamId(u32),
}

type Result<T> = std::result::Result<T, Error>;

/// The two streams every device exposes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum StreamId {
    Playback = 0,
    Capture = 1,
}

impl StreamId {
    pub const ALL: [StreamId; 2] = [StreamId::Playback, StreamId::Capture];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn direction(self) -> u8 {
        match self {
            StreamId::Playback => VIRTIO_SND_D_OUTPUT,
            StreamId::Capture => VIRTIO_SND_D_INPUT,
        }
    }

    /// Channel count preferred when the device allows it.
    pub fn natural_channels(self) -> u8 {
        match self {
            StreamId::Playback => 2,
            StreamId::Capture => 1,
        }
    }
}

impl TryFrom<u32> for StreamId {
    type Error = Error;

    fn try_from(val: u32) -> Result<Self> {
        match val {
            0 => Ok(StreamId::Playback),
            1 => Ok(StreamId::Capture),
            other => Err(Error::InvalidStreamId(other)),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum StreamState {
    #[default]
    Idle,
    ParamsSet,
    Prepared,
    Running,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            StreamState::Idle => write!(f, "VIRTIO_SND_PCM_STATE_IDLE"),
            StreamState::ParamsSet => write!(f, "VIRTIO_SND_PCM_STATE_PARAMS_SET"),
            StreamState::Prepared => write!(f, "VIRTIO_SND_PCM_STATE_PREPARED"),
            StreamState::Running => write!(f, "VIRTIO_SND_PCM_STATE_RUNNING"),
        }
    }
}

macro_rules! set_new_state {
    ($check_fn:ident, $new_state_fn:ident, $new_state:expr, $($valid_source_states:tt)*) => {
        pub fn $check_fn(&self) -> Result<()> {
            if !matches!(self, $($valid_source_states)*) {
                return Err(Error::InvalidStateTransition(*self, $new_state));
            }
            Ok(())
        }

        pub fn $new_state_fn(&mut self) -> Result<()> {
            self.$check_fn()?;
            *self = $new_state;
            Ok(())
        }
    };
}

impl StreamState {
    set_new_state!(
        check_set_parameters,
        set_parameters,
        Self::ParamsSet,
        Self::Idle | Self::ParamsSet
    );

    set_new_state!(
        check_prepare,
        prepare,
        Self::Prepared,
        Self::ParamsSet | Self::Prepared
    );

    set_new_state!(
        check_start,
        start,
        Self::Running,
        Self::Prepared | Self::Running
    );

    set_new_state!(check_stop, stop, Self::Prepared, Self::Running);

    /// Release is legal from every state.
    pub fn release(&mut self) {
        *self = Self::Idle;
    }

    pub fn check_running(&self) -> Result<()> {
        match self {
            Self::Running => Ok(()),
            other => Err(Error::NotRunning(*other)),
        }
    }
}

/// Channel count, format index and rate index of a stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PcmFormat {
    pub channels: u8,
    pub format: u8,
    pub rate: u8,
}

impl PcmFormat {
    /// 16-bit signed PCM at 48 kHz with the stream's natural channel count.
    pub fn baseline(stream: StreamId) -> Self {
        PcmFormat {
            channels: stream.natural_channels(),
            format: VIRTIO_SND_PCM_FMT_S16,
            rate: VIRTIO_SND_PCM_RATE_48000,
        }
    }

    pub fn frame_bytes(&self) -> Option<usize> {
        sample_bytes(self.format).map(|bytes| bytes * self.channels as usize)
    }

    pub fn is_known(&self) -> bool {
        self.channels > 0 && sample_bytes(self.format).is_some() && rate_hz(self.rate).is_some()
    }
}

impl std::fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}ch fmt {} @ {}Hz",
            self.channels,
            self.format,
            rate_hz(self.rate).unwrap_or(0)
        )
    }
}

/// Parameters accepted by the device with SET_PARAMS.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PcmParams {
    pub buffer_bytes: u32,
    pub period_bytes: u32,
    pub format: PcmFormat,
}

/// What the device advertised for one stream.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PcmCapabilities {
    pub formats: u64,
    pub rates: u64,
    pub channels_min: u8,
    pub channels_max: u8,
}

impl From<&PcmInfo> for PcmCapabilities {
    fn from(info: &PcmInfo) -> Self {
        PcmCapabilities {
            formats: info.formats,
            rates: info.rates,
            channels_min: info.channels_min,
            channels_max: info.channels_max,
        }
    }
}

impl PcmCapabilities {
    fn has_format(&self, format: u8) -> bool {
        format < 64 && self.formats & (1 << format) != 0
    }

    fn has_rate(&self, rate: u8) -> bool {
        rate < 64 && self.rates & (1 << rate) != 0
    }

    pub fn supports(&self, format: &PcmFormat) -> bool {
        self.has_format(format.format)
            && self.has_rate(format.rate)
            && (self.channels_min..=self.channels_max).contains(&format.channels)
    }
}

const FORMAT_PRIORITY: [u8; 5] = [
    VIRTIO_SND_PCM_FMT_S16,
    VIRTIO_SND_PCM_FMT_S24,
    VIRTIO_SND_PCM_FMT_S32,
    VIRTIO_SND_PCM_FMT_FLOAT,
    VIRTIO_SND_PCM_FMT_FLOAT64,
];

const PRIMARY_RATES: [u8; 2] = [VIRTIO_SND_PCM_RATE_48000, VIRTIO_SND_PCM_RATE_44100];

const SECONDARY_RATES: [u8; 12] = [
    VIRTIO_SND_PCM_RATE_96000,
    VIRTIO_SND_PCM_RATE_88200,
    VIRTIO_SND_PCM_RATE_192000,
    VIRTIO_SND_PCM_RATE_176400,
    VIRTIO_SND_PCM_RATE_64000,
    VIRTIO_SND_PCM_RATE_32000,
    VIRTIO_SND_PCM_RATE_22050,
    VIRTIO_SND_PCM_RATE_16000,
    VIRTIO_SND_PCM_RATE_11025,
    VIRTIO_SND_PCM_RATE_8000,
    VIRTIO_SND_PCM_RATE_384000,
    VIRTIO_SND_PCM_RATE_5512,
];

/// Picks the format a stream runs with, given what the device advertised.
///
/// The baseline wins when advertised. Otherwise every priority format is tried
/// at 48 kHz and 44.1 kHz before any of the remaining rates.
pub fn select_format(stream: StreamId, caps: &PcmCapabilities) -> Option<PcmFormat> {
    let natural = stream.natural_channels();
    let channels = if (caps.channels_min..=caps.channels_max).contains(&natural) {
        natural
    } else {
        caps.channels_min
    };
    if channels == 0 || caps.channels_min > caps.channels_max {
        return None;
    }

    let baseline = PcmFormat::baseline(stream);
    if caps.has_format(baseline.format) && caps.has_rate(baseline.rate) {
        return Some(PcmFormat {
            channels,
            ..baseline
        });
    }

    for rates in [&PRIMARY_RATES[..], &SECONDARY_RATES[..]] {
        for &format in FORMAT_PRIORITY.iter() {
            if !caps.has_format(format) {
                continue;
            }
            if let Some(&rate) = rates.iter().find(|&&rate| caps.has_rate(rate)) {
                return Some(PcmFormat {
                    channels,
                    format,
                    rate,
                });
            }
        }
    }
    None
}

/// Driver-side view of one stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Stream {
    pub id: StreamId,
    pub state: StreamState,
    /// Format the next SET_PARAMS will request.
    pub format: PcmFormat,
    /// Parameters accepted by the device, cleared on release.
    pub params: Option<PcmParams>,
    /// Capability cache, `None` until a capability query succeeds.
    pub caps: Option<PcmCapabilities>,
}

impl Stream {
    pub fn new(id: StreamId) -> Self {
        Stream {
            id,
            state: StreamState::default(),
            format: PcmFormat::baseline(id),
            params: None,
            caps: None,
        }
    }
}
