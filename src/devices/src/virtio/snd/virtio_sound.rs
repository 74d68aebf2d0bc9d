// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

// Control request codes.
pub const VIRTIO_SND_R_PCM_INFO: u32 = 0x0100;
pub const VIRTIO_SND_R_PCM_SET_PARAMS: u32 = 0x0101;
pub const VIRTIO_SND_R_PCM_PREPARE: u32 = 0x0102;
pub const VIRTIO_SND_R_PCM_RELEASE: u32 = 0x0103;
pub const VIRTIO_SND_R_PCM_START: u32 = 0x0104;
pub const VIRTIO_SND_R_PCM_STOP: u32 = 0x0105;

// Event types.
pub const VIRTIO_SND_EVT_JACK_CONNECTED: u32 = 0x1000;
pub const VIRTIO_SND_EVT_JACK_DISCONNECTED: u32 = 0x1001;
pub const VIRTIO_SND_EVT_PCM_PERIOD_ELAPSED: u32 = 0x1100;
pub const VIRTIO_SND_EVT_PCM_XRUN: u32 = 0x1101;

// Status codes.
pub const VIRTIO_SND_S_OK: u32 = 0;
pub const VIRTIO_SND_S_BAD_MSG: u32 = 1;
pub const VIRTIO_SND_S_NOT_SUPP: u32 = 2;
pub const VIRTIO_SND_S_IO_ERR: u32 = 3;

/// Status pre-set in a posted buffer so an untouched status is never read as OK.
pub const VIRTIO_SND_S_UNSET: u32 = 0xFFFF_FFFF;

// Stream directions.
pub const VIRTIO_SND_D_OUTPUT: u8 = 0;
pub const VIRTIO_SND_D_INPUT: u8 = 1;

// PCM formats.
pub const VIRTIO_SND_PCM_FMT_IMA_ADPCM: u8 = 0;
pub const VIRTIO_SND_PCM_FMT_MU_LAW: u8 = 1;
pub const VIRTIO_SND_PCM_FMT_A_LAW: u8 = 2;
pub const VIRTIO_SND_PCM_FMT_S8: u8 = 3;
pub const VIRTIO_SND_PCM_FMT_U8: u8 = 4;
pub const VIRTIO_SND_PCM_FMT_S16: u8 = 5;
pub const VIRTIO_SND_PCM_FMT_U16: u8 = 6;
pub const VIRTIO_SND_PCM_FMT_S18_3: u8 = 7;
pub const VIRTIO_SND_PCM_FMT_U18_3: u8 = 8;
pub const VIRTIO_SND_PCM_FMT_S20_3: u8 = 9;
pub const VIRTIO_SND_PCM_FMT_U20_3: u8 = 10;
pub const VIRTIO_SND_PCM_FMT_S24_3: u8 = 11;
pub const VIRTIO_SND_PCM_FMT_U24_3: u8 = 12;
pub const VIRTIO_SND_PCM_FMT_S20: u8 = 13;
pub const VIRTIO_SND_PCM_FMT_U20: u8 = 14;
pub const VIRTIO_SND_PCM_FMT_S24: u8 = 15;
pub const VIRTIO_SND_PCM_FMT_U24: u8 = 16;
pub const VIRTIO_SND_PCM_FMT_S32: u8 = 17;
pub const VIRTIO_SND_PCM_FMT_U32: u8 = 18;
pub const VIRTIO_SND_PCM_FMT_FLOAT: u8 = 19;
pub const VIRTIO_SND_PCM_FMT_FLOAT64: u8 = 20;

// PCM frame rates.
pub const VIRTIO_SND_PCM_RATE_5512: u8 = 0;
pub const VIRTIO_SND_PCM_RATE_8000: u8 = 1;
pub const VIRTIO_SND_PCM_RATE_11025: u8 = 2;
pub const VIRTIO_SND_PCM_RATE_16000: u8 = 3;
pub const VIRTIO_SND_PCM_RATE_22050: u8 = 4;
pub const VIRTIO_SND_PCM_RATE_32000: u8 = 5;
pub const VIRTIO_SND_PCM_RATE_44100: u8 = 6;
pub const VIRTIO_SND_PCM_RATE_48000: u8 = 7;
pub const VIRTIO_SND_PCM_RATE_64000: u8 = 8;
pub const VIRTIO_SND_PCM_RATE_88200: u8 = 9;
pub const VIRTIO_SND_PCM_RATE_96000: u8 = 10;
pub const VIRTIO_SND_PCM_RATE_176400: u8 = 11;
pub const VIRTIO_SND_PCM_RATE_192000: u8 = 12;
pub const VIRTIO_SND_PCM_RATE_384000: u8 = 13;

// Wire structure sizes.
pub const VIRTIO_SND_HDR_SIZE: usize = 4;
pub const VIRTIO_SND_QUERY_INFO_SIZE: usize = 12;
pub const VIRTIO_SND_PCM_HDR_SIZE: usize = 8;
pub const VIRTIO_SND_PCM_SET_PARAMS_SIZE: usize = 24;
pub const VIRTIO_SND_PCM_INFO_SIZE: usize = 32;
pub const VIRTIO_SND_PCM_XFER_SIZE: usize = 8;
pub const VIRTIO_SND_PCM_STATUS_SIZE: usize = 8;
pub const VIRTIO_SND_EVENT_SIZE: usize = 8;

/// Bytes per sample as laid out in memory, `None` for compressed or unknown formats.
pub fn sample_bytes(format: u8) -> Option<usize> {
    match format {
        VIRTIO_SND_PCM_FMT_MU_LAW
        | VIRTIO_SND_PCM_FMT_A_LAW
        | VIRTIO_SND_PCM_FMT_S8
        | VIRTIO_SND_PCM_FMT_U8 => Some(1),
        VIRTIO_SND_PCM_FMT_S16 | VIRTIO_SND_PCM_FMT_U16 => Some(2),
        VIRTIO_SND_PCM_FMT_S18_3
        | VIRTIO_SND_PCM_FMT_U18_3
        | VIRTIO_SND_PCM_FMT_S20_3
        | VIRTIO_SND_PCM_FMT_U20_3
        | VIRTIO_SND_PCM_FMT_S24_3
        | VIRTIO_SND_PCM_FMT_U24_3 => Some(3),
        VIRTIO_SND_PCM_FMT_S20
        | VIRTIO_SND_PCM_FMT_U20
        | VIRTIO_SND_PCM_FMT_S24
        | VIRTIO_SND_PCM_FMT_U24
        | VIRTIO_SND_PCM_FMT_S32
        | VIRTIO_SND_PCM_FMT_U32
        | VIRTIO_SND_PCM_FMT_FLOAT => Some(4),
        VIRTIO_SND_PCM_FMT_FLOAT64 => Some(8),
        _ => None,
    }
}

pub fn rate_hz(rate: u8) -> Option<u32> {
    Some(match rate {
        VIRTIO_SND_PCM_RATE_5512 => 5512,
        VIRTIO_SND_PCM_RATE_8000 => 8000,
        VIRTIO_SND_PCM_RATE_11025 => 11025,
        VIRTIO_SND_PCM_RATE_16000 => 16000,
        VIRTIO_SND_PCM_RATE_22050 => 22050,
        VIRTIO_SND_PCM_RATE_32000 => 32000,
        VIRTIO_SND_PCM_RATE_44100 => 44100,
        VIRTIO_SND_PCM_RATE_48000 => 48000,
        VIRTIO_SND_PCM_RATE_64000 => 64000,
        VIRTIO_SND_PCM_RATE_88200 => 88200,
        VIRTIO_SND_PCM_RATE_96000 => 96000,
        VIRTIO_SND_PCM_RATE_176400 => 176400,
        VIRTIO_SND_PCM_RATE_192000 => 192000,
        VIRTIO_SND_PCM_RATE_384000 => 384000,
        _ => return None,
    })
}
