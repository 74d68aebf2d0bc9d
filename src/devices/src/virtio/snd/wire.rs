//! Encoders and decoders for the fixed little-endian virtio-snd structures.
//!
//! Every structure is built byte by byte so the layout never depends on how
//! the compiler arranges a Rust struct. Decoders return `None` on short input.

use super::virtio_sound::{
    VIRTIO_SND_EVENT_SIZE, VIRTIO_SND_HDR_SIZE, VIRTIO_SND_PCM_HDR_SIZE, VIRTIO_SND_PCM_INFO_SIZE,
    VIRTIO_SND_PCM_SET_PARAMS_SIZE, VIRTIO_SND_PCM_STATUS_SIZE, VIRTIO_SND_PCM_XFER_SIZE,
    VIRTIO_SND_QUERY_INFO_SIZE, VIRTIO_SND_R_PCM_INFO, VIRTIO_SND_R_PCM_SET_PARAMS,
};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SetParams {
    pub stream_id: u32,
    pub buffer_bytes: u32,
    pub period_bytes: u32,
    pub features: u32,
    pub channels: u8,
    pub format: u8,
    pub rate: u8,
}

/// One entry of a PCM_INFO response.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PcmInfo {
    pub hda_fn_nid: u32,
    pub features: u32,
    pub formats: u64,
    pub rates: u64,
    pub direction: u8,
    pub channels_min: u8,
    pub channels_max: u8,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PcmStatus {
    pub status: u32,
    pub latency_bytes: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Event {
    pub kind: u32,
    pub data: u32,
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn get_u64(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

pub fn encode_query_info(start_id: u32, count: u32) -> [u8; VIRTIO_SND_QUERY_INFO_SIZE] {
    let mut buf = [0u8; VIRTIO_SND_QUERY_INFO_SIZE];
    put_u32(&mut buf, 0, VIRTIO_SND_R_PCM_INFO);
    put_u32(&mut buf, 4, start_id);
    put_u32(&mut buf, 8, count);
    buf
}

pub fn encode_set_params(params: &SetParams) -> [u8; VIRTIO_SND_PCM_SET_PARAMS_SIZE] {
    let mut buf = [0u8; VIRTIO_SND_PCM_SET_PARAMS_SIZE];
    put_u32(&mut buf, 0, VIRTIO_SND_R_PCM_SET_PARAMS);
    put_u32(&mut buf, 4, params.stream_id);
    put_u32(&mut buf, 8, params.buffer_bytes);
    put_u32(&mut buf, 12, params.period_bytes);
    put_u32(&mut buf, 16, params.features);
    buf[20] = params.channels;
    buf[21] = params.format;
    buf[22] = params.rate;
    buf
}

pub fn decode_set_params(buf: &[u8]) -> Option<SetParams> {
    if buf.len() < VIRTIO_SND_PCM_SET_PARAMS_SIZE || get_u32(buf, 0)? != VIRTIO_SND_R_PCM_SET_PARAMS
    {
        return None;
    }
    Some(SetParams {
        stream_id: get_u32(buf, 4)?,
        buffer_bytes: get_u32(buf, 8)?,
        period_bytes: get_u32(buf, 12)?,
        features: get_u32(buf, 16)?,
        channels: buf[20],
        format: buf[21],
        rate: buf[22],
    })
}

/// PREPARE, RELEASE, START and STOP share this layout.
pub fn encode_pcm_command(code: u32, stream_id: u32) -> [u8; VIRTIO_SND_PCM_HDR_SIZE] {
    let mut buf = [0u8; VIRTIO_SND_PCM_HDR_SIZE];
    put_u32(&mut buf, 0, code);
    put_u32(&mut buf, 4, stream_id);
    buf
}

pub fn encode_xfer_header(stream_id: u32) -> [u8; VIRTIO_SND_PCM_XFER_SIZE] {
    let mut buf = [0u8; VIRTIO_SND_PCM_XFER_SIZE];
    put_u32(&mut buf, 0, stream_id);
    buf
}

/// Leading status word of a control response, or the request code of a request.
pub fn decode_status(buf: &[u8]) -> Option<u32> {
    if buf.len() < VIRTIO_SND_HDR_SIZE {
        return None;
    }
    get_u32(buf, 0)
}

pub fn encode_status(status: u32) -> [u8; VIRTIO_SND_HDR_SIZE] {
    status.to_le_bytes()
}

pub fn encode_pcm_info(info: &PcmInfo) -> [u8; VIRTIO_SND_PCM_INFO_SIZE] {
    let mut buf = [0u8; VIRTIO_SND_PCM_INFO_SIZE];
    put_u32(&mut buf, 0, info.hda_fn_nid);
    put_u32(&mut buf, 4, info.features);
    put_u64(&mut buf, 8, info.formats);
    put_u64(&mut buf, 16, info.rates);
    buf[24] = info.direction;
    buf[25] = info.channels_min;
    buf[26] = info.channels_max;
    buf
}

pub fn decode_pcm_info(buf: &[u8]) -> Option<PcmInfo> {
    if buf.len() < VIRTIO_SND_PCM_INFO_SIZE {
        return None;
    }
    Some(PcmInfo {
        hda_fn_nid: get_u32(buf, 0)?,
        features: get_u32(buf, 4)?,
        formats: get_u64(buf, 8)?,
        rates: get_u64(buf, 16)?,
        direction: buf[24],
        channels_min: buf[25],
        channels_max: buf[26],
    })
}

pub fn encode_pcm_status(status: &PcmStatus) -> [u8; VIRTIO_SND_PCM_STATUS_SIZE] {
    let mut buf = [0u8; VIRTIO_SND_PCM_STATUS_SIZE];
    put_u32(&mut buf, 0, status.status);
    put_u32(&mut buf, 4, status.latency_bytes);
    buf
}

pub fn decode_pcm_status(buf: &[u8]) -> Option<PcmStatus> {
    if buf.len() < VIRTIO_SND_PCM_STATUS_SIZE {
        return None;
    }
    Some(PcmStatus {
        status: get_u32(buf, 0)?,
        latency_bytes: get_u32(buf, 4)?,
    })
}

pub fn encode_event(kind: u32, data: u32) -> [u8; VIRTIO_SND_EVENT_SIZE] {
    let mut buf = [0u8; VIRTIO_SND_EVENT_SIZE];
    put_u32(&mut buf, 0, kind);
    put_u32(&mut buf, 4, data);
    buf
}

pub fn decode_event(buf: &[u8]) -> Option<Event> {
    if buf.len() < VIRTIO_SND_EVENT_SIZE {
        return None;
    }
    Some(Event {
        kind: get_u32(buf, 0)?,
        data: get_u32(buf, 4)?,
    })
}
