use serde::{Deserialize, Serialize};

/// NAL slice types present in an H.264 access unit, used by recorders to
/// detect keyframes without re-parsing the bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceType {
    I,
    P,
    B,
    Sps,
    Pps,
    Unknown,
}

/// MPEG-4 AudioSpecificConfig, decoded from the FLV AAC sequence header (or
/// synthesized by the transcoder when bridging Opus -> AAC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mpeg4AudioConfig {
    pub object_type: u8,
    pub sampling_frequency: u32,
    pub channel_config: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct H264Video {
    /// Annex-B NAL units, each prefixed with `00 00 00 01`. On I-frames this
    /// is preceded by a fresh SPS+PPS pair (see [SliceType::I] in `slice_types`).
    pub data: Vec<u8>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub slice_types: Vec<SliceType>,
    pub pts: i64,
    pub dts: i64,
    pub clock_rate: u32,
}

impl H264Video {
    pub fn is_keyframe(&self) -> bool {
        self.slice_types.contains(&SliceType::I)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AacAudio {
    /// Raw AAC, no ADTS framing.
    pub data: Vec<u8>,
    pub mpeg4_audio_config: Option<Mpeg4AudioConfig>,
    pub mpeg4_audio_config_bytes: Vec<u8>,
    pub sequence_header: bool,
    pub pts: i64,
    pub dts: i64,
    pub clock_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpusAudio {
    /// One Opus packet.
    pub data: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
    /// Always 48000.
    pub clock_rate: u32,
}

/// A single media unit flowing from an ingress to the hub and onward to
/// egress pipelines. Exactly one payload kind per frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    H264Video(H264Video),
    AacAudio(AacAudio),
    OpusAudio(OpusAudio),
}

impl Frame {
    /// `t * 1000 / rate`
    pub fn raw_millis(t: i64, rate: u32) -> i64 {
        t * 1000 / rate as i64
    }

    pub fn dts(&self) -> i64 {
        match self {
            Frame::H264Video(f) => f.dts,
            Frame::AacAudio(f) => f.dts,
            Frame::OpusAudio(f) => f.dts,
        }
    }

    pub fn pts(&self) -> i64 {
        match self {
            Frame::H264Video(f) => f.pts,
            Frame::AacAudio(f) => f.pts,
            Frame::OpusAudio(f) => f.pts,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Frame::H264Video(f) => f.clock_rate,
            Frame::AacAudio(f) => f.clock_rate,
            Frame::OpusAudio(f) => f.clock_rate,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Frame::H264Video(_))
    }
}

/// Media type + codec advertised by a [crate::hub::Source].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    H264,
    Aac,
    Opus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSpec {
    pub media_type: MediaType,
    pub codec: Codec,
    pub clock_rate: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_millis_converts_clock_domain_to_milliseconds() {
        assert_eq!(Frame::raw_millis(90_000, 90_000), 1_000);
        assert_eq!(Frame::raw_millis(48_000, 48_000), 1_000);
    }

    #[test]
    fn keyframe_detection_looks_at_slice_types() {
        let f = H264Video {
            data: vec![],
            sps: vec![],
            pps: vec![],
            slice_types: vec![SliceType::Sps, SliceType::Pps, SliceType::I],
            pts: 0,
            dts: 0,
            clock_rate: 90_000,
        };
        assert!(f.is_keyframe());
    }
}
