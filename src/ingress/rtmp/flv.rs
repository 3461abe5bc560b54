//! FLV AudioTag/VideoTag body parsing.
//!
//! `rml_rtmp` hands us the AudioData/VideoData payload directly (the chunk
//! body for audio/video RTMP messages is byte-for-byte the FLV tag body,
//! minus the 11-byte FLV tag envelope) — we only need to parse the tag body,
//! not a full FLV container.

use anyhow::{bail, Result};

pub const SOUND_FORMAT_AAC: u8 = 10;
pub const CODEC_ID_AVC: u8 = 7;

#[derive(Debug, PartialEq, Eq)]
pub enum AacPacketType {
    SequenceHeader,
    Raw,
}

pub struct AudioTag<'a> {
    pub sound_format: u8,
    pub sound_rate: u8,
    pub aac_packet_type: Option<AacPacketType>,
    pub payload: &'a [u8],
}

/// Maps the 2-bit FLV `SoundRate` field to Hz. Only meaningful for non-AAC
/// formats; AAC always reports index 3 (44kHz) here and carries its real
/// rate in the AudioSpecificConfig.
pub fn flv_sound_rate_hz(sound_rate: u8) -> u32 {
    match sound_rate {
        0 => 5_500,
        1 => 11_000,
        2 => 22_000,
        _ => 44_000,
    }
}

pub fn decode_audio_tag(data: &[u8]) -> Result<AudioTag<'_>> {
    if data.is_empty() {
        bail!("empty audio tag");
    }
    let flags = data[0];
    let sound_format = flags >> 4;
    let sound_rate = (flags >> 2) & 0x3;

    if sound_format != SOUND_FORMAT_AAC {
        return Ok(AudioTag {
            sound_format,
            sound_rate,
            aac_packet_type: None,
            payload: &data[1..],
        });
    }

    if data.len() < 2 {
        bail!("truncated AAC audio tag");
    }
    let aac_packet_type = match data[1] {
        0 => AacPacketType::SequenceHeader,
        _ => AacPacketType::Raw,
    };
    Ok(AudioTag {
        sound_format,
        sound_rate,
        aac_packet_type: Some(aac_packet_type),
        payload: &data[2..],
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum AvcPacketType {
    SequenceHeader,
    Nalu,
    EndOfSequence,
}

pub struct VideoTag<'a> {
    pub codec_id: u8,
    pub avc_packet_type: Option<AvcPacketType>,
    /// Signed 24-bit composition time offset, in milliseconds.
    pub composition_time: i32,
    pub payload: &'a [u8],
}

pub fn decode_video_tag(data: &[u8]) -> Result<VideoTag<'_>> {
    if data.is_empty() {
        bail!("empty video tag");
    }
    let codec_id = data[0] & 0x0f;
    if codec_id != CODEC_ID_AVC {
        return Ok(VideoTag {
            codec_id,
            avc_packet_type: None,
            composition_time: 0,
            payload: &data[1..],
        });
    }
    if data.len() < 5 {
        bail!("truncated AVC video tag");
    }
    let avc_packet_type = match data[1] {
        0 => AvcPacketType::SequenceHeader,
        1 => AvcPacketType::Nalu,
        _ => AvcPacketType::EndOfSequence,
    };
    let raw = [data[2], data[3], data[4]];
    let composition_time = sign_extend_24(raw);
    Ok(VideoTag {
        codec_id,
        avc_packet_type: Some(avc_packet_type),
        composition_time,
        payload: &data[5..],
    })
}

fn sign_extend_24(raw: [u8; 3]) -> i32 {
    let unsigned = ((raw[0] as u32) << 16) | ((raw[1] as u32) << 8) | raw[2] as u32;
    if unsigned & 0x800000 != 0 {
        (unsigned | 0xff000000) as i32
    } else {
        unsigned as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_aac_sequence_header_tag() {
        let data = [0xAF, 0x00, 0x12, 0x08];
        let tag = decode_audio_tag(&data).unwrap();
        assert_eq!(tag.sound_format, SOUND_FORMAT_AAC);
        assert_eq!(tag.aac_packet_type, Some(AacPacketType::SequenceHeader));
        assert_eq!(tag.payload, &[0x12, 0x08]);
    }

    #[test]
    fn decodes_avc_nalu_tag_with_composition_time() {
        let mut data = vec![0x17, 0x01, 0x00, 0x00, 0x0a];
        data.extend_from_slice(&[0xde, 0xad]);
        let tag = decode_video_tag(&data).unwrap();
        assert_eq!(tag.avc_packet_type, Some(AvcPacketType::Nalu));
        assert_eq!(tag.composition_time, 10);
        assert_eq!(tag.payload, &[0xde, 0xad]);
    }

    #[test]
    fn negative_composition_time_sign_extends() {
        let data = vec![0x17, 0x01, 0xff, 0xff, 0xf6];
        let tag = decode_video_tag(&data).unwrap();
        assert_eq!(tag.composition_time, -10);
    }
}
