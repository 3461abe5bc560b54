//! MPEG-4 AudioSpecificConfig parsing and ADTS header synthesis.
//!
//! The FLV AAC sequence header carries a raw AudioSpecificConfig with no
//! ADTS framing; recorders need ADTS, so we synthesize a 7-byte header on
//! write instead of storing one on ingress (mirrors the original handler,
//! which keeps `MPEG4AudioConfig` and fills ADTS headers lazily per muxer).

use crate::frame::Mpeg4AudioConfig;
use anyhow::{bail, Result};

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

pub fn parse_audio_specific_config(data: &[u8]) -> Result<Mpeg4AudioConfig> {
    if data.len() < 2 {
        bail!("AudioSpecificConfig too short");
    }
    let mut reader = BitReader::new(data);
    let object_type = reader.read_bits(5).ok_or_else(|| anyhow::anyhow!("eof"))? as u8;
    let freq_index = reader.read_bits(4).ok_or_else(|| anyhow::anyhow!("eof"))? as usize;
    let sampling_frequency = if freq_index == 0xf {
        reader.read_bits(24).ok_or_else(|| anyhow::anyhow!("eof"))?
    } else {
        *SAMPLE_RATES
            .get(freq_index)
            .ok_or_else(|| anyhow::anyhow!("invalid sampling frequency index"))?
    };
    let channel_config = reader.read_bits(4).ok_or_else(|| anyhow::anyhow!("eof"))? as u8;
    Ok(Mpeg4AudioConfig {
        object_type,
        sampling_frequency,
        channel_config,
    })
}

/// Re-encodes a [Mpeg4AudioConfig] as a 2-byte AudioSpecificConfig, as used
/// when the transcoder bridge needs to hand a recorder its own config bytes
/// (e.g. after bridging Opus -> AAC).
pub fn encode_audio_specific_config(cfg: &Mpeg4AudioConfig) -> Vec<u8> {
    let freq_index = SAMPLE_RATES
        .iter()
        .position(|&r| r == cfg.sampling_frequency)
        .unwrap_or(3) as u8; // default to 48000 if not an exact table match
    let b0 = (cfg.object_type << 3) | (freq_index >> 1);
    let b1 = (freq_index << 7) | (cfg.channel_config << 3);
    vec![b0, b1]
}

/// Fills a 7-byte ADTS header (no CRC) for one AAC frame of `payload_len`
/// bytes (header included in the frame-length field), assuming 1024 samples
/// per frame.
pub fn fill_adts_header(cfg: &Mpeg4AudioConfig, payload_len: usize) -> [u8; 7] {
    let freq_index = SAMPLE_RATES
        .iter()
        .position(|&r| r == cfg.sampling_frequency)
        .unwrap_or(3) as u32;
    let profile = cfg.object_type.saturating_sub(1) as u32;
    let frame_length = (payload_len + 7) as u32;

    let mut header = [0u8; 7];
    header[0] = 0xFF;
    header[1] = 0xF1;
    header[2] = ((profile & 0x3) << 6) as u8
        | ((freq_index & 0xf) << 2) as u8
        | (((cfg.channel_config as u32 >> 2) & 0x1) << 1) as u8;
    header[3] = (((cfg.channel_config as u32 & 0x3) << 6) as u8)
        | ((frame_length >> 11) & 0x3) as u8;
    header[4] = ((frame_length >> 3) & 0xff) as u8;
    header[5] = (((frame_length & 0x7) << 5) as u8) | 0x1f;
    header[6] = 0xfc;
    header
}

struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    fn read_bits(&mut self, n: usize) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..n {
            let byte = self.bit_pos / 8;
            if byte >= self.data.len() {
                return None;
            }
            let shift = 7 - (self.bit_pos % 8);
            let bit = (self.data[byte] >> shift) & 1;
            value = (value << 1) | bit as u32;
            self.bit_pos += 1;
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stereo_44khz_lc_aac_config() {
        // object_type=2 (AAC LC), freq_index=4 (44100), channel_config=2 (stereo)
        // bits: 00010 0100 0010 000000 -> bytes 0x12 0x08
        let cfg = parse_audio_specific_config(&[0x12, 0x08]).unwrap();
        assert_eq!(cfg.object_type, 2);
        assert_eq!(cfg.sampling_frequency, 44100);
        assert_eq!(cfg.channel_config, 2);
    }

    #[test]
    fn adts_header_has_correct_sync_and_frame_length() {
        let cfg = Mpeg4AudioConfig {
            object_type: 2,
            sampling_frequency: 44100,
            channel_config: 2,
        };
        let header = fill_adts_header(&cfg, 100);
        assert_eq!(header[0], 0xFF);
        assert_eq!(header[1] & 0xF0, 0xF0);
        let frame_length =
            (((header[3] & 0x3) as u32) << 11) | ((header[4] as u32) << 3) | ((header[5] as u32) >> 5);
        assert_eq!(frame_length, 107);
    }
}
