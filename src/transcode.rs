//! AAC <-> Opus transcoder bridge. One [Transcoder] handles a single
//! direction and is owned by exactly one egress pipeline; it is not
//! concurrency-safe.
//!
//! Output PTS is derived by accumulating `frame_size` samples onto a running
//! counter rather than rescaling input PTS, so output timing stays
//! monotonic and gap-free regardless of input jitter.

use crate::aac;
use crate::error::{RelayError, Result};
use crate::frame::{AacAudio, Frame, Mpeg4AudioConfig, OpusAudio};
use fdk_aac::dec::{Decoder as AacDecoder, Transport as AacTransport};
use fdk_aac::enc::{BitRate, Encoder as AacEncoder, EncoderParams, Transport as AacEncTransport};
use opus::{Application, Channels, Decoder as OpusDecoder, Encoder as OpusEncoder};
use std::collections::VecDeque;

const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_FRAME_SIZE: usize = 960; // 20ms @ 48kHz
const AAC_ENCODE_FRAME_SIZE: usize = 1024;
const CHANNELS: usize = 2;

/// Opus -> AAC config the transcoder hands the recorder once it starts
/// producing frames, since there's no in-band AAC sequence header here.
pub fn bridged_aac_config() -> Mpeg4AudioConfig {
    Mpeg4AudioConfig {
        object_type: 2, // AAC-LC
        sampling_frequency: OPUS_SAMPLE_RATE,
        channel_config: CHANNELS as u8,
    }
}

enum Inner {
    AacToOpus {
        decoder: AacDecoder,
        encoder: OpusEncoder,
    },
    OpusToAac {
        decoder: OpusDecoder,
        encoder: AacEncoder,
    },
}

pub struct Transcoder {
    inner: Inner,
    fifo: VecDeque<f32>,
    next_pts: i64,
}

impl Transcoder {
    pub fn new_aac_to_opus() -> Result<Self> {
        let decoder = AacDecoder::new(AacTransport::Adts);
        let encoder = OpusEncoder::new(OPUS_SAMPLE_RATE, Channels::Stereo, Application::Audio)
            .map_err(|e| RelayError::CodecInitFailure(e.to_string()))?;
        Ok(Self {
            inner: Inner::AacToOpus { decoder, encoder },
            fifo: VecDeque::new(),
            next_pts: 0,
        })
    }

    pub fn new_opus_to_aac() -> Result<Self> {
        let decoder = OpusDecoder::new(OPUS_SAMPLE_RATE, Channels::Stereo)
            .map_err(|e| RelayError::CodecInitFailure(e.to_string()))?;
        let encoder = AacEncoder::new(EncoderParams {
            bit_rate: BitRate::Cbr(64_000),
            sample_rate: OPUS_SAMPLE_RATE,
            transport: AacEncTransport::Raw,
        })
        .map_err(|e| RelayError::CodecInitFailure(format!("{e:?}")))?;
        Ok(Self {
            inner: Inner::OpusToAac { decoder, encoder },
            fifo: VecDeque::new(),
            next_pts: 0,
        })
    }

    /// Feeds one input frame, returning every output frame the bridge could
    /// assemble a full encoder frame for. May return zero, one, or several
    /// frames depending on how the sample FIFO filled up.
    pub fn process(&mut self, frame: &Frame) -> Result<Vec<Frame>> {
        match (&mut self.inner, frame) {
            (Inner::AacToOpus { decoder, encoder }, Frame::AacAudio(aac_frame)) => {
                if aac_frame.sequence_header {
                    return Ok(Vec::new());
                }
                let cfg = aac_frame
                    .mpeg4_audio_config
                    .clone()
                    .unwrap_or(Mpeg4AudioConfig {
                        object_type: 2,
                        sampling_frequency: aac_frame.clock_rate,
                        channel_config: CHANNELS as u8,
                    });
                let adts_header = aac::fill_adts_header(&cfg, aac_frame.data.len());
                let mut adts = Vec::with_capacity(7 + aac_frame.data.len());
                adts.extend_from_slice(&adts_header);
                adts.extend_from_slice(&aac_frame.data);

                let consumed = decoder
                    .fill(&adts)
                    .map_err(|e| RelayError::WriteFailure(format!("{e:?}")))?;
                if consumed < adts.len() {
                    return Ok(Vec::new());
                }
                let mut pcm = vec![0i16; 8192];
                loop {
                    match decoder.decode_frame(&mut pcm) {
                        Ok(()) => {
                            let decoded_len = decoder.decoded_frame_size();
                            self.fifo
                                .extend(pcm[..decoded_len].iter().map(|s| *s as f32 / i16::MAX as f32));
                        }
                        Err(_) => break,
                    }
                }
                encode_opus_frames(encoder, &mut self.fifo, &mut self.next_pts)
            }
            (Inner::OpusToAac { decoder, encoder }, Frame::OpusAudio(opus_frame)) => {
                let mut pcm = vec![0f32; 5760 * CHANNELS];
                let decoded_len = decoder
                    .decode_float(&opus_frame.data, &mut pcm, false)
                    .map_err(|e| RelayError::WriteFailure(e.to_string()))?;
                self.fifo
                    .extend(pcm[..decoded_len * CHANNELS].iter().copied());
                encode_aac_frames(encoder, &mut self.fifo, &mut self.next_pts)
            }
            _ => Ok(Vec::new()),
        }
    }
}

fn encode_opus_frames(
    encoder: &mut OpusEncoder,
    fifo: &mut VecDeque<f32>,
    next_pts: &mut i64,
) -> Result<Vec<Frame>> {
    let chunk_len = OPUS_FRAME_SIZE * CHANNELS;
    let mut out = Vec::new();
    while fifo.len() >= chunk_len {
        let chunk: Vec<f32> = fifo.drain(..chunk_len).collect();
        let mut buf = vec![0u8; 4000];
        let n = encoder
            .encode_float(&chunk, &mut buf)
            .map_err(|e| RelayError::WriteFailure(e.to_string()))?;
        buf.truncate(n);
        let pts = *next_pts;
        *next_pts += OPUS_FRAME_SIZE as i64;
        out.push(Frame::OpusAudio(OpusAudio {
            data: buf,
            pts,
            dts: pts,
            clock_rate: OPUS_SAMPLE_RATE,
        }));
    }
    Ok(out)
}

fn encode_aac_frames(
    encoder: &mut AacEncoder,
    fifo: &mut VecDeque<f32>,
    next_pts: &mut i64,
) -> Result<Vec<Frame>> {
    let chunk_len = AAC_ENCODE_FRAME_SIZE * CHANNELS;
    let mut out = Vec::new();
    let cfg = bridged_aac_config();
    while fifo.len() >= chunk_len {
        let chunk_f32: Vec<f32> = fifo.drain(..chunk_len).collect();
        let chunk_i16: Vec<i16> = chunk_f32
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .collect();
        let mut buf = vec![0u8; 4096];
        let info = encoder
            .encode(&chunk_i16, &mut buf)
            .map_err(|e| RelayError::WriteFailure(format!("{e:?}")))?;
        buf.truncate(info.output_size);
        let pts = *next_pts;
        *next_pts += AAC_ENCODE_FRAME_SIZE as i64;
        out.push(Frame::AacAudio(AacAudio {
            data: buf,
            mpeg4_audio_config: Some(cfg.clone()),
            mpeg4_audio_config_bytes: aac::encode_audio_specific_config(&cfg),
            sequence_header: false,
            pts,
            dts: pts,
            clock_rate: OPUS_SAMPLE_RATE,
        }));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridged_config_is_stereo_aac_lc_at_48khz() {
        let cfg = bridged_aac_config();
        assert_eq!(cfg.object_type, 2);
        assert_eq!(cfg.sampling_frequency, 48_000);
        assert_eq!(cfg.channel_config, 2);
    }
}
