//! MP4 recorder: one fragmented-free `.mp4` file per stream, split on
//! a keyframe once `split_interval_ms` has elapsed. AAC frames carry a
//! synthesized ADTS header even inside the container, reusing the same
//! ADTS filler as the HLS path rather than keeping a second raw-AAC code
//! path.

use crate::aac;
use crate::frame::{Frame, H264Video, Mpeg4AudioConfig};
use crate::h264::split_annex_b_nalus;
use crate::hub::Hub;
use crate::transcode::Transcoder;
use anyhow::Result;
use bytes::Bytes;
use log::{info, warn};
use mp4::{
    AacConfig, AacProfile, AvcConfig, ChannelConfig, MediaConfig, Mp4Config, Mp4Sample, Mp4Writer,
    SampleFreqIndex, TrackConfig, TrackType,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How often the recorder rotates to a new file, measured against incoming
/// video DTS rather than wall clock.
const DEFAULT_SPLIT_INTERVAL_MS: i64 = 60_000;

const VIDEO_TIMESCALE: u32 = 90_000;
const AUDIO_TIMESCALE: u32 = 48_000;

// ADTS framing assumes 1024 samples/frame (AAC-LC default).

/// AVCDecoderConfigurationRecord dimensions aren't parsed from SPS anywhere
/// in this crate; the container only needs *a* tkhd width/height, not the
/// true display size, so this placeholder is carried in every track.
const PLACEHOLDER_WIDTH: u16 = 1920;
const PLACEHOLDER_HEIGHT: u16 = 1080;

struct Mp4Recorder {
    writer: Mp4Writer<File>,
    video_track_id: Option<u32>,
    audio_track_id: Option<u32>,
    sps: Vec<u8>,
    pps: Vec<u8>,
    last_split_time: i64,
}

impl Mp4Recorder {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let config = Mp4Config {
            major_brand: str::parse("isom")?,
            minor_version: 0,
            compatible_brands: vec![str::parse("isom")?, str::parse("iso2")?, str::parse("avc1")?, str::parse("mp41")?],
            timescale: 1000,
        };
        let writer = Mp4Writer::write_start(file, &config)?;
        Ok(Self {
            writer,
            video_track_id: None,
            audio_track_id: None,
            sps: Vec::new(),
            pps: Vec::new(),
            last_split_time: 0,
        })
    }

    fn write_video(&mut self, video: &H264Video) -> Result<()> {
        if !video.sps.is_empty() {
            self.sps = video.sps.clone();
        }
        if !video.pps.is_empty() {
            self.pps = video.pps.clone();
        }
        if self.video_track_id.is_none() {
            if self.sps.is_empty() || self.pps.is_empty() {
                return Ok(());
            }
            let track_id = self.writer.add_track(&TrackConfig {
                track_type: TrackType::Video,
                timescale: VIDEO_TIMESCALE,
                language: "und".to_string(),
                media_conf: MediaConfig::AvcConfig(AvcConfig {
                    width: PLACEHOLDER_WIDTH,
                    height: PLACEHOLDER_HEIGHT,
                    seq_param_set: self.sps.clone(),
                    pic_param_set: self.pps.clone(),
                }),
            })?;
            self.video_track_id = Some(track_id);
        }
        let Some(track_id) = self.video_track_id else {
            return Ok(());
        };
        // mp4 samples are bare NAL units (length-prefixed internally by the
        // writer), not Annex-B; strip the start codes this crate uses
        // internally for RTP/HLS.
        let mut payload = Vec::with_capacity(video.data.len());
        for nal in split_annex_b_nalus(&video.data) {
            payload.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            payload.extend_from_slice(nal);
        }
        self.writer.write_sample(
            track_id,
            &Mp4Sample {
                start_time: (video.dts - self.last_split_time).max(0) as u64,
                duration: 0,
                rendering_offset: (video.pts - video.dts) as i32,
                is_sync: video.is_keyframe(),
                bytes: Bytes::from(payload),
            },
        )?;
        Ok(())
    }

    fn write_audio(&mut self, data: &[u8], cfg: &Mpeg4AudioConfig, pts: i64, dts: i64) -> Result<()> {
        if self.audio_track_id.is_none() {
            let track_id = self.writer.add_track(&TrackConfig {
                track_type: TrackType::Audio,
                timescale: AUDIO_TIMESCALE,
                language: "und".to_string(),
                media_conf: MediaConfig::AacConfig(AacConfig {
                    bitrate: 128_000,
                    profile: AacProfile::Lc,
                    freq_index: freq_index_for(cfg.sampling_frequency),
                    chan_conf: if cfg.channel_config == 1 {
                        ChannelConfig::Mono
                    } else {
                        ChannelConfig::Stereo
                    },
                }),
            })?;
            self.audio_track_id = Some(track_id);
        }
        let Some(track_id) = self.audio_track_id else {
            return Ok(());
        };
        let adts = aac::fill_adts_header(cfg, data.len());
        let mut payload = Vec::with_capacity(7 + data.len());
        payload.extend_from_slice(&adts);
        payload.extend_from_slice(data);
        self.writer.write_sample(
            track_id,
            &Mp4Sample {
                start_time: (dts - self.last_split_time).max(0) as u64,
                duration: 0,
                rendering_offset: (pts - dts) as i32,
                is_sync: true,
                bytes: Bytes::from(payload),
            },
        )?;
        Ok(())
    }

    fn finish(mut self) {
        if let Err(e) = self.writer.write_end() {
            warn!("mp4 write_end failed: {e}");
        }
    }
}

fn freq_index_for(rate: u32) -> SampleFreqIndex {
    match rate {
        96_000 => SampleFreqIndex::Freq96000,
        88_200 => SampleFreqIndex::Freq88200,
        64_000 => SampleFreqIndex::Freq64000,
        48_000 => SampleFreqIndex::Freq48000,
        44_100 => SampleFreqIndex::Freq44100,
        32_000 => SampleFreqIndex::Freq32000,
        24_000 => SampleFreqIndex::Freq24000,
        22_050 => SampleFreqIndex::Freq22050,
        16_000 => SampleFreqIndex::Freq16000,
        12_000 => SampleFreqIndex::Freq12000,
        11_025 => SampleFreqIndex::Freq11025,
        8_000 => SampleFreqIndex::Freq8000,
        _ => SampleFreqIndex::Freq48000,
    }
}

fn file_path(out_dir: &Path, stream_id: &str) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    out_dir.join("videos").join(format!("{stream_id}_{timestamp}.mp4"))
}

/// Drives one stream's MP4 recording: subscribes to `hub`, rotates files on
/// the next keyframe once `split_interval` has elapsed since the last split,
/// and transcodes Opus sources to AAC via [Transcoder] since this container
/// only carries AAC.
pub async fn run(hub: Arc<Hub>, stream_id: String, out_dir: PathBuf, split_interval: Option<Duration>) {
    let split_interval_ms = split_interval.unwrap_or(Duration::from_millis(DEFAULT_SPLIT_INTERVAL_MS as u64)).as_millis() as i64;

    let dir = out_dir.join("videos");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!("failed to create mp4 output dir for {stream_id}: {e}");
        return;
    }

    let mut rx = hub.subscribe(&stream_id).await;
    let mut recorder = match Mp4Recorder::create(&file_path(&out_dir, &stream_id)) {
        Ok(r) => r,
        Err(e) => {
            warn!("failed to start mp4 recorder for {stream_id}: {e}");
            return;
        }
    };
    let mut split_pending = false;
    let mut bridge: Option<Transcoder> = None;

    info!("mp4 recording started for {stream_id}");

    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::H264Video(video) => {
                if !split_pending && video.dts - recorder.last_split_time >= split_interval_ms {
                    split_pending = true;
                }
                if split_pending && video.is_keyframe() {
                    recorder.finish();
                    match Mp4Recorder::create(&file_path(&out_dir, &stream_id)) {
                        Ok(mut fresh) => {
                            fresh.last_split_time = video.dts;
                            recorder = fresh;
                        }
                        Err(e) => {
                            warn!("failed to split mp4 file for {stream_id}: {e}");
                            return;
                        }
                    }
                    split_pending = false;
                }
                if let Err(e) = recorder.write_video(&video) {
                    warn!("mp4 write_video failed for {stream_id}: {e}");
                }
            }
            Frame::AacAudio(aac) => {
                if aac.sequence_header || aac.data.is_empty() {
                    continue;
                }
                let Some(cfg) = &aac.mpeg4_audio_config else {
                    continue;
                };
                if let Err(e) = recorder.write_audio(&aac.data, cfg, aac.pts, aac.dts) {
                    warn!("mp4 write_audio failed for {stream_id}: {e}");
                }
            }
            Frame::OpusAudio(opus) => {
                if bridge.is_none() {
                    match Transcoder::new_opus_to_aac() {
                        Ok(t) => bridge = Some(t),
                        Err(e) => {
                            warn!("mp4 opus->aac bridge init failed for {stream_id}: {e}");
                            continue;
                        }
                    }
                }
                let Some(bridge) = bridge.as_mut() else {
                    continue;
                };
                match bridge.process(&Frame::OpusAudio(opus)) {
                    Ok(aac_frames) => {
                        for f in aac_frames {
                            if let Frame::AacAudio(aac) = f {
                                if let Some(cfg) = &aac.mpeg4_audio_config {
                                    if let Err(e) = recorder.write_audio(&aac.data, cfg, aac.pts, aac.dts) {
                                        warn!("mp4 write_audio failed for {stream_id}: {e}");
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => warn!("mp4 opus->aac bridge failed for {stream_id}: {e}"),
                }
            }
        }
    }

    recorder.finish();
    info!("mp4 recording ended for {stream_id}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freq_index_maps_common_rates() {
        assert!(matches!(freq_index_for(48_000), SampleFreqIndex::Freq48000));
        assert!(matches!(freq_index_for(44_100), SampleFreqIndex::Freq44100));
        assert!(matches!(freq_index_for(1), SampleFreqIndex::Freq48000));
    }
}
