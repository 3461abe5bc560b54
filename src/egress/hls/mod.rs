//! HLS egress: lazy per-stream muxer construction, keyed `(streamID,
//! variantName)` registry for the HTTP handler, and a choice of two
//! hand-rolled container backends selected by `service.llhls` — MPEG-TS
//! (see [ts]) or Low-Latency fMP4 (see [fmp4]). No general container
//! library backs either; both write PES/TS or ISO-BMFF boxes directly.

mod fmp4;
mod segment;
mod ts;

use crate::aac;
use crate::frame::{AacAudio, Codec, Frame, H264Video};
use crate::hub::Hub;
use crate::transcode::Transcoder;
use anyhow::Result;
use fmp4::FragSample;
use log::{info, warn};
use m3u8_rs::{ExtTag, MediaSegment, MediaSegmentType, PartInf, Part, PreloadHint};
use segment::SegmentWriter;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use ts::ContinuityCounters;

/// Same placeholder used by the MP4 recorder: no SPS parsing in this
/// pipeline, and the fMP4 `avc1` sample entry only needs *a* width/height.
const PLACEHOLDER_WIDTH: u16 = 1920;
const PLACEHOLDER_HEIGHT: u16 = 1080;

/// How many parts the fMP4 playlist keeps in its sliding window. At
/// [fmp4::PART_DURATION_MS] each this is a ~6s live edge, comparable to the
/// MPEG-TS path's `SEGMENT_DURATION * PLAYLIST_WINDOW`.
const FMP4_PLAYLIST_WINDOW: usize = 12;

/// Placeholder `BANDWIDTH` for the master playlist variant. The original
/// implementation hard-codes this with no actual throughput measurement;
/// carried over rather than inventing a measurement path.
const PLACEHOLDER_BANDWIDTH: u64 = 33_033;

const VARIANT_NAME: &str = "pass";

/// Registry of HLS muxers keyed by `(streamID, variantName)`, resolved by
/// the HTTP router for playlist/segment serving.
#[derive(Default)]
pub struct HlsHub {
    muxers: RwLock<HashMap<(String, String), Arc<RwLock<HlsMuxer>>>>,
}

impl HlsHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn store(&self, stream_id: &str, muxer: HlsMuxer) -> Arc<RwLock<HlsMuxer>> {
        let handle = Arc::new(RwLock::new(muxer));
        self.muxers
            .write()
            .await
            .insert((stream_id.to_string(), VARIANT_NAME.to_string()), handle.clone());
        handle
    }

    pub async fn get(&self, stream_id: &str, variant: &str) -> Option<Arc<RwLock<HlsMuxer>>> {
        self.muxers
            .read()
            .await
            .get(&(stream_id.to_string(), variant.to_string()))
            .cloned()
    }

    pub async fn remove(&self, stream_id: &str) {
        self.muxers.write().await.remove(&(stream_id.to_string(), VARIANT_NAME.to_string()));
    }

    /// Writes the one-variant master playlist for `stream_id`.
    pub async fn write_master_playlist(&self, stream_id: &str, out_dir: &PathBuf) -> Result<()> {
        std::fs::create_dir_all(out_dir)?;
        let mut pl = m3u8_rs::MasterPlaylist::default();
        pl.version = Some(3);
        pl.variants = vec![m3u8_rs::VariantStream {
            is_i_frame: false,
            uri: format!("{VARIANT_NAME}/index.m3u8"),
            bandwidth: PLACEHOLDER_BANDWIDTH,
            average_bandwidth: None,
            codecs: Some("avc1.42e01f,mp4a.40.2".to_string()),
            resolution: None,
            frame_rate: None,
            hdcp_level: None,
            audio: None,
            video: None,
            subtitles: None,
            closed_captions: None,
            other_attributes: None,
        }];
        let mut f = std::fs::File::create(out_dir.join("master.m3u8"))?;
        pl.write_to(&mut f)?;
        Ok(())
    }
}

/// Backend-specific muxer state. MPEG-TS is self-describing per packet, so
/// its rotation only needs the segment writer and continuity counters;
/// fMP4 needs SPS/PPS and the AAC config up front to build `init.mp4`
/// before any fragment can be written, so it buffers samples until both are
/// known.
enum Backend {
    Ts {
        writer: SegmentWriter,
        counters: ContinuityCounters,
        video_pes_cc: u8,
        audio_pes_cc: u8,
    },
    Fmp4(Box<Fmp4State>),
}

struct Fmp4State {
    out_dir: PathBuf,
    init_written: bool,
    sps: Vec<u8>,
    pps: Vec<u8>,
    sample_rate: u32,
    channels: u8,
    audio_cfg_bytes: Vec<u8>,
    next_index: u64,
    media_sequence: u64,
    segments: Vec<u64>,
    sequence_number: u32,
    part_start_dts: Option<i64>,
    video_base_decode_time: u64,
    audio_base_decode_time: u64,
    video_samples: Vec<FragSample>,
    audio_samples: Vec<FragSample>,
    last_keyframe_in_part: bool,
    last_video_dts: Option<i64>,
}

impl Fmp4State {
    fn new(out_dir: PathBuf, sample_rate: u32, channels: u8) -> Self {
        Self {
            out_dir,
            init_written: false,
            sps: Vec::new(),
            pps: Vec::new(),
            sample_rate,
            channels,
            audio_cfg_bytes: Vec::new(),
            next_index: 0,
            media_sequence: 0,
            segments: Vec::new(),
            sequence_number: 1,
            part_start_dts: None,
            video_base_decode_time: 0,
            audio_base_decode_time: 0,
            video_samples: Vec::new(),
            audio_samples: Vec::new(),
            last_keyframe_in_part: false,
            last_video_dts: None,
        }
    }

    fn ready(&self) -> bool {
        !self.sps.is_empty() && !self.pps.is_empty() && !self.audio_cfg_bytes.is_empty()
    }

    fn write_init_if_needed(&mut self) -> Result<()> {
        if self.init_written || !self.ready() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.out_dir)?;
        let init = fmp4::build_init_segment(
            &self.sps,
            &self.pps,
            PLACEHOLDER_WIDTH,
            PLACEHOLDER_HEIGHT,
            self.sample_rate,
            self.channels,
            &self.audio_cfg_bytes,
        );
        File::create(self.out_dir.join("init.mp4"))?.write_all(&init)?;
        self.init_written = true;
        Ok(())
    }

    fn part_name(index: u64) -> String {
        format!("part{index}.m4s")
    }

    fn flush_part(&mut self) -> Result<()> {
        if self.video_samples.is_empty() && self.audio_samples.is_empty() {
            return Ok(());
        }
        let fragment = fmp4::build_fragment(
            self.sequence_number,
            self.video_base_decode_time,
            &self.video_samples,
            self.audio_base_decode_time,
            &self.audio_samples,
        );
        self.sequence_number += 1;
        let index = self.next_index;
        self.next_index += 1;
        let path = self.out_dir.join(Self::part_name(index));
        File::create(path)?.write_all(&fragment)?;

        self.video_base_decode_time += self
            .video_samples
            .iter()
            .map(|s| s.duration as u64)
            .sum::<u64>();
        self.audio_base_decode_time += self
            .audio_samples
            .iter()
            .map(|s| s.duration as u64)
            .sum::<u64>();
        self.video_samples.clear();
        self.audio_samples.clear();

        self.segments.push(index);
        if self.segments.len() > FMP4_PLAYLIST_WINDOW {
            self.segments.remove(0);
            self.media_sequence += 1;
        }
        self.write_playlist()?;
        Ok(())
    }

    fn write_playlist(&self) -> Result<()> {
        let mut pl = m3u8_rs::MediaPlaylist::default();
        pl.version = Some(6);
        let part_target = fmp4::PART_DURATION_MS as f32 / 1000.0;
        pl.target_duration = part_target.ceil().max(1.0);
        pl.media_sequence = self.media_sequence;
        pl.end_list = false;
        pl.part_inf = Some(PartInf {
            part_target: part_target as f64,
        });
        pl.unknown_tags.push(ExtTag {
            tag: "X-MAP".to_string(),
            rest: Some("URI=\"init.mp4\"".to_string()),
        });
        pl.segments = self
            .segments
            .iter()
            .map(|idx| {
                MediaSegmentType::Full(MediaSegment {
                    uri: Self::part_name(*idx),
                    duration: part_target,
                    ..MediaSegment::default()
                })
            })
            .collect();
        if let Some(&last) = self.segments.last() {
            pl.segments.push(MediaSegmentType::Partial(Part {
                uri: Self::part_name(last),
                duration: part_target as f64,
                independent: self.last_keyframe_in_part,
                gap: false,
                byte_range: None,
            }));
            pl.segments.push(MediaSegmentType::PreloadHint(PreloadHint {
                hint_type: "PART".to_string(),
                uri: Self::part_name(last + 1),
                byte_range_start: None,
                byte_range_length: None,
            }));
        }

        let mut f = File::create(self.out_dir.join("index.m3u8"))?;
        pl.write_to(&mut f)?;
        Ok(())
    }
}

pub struct HlsMuxer {
    backend: Backend,
    has_audio: bool,
}

impl HlsMuxer {
    fn new(out_dir: PathBuf, has_audio: bool, llhls: bool, audio_sample_rate: u32, audio_channels: u8) -> Result<Self> {
        let backend = if llhls {
            Backend::Fmp4(Box::new(Fmp4State::new(out_dir, audio_sample_rate, audio_channels)))
        } else {
            Backend::Ts {
                writer: SegmentWriter::new(out_dir)?,
                counters: ContinuityCounters::default(),
                video_pes_cc: 0,
                audio_pes_cc: 0,
            }
        };
        Ok(Self { backend, has_audio })
    }

    fn write_video(&mut self, video: &H264Video) -> Result<()> {
        match &mut self.backend {
            Backend::Ts {
                writer,
                counters,
                video_pes_cc,
                ..
            } => {
                if video.is_keyframe() && writer.should_rotate() {
                    let mut pat_pmt = Vec::new();
                    ts::write_pat(&mut pat_pmt, counters);
                    ts::write_pmt(&mut pat_pmt, counters, self.has_audio);
                    writer.rotate(&pat_pmt)?;
                    writer.write_playlist()?;
                }
                // `video.data` is already Annex-B; write it through as one PES payload.
                let mut out = Vec::new();
                ts::write_pes(&mut out, ts::VIDEO_PID, video_pes_cc, &video.data, video.pts, Some(video.dts), video.is_keyframe());
                writer.write(&out)
            }
            Backend::Fmp4(state) => {
                if !video.sps.is_empty() {
                    state.sps = video.sps.clone();
                }
                if !video.pps.is_empty() {
                    state.pps = video.pps.clone();
                }
                state.write_init_if_needed()?;
                if !state.init_written {
                    return Ok(());
                }
                let part_due = match state.part_start_dts {
                    Some(start) => video.dts - start >= fmp4::PART_DURATION_MS,
                    None => true,
                };
                if video.is_keyframe() && part_due {
                    state.flush_part()?;
                    state.part_start_dts = Some(video.dts);
                    state.last_keyframe_in_part = false;
                }
                state.last_keyframe_in_part = state.last_keyframe_in_part || video.is_keyframe();
                // trun needs a duration per sample; approximate it as the gap
                // since the previous frame rather than waiting on the next one.
                let prev_dts = state.last_video_dts.unwrap_or(video.dts);
                state.last_video_dts = Some(video.dts);
                state.video_samples.push(FragSample {
                    data: fmp4::video_sample_payload(&video.data),
                    duration: ((video.dts - prev_dts).max(0) as u32).max(1),
                    keyframe: video.is_keyframe(),
                    composition_offset: (video.pts - video.dts) as i32,
                });
                Ok(())
            }
        }
    }

    fn write_audio(&mut self, aac: &AacAudio) -> Result<()> {
        if aac.sequence_header {
            return Ok(());
        }
        let cfg = match &aac.mpeg4_audio_config {
            Some(c) => c,
            None => return Ok(()),
        };
        match &mut self.backend {
            Backend::Ts { writer, audio_pes_cc, .. } => {
                let adts_header = aac::fill_adts_header(cfg, aac.data.len());
                let mut payload = Vec::with_capacity(7 + aac.data.len());
                payload.extend_from_slice(&adts_header);
                payload.extend_from_slice(&aac.data);
                let mut out = Vec::new();
                ts::write_pes(&mut out, ts::AUDIO_PID, audio_pes_cc, &payload, aac.pts, None, false);
                writer.write(&out)
            }
            Backend::Fmp4(state) => {
                if state.audio_cfg_bytes.is_empty() {
                    state.audio_cfg_bytes = aac::encode_audio_specific_config(cfg);
                }
                state.write_init_if_needed()?;
                if !state.init_written {
                    return Ok(());
                }
                state.audio_samples.push(FragSample {
                    data: fmp4::audio_sample_payload(&aac.data, cfg),
                    duration: 1024,
                    keyframe: true,
                    composition_offset: 0,
                });
                Ok(())
            }
        }
    }
}

/// Drives one stream's HLS egress: subscribes to `hub`, lazily builds the
/// muxer on the first audio frame carrying `MPEG4AudioConfigBytes`, and
/// writes every subsequent frame through it. If `audio_codec` is Opus, the
/// AAC bridge is instantiated up front rather than on first frame, since
/// there's no other way to discover its AAC extradata before that muxer can
/// be built.
pub async fn run(hub: Arc<Hub>, hls_hub: Arc<HlsHub>, stream_id: String, out_dir: PathBuf, audio_codec: Codec, llhls: bool) {
    let mut rx = hub.subscribe(&stream_id).await;
    let mut handle: Option<Arc<RwLock<HlsMuxer>>> = None;
    let mut bridge = if audio_codec == Codec::Opus {
        match Transcoder::new_opus_to_aac() {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("hls opus->aac bridge init failed for {stream_id}: {e}");
                None
            }
        }
    } else {
        None
    };

    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::H264Video(video) => {
                if let Some(h) = &handle {
                    if let Err(e) = h.write().await.write_video(&video) {
                        warn!("hls write_video failed for {stream_id}: {e}");
                    }
                }
            }
            Frame::AacAudio(aac) => {
                write_aac(&hls_hub, &out_dir, &stream_id, &mut handle, &aac, llhls).await;
            }
            Frame::OpusAudio(opus) => {
                let Some(b) = bridge.as_mut() else {
                    continue;
                };
                match b.process(&Frame::OpusAudio(opus)) {
                    Ok(aac_frames) => {
                        for f in aac_frames {
                            if let Frame::AacAudio(aac) = f {
                                write_aac(&hls_hub, &out_dir, &stream_id, &mut handle, &aac, llhls).await;
                            }
                        }
                    }
                    Err(e) => warn!("hls opus->aac bridge failed for {stream_id}: {e}"),
                }
            }
        }
    }
    hls_hub.remove(&stream_id).await;
    info!("hls egress ended for {stream_id}");
}

/// Builds the muxer on the first call carrying `MPEG4AudioConfig` bytes,
/// then writes `aac` through it. Shared by the native-AAC and bridged-Opus
/// paths so muxer construction happens exactly once regardless of source
/// codec.
async fn write_aac(
    hls_hub: &Arc<HlsHub>,
    out_dir: &PathBuf,
    stream_id: &str,
    handle: &mut Option<Arc<RwLock<HlsMuxer>>>,
    aac: &AacAudio,
    llhls: bool,
) {
    if aac.sequence_header {
        return;
    }
    if handle.is_none() {
        if aac.mpeg4_audio_config_bytes.is_empty() && aac.mpeg4_audio_config.is_none() {
            return;
        }
        let stream_dir = out_dir.join(stream_id);
        let (sample_rate, channels) = aac
            .mpeg4_audio_config
            .as_ref()
            .map(|c| (c.sampling_frequency, c.channel_config))
            .unwrap_or((48_000, 2));
        match HlsMuxer::new(stream_dir.join(VARIANT_NAME), true, llhls, sample_rate, channels) {
            Ok(m) => {
                if let Err(e) = hls_hub.write_master_playlist(stream_id, &stream_dir).await {
                    warn!("failed to write hls master playlist for {stream_id}: {e}");
                }
                info!("hls egress started for {stream_id}: view at /hls/{stream_id}/master.m3u8");
                *handle = Some(hls_hub.store(stream_id, m).await);
            }
            Err(e) => {
                warn!("failed to start hls muxer for {stream_id}: {e}");
                return;
            }
        }
    }
    if let Some(h) = handle.as_ref() {
        if let Err(e) = h.write().await.write_audio(aac) {
            warn!("hls write_audio failed for {stream_id}: {e}");
        }
    }
}
