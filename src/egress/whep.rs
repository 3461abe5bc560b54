//! WHEP egress: pre-negotiated local tracks, hand-rolled RTP
//! packetization, and DTS-ordered A/V interleave on write.

use crate::frame::{Codec, Frame, MediaSpec, MediaType};
use crate::h264::split_annex_b_nalus;
use crate::hub::Hub;
use crate::transcode::Transcoder;
use anyhow::Result;
use bytes::Bytes;
use log::{info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::packetizer::Payloader;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

const VIDEO_MTU: usize = 1400;
const VIDEO_PAYLOAD_TYPE: u8 = 96;
const AUDIO_PAYLOAD_TYPE: u8 = 111;

/// Pre-negotiated local tracks for one stream, created lazily by [run] on
/// its first real frame and resolved by the HTTP offer handler.
pub struct WhepTracks {
    pub video: Arc<TrackLocalStaticRTP>,
    pub audio: Arc<TrackLocalStaticRTP>,
}

impl WhepTracks {
    fn new(stream_id: &str) -> Self {
        let video = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_id.to_owned(),
        ));
        let audio = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.to_owned(),
        ));
        Self { video, audio }
    }
}

/// Registry of pre-negotiated tracks, keyed by `streamID`.
#[derive(Default)]
pub struct WhepHub {
    tracks: RwLock<HashMap<String, Arc<WhepTracks>>>,
}

impl WhepHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn get_or_create(&self, stream_id: &str) -> Arc<WhepTracks> {
        if let Some(t) = self.tracks.read().await.get(stream_id) {
            return t.clone();
        }
        let mut tracks = self.tracks.write().await;
        tracks
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(WhepTracks::new(stream_id)))
            .clone()
    }

    pub async fn get(&self, stream_id: &str) -> Option<Arc<WhepTracks>> {
        self.tracks.read().await.get(stream_id).cloned()
    }

    async fn remove(&self, stream_id: &str) {
        self.tracks.write().await.remove(stream_id);
    }
}

struct QueuedPacket {
    dts: i64,
    packet: webrtc::rtp::packet::Packet,
}

/// Drains both queues by source DTS (earlier first), stopping once either
/// queue is empty so in-order arrivals on the lagging track are never
/// reordered against what's already been written.
async fn drain_interleaved(
    video_q: &mut VecDeque<QueuedPacket>,
    audio_q: &mut VecDeque<QueuedPacket>,
    video_track: &TrackLocalStaticRTP,
    audio_track: &TrackLocalStaticRTP,
) {
    while !video_q.is_empty() && !audio_q.is_empty() {
        let write_video = video_q.front().unwrap().dts <= audio_q.front().unwrap().dts;
        let queued = if write_video {
            video_q.pop_front().unwrap()
        } else {
            audio_q.pop_front().unwrap()
        };
        let track = if write_video { video_track } else { audio_track };
        if let Err(e) = track.write_rtp(&queued.packet).await {
            warn!("whep write_rtp failed: {e}");
        }
    }
}

/// Packetizes one Annex-B H.264 access unit into RTP packets tagged with
/// its source DTS.
fn packetize_h264(
    payloader: &mut H264Payloader,
    seq: &mut u16,
    data: &[u8],
    dts: i64,
) -> Vec<QueuedPacket> {
    let nalus = split_annex_b_nalus(data);
    let mut out = Vec::new();
    let nalu_count = nalus.len();
    for (nalu_idx, nalu) in nalus.into_iter().enumerate() {
        let Ok(chunks) = payloader.payload(VIDEO_MTU, &Bytes::copy_from_slice(nalu)) else {
            continue;
        };
        let chunk_count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let marker = nalu_idx + 1 == nalu_count && i + 1 == chunk_count;
            let packet = webrtc::rtp::packet::Packet {
                header: webrtc::rtp::header::Header {
                    version: 2,
                    marker,
                    payload_type: VIDEO_PAYLOAD_TYPE,
                    sequence_number: *seq,
                    timestamp: dts as u32,
                    ssrc: 0,
                    ..Default::default()
                },
                payload: chunk,
            };
            *seq = seq.wrapping_add(1);
            out.push(QueuedPacket { dts, packet });
        }
    }
    out
}

/// One Opus frame fits one RTP packet with no fragmentation (RFC 7587).
fn packetize_opus(seq: &mut u16, data: &[u8], dts: i64) -> QueuedPacket {
    let packet = webrtc::rtp::packet::Packet {
        header: webrtc::rtp::header::Header {
            version: 2,
            marker: true,
            payload_type: AUDIO_PAYLOAD_TYPE,
            sequence_number: *seq,
            timestamp: dts as u32,
            ssrc: 0,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(data),
    };
    *seq = seq.wrapping_add(1);
    QueuedPacket { dts, packet }
}

/// Drives one stream's WHEP egress: subscribes to `hub`, packetizes H.264
/// and Opus into the pre-negotiated tracks, bridging AAC to Opus via [C6]
/// when the source publishes AAC instead.
///
/// [C6]: crate::transcode::Transcoder
pub async fn run(hub: Arc<Hub>, whep_hub: Arc<WhepHub>, stream_id: String, media_specs: Vec<MediaSpec>) {
    let tracks = whep_hub.get_or_create(&stream_id).await;
    let has_audio = media_specs.iter().any(|s| s.media_type == MediaType::Audio);
    let needs_bridge = media_specs
        .iter()
        .any(|s| s.media_type == MediaType::Audio && s.codec == Codec::Aac);

    let mut rx = hub.subscribe(&stream_id).await;
    let mut h264_payloader = H264Payloader::default();
    let mut video_seq: u16 = 0;
    let mut audio_seq: u16 = 0;
    let mut video_q: VecDeque<QueuedPacket> = VecDeque::new();
    let mut audio_q: VecDeque<QueuedPacket> = VecDeque::new();
    let mut bridge = if needs_bridge {
        match Transcoder::new_aac_to_opus() {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("whep transcoder init failed for {stream_id}: {e}");
                None
            }
        }
    } else {
        None
    };

    info!("whep egress started for {stream_id}");

    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::H264Video(video) => {
                let packets = packetize_h264(&mut h264_payloader, &mut video_seq, &video.data, video.dts);
                video_q.extend(packets);
            }
            Frame::AacAudio(aac) => {
                if aac.sequence_header {
                    continue;
                }
                let Some(bridge) = bridge.as_mut() else {
                    continue;
                };
                match bridge.process(&Frame::AacAudio(aac)) {
                    Ok(opus_frames) => {
                        for f in opus_frames {
                            if let Frame::OpusAudio(opus) = f {
                                audio_q.push_back(packetize_opus(&mut audio_seq, &opus.data, opus.dts));
                            }
                        }
                    }
                    Err(e) => warn!("whep aac->opus bridge failed for {stream_id}: {e}"),
                }
            }
            Frame::OpusAudio(opus) => {
                audio_q.push_back(packetize_opus(&mut audio_seq, &opus.data, opus.dts));
            }
        }

        if has_audio {
            drain_interleaved(&mut video_q, &mut audio_q, &tracks.video, &tracks.audio).await;
        } else {
            while let Some(p) = video_q.pop_front() {
                if let Err(e) = tracks.video.write_rtp(&p.packet).await {
                    warn!("whep write_rtp failed: {e}");
                }
            }
        }
    }

    whep_hub.remove(&stream_id).await;
    info!("whep egress ended for {stream_id}");
}

/// Accepts a WHEP SDP offer for `stream_id`: resolves its pre-negotiated
/// tracks, adds them as senders on a fresh peer connection, and returns the
/// SDP answer.
pub async fn handle_offer(whep_hub: Arc<WhepHub>, stream_id: String, offer_sdp: String) -> Result<String> {
    let tracks = whep_hub
        .get(&stream_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("no active tracks for stream {stream_id}"))?;

    let mut media_engine = MediaEngine::default();
    register_codecs(&mut media_engine)?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = api.new_peer_connection(RTCConfiguration::default()).await?;
    pc.add_track(tracks.video.clone() as Arc<dyn TrackLocal + Send + Sync>).await?;
    pc.add_track(tracks.audio.clone() as Arc<dyn TrackLocal + Send + Sync>).await?;

    let offer = RTCSessionDescription::offer(offer_sdp)?;
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer(None).await?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    let local_desc = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow::anyhow!("missing local description after gathering"))?;
    Ok(local_desc.sdp)
}

/// Registers H.264 and Opus at the fixed payload types [packetize_h264] and
/// [packetize_opus] hard-code, so negotiated PTs match the ones this egress
/// actually writes.
fn register_codecs(media_engine: &mut MediaEngine) -> Result<()> {
    use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                    .to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: VIDEO_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            payload_type: AUDIO_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleave_orders_by_source_dts() {
        // [V:0, A:20, V:40, A:60] interleaved arrival, out-of-order drain
        // calls still produce the timestamp-ordered write sequence.
        let mut video_q = VecDeque::new();
        let mut audio_q = VecDeque::new();
        video_q.push_back(fake_packet(0));
        video_q.push_back(fake_packet(40));
        audio_q.push_back(fake_packet(20));
        audio_q.push_back(fake_packet(60));

        let mut order = Vec::new();
        while !video_q.is_empty() && !audio_q.is_empty() {
            let write_video = video_q.front().unwrap().dts <= audio_q.front().unwrap().dts;
            let q = if write_video { &mut video_q } else { &mut audio_q };
            let p = q.pop_front().unwrap();
            order.push((write_video, p.dts));
        }
        assert_eq!(order, vec![(true, 0), (false, 20), (true, 40)]);
        // one queue (audio, dts=60) remains, per the "stop at empty" rule.
        assert_eq!(video_q.len(), 0);
        assert_eq!(audio_q.len(), 1);
    }

    fn fake_packet(dts: i64) -> QueuedPacket {
        QueuedPacket {
            dts,
            packet: webrtc::rtp::packet::Packet::default(),
        }
    }
}
