//! WHIP ingress: HTTP offer/answer over `webrtc-rs`, hand-rolled RTP
//! depacketization, and the 3-second track-wait handshake.

pub mod rtp;

use crate::error::RelayError;
use crate::frame::{Codec, Frame, H264Video, MediaSpec, MediaType, OpusAudio};
use crate::hub::{Hub, Source};
use anyhow::{anyhow, Result};
use log::{error, info, warn};
use rtp::{depacketize_h264, depacketize_opus, FrameAssembler, TimestampGenerator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_remote::TrackRemote;

const TRACK_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Accepts a WHIP SDP offer for `stream_id`, wires up RTP ingestion into
/// `hub`, and returns the SDP answer. `public_ip` selects the "containerized"
/// ICE candidate mapping mode when set, for deployments behind NAT/port
/// forwarding (`docker.mode`).
pub async fn handle_offer(
    hub: Arc<Hub>,
    stream_id: String,
    offer_sdp: String,
    public_ip: Option<std::net::IpAddr>,
) -> Result<String> {
    let expected_track_count = count_media_sections(&offer_sdp).max(1);

    let mut media_engine = MediaEngine::default();
    register_codecs(&mut media_engine)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    if let Some(ip) = public_ip {
        setting_engine.set_nat_1to1_ips(vec![ip.to_string()], webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType::Host);
    }

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build();

    let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);

    let (track_tx, mut track_rx) = mpsc::channel::<MediaSpec>(8);
    let (ready_tx, ready_rx) = watch::channel(false);

    let hub_for_track = hub.clone();
    let stream_id_for_track = stream_id.clone();
    let ready_rx_for_track = ready_rx.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let hub = hub_for_track.clone();
        let stream_id = stream_id_for_track.clone();
        let track_tx = track_tx.clone();
        let ready_rx = ready_rx_for_track.clone();
        Box::pin(async move {
            let codec = track.codec();
            let kind = track.kind();
            let spec = MediaSpec {
                media_type: match kind {
                    RTPCodecType::Video => MediaType::Video,
                    _ => MediaType::Audio,
                },
                codec: if kind == RTPCodecType::Video {
                    Codec::H264
                } else {
                    Codec::Opus
                },
                clock_rate: codec.capability.clock_rate,
            };
            let _ = track_tx.send(spec).await;
            read_track(hub, stream_id, track, ready_rx).await;
        })
    }));

    let pc_for_state = pc.clone();
    let hub_for_state = hub.clone();
    let stream_id_for_state = stream_id.clone();
    pc.on_ice_connection_state_change(Box::new(move |state| {
        let pc = pc_for_state.clone();
        let hub = hub_for_state.clone();
        let stream_id = stream_id_for_state.clone();
        Box::pin(async move {
            match state {
                webrtc::ice_transport::ice_connection_state::RTCIceConnectionState::Failed => {
                    let _ = pc.close().await;
                }
                webrtc::ice_transport::ice_connection_state::RTCIceConnectionState::Disconnected => {
                    hub.unpublish(&stream_id).await;
                }
                _ => {}
            }
        })
    }));

    let hub_for_wait = hub.clone();
    let stream_id_for_wait = stream_id.clone();
    tokio::spawn(async move {
        wait_tracks_and_notify(
            hub_for_wait,
            stream_id_for_wait,
            expected_track_count,
            &mut track_rx,
            ready_tx,
        )
        .await;
    });

    pc.set_remote_description(RTCSessionDescription::offer(offer_sdp)?)
        .await?;
    let answer = pc.create_answer(None).await?;
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    let local_desc = pc
        .local_description()
        .await
        .ok_or_else(|| anyhow!("no local description after gathering"))?;
    Ok(local_desc.sdp)
}

async fn wait_tracks_and_notify(
    hub: Arc<Hub>,
    stream_id: String,
    expected_track_count: usize,
    track_rx: &mut mpsc::Receiver<MediaSpec>,
    ready_tx: watch::Sender<bool>,
) {
    let mut specs = Vec::new();
    let deadline = tokio::time::sleep(TRACK_WAIT_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            Some(spec) = track_rx.recv() => {
                specs.push(spec);
                if specs.len() >= expected_track_count {
                    break;
                }
            }
            _ = &mut deadline => {
                break;
            }
        }
    }

    if specs.is_empty() {
        error!(
            "{}",
            RelayError::MissingTrack {
                stream_id: stream_id.clone()
            }
        );
        return;
    }
    if specs.len() < expected_track_count {
        warn!(
            "{}",
            RelayError::TrackWaitTimeout {
                stream_id: stream_id.clone()
            }
        );
    }

    hub.notify(Source {
        name: "whip".to_string(),
        stream_id,
        media_specs: specs,
    });
    let _ = ready_tx.send(true);
}

async fn read_track(
    hub: Arc<Hub>,
    stream_id: String,
    track: Arc<TrackRemote>,
    ready_rx: watch::Receiver<bool>,
) {
    let is_video = track.kind() == RTPCodecType::Video;
    let mut assembler = FrameAssembler::default();
    let mut ts_gen = TimestampGenerator::default();
    let mut sps = Vec::new();
    let mut pps = Vec::new();
    let mut buffered: Vec<Frame> = Vec::new();
    let mut ready = *ready_rx.borrow();

    loop {
        let (packet, _attrs) = match track.read_rtp().await {
            Ok(p) => p,
            Err(e) => {
                info!("track for {stream_id} closed: {e}");
                break;
            }
        };
        let Some(group) = assembler.push(packet) else {
            continue;
        };
        if group.is_empty() {
            continue;
        }
        let ts = ts_gen.normalize(group[0].header.timestamp);

        let frame = if is_video {
            let (data, slice_types) = depacketize_h264(&group, &mut sps, &mut pps);
            if data.is_empty() {
                continue;
            }
            Frame::H264Video(H264Video {
                data,
                sps: sps.clone(),
                pps: pps.clone(),
                slice_types,
                pts: ts,
                dts: ts,
                clock_rate: 90_000,
            })
        } else {
            let data = depacketize_opus(&group);
            if data.is_empty() {
                continue;
            }
            Frame::OpusAudio(OpusAudio {
                data,
                pts: ts,
                dts: ts,
                clock_rate: 48_000,
            })
        };

        if !ready {
            ready = *ready_rx.borrow();
        }
        if ready {
            for buffered_frame in buffered.drain(..) {
                hub.publish(&stream_id, buffered_frame).await;
            }
            hub.publish(&stream_id, frame).await;
        } else {
            buffered.push(frame);
        }
    }
}

fn register_codecs(media_engine: &mut MediaEngine) -> Result<()> {
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
            payload_type: 102,
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
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(())
}

/// Counts `m=` media sections in an SDP offer to determine the expected
/// track count, without pulling in a full SDP parser for this one value.
fn count_media_sections(sdp: &str) -> usize {
    sdp.lines().filter(|l| l.starts_with("m=")).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_audio_and_video_media_sections() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nm=video 9 UDP/TLS/RTP/SAVPF 102\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
        assert_eq!(count_media_sections(sdp), 2);
    }
}
