//! RTMP ingress: TCP listener, RTMP handshake/chunk session (via
//! `rml_rtmp`), and hand-rolled FLV tag parsing feeding the [Frame] model
//! straight into the [Hub].

mod flv;

use crate::aac;
use crate::frame::{AacAudio, Codec, Frame, H264Video, MediaSpec, MediaType, Mpeg4AudioConfig};
use crate::h264 as avc;
use crate::hub::{Hub, Source};
use anyhow::{bail, Result};
use log::{error, info, warn};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// AAC default sample rate used until the sequence header refines it, per
/// the fixed media specs registered at `OnPublish`.
pub const AAC_DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Optional debug aid: when set, every published stream is mirrored to an
/// FLV file under this directory. Not required by the design.
#[derive(Clone, Default)]
pub struct RtmpIngressConfig {
    pub mirror_dir: Option<PathBuf>,
}

pub async fn listen(addr: String, hub: Arc<Hub>, config: RtmpIngressConfig) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("RTMP listening on {addr}");
    loop {
        let (socket, peer) = listener.accept().await?;
        let hub = hub.clone();
        let config = config.clone();
        tokio::spawn(async move {
            info!("RTMP connection from {peer}");
            if let Err(e) = handle_connection(socket, hub, config).await {
                error!("RTMP connection from {peer} closed: {e}");
            }
        });
    }
}

struct SessionState {
    stream_id: Option<String>,
    notified: bool,
    sps: Vec<u8>,
    pps: Vec<u8>,
    avc_length_size: usize,
    audio_config: Option<Mpeg4AudioConfig>,
    mirror: Option<std::fs::File>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            stream_id: None,
            notified: false,
            sps: Vec::new(),
            pps: Vec::new(),
            avc_length_size: 4,
            audio_config: None,
            mirror: None,
        }
    }
}

async fn handle_connection(mut socket: TcpStream, hub: Arc<Hub>, config: RtmpIngressConfig) -> Result<()> {
    let mut hs = Handshake::new(PeerType::Server);
    let p0_p1 = hs.generate_outbound_p0_and_p1()?;
    socket.write_all(&p0_p1).await?;

    let mut buf = [0u8; 4096];
    let (mut session, mut queue) = loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            bail!("EOF during handshake");
        }
        match hs.process_bytes(&buf[..n])? {
            HandshakeProcessResult::InProgress { response_bytes } => {
                socket.write_all(&response_bytes).await?;
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                socket.write_all(&response_bytes).await?;
                let (mut session, results) = ServerSession::new(ServerSessionConfig::new())?;
                let more = session.handle_input(&remaining_bytes)?;
                let mut queue: VecDeque<ServerSessionResult> = VecDeque::from(results);
                queue.extend(more);
                break (session, queue);
            }
        }
    };

    let mut state = SessionState::new();
    loop {
        while let Some(result) = queue.pop_front() {
            process_result(result, &mut session, &mut queue, &mut state, &hub, &config, &mut socket).await?;
        }
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let results = session.handle_input(&buf[..n])?;
        queue.extend(results);
    }

    if let Some(stream_id) = &state.stream_id {
        hub.unpublish(stream_id).await;
    }
    Ok(())
}

async fn process_result(
    result: ServerSessionResult,
    session: &mut ServerSession,
    queue: &mut VecDeque<ServerSessionResult>,
    state: &mut SessionState,
    hub: &Arc<Hub>,
    config: &RtmpIngressConfig,
    socket: &mut TcpStream,
) -> Result<()> {
    match result {
        ServerSessionResult::OutboundResponse(packet) => {
            socket.write_all(&packet.bytes).await?;
        }
        ServerSessionResult::UnhandleableMessageReceived(_) => {}
        ServerSessionResult::RaisedEvent(event) => match event {
            ServerSessionEvent::ConnectionRequested { request_id, .. } => {
                queue.extend(session.accept_request(request_id)?);
            }
            ServerSessionEvent::PublishStreamRequested {
                request_id,
                stream_key,
                ..
            } => {
                if stream_key.is_empty() {
                    bail!("empty publishing name");
                }
                queue.extend(session.accept_request(request_id)?);
                info!("RTMP publish started: {stream_key}");
                if let Some(dir) = &config.mirror_dir {
                    state.mirror = open_mirror_file(dir, &stream_key).ok();
                }
                state.stream_id = Some(stream_key.clone());
                hub.notify(Source {
                    name: "rtmp".to_string(),
                    stream_id: stream_key,
                    media_specs: vec![
                        MediaSpec {
                            media_type: MediaType::Video,
                            codec: Codec::H264,
                            clock_rate: VIDEO_CLOCK_RATE,
                        },
                        MediaSpec {
                            media_type: MediaType::Audio,
                            codec: Codec::Aac,
                            clock_rate: AAC_DEFAULT_SAMPLE_RATE,
                        },
                    ],
                });
                state.notified = true;
            }
            ServerSessionEvent::AudioDataReceived { data, timestamp, .. } => {
                if let Some(stream_id) = state.stream_id.clone() {
                    if let Some(mirror) = state.mirror.as_mut() {
                        let _ = write_mirror_tag(mirror, 8, timestamp.value, &data);
                    }
                    if let Err(e) = handle_audio(&data, timestamp.value, state, hub, &stream_id).await {
                        warn!("failed to decode FLV audio tag: {e}");
                    }
                }
            }
            ServerSessionEvent::VideoDataReceived { data, timestamp, .. } => {
                if let Some(stream_id) = state.stream_id.clone() {
                    if let Some(mirror) = state.mirror.as_mut() {
                        let _ = write_mirror_tag(mirror, 9, timestamp.value, &data);
                    }
                    if let Err(e) = handle_video(&data, timestamp.value, state, hub, &stream_id).await {
                        warn!("failed to decode FLV video tag: {e}");
                    }
                }
            }
            ServerSessionEvent::PlayStreamRequested { request_id, .. } => {
                queue.extend(session.reject_request(request_id, "0", "playback not supported")?);
            }
            _ => {}
        },
    }
    Ok(())
}

async fn handle_audio(
    data: &[u8],
    timestamp_ms: u32,
    state: &mut SessionState,
    hub: &Arc<Hub>,
    stream_id: &str,
) -> Result<()> {
    let tag = flv::decode_audio_tag(data)?;
    if tag.sound_format != flv::SOUND_FORMAT_AAC {
        return Ok(());
    }
    match tag.aac_packet_type {
        Some(flv::AacPacketType::SequenceHeader) => {
            let cfg = aac::parse_audio_specific_config(tag.payload)?;
            let clock_rate = cfg.sampling_frequency;
            state.audio_config = Some(cfg);
            hub.publish(
                stream_id,
                Frame::AacAudio(AacAudio {
                    data: Vec::new(),
                    mpeg4_audio_config: state.audio_config.clone(),
                    mpeg4_audio_config_bytes: tag.payload.to_vec(),
                    sequence_header: true,
                    pts: 0,
                    dts: 0,
                    clock_rate,
                }),
            )
            .await;
        }
        Some(flv::AacPacketType::Raw) => {
            let clock_rate = state
                .audio_config
                .as_ref()
                .map(|c| c.sampling_frequency)
                .unwrap_or_else(|| flv::flv_sound_rate_hz(tag.sound_rate));
            let ts = (timestamp_ms as i64) * clock_rate as i64 / 1000;
            hub.publish(
                stream_id,
                Frame::AacAudio(AacAudio {
                    data: tag.payload.to_vec(),
                    mpeg4_audio_config: state.audio_config.clone(),
                    mpeg4_audio_config_bytes: Vec::new(),
                    sequence_header: false,
                    pts: ts,
                    dts: ts,
                    clock_rate,
                }),
            )
            .await;
        }
        None => {}
    }
    Ok(())
}

async fn handle_video(
    data: &[u8],
    timestamp_ms: u32,
    state: &mut SessionState,
    hub: &Arc<Hub>,
    stream_id: &str,
) -> Result<()> {
    let tag = flv::decode_video_tag(data)?;
    if tag.codec_id != flv::CODEC_ID_AVC {
        return Ok(());
    }
    match tag.avc_packet_type {
        Some(flv::AvcPacketType::SequenceHeader) => {
            let parsed = avc::AvcDecoderConfig::parse(tag.payload)?;
            state.avc_length_size = parsed.length_size;
            state.sps = parsed.sps;
            state.pps = parsed.pps;
        }
        Some(flv::AvcPacketType::Nalu) => {
            let (payload, slice_types) = avc::build_annex_b(
                tag.payload,
                state.avc_length_size,
                &mut state.sps,
                &mut state.pps,
            );
            if payload.is_empty() {
                return Ok(());
            }
            let dts = timestamp_ms as i64;
            let pts = dts + tag.composition_time as i64;
            hub.publish(
                stream_id,
                Frame::H264Video(H264Video {
                    data: payload,
                    sps: state.sps.clone(),
                    pps: state.pps.clone(),
                    slice_types,
                    pts: pts * 90,
                    dts: dts * 90,
                    clock_rate: VIDEO_CLOCK_RATE,
                }),
            )
            .await;
        }
        _ => {}
    }
    Ok(())
}

fn open_mirror_file(dir: &std::path::Path, stream_key: &str) -> Result<std::fs::File> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{stream_key}.flv"));
    let mut file = std::fs::File::create(path)?;
    // FLV header: signature, version, audio+video flags, data offset, then
    // PreviousTagSize0.
    file.write_all(&[b'F', b'L', b'V', 1, 0b0000_0101, 0, 0, 0, 9, 0, 0, 0, 0])?;
    Ok(file)
}

fn write_mirror_tag(file: &mut std::fs::File, tag_type: u8, timestamp: u32, body: &[u8]) -> Result<()> {
    let ts_bytes = timestamp.to_be_bytes();
    let mut header = [0u8; 11];
    header[0] = tag_type;
    let len = body.len() as u32;
    header[1..4].copy_from_slice(&len.to_be_bytes()[1..]);
    header[4..7].copy_from_slice(&ts_bytes[1..]);
    header[7] = ts_bytes[0];
    file.write_all(&header)?;
    file.write_all(body)?;
    let total = (11 + body.len()) as u32;
    file.write_all(&total.to_be_bytes())?;
    Ok(())
}
