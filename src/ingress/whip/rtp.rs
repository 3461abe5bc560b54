//! RTP depacketization: H.264 (STAP-A/FU-A -> Annex-B) and Opus (pass-through),
//! plus marker-bit/timestamp-boundary frame-boundary assembly and the
//! zero-based per-track timestamp generator.

use crate::frame::SliceType;
use crate::h264::{classify_slice, nal_unit_type, START_CODE};
use webrtc::rtp::packet::Packet;

const NALU_TYPE_STAP_A: u8 = 24;
const NALU_TYPE_FU_A: u8 = 28;

/// Produces zero-based offsets in the RTP clock domain by subtracting the
/// first observed timestamp from every subsequent one.
#[derive(Default)]
pub struct TimestampGenerator {
    first: Option<u32>,
}

impl TimestampGenerator {
    pub fn normalize(&mut self, rtp_timestamp: u32) -> i64 {
        let first = *self.first.get_or_insert(rtp_timestamp);
        rtp_timestamp.wrapping_sub(first) as i64
    }
}

/// Buffers RTP packets that share a common timestamp and declares a frame
/// boundary when the marker bit is set or the next packet's timestamp
/// differs from the buffered one.
#[derive(Default)]
pub struct FrameAssembler {
    buffer: Vec<Packet>,
    current_ts: Option<u32>,
}

impl FrameAssembler {
    /// Feeds one packet in. Returns a completed group of packets forming one
    /// access unit, if this packet closed one.
    pub fn push(&mut self, packet: Packet) -> Option<Vec<Packet>> {
        let ts = packet.header.timestamp;
        let marker = packet.header.marker;

        let mut completed = None;
        if let Some(current) = self.current_ts {
            if current != ts {
                completed = Some(std::mem::take(&mut self.buffer));
            }
        }
        self.current_ts = Some(ts);
        self.buffer.push(packet);

        if marker {
            completed = Some(std::mem::take(&mut self.buffer));
            self.current_ts = None;
        }
        completed
    }
}

/// Depacketizes one access unit's worth of H.264 RTP packets into an
/// Annex-B payload, applying the same SPS/PPS-cache-and-prepend discipline
/// as the RTMP ingress.
pub fn depacketize_h264(
    packets: &[Packet],
    cached_sps: &mut Vec<u8>,
    cached_pps: &mut Vec<u8>,
) -> (Vec<u8>, Vec<SliceType>) {
    let mut nalus: Vec<Vec<u8>> = Vec::new();
    let mut fu_buffer: Option<Vec<u8>> = None;

    for packet in packets {
        let payload = &packet.payload;
        if payload.is_empty() {
            continue;
        }
        let nal_type = payload[0] & 0x1f;
        match nal_type {
            NALU_TYPE_STAP_A => {
                let mut pos = 1;
                while pos + 2 <= payload.len() {
                    let len = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
                    pos += 2;
                    if pos + len > payload.len() {
                        break;
                    }
                    nalus.push(payload[pos..pos + len].to_vec());
                    pos += len;
                }
            }
            NALU_TYPE_FU_A => {
                if payload.len() < 2 {
                    continue;
                }
                let fu_indicator = payload[0];
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                if start {
                    let nal_header = (fu_indicator & 0xe0) | (fu_header & 0x1f);
                    let mut buf = vec![nal_header];
                    buf.extend_from_slice(&payload[2..]);
                    fu_buffer = Some(buf);
                } else if let Some(buf) = fu_buffer.as_mut() {
                    buf.extend_from_slice(&payload[2..]);
                }
                if end {
                    if let Some(buf) = fu_buffer.take() {
                        nalus.push(buf);
                    }
                }
            }
            _ => {
                nalus.push(payload.to_vec());
            }
        }
    }

    let mut has_sps_in_band = false;
    for nal in &nalus {
        match nal_unit_type(nal) {
            7 => {
                *cached_sps = nal.clone();
                has_sps_in_band = true;
            }
            8 => *cached_pps = nal.clone(),
            _ => {}
        }
    }

    let mut out = Vec::new();
    let mut slice_types = Vec::with_capacity(nalus.len());
    let mut prepended = false;
    for nal in &nalus {
        let st = classify_slice(nal);
        slice_types.push(st);
        match nal_unit_type(nal) {
            7 | 8 => {
                out.extend_from_slice(&START_CODE);
                out.extend_from_slice(nal);
            }
            _ => {
                if st == SliceType::I && !has_sps_in_band && !prepended {
                    out.extend_from_slice(&START_CODE);
                    out.extend_from_slice(cached_sps);
                    out.extend_from_slice(&START_CODE);
                    out.extend_from_slice(cached_pps);
                    prepended = true;
                }
                out.extend_from_slice(&START_CODE);
                out.extend_from_slice(nal);
            }
        }
    }
    (out, slice_types)
}

/// Opus RTP payload is the raw Opus packet (RFC 7587); an access unit is
/// normally exactly one RTP packet.
pub fn depacketize_opus(packets: &[Packet]) -> Vec<u8> {
    packets.iter().flat_map(|p| p.payload.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use webrtc::rtp::header::Header;

    fn packet(ts: u32, marker: bool, payload: Vec<u8>) -> Packet {
        Packet {
            header: Header {
                timestamp: ts,
                marker,
                ..Default::default()
            },
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn frame_boundary_on_marker_bit() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(packet(100, false, vec![1])).is_none());
        let done = assembler.push(packet(100, true, vec![2]));
        assert_eq!(done.unwrap().len(), 2);
    }

    #[test]
    fn frame_boundary_on_timestamp_change() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.push(packet(100, false, vec![1])).is_none());
        let done = assembler.push(packet(200, false, vec![2]));
        assert_eq!(done.unwrap().len(), 1);
    }

    #[test]
    fn timestamp_generator_is_zero_based() {
        let mut gen = TimestampGenerator::default();
        assert_eq!(gen.normalize(1000), 0);
        assert_eq!(gen.normalize(1090), 90);
    }

    #[test]
    fn reassembles_fragmented_fu_a_nal() {
        let mut sps = vec![0x67, 1];
        let mut pps = vec![0x68, 2];
        // FU-A: indicator nal_ref_idc=3,type=28 -> 0x7C; header start,type=5(IDR) -> 0x85
        let first = packet(1000, false, vec![0x7c, 0x85, 0xAA]);
        let last = packet(1000, true, vec![0x7c, 0x45, 0xBB]); // end bit set, type=5
        let (data, slice_types) = depacketize_h264(&[first, last], &mut sps, &mut pps);
        assert_eq!(slice_types, vec![SliceType::I]);
        assert!(data.windows(4).any(|w| w == [0, 0, 0, 1]));
        assert!(data.ends_with(&[0xAA, 0xBB]));
    }
}
