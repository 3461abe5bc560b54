//! Hand-rolled MPEG-TS packetization: PAT/PMT tables and PES-wrapped H.264
//! Annex-B / ADTS AAC payloads split into 188-byte TS packets. Table layout
//! follows ITU-T H.222.0, grounded in the PAT/PMT builders of the pack's
//! hand-rolled mpegts muxer; this crate writes PES/TS packets directly
//! instead of going through a general container library.

const PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;

const STREAM_TYPE_H264: u8 = 0x1b;
const STREAM_TYPE_AAC_ADTS: u8 = 0x0f;

/// ISO/IEC 13818-1 CRC-32/MPEG-2 polynomial, as used by PAT/PMT section CRCs.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04c1_1db7;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Per-PID continuity counters; PAT/PMT share one slot each from `data`.
pub struct ContinuityCounters {
    pat: u8,
    pmt: u8,
    video: u8,
    audio: u8,
}

impl Default for ContinuityCounters {
    fn default() -> Self {
        Self {
            pat: 0,
            pmt: 0,
            video: 0,
            audio: 0,
        }
    }
}

fn write_section_packet(out: &mut Vec<u8>, pid: u16, continuity: &mut u8, section: &[u8]) {
    let mut packet = vec![0u8; PACKET_SIZE];
    packet[0] = SYNC_BYTE;
    packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1f); // payload_unit_start_indicator
    packet[2] = (pid & 0xff) as u8;
    packet[3] = 0x10 | (*continuity & 0x0f); // no adaptation field, payload only
    *continuity = continuity.wrapping_add(1);
    packet[4] = 0x00; // pointer_field
    let body_start = 5;
    let copy_len = section.len().min(PACKET_SIZE - body_start);
    packet[body_start..body_start + copy_len].copy_from_slice(&section[..copy_len]);
    for b in packet.iter_mut().skip(body_start + copy_len) {
        *b = 0xff;
    }
    out.extend_from_slice(&packet);
}

/// Builds the single-program PAT pointing PID 0x1000 at program 1.
pub fn write_pat(out: &mut Vec<u8>, counters: &mut ContinuityCounters) {
    let mut section = vec![0u8; 8];
    section[0] = 0x00; // table_id
    section[3] = 0x00; // transport_stream_id hi
    section[4] = 0x01; // transport_stream_id lo
    section[5] = 0xc1; // version_number=0, current_next=1
    section[6] = 0x00; // section_number
    section[7] = 0x00; // last_section_number
    section.extend_from_slice(&[0x00, 0x01]); // program_number = 1
    section.extend_from_slice(&(0xE000 | PMT_PID).to_be_bytes());
    let section_length = (section.len() - 3 + 4) as u16; // + crc32, excluding table_id+length field
    section[1] = 0xb0 | ((section_length >> 8) as u8 & 0x0f);
    section[2] = (section_length & 0xff) as u8;
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    write_section_packet(out, PAT_PID, &mut counters.pat, &section);
}

/// Builds a PMT with one H.264 and (optionally) one AAC elementary stream.
pub fn write_pmt(out: &mut Vec<u8>, counters: &mut ContinuityCounters, has_audio: bool) {
    let mut section = vec![0u8; 8];
    section[0] = 0x02; // table_id
    section[3] = 0x00; // program_number hi
    section[4] = 0x01; // program_number lo
    section[5] = 0xc1;
    section[6] = 0x00;
    section[7] = 0x00;
    section.extend_from_slice(&(0xE000 | VIDEO_PID).to_be_bytes()); // PCR_PID = video
    section.extend_from_slice(&[0xf0, 0x00]); // program_info_length = 0

    section.push(STREAM_TYPE_H264);
    section.extend_from_slice(&(0xE000 | VIDEO_PID).to_be_bytes());
    section.extend_from_slice(&[0xf0, 0x00]);

    if has_audio {
        section.push(STREAM_TYPE_AAC_ADTS);
        section.extend_from_slice(&(0xE000 | AUDIO_PID).to_be_bytes());
        section.extend_from_slice(&[0xf0, 0x00]);
    }

    let section_length = (section.len() - 3 + 4) as u16;
    section[1] = 0xb0 | ((section_length >> 8) as u8 & 0x0f);
    section[2] = (section_length & 0xff) as u8;
    let crc = crc32_mpeg2(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    write_section_packet(out, PMT_PID, &mut counters.pmt, &section);
}

/// Wraps `payload` in a PES header and splits it across 188-byte TS packets.
/// `pts_90khz`/`dts_90khz` are in the 90kHz system clock; `is_video` sets the
/// PCR and random-access flags on the first packet when `keyframe`.
pub fn write_pes(
    out: &mut Vec<u8>,
    pid: u16,
    continuity: &mut u8,
    payload: &[u8],
    pts_90khz: i64,
    dts_90khz: Option<i64>,
    keyframe: bool,
) {
    let stream_id = if pid == VIDEO_PID { 0xe0 } else { 0xc0 };
    let has_dts = dts_90khz.is_some_and(|dts| dts != pts_90khz);

    let mut pes = Vec::with_capacity(payload.len() + 19);
    pes.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    let pes_header_data_len = if has_dts { 10 } else { 5 };
    let pes_packet_len = payload.len() + 3 + pes_header_data_len;
    pes.extend_from_slice(&((pes_packet_len.min(0xffff)) as u16).to_be_bytes());
    pes.push(0x80); // marker bits, no scrambling
    pes.push(if has_dts { 0xc0 } else { 0x80 }); // PTS (+DTS) flags
    pes.push(pes_header_data_len as u8);
    pes.extend_from_slice(&pts_dts_bytes(pts_90khz, if has_dts { 0x3 } else { 0x2 }));
    if let Some(dts) = dts_90khz {
        if has_dts {
            pes.extend_from_slice(&pts_dts_bytes(dts, 0x1));
        }
    }
    pes.extend_from_slice(payload);

    let mut first = true;
    let mut pos = 0;
    while pos < pes.len() {
        let mut packet = vec![0u8; PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        packet[1] = (if first { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1f);
        packet[2] = (pid & 0xff) as u8;

        let header_len = if first && keyframe { 4 + 1 + 6 } else { 4 };
        let mut body_start = header_len;
        let remaining = pes.len() - pos;
        let available = PACKET_SIZE - body_start;
        let (adaptation_needed, stuffing) = if remaining < available {
            (true, available - remaining)
        } else {
            (false, 0)
        };

        if first && keyframe {
            packet[3] = 0x30 | (*continuity & 0x0f); // adaptation field + payload
            packet[4] = (5 + 6) as u8; // adaptation_field_length (placeholder, fixed below)
            packet[5] = 0x50; // random_access_indicator + PCR_flag
            let pcr = pts_to_pcr_base(pts_90khz);
            write_pcr(&mut packet[6..12], pcr);
            body_start = 4 + 1 + 6;
        } else if adaptation_needed {
            packet[3] = 0x30 | (*continuity & 0x0f);
            packet[4] = (stuffing.saturating_sub(1)) as u8;
            if stuffing >= 2 {
                packet[5] = 0x00;
                for b in packet.iter_mut().take(4 + stuffing).skip(6) {
                    *b = 0xff;
                }
            }
            body_start = 4 + stuffing;
        } else {
            packet[3] = 0x10 | (*continuity & 0x0f);
        }
        *continuity = continuity.wrapping_add(1);

        let copy_len = (PACKET_SIZE - body_start).min(remaining);
        packet[body_start..body_start + copy_len].copy_from_slice(&pes[pos..pos + copy_len]);
        for b in packet.iter_mut().skip(body_start + copy_len) {
            *b = 0xff;
        }
        out.extend_from_slice(&packet);
        pos += copy_len;
        first = false;
    }
}

fn pts_dts_bytes(value_90khz: i64, marker: u8) -> [u8; 5] {
    let v = (value_90khz as u64) & 0x1_ffff_ffff;
    [
        (marker << 4) | (((v >> 30) & 0x7) as u8) << 1 | 1,
        ((v >> 22) & 0xff) as u8,
        (((v >> 15) & 0x7f) as u8) << 1 | 1,
        ((v >> 7) & 0xff) as u8,
        (((v & 0x7f) as u8) << 1) | 1,
    ]
}

fn pts_to_pcr_base(pts_90khz: i64) -> u64 {
    pts_90khz.max(0) as u64
}

fn write_pcr(dst: &mut [u8], base: u64) {
    let base = base & 0x1_ffff_ffff;
    let ext: u64 = 0;
    dst[0] = (base >> 25) as u8;
    dst[1] = (base >> 17) as u8;
    dst[2] = (base >> 9) as u8;
    dst[3] = (base >> 1) as u8;
    dst[4] = (((base & 1) as u8) << 7) | 0x7e | ((ext >> 8) as u8 & 0x1);
    dst[5] = (ext & 0xff) as u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pat_and_pmt_produce_one_ts_packet_each() {
        let mut out = Vec::new();
        let mut counters = ContinuityCounters::default();
        write_pat(&mut out, &mut counters);
        assert_eq!(out.len(), PACKET_SIZE);
        write_pmt(&mut out, &mut counters, true);
        assert_eq!(out.len(), PACKET_SIZE * 2);
        assert_eq!(out[0], SYNC_BYTE);
        assert_eq!(out[PACKET_SIZE], SYNC_BYTE);
    }

    #[test]
    fn pes_payload_splits_across_multiple_ts_packets() {
        let mut out = Vec::new();
        let mut cc = 0u8;
        let payload = vec![0xAAu8; 500];
        write_pes(&mut out, VIDEO_PID, &mut cc, &payload, 90_000, Some(90_000), true);
        assert_eq!(out.len() % PACKET_SIZE, 0);
        assert!(out.len() / PACKET_SIZE >= 3);
        for chunk in out.chunks(PACKET_SIZE) {
            assert_eq!(chunk[0], SYNC_BYTE);
        }
    }

    #[test]
    fn crc32_is_deterministic() {
        assert_eq!(crc32_mpeg2(b"test"), crc32_mpeg2(b"test"));
        assert_ne!(crc32_mpeg2(b"test"), crc32_mpeg2(b"fest"));
    }
}
