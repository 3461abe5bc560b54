//! Hand-rolled fragmented MP4 (ISO/IEC 14496-12) for the Low-Latency HLS
//! variant: an `init.mp4` (`ftyp`/`moov`/`mvex`) written once per variant,
//! then one `moof`/`mdat` fragment per `PartDuration` appended to the
//! running segment file. Byte-range parts let the player start reading a
//! part before its parent segment closes, the same pattern the pack's
//! richer fMP4/LL-HLS muxer uses (there driven by ffmpeg's fragmenting
//! muxer instead of hand-rolled boxes, since that crate carries an ffmpeg
//! dependency this one doesn't).
//!
//! Samples carry the same payload convention as the plain MP4 recorder:
//! video is length-prefixed NAL units (Annex-B start codes stripped), audio
//! is an ADTS-framed AAC frame (even though ADTS is redundant next to the
//! `esds` box — matches the existing recorder rather than a second
//! raw-AAC code path).

use crate::frame::Mpeg4AudioConfig;
use crate::h264::split_annex_b_nalus;

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;
pub const VIDEO_TIMESCALE: u32 = 90_000;

/// LL-HLS part size this variant targets; see `PartInf::part_target` in the
/// written playlist.
pub const PART_DURATION_MS: i64 = 500;

fn bx(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

fn concat(boxes: &[Vec<u8>]) -> Vec<u8> {
    boxes.iter().flat_map(|b| b.iter().copied()).collect()
}

fn ftyp() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"iso5");
    body.extend_from_slice(&0u32.to_be_bytes());
    for brand in [b"iso5", b"iso6", b"mp41"] {
        body.extend_from_slice(brand);
    }
    bx(b"ftyp", &body)
}

fn mvhd(next_track_id: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_be_bytes()); // version/flags
    body.extend_from_slice(&0u32.to_be_bytes()); // creation_time
    body.extend_from_slice(&0u32.to_be_bytes()); // modification_time
    body.extend_from_slice(&1000u32.to_be_bytes()); // timescale
    body.extend_from_slice(&0u32.to_be_bytes()); // duration (unknown, fragmented)
    body.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
    body.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
    body.extend_from_slice(&[0u8; 2]); // reserved
    body.extend_from_slice(&[0u8; 8]); // reserved
    body.extend_from_slice(&identity_matrix());
    body.extend_from_slice(&[0u8; 24]); // pre_defined
    body.extend_from_slice(&next_track_id.to_be_bytes());
    bx(b"mvhd", &body)
}

fn identity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}

fn tkhd(track_id: u32, width: u16, height: u16, is_audio: bool) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x0000_0007u32.to_be_bytes()); // version0, enabled|in-movie|in-preview
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&track_id.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes()); // reserved
    body.extend_from_slice(&0u32.to_be_bytes()); // duration
    body.extend_from_slice(&[0u8; 8]); // reserved
    body.extend_from_slice(&0u16.to_be_bytes()); // layer
    body.extend_from_slice(&0u16.to_be_bytes()); // alternate_group
    body.extend_from_slice(&(if is_audio { 0x0100u16 } else { 0 }).to_be_bytes()); // volume
    body.extend_from_slice(&[0u8; 2]);
    body.extend_from_slice(&identity_matrix());
    body.extend_from_slice(&((width as u32) << 16).to_be_bytes());
    body.extend_from_slice(&((height as u32) << 16).to_be_bytes());
    bx(b"tkhd", &body)
}

fn mdhd(timescale: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&timescale.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes()); // duration
    body.extend_from_slice(&0x55c4u16.to_be_bytes()); // language "und"
    body.extend_from_slice(&0u16.to_be_bytes());
    bx(b"mdhd", &body)
}

fn hdlr(handler_type: &[u8; 4], name: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
    body.extend_from_slice(handler_type);
    body.extend_from_slice(&[0u8; 12]); // reserved
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    bx(b"hdlr", &body)
}

fn dinf() -> Vec<u8> {
    let mut url = Vec::new();
    url.extend_from_slice(&0x0000_0001u32.to_be_bytes()); // version/flags, self-contained
    let url_box = bx(b"url ", &url);
    let mut dref_body = Vec::new();
    dref_body.extend_from_slice(&0u32.to_be_bytes());
    dref_body.extend_from_slice(&1u32.to_be_bytes()); // entry_count
    dref_body.extend_from_slice(&url_box);
    let dref = bx(b"dref", &dref_body);
    bx(b"dinf", &dref)
}

fn avc_decoder_config(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(1); // configurationVersion
    body.push(sps.get(1).copied().unwrap_or(0x42)); // AVCProfileIndication
    body.push(sps.get(2).copied().unwrap_or(0)); // profile_compatibility
    body.push(sps.get(3).copied().unwrap_or(0x1f)); // AVCLevelIndication
    body.push(0xfc | 0x03); // reserved(6) + lengthSizeMinusOne=3 (4-byte NAL lengths)
    body.push(0xe0 | 0x01); // reserved(3) + numOfSequenceParameterSets=1
    body.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    body.extend_from_slice(sps);
    body.push(1); // numOfPictureParameterSets
    body.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    body.extend_from_slice(pps);
    bx(b"avcC", &body)
}

fn avc1(width: u16, height: u16, sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 6]); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    body.extend_from_slice(&[0u8; 16]); // pre_defined / reserved
    body.extend_from_slice(&width.to_be_bytes());
    body.extend_from_slice(&height.to_be_bytes());
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // horizresolution 72dpi
    body.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // vertresolution 72dpi
    body.extend_from_slice(&0u32.to_be_bytes()); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // frame_count
    body.extend_from_slice(&[0u8; 32]); // compressorname
    body.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
    body.extend_from_slice(&0xffffu16.to_be_bytes()); // pre_defined
    body.extend_from_slice(&avc_decoder_config(sps, pps));
    bx(b"avc1", &body)
}

fn esds(audio_cfg_bytes: &[u8]) -> Vec<u8> {
    let mut dsi = Vec::new();
    dsi.push(0x05);
    dsi.push(audio_cfg_bytes.len() as u8);
    dsi.extend_from_slice(audio_cfg_bytes);

    let mut dec_config = Vec::new();
    dec_config.push(0x40); // objectTypeIndication: AAC
    dec_config.push(0x15); // streamType=audio(5)<<2 | upStream=0 | reserved=1
    dec_config.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
    dec_config.extend_from_slice(&128_000u32.to_be_bytes()); // maxBitrate
    dec_config.extend_from_slice(&128_000u32.to_be_bytes()); // avgBitrate
    dec_config.extend_from_slice(&dsi);
    let mut dec_config_desc = Vec::new();
    dec_config_desc.push(0x04);
    dec_config_desc.push(dec_config.len() as u8);
    dec_config_desc.extend_from_slice(&dec_config);

    let sl_config = [0x06, 0x01, 0x02];

    let mut es_descr = Vec::new();
    es_descr.extend_from_slice(&1u16.to_be_bytes()); // ES_ID
    es_descr.push(0); // flags
    es_descr.extend_from_slice(&dec_config_desc);
    es_descr.extend_from_slice(&sl_config);
    let mut es_desc = Vec::new();
    es_desc.push(0x03);
    es_desc.push(es_descr.len() as u8);
    es_desc.extend_from_slice(&es_descr);

    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&es_desc);
    bx(b"esds", &body)
}

fn mp4a(sample_rate: u32, channels: u8, audio_cfg_bytes: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&[0u8; 6]); // reserved
    body.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
    body.extend_from_slice(&[0u8; 8]); // reserved
    body.extend_from_slice(&(channels as u16).to_be_bytes());
    body.extend_from_slice(&16u16.to_be_bytes()); // samplesize
    body.extend_from_slice(&[0u8; 4]); // pre_defined/reserved
    body.extend_from_slice(&((sample_rate as u32) << 16).to_be_bytes());
    body.extend_from_slice(&esds(audio_cfg_bytes));
    bx(b"mp4a", &body)
}

fn stbl(sample_entry: Vec<u8>) -> Vec<u8> {
    let stsd = {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes()); // entry_count
        body.extend_from_slice(&sample_entry);
        bx(b"stsd", &body)
    };
    let empty_table = |fourcc: &[u8; 4], extra: &[u8]| {
        let mut body = vec![0u8; 4];
        body.extend_from_slice(extra);
        bx(fourcc, &body)
    };
    let stts = empty_table(b"stts", &0u32.to_be_bytes());
    let stsc = empty_table(b"stsc", &0u32.to_be_bytes());
    let stsz = {
        let mut body = vec![0u8; 4];
        body.extend_from_slice(&0u32.to_be_bytes()); // sample_size
        body.extend_from_slice(&0u32.to_be_bytes()); // sample_count
        bx(b"stsz", &body)
    };
    let stco = empty_table(b"stco", &0u32.to_be_bytes());
    bx(b"stbl", &concat(&[stsd, stts, stsc, stsz, stco]))
}

fn minf_video() -> Vec<u8> {
    let mut vmhd_body = vec![0u8; 4];
    vmhd_body.extend_from_slice(&[0u8; 8]); // graphicsmode + opcolor
    let vmhd = bx(b"vmhd", &vmhd_body);
    vmhd
}

fn minf_audio() -> Vec<u8> {
    let smhd_body = [0u8; 8]; // version/flags + balance + reserved
    bx(b"smhd", &smhd_body)
}

fn trak_video(width: u16, height: u16, sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mdia = bx(
        b"mdia",
        &concat(&[
            mdhd(VIDEO_TIMESCALE),
            hdlr(b"vide", "VideoHandler"),
            bx(
                b"minf",
                &concat(&[minf_video(), dinf(), stbl(avc1(width, height, sps, pps))]),
            ),
        ]),
    );
    bx(b"trak", &concat(&[tkhd(VIDEO_TRACK_ID, width, height, false), mdia]))
}

fn trak_audio(sample_rate: u32, channels: u8, audio_cfg_bytes: &[u8]) -> Vec<u8> {
    let mdia = bx(
        b"mdia",
        &concat(&[
            mdhd(sample_rate),
            hdlr(b"soun", "SoundHandler"),
            bx(
                b"minf",
                &concat(&[minf_audio(), dinf(), stbl(mp4a(sample_rate, channels, audio_cfg_bytes))]),
            ),
        ]),
    );
    bx(b"trak", &concat(&[tkhd(AUDIO_TRACK_ID, 0, 0, true), mdia]))
}

fn trex(track_id: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_be_bytes());
    body.extend_from_slice(&track_id.to_be_bytes());
    body.extend_from_slice(&1u32.to_be_bytes()); // default_sample_description_index
    body.extend_from_slice(&0u32.to_be_bytes()); // default_sample_duration
    body.extend_from_slice(&0u32.to_be_bytes()); // default_sample_size
    body.extend_from_slice(&0u32.to_be_bytes()); // default_sample_flags
    bx(b"trex", &body)
}

/// Builds `init.mp4`: `ftyp` + `moov` carrying both tracks' sample
/// descriptions and an `mvex` so players recognize the file as fragmented.
pub fn build_init_segment(
    sps: &[u8],
    pps: &[u8],
    width: u16,
    height: u16,
    sample_rate: u32,
    channels: u8,
    audio_cfg_bytes: &[u8],
) -> Vec<u8> {
    let moov_body = concat(&[
        mvhd(3),
        trak_video(width, height, sps, pps),
        trak_audio(sample_rate, channels, audio_cfg_bytes),
        bx(b"mvex", &concat(&[trex(VIDEO_TRACK_ID), trex(AUDIO_TRACK_ID)])),
    ]);
    concat(&[ftyp(), bx(b"moov", &moov_body)])
}

/// One encoded access unit queued for the next fragment.
pub struct FragSample {
    pub data: Vec<u8>,
    pub duration: u32,
    pub keyframe: bool,
    pub composition_offset: i32,
}

fn mfhd(sequence_number: u32) -> Vec<u8> {
    let mut body = vec![0u8; 4];
    body.extend_from_slice(&sequence_number.to_be_bytes());
    bx(b"mfhd", &body)
}

const TRUN_DATA_OFFSET_PRESENT: u32 = 0x0000_0001;
const TRUN_SAMPLE_DURATION_PRESENT: u32 = 0x0000_0100;
const TRUN_SAMPLE_SIZE_PRESENT: u32 = 0x0000_0200;
const TRUN_SAMPLE_FLAGS_PRESENT: u32 = 0x0000_0400;
const TRUN_SAMPLE_CTS_PRESENT: u32 = 0x0000_0800;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x0002_0000;

fn sample_flags(keyframe: bool) -> u32 {
    if keyframe {
        0x0200_0000 // sample_depends_on = 2 (no other sample depends on this being non-sync), is_non_sync=0
    } else {
        0x0101_0000 // sample_depends_on = 1, is_non_sync=1
    }
}

fn traf(track_id: u32, base_media_decode_time: u64, samples: &[FragSample], data_offset: i32, with_cts: bool) -> Vec<u8> {
    let mut tfhd_body = Vec::new();
    tfhd_body.extend_from_slice(&TFHD_DEFAULT_BASE_IS_MOOF.to_be_bytes()); // version0 (top byte 0) + flags
    tfhd_body.extend_from_slice(&track_id.to_be_bytes());
    let tfhd = bx(b"tfhd", &tfhd_body);

    let mut tfdt_body = Vec::new();
    tfdt_body.extend_from_slice(&0x0100_0000u32.to_be_bytes()); // version1, flags0
    tfdt_body.extend_from_slice(&base_media_decode_time.to_be_bytes());
    let tfdt = bx(b"tfdt", &tfdt_body);

    let mut flags = TRUN_DATA_OFFSET_PRESENT | TRUN_SAMPLE_DURATION_PRESENT | TRUN_SAMPLE_SIZE_PRESENT | TRUN_SAMPLE_FLAGS_PRESENT;
    if with_cts {
        flags |= TRUN_SAMPLE_CTS_PRESENT;
    }
    let mut trun_body = Vec::new();
    trun_body.extend_from_slice(&0u8.to_be_bytes()); // version0
    trun_body.extend_from_slice(&flags.to_be_bytes()[1..]);
    trun_body.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    trun_body.extend_from_slice(&data_offset.to_be_bytes());
    for s in samples {
        trun_body.extend_from_slice(&s.duration.to_be_bytes());
        trun_body.extend_from_slice(&(s.data.len() as u32).to_be_bytes());
        trun_body.extend_from_slice(&sample_flags(s.keyframe).to_be_bytes());
        if with_cts {
            trun_body.extend_from_slice(&s.composition_offset.to_be_bytes());
        }
    }
    let trun = bx(b"trun", &trun_body);

    bx(b"traf", &concat(&[tfhd, tfdt, trun]))
}

/// Builds one `moof`+`mdat` fragment (one LL-HLS part) carrying both the
/// video and audio samples accumulated since the previous part.
pub fn build_fragment(
    sequence_number: u32,
    video_base_decode_time: u64,
    video_samples: &[FragSample],
    audio_base_decode_time: u64,
    audio_samples: &[FragSample],
) -> Vec<u8> {
    // moof size must be known before trun's data_offset can point past it;
    // build with a placeholder offset, then patch once real sizes are known.
    let mfhd_box = mfhd(sequence_number);
    let video_traf = traf(VIDEO_TRACK_ID, video_base_decode_time, video_samples, 0, true);
    let audio_traf = traf(AUDIO_TRACK_ID, audio_base_decode_time, audio_samples, 0, false);
    let moof_body = concat(&[mfhd_box, video_traf, audio_traf]);
    let moof = bx(b"moof", &moof_body);

    let mdat_body: Vec<u8> = video_samples
        .iter()
        .chain(audio_samples.iter())
        .flat_map(|s| s.data.iter().copied())
        .collect();
    let mdat = bx(b"mdat", &mdat_body);

    let data_offset = (moof.len() + 8) as i32; // mdat header is 8 bytes
    let mut out = patch_trun_data_offsets(moof, data_offset);
    out.extend_from_slice(&mdat);
    out
}

/// `trun.data_offset` must point from the start of `moof` to the first
/// sample byte; both traf's trun entries share the same offset since audio
/// samples are written immediately after all video samples in `mdat`, so
/// only the audio trun's offset needs the video payload length added.
fn patch_trun_data_offsets(moof: Vec<u8>, base_offset: i32) -> Vec<u8> {
    // The video traf's trun already wants `base_offset`; the audio traf's
    // trun wants `base_offset + sum(video sample sizes)`. Both were written
    // as 0 above; patch them in place by locating each `trun` box's
    // data_offset field (immediately after the 12-byte full box + header
    // + sample_count fields: box header 8, version/flags 4, sample_count 4).
    let mut out = moof;
    let mut video_payload_len = 0i32;
    let mut cursor = 0usize;
    let mut trun_index = 0;
    while let Some(pos) = find_box(&out, b"trun", cursor) {
        let body_start = pos + 8;
        let sample_count = u32::from_be_bytes([out[body_start + 4], out[body_start + 5], out[body_start + 6], out[body_start + 7]]) as usize;
        let offset_field = body_start + 8;
        let offset_value = if trun_index == 0 {
            base_offset
        } else {
            base_offset + video_payload_len
        };
        out[offset_field..offset_field + 4].copy_from_slice(&offset_value.to_be_bytes());

        if trun_index == 0 {
            // sum this trun's sample sizes to compute the audio trun's offset
            let mut p = offset_field + 4;
            for _ in 0..sample_count {
                let size = u32::from_be_bytes([out[p + 4], out[p + 5], out[p + 6], out[p + 7]]);
                video_payload_len += size as i32;
                p += 16; // duration(4) + size(4) + flags(4) + cts(4)
            }
        }
        trun_index += 1;
        cursor = pos + 8;
    }
    out
}

fn find_box(data: &[u8], fourcc: &[u8; 4], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 8 <= data.len() {
        if &data[i + 4..i + 8] == fourcc {
            return Some(i);
        }
        let size = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize;
        if size < 8 {
            break;
        }
        i += size;
    }
    None
}

/// Strips Annex-B start codes and re-frames as length-prefixed NAL units,
/// the same conversion the plain MP4 recorder applies.
pub fn video_sample_payload(annex_b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(annex_b.len());
    for nal in split_annex_b_nalus(annex_b) {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// ADTS-framed AAC payload for one audio sample, matching the convention the
/// plain MP4 recorder already uses for its own samples.
pub fn audio_sample_payload(data: &[u8], cfg: &Mpeg4AudioConfig) -> Vec<u8> {
    let adts = crate::aac::fill_adts_header(cfg, data.len());
    let mut payload = Vec::with_capacity(7 + data.len());
    payload.extend_from_slice(&adts);
    payload.extend_from_slice(data);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_segment_starts_with_ftyp_then_moov() {
        let sps = [0x67, 0x42, 0x00, 0x1f];
        let pps = [0x68, 0xce, 0x3c, 0x80];
        let init = build_init_segment(&sps, &pps, 1280, 720, 48_000, 2, &[0x11, 0x90]);
        assert_eq!(&init[4..8], b"ftyp");
        let ftyp_len = u32::from_be_bytes([init[0], init[1], init[2], init[3]]) as usize;
        assert_eq!(&init[ftyp_len + 4..ftyp_len + 8], b"moov");
    }

    #[test]
    fn fragment_starts_with_moof_then_mdat() {
        let video = vec![FragSample {
            data: vec![0u8; 20],
            duration: 3000,
            keyframe: true,
            composition_offset: 0,
        }];
        let audio = vec![FragSample {
            data: vec![1u8; 10],
            duration: 1024,
            keyframe: true,
            composition_offset: 0,
        }];
        let frag = build_fragment(1, 0, &video, 0, &audio);
        assert_eq!(&frag[4..8], b"moof");
        let moof_len = u32::from_be_bytes([frag[0], frag[1], frag[2], frag[3]]) as usize;
        assert_eq!(&frag[moof_len + 4..moof_len + 8], b"mdat");
        assert_eq!(frag.len(), moof_len + 8 + 30);
    }
}
