//! Per-variant `.ts` segment rotation and media playlist maintenance.
//! Segment naming and `m3u8-rs` usage follow the pack's HLS muxer idiom
//! (chrono timestamps, sliding playlist window).

use anyhow::Result;
use m3u8_rs::MediaSegment;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// How long a `.ts` segment may run before the next keyframe rotates it.
pub const SEGMENT_DURATION: Duration = Duration::from_secs(1);

/// Number of segments kept in the sliding playlist window.
const PLAYLIST_WINDOW: usize = 6;

pub struct SegmentWriter {
    dir: PathBuf,
    next_index: u64,
    current_file: Option<File>,
    current_started_wall: Option<std::time::Instant>,
    segments: Vec<(u64, f32)>,
    media_sequence: u64,
}

impl SegmentWriter {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            next_index: 0,
            current_file: None,
            current_started_wall: None,
            segments: Vec::new(),
            media_sequence: 0,
        })
    }

    pub fn segment_name(index: u64) -> String {
        format!("seg{index}.ts")
    }

    /// Whether the current segment should roll over on the next keyframe.
    pub fn should_rotate(&self) -> bool {
        match self.current_started_wall {
            None => true,
            Some(started) => started.elapsed() >= SEGMENT_DURATION,
        }
    }

    /// Writes the PAT/PMT + any buffered data to a new segment file,
    /// finalizing the previous one's duration in the playlist.
    pub fn rotate(&mut self, pat_pmt: &[u8]) -> Result<()> {
        if let Some(started) = self.current_started_wall.take() {
            if let Some((_, dur)) = self.segments.last_mut() {
                *dur = started.elapsed().as_secs_f32();
            }
        }
        let index = self.next_index;
        self.next_index += 1;
        let path = self.dir.join(Self::segment_name(index));
        let mut file = File::create(path)?;
        file.write_all(pat_pmt)?;
        self.current_file = Some(file);
        self.current_started_wall = Some(std::time::Instant::now());
        self.segments.push((index, 0.0));
        if self.segments.len() > PLAYLIST_WINDOW {
            self.segments.remove(0);
            self.media_sequence += 1;
        }
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if let Some(file) = self.current_file.as_mut() {
            file.write_all(data)?;
        }
        Ok(())
    }

    pub fn write_playlist(&self) -> Result<()> {
        let mut pl = m3u8_rs::MediaPlaylist::default();
        pl.version = Some(3);
        pl.target_duration = SEGMENT_DURATION.as_secs_f32().ceil();
        pl.media_sequence = self.media_sequence;
        pl.end_list = false;
        pl.segments = self
            .segments
            .iter()
            .map(|(idx, dur)| {
                let mut seg = MediaSegment::default();
                seg.uri = Self::segment_name(*idx);
                seg.duration = if *dur > 0.0 {
                    *dur
                } else {
                    SEGMENT_DURATION.as_secs_f32()
                };
                seg
            })
            .collect();

        let mut f = File::create(self.dir.join("index.m3u8"))?;
        pl.write_to(&mut f)?;
        Ok(())
    }
}
