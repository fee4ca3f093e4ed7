//! Track sample storage: fractional-position additive writes, a
//! disk-backed paging window, and multi-track mixdown.
//!
//! A `TrackBuffer` holds one output track's waveform. Memory stays
//! bounded for arbitrarily long tracks: only a fixed window of samples
//! is resident, the rest lives in an anonymous temp file as raw
//! little-endian f32. A `NoteBuffer` is the short-lived carrier of one
//! synthesized note on its way into a track.

use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};

use tracing::debug;

use crate::error::CantusError;

/// Samples held in memory per track. Window misses flush and reload.
const WINDOW_SAMPLES: usize = 1 << 16;

/// Chunk size for streaming scans and mixdown.
const SCAN_CHUNK: usize = 8192;

/// One freshly synthesized note, tagged with its placement in the track.
///
/// Allocated per note by the generation pipeline, handed to
/// [`TrackBuffer::write_blend`], then dropped.
#[derive(Debug, Clone)]
pub struct NoteBuffer {
    pub sample_rate: u32,
    pub data: Vec<f32>,
    /// Sub-sample offset added to the track cursor when placing the note.
    pub cursor_delta: f32,
    /// Coarse pre-roll: this many note samples sound ahead of the
    /// nominal cursor position (consonant onset before the beat).
    pub align_pos: u32,
    /// Scales the note's samples before blending.
    pub volume: f32,
}

impl NoteBuffer {
    pub fn new(sample_rate: u32) -> Self {
        NoteBuffer {
            sample_rate,
            data: Vec::new(),
            cursor_delta: 0.0,
            align_pos: 0,
            volume: 1.0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Disk-backed sample store for one output track.
///
/// The write cursor is a fractional sample position so sub-sample pitch
/// timing survives long chains of notes. All sample mutation goes
/// through [`write_blend`](TrackBuffer::write_blend), which is additive.
/// No internal locking: one owner writes a track end to end, and
/// [`combine_tracks`] is the synchronization point after all tracks
/// have finished.
#[derive(Debug)]
pub struct TrackBuffer {
    rate: u32,
    volume: f32,
    cursor: f64,
    align_pos: u32,
    /// Logical sample count of the track.
    length: u32,
    /// Samples currently present in the backing file.
    flushed_len: u32,
    file: File,
    window: Vec<f32>,
    /// Track index of `window[0]`; always a multiple of `WINDOW_SAMPLES`.
    window_start: u32,
    dirty: bool,
}

impl TrackBuffer {
    /// Create an empty track. Acquires the backing temp file up front so
    /// paging failures cannot strike after samples were accepted silently.
    pub fn new(rate: u32) -> Result<Self, CantusError> {
        let file = tempfile::tempfile()?;
        Ok(TrackBuffer {
            rate,
            volume: 1.0,
            cursor: 0.0,
            align_pos: 0,
            length: 0,
            flushed_len: 0,
            file,
            window: vec![0.0; WINDOW_SAMPLES],
            window_start: 0,
            dirty: false,
        })
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }

    /// Number of samples written so far.
    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The track's alignment reference: the largest note pre-roll seen.
    pub fn align_pos(&self) -> u32 {
        self.align_pos
    }

    /// Current write position in fractional sample units.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn set_cursor(&mut self, position: f64) {
        self.cursor = position;
    }

    /// Advance (or rewind) the write cursor. Stored samples are untouched.
    pub fn move_cursor(&mut self, delta: f64) {
        self.cursor += delta;
    }

    /// Additively write a note at the current cursor position.
    ///
    /// The effective start is `cursor + cursor_delta - align_pos`; its
    /// fractional part splits every note sample across the two adjacent
    /// track samples with linear weights, so sub-sample timing is kept.
    /// Existing content is summed with, never overwritten; writing past
    /// the end zero-extends the track. Portions that would land before
    /// sample 0 are clipped.
    ///
    /// The note must be synthesized at the track rate; a mismatched
    /// note is refused with [`CantusError::RateMismatch`].
    pub fn write_blend(&mut self, note: &NoteBuffer) -> Result<(), CantusError> {
        if note.sample_rate != self.rate {
            return Err(CantusError::RateMismatch {
                note_rate: note.sample_rate,
                track_rate: self.rate,
            });
        }

        let start = self.cursor + note.cursor_delta as f64 - note.align_pos as f64;
        let base = start.floor();
        let frac = (start - base) as f32;
        let base = base as i64;

        for (i, &s) in note.data.iter().enumerate() {
            let pos = base + i as i64;
            let v = s * note.volume;
            if pos >= 0 {
                self.add_at(pos as u32, v * (1.0 - frac))?;
            }
            if frac > 0.0 && pos + 1 >= 0 {
                self.add_at((pos + 1) as u32, v * frac)?;
            }
        }

        self.align_pos = self.align_pos.max(note.align_pos);
        Ok(())
    }

    /// Read one sample. Indices beyond the written length are silence.
    pub fn sample(&mut self, index: u32) -> Result<f32, CantusError> {
        if index >= self.length {
            return Ok(0.0);
        }
        self.ensure_window(index)?;
        Ok(self.window[(index - self.window_start) as usize])
    }

    /// Read a contiguous range into `out`, paging windows in as needed.
    /// The range may extend past the written length; the excess is zeroed.
    pub fn get_samples(&mut self, start: u32, out: &mut [f32]) -> Result<(), CantusError> {
        let mut index = start;
        let mut filled = 0usize;
        while filled < out.len() {
            if index >= self.length {
                out[filled..].fill(0.0);
                break;
            }
            self.ensure_window(index)?;
            let offset = (index - self.window_start) as usize;
            let window_left = WINDOW_SAMPLES - offset;
            let track_left = (self.length - index) as usize;
            let n = (out.len() - filled).min(window_left).min(track_left);
            out[filled..filled + n].copy_from_slice(&self.window[offset..offset + n]);
            filled += n;
            index += n as u32;
        }
        Ok(())
    }

    /// True maximum absolute sample value over the full written range.
    pub fn max_value(&mut self) -> Result<f32, CantusError> {
        let mut max = 0.0f32;
        let mut chunk = vec![0.0f32; SCAN_CHUNK];
        let mut start = 0u32;
        while start < self.length {
            let n = SCAN_CHUNK.min((self.length - start) as usize);
            self.get_samples(start, &mut chunk[..n])?;
            for &s in &chunk[..n] {
                max = max.max(s.abs());
            }
            start += n as u32;
        }
        Ok(max)
    }

    /// Nominal volume over peak: the per-track scaling that mixdown uses
    /// so tracks self-normalize. 1.0 for a silent track.
    pub fn absolute_volume(&mut self) -> Result<f32, CantusError> {
        let max = self.max_value()?;
        Ok(if max > 0.0 { self.volume / max } else { 1.0 })
    }

    /// The whole track as normalized 16-bit PCM.
    pub fn pcm_i16(&mut self) -> Result<Vec<i16>, CantusError> {
        let norm = self.absolute_volume()?;
        let mut pcm = Vec::with_capacity(self.length as usize);
        let mut chunk = vec![0.0f32; SCAN_CHUNK];
        let mut start = 0u32;
        while start < self.length {
            let n = SCAN_CHUNK.min((self.length - start) as usize);
            self.get_samples(start, &mut chunk[..n])?;
            for &s in &chunk[..n] {
                pcm.push(((s * norm).clamp(-1.0, 1.0) * 32767.0) as i16);
            }
            start += n as u32;
        }
        Ok(pcm)
    }

    /// Add one value to the sample at `index`, extending the track.
    fn add_at(&mut self, index: u32, value: f32) -> Result<(), CantusError> {
        self.ensure_window(index)?;
        self.window[(index - self.window_start) as usize] += value;
        self.dirty = true;
        if index >= self.length {
            self.length = index + 1;
        }
        Ok(())
    }

    /// Additively write a run of samples at integer positions.
    fn add_run(&mut self, start: u32, samples: &[f32]) -> Result<(), CantusError> {
        for (i, &s) in samples.iter().enumerate() {
            self.add_at(start + i as u32, s)?;
        }
        Ok(())
    }

    /// Make the window cover `index`, flushing and reloading on a miss.
    fn ensure_window(&mut self, index: u32) -> Result<(), CantusError> {
        let target = index - index % WINDOW_SAMPLES as u32;
        if target == self.window_start {
            return Ok(());
        }
        self.flush()?;
        debug!(
            from = self.window_start,
            to = target,
            "track window miss, repositioning"
        );
        self.window_start = target;
        self.window.fill(0.0);
        if target < self.flushed_len {
            let n = ((self.flushed_len - target) as usize).min(WINDOW_SAMPLES);
            read_f32s(&mut self.file, target, &mut self.window[..n])?;
        }
        Ok(())
    }

    /// Write the dirty part of the window back to the backing file.
    fn flush(&mut self) -> Result<(), CantusError> {
        if !self.dirty {
            return Ok(());
        }
        let covered = (self.length.saturating_sub(self.window_start) as usize).min(WINDOW_SAMPLES);
        if covered > 0 {
            write_f32s(&mut self.file, self.window_start, &self.window[..covered])?;
            self.flushed_len = self.flushed_len.max(self.window_start + covered as u32);
        }
        self.dirty = false;
        Ok(())
    }
}

/// Mix `tracks` into `sum`.
///
/// Tracks are aligned on the largest pre-roll among them, each scaled by
/// its own volume-over-peak ratio, and summed per sample. The output
/// length is the maximum aligned length; shorter tracks contribute
/// silence past their end. Summation is commutative in track order up
/// to floating-point rounding. Inputs are only read (the `&mut` is for
/// paging), so this is the designed post-generation synchronization
/// point.
pub fn combine_tracks(sum: &mut TrackBuffer, tracks: &mut [TrackBuffer]) -> Result<(), CantusError> {
    if tracks.is_empty() {
        return Ok(());
    }

    let max_align = tracks.iter().map(|t| t.align_pos).max().unwrap_or(0);
    let out_len = tracks
        .iter()
        .map(|t| t.length.saturating_sub(t.align_pos) + max_align)
        .max()
        .unwrap_or(0);

    let mut ratios = Vec::with_capacity(tracks.len());
    for track in tracks.iter_mut() {
        ratios.push(track.absolute_volume()?);
    }

    let mut acc = vec![0.0f32; SCAN_CHUNK];
    let mut part = vec![0.0f32; SCAN_CHUNK];
    let mut start = 0u32;
    while start < out_len {
        let n = SCAN_CHUNK.min((out_len - start) as usize);
        acc[..n].fill(0.0);
        for (track, &ratio) in tracks.iter_mut().zip(&ratios) {
            // Output position `start` maps to this track's position
            // `start - (max_align - track.align_pos)`.
            let shift = max_align - track.align_pos;
            let (src_start, skip) = if start >= shift {
                (start - shift, 0usize)
            } else {
                (0, (shift - start) as usize)
            };
            if skip >= n {
                continue;
            }
            track.get_samples(src_start, &mut part[..n - skip])?;
            for (a, &p) in acc[skip..n].iter_mut().zip(&part[..n - skip]) {
                *a += p * ratio;
            }
        }
        sum.add_run(start, &acc[..n])?;
        start += n as u32;
    }

    sum.align_pos = sum.align_pos.max(max_align);
    Ok(())
}

fn write_f32s(file: &mut File, offset_samples: u32, data: &[f32]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset_samples as u64 * 4))?;
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for &s in data {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    file.write_all(&bytes)
}

fn read_f32s(file: &mut File, offset_samples: u32, out: &mut [f32]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset_samples as u64 * 4))?;
    let mut bytes = vec![0u8; out.len() * 4];
    file.read_exact(&mut bytes)?;
    for (s, b) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *s = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    }
    Ok(())
}
