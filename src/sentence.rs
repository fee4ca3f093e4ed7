//! Sentence generation: stitching per-note audio pieces into one
//! continuous, phase-coherent track region.
//!
//! A sentence is an ordered list of pieces (one per lyric/note). The
//! orchestrator resolves each piece against its instrument sample,
//! dispatches synthesis to a backend, and blends the result into a
//! `TrackBuffer`. The backend seam is a single capability: synthesize
//! one piece given neighboring context and the running oscillator
//! phase. Phase is explicit state, threaded through every call, so
//! concatenated pieces meet without a discontinuity.

use serde::{Deserialize, Serialize};

use crate::error::CantusError;
use crate::track::{NoteBuffer, TrackBuffer};

/// One lyric/note unit within a sentence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Piece {
    /// Lyric identity, resolved against a `SourceFetcher`.
    pub lyric: String,
    /// Vowels sustain by periodic wavetable playback; consonants replay
    /// their transient head.
    pub is_vowel: bool,
    /// Cross-fade weight into the next piece, in `[0, 1]` as a fraction
    /// of this piece's length.
    #[serde(default = "default_weight")]
    pub weight: f32,
    /// Per-note volume applied when blending into the track.
    #[serde(default = "default_volume")]
    pub volume: f32,
    /// Target duration in samples at the track rate.
    pub length: u32,
    /// Target frequency in Hz per output sample; `length` entries.
    pub freq_map: Vec<f32>,
}

fn default_weight() -> f32 {
    0.1
}

fn default_volume() -> f32 {
    1.0
}

/// An ordered piece list rendered as one continuous track region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sentence {
    pub pieces: Vec<Piece>,
}

impl Sentence {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Total duration in samples.
    pub fn total_length(&self) -> u64 {
        self.pieces.iter().map(|p| p.length as u64).sum()
    }
}

/// Borrowed view of a resolved instrument sample.
#[derive(Debug, Clone, Copy)]
pub struct PieceSource<'a> {
    pub samples: &'a [f32],
    pub sample_rate: u32,
    /// Fundamental pitch of the recording, in Hz. Positive.
    pub origin_freq: f32,
}

/// Resolves a lyric identity to its source recording.
///
/// Implementations must hand out already-loaded data: the orchestrator
/// resolves every lyric before the first sample is written, so a
/// missing source aborts the sentence without partial output.
pub trait SourceFetcher {
    fn fetch(&self, lyric: &str) -> Option<PieceSource<'_>>;
}

/// Per-piece resampling parameters derived from the source and piece.
#[derive(Debug, Clone, Copy)]
pub struct DerivedInfo {
    /// Source samples per period at the origin pitch.
    pub period: f32,
    /// Source rate over track rate.
    pub rate_ratio: f32,
    /// Consonant samples sounding ahead of the beat. Zero for vowels
    /// and for the first note of a sentence.
    pub preroll: u32,
}

/// Consonant pre-roll cap, in samples at the track rate (~23 ms at
/// 44100 Hz).
const MAX_PREROLL: u32 = 1024;

fn derive_info(source: &PieceSource<'_>, piece: &Piece, track_rate: u32, first_note: bool) -> DerivedInfo {
    let preroll = if piece.is_vowel || first_note {
        0
    } else {
        (piece.length / 4).min(MAX_PREROLL)
    };
    DerivedInfo {
        period: source.sample_rate as f32 / source.origin_freq,
        rate_ratio: source.sample_rate as f32 / track_rate as f32,
        preroll,
    }
}

/// Everything a backend needs to synthesize one piece.
pub struct PieceRequest<'a> {
    pub is_vowel: bool,
    pub length: u32,
    pub freq_map: &'a [f32],
    pub first_note: bool,
    pub has_next_note: bool,
    /// Cross-fade weight into the next piece.
    pub weight: f32,
    pub source: &'a PieceSource<'a>,
    /// Present whenever `has_next_note`.
    pub next_source: Option<&'a PieceSource<'a>>,
    pub derived: DerivedInfo,
    pub track_rate: u32,
}

/// A synthesis backend: one capability, chosen at generator
/// construction.
///
/// `phase` is the running oscillator phase in fractional periods,
/// `[0, 1)`. The backend consumes the phase the previous piece ended on
/// and returns the phase this piece ends on; the orchestrator threads
/// it through the whole sentence.
pub trait PieceGenerator {
    fn generate_piece(
        &self,
        req: &PieceRequest<'_>,
        phase: f32,
        dst: &mut Vec<f32>,
    ) -> Result<f32, CantusError>;
}

/// Reference CPU backend.
///
/// Vowels read one period of the source's sustained region as a
/// wavetable, the read position driven directly by the running phase,
/// so the target freq map is followed exactly and phase continuity is
/// structural. Consonants replay the transient head of the recording at
/// the native rate ratio (time-domain, not pitch-looped) while the
/// phase keeps advancing underneath for the following vowel. When a
/// next note exists, the tail cross-fades into the next source rendered
/// at the same phase; the final note of a sentence skips the fade.
pub struct CpuPieceGenerator;

impl PieceGenerator for CpuPieceGenerator {
    fn generate_piece(
        &self,
        req: &PieceRequest<'_>,
        phase: f32,
        dst: &mut Vec<f32>,
    ) -> Result<f32, CantusError> {
        let n = req.length as usize;
        dst.clear();
        dst.reserve(n);

        let mut phase = if req.first_note { 0.0 } else { phase };
        let rate = req.track_rate as f32;

        let fade_len = if req.has_next_note {
            ((req.weight.clamp(0.0, 1.0) * n as f32) as usize).min(n)
        } else {
            0
        };
        let fade_start = n - fade_len;

        let next = req.next_source;
        let next_period = next.map(|s| s.sample_rate as f32 / s.origin_freq);

        for t in 0..n {
            let f = req.freq_map[t];
            let mut s = if req.is_vowel {
                read_wavetable(req.source, req.derived.period, phase)
            } else {
                read_transient(req.source, req.derived.rate_ratio, t)
            };

            if fade_len > 0 && t >= fade_start {
                if let (Some(next_src), Some(period)) = (next, next_period) {
                    let into = (t - fade_start) as f32 / fade_len as f32;
                    let next_s = read_wavetable(next_src, period, phase);
                    s = s * (1.0 - into) + next_s * into;
                }
            }

            dst.push(s);
            phase += f / rate;
            if phase >= 1.0 {
                phase -= 1.0;
            }
        }

        Ok(phase)
    }
}

/// Read the source's sustained region as a single-cycle wavetable at
/// the given phase, with linear interpolation.
fn read_wavetable(source: &PieceSource<'_>, period: f32, phase: f32) -> f32 {
    if source.samples.is_empty() || period <= 0.0 {
        return 0.0;
    }
    // Anchor the cycle in the middle of the recording, past the onset
    // transient, and keep a full period of headroom before the end.
    let max_start = (source.samples.len() as f32 - period - 1.0).max(0.0);
    let start = (source.samples.len() as f32 / 2.0).min(max_start);
    read_interpolated(source.samples, start + phase * period)
}

/// Replay the head of the recording at the native rate ratio,
/// preserving the consonant transient. Past the end reads silence.
fn read_transient(source: &PieceSource<'_>, rate_ratio: f32, t: usize) -> f32 {
    read_interpolated(source.samples, t as f32 * rate_ratio)
}

/// Linear interpolation at a fractional position; out of range is 0.
fn read_interpolated(samples: &[f32], position: f32) -> f32 {
    if samples.is_empty() || position < 0.0 {
        return 0.0;
    }
    let idx = position as usize;
    if idx + 1 >= samples.len() {
        return if idx < samples.len() { samples[idx] } else { 0.0 };
    }
    let frac = position - idx as f32;
    samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
}

/// Orchestrates sentence rendering through a chosen backend.
pub struct SentenceGenerator {
    backend: Box<dyn PieceGenerator>,
}

impl SentenceGenerator {
    /// The CPU reference backend.
    pub fn cpu() -> Self {
        SentenceGenerator {
            backend: Box::new(CpuPieceGenerator),
        }
    }

    pub fn with_backend(backend: Box<dyn PieceGenerator>) -> Self {
        SentenceGenerator { backend }
    }

    /// Render a whole sentence into `track`, starting at the track's
    /// current cursor and leaving the cursor at the sentence's end.
    ///
    /// Every lyric is resolved before anything is written: an
    /// unresolvable piece is a hard failure for the whole sentence, not
    /// a silent gap. Phase starts fresh on the first note and is
    /// threaded through every piece; the last piece gets
    /// `has_next_note = false` and writes no trailing fade.
    pub fn generate(
        &self,
        fetcher: &dyn SourceFetcher,
        sentence: &Sentence,
        track: &mut TrackBuffer,
    ) -> Result<(), CantusError> {
        let mut sources = Vec::with_capacity(sentence.pieces.len());
        for piece in &sentence.pieces {
            if piece.freq_map.len() != piece.length as usize {
                return Err(CantusError::Generation {
                    lyric: piece.lyric.clone(),
                    reason: format!(
                        "frequency map holds {} entries for {} samples",
                        piece.freq_map.len(),
                        piece.length
                    ),
                });
            }
            let source = fetcher.fetch(&piece.lyric).ok_or_else(|| CantusError::Generation {
                lyric: piece.lyric.clone(),
                reason: "no instrument sample for lyric".to_string(),
            })?;
            sources.push(source);
        }

        let mut phase = 0.0f32;
        let mut data = Vec::new();
        for (i, piece) in sentence.pieces.iter().enumerate() {
            let first_note = i == 0;
            let has_next = i + 1 < sentence.pieces.len();
            let derived = derive_info(&sources[i], piece, track.rate(), first_note);

            let req = PieceRequest {
                is_vowel: piece.is_vowel,
                length: piece.length,
                freq_map: &piece.freq_map,
                first_note,
                has_next_note: has_next,
                weight: piece.weight,
                source: &sources[i],
                next_source: if has_next { Some(&sources[i + 1]) } else { None },
                derived,
                track_rate: track.rate(),
            };

            phase = self.backend.generate_piece(&req, phase, &mut data)?;

            let note = NoteBuffer {
                sample_rate: track.rate(),
                data: std::mem::take(&mut data),
                cursor_delta: 0.0,
                align_pos: derived.preroll,
                volume: piece.volume,
            };
            track.write_blend(&note)?;
            track.move_cursor(piece.length as f64);
            data = note.data;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::f32::consts::PI;
    use std::rc::Rc;

    struct MapFetcher {
        sources: HashMap<String, (Vec<f32>, u32, f32)>,
    }

    impl MapFetcher {
        fn with_sine(lyrics: &[&str], freq: f32, sample_rate: u32) -> Self {
            let samples: Vec<f32> = (0..sample_rate as usize)
                .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
                .collect();
            let sources = lyrics
                .iter()
                .map(|&l| (l.to_string(), (samples.clone(), sample_rate, freq)))
                .collect();
            MapFetcher { sources }
        }
    }

    impl SourceFetcher for MapFetcher {
        fn fetch(&self, lyric: &str) -> Option<PieceSource<'_>> {
            self.sources.get(lyric).map(|(samples, rate, freq)| PieceSource {
                samples,
                sample_rate: *rate,
                origin_freq: *freq,
            })
        }
    }

    fn vowel_piece(lyric: &str, length: u32, freq: f32) -> Piece {
        Piece {
            lyric: lyric.to_string(),
            is_vowel: true,
            weight: 0.1,
            volume: 1.0,
            length,
            freq_map: vec![freq; length as usize],
        }
    }

    /// Backend that records the phases handed to it.
    struct PhaseSpy {
        seen: Rc<RefCell<Vec<(f32, bool, bool)>>>,
        inner: CpuPieceGenerator,
    }

    impl PieceGenerator for PhaseSpy {
        fn generate_piece(
            &self,
            req: &PieceRequest<'_>,
            phase: f32,
            dst: &mut Vec<f32>,
        ) -> Result<f32, CantusError> {
            self.seen
                .borrow_mut()
                .push((phase, req.first_note, req.has_next_note));
            self.inner.generate_piece(req, phase, dst)
        }
    }

    #[test]
    fn phase_threads_across_pieces() {
        let fetcher = MapFetcher::with_sine(&["a", "i"], 440.0, 44100);
        let sentence = Sentence {
            pieces: vec![vowel_piece("a", 1000, 440.0), vowel_piece("i", 1000, 440.0)],
        };

        let seen = Rc::new(RefCell::new(Vec::new()));
        let generator = SentenceGenerator::with_backend(Box::new(PhaseSpy {
            seen: Rc::clone(&seen),
            inner: CpuPieceGenerator,
        }));

        let mut track = TrackBuffer::new(44100).unwrap();
        generator.generate(&fetcher, &sentence, &mut track).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (0.0, true, true));

        // Note 2's incoming phase continues note 1's ending phase:
        // 1000 samples of 440 Hz at 44100 Hz, wrapped to [0, 1).
        let expected = (1000.0 * 440.0 / 44100.0_f32).fract();
        let (incoming, first, has_next) = seen[1];
        assert!(!first);
        assert!(!has_next, "Final note must not cross-fade onward");
        assert!(
            (incoming - expected).abs() < 1e-3,
            "Phase discontinuity at note boundary: got {incoming}, want {expected}"
        );
    }

    #[test]
    fn two_note_sentence_writes_exact_length() {
        let fetcher = MapFetcher::with_sine(&["a", "i"], 440.0, 44100);
        let sentence = Sentence {
            pieces: vec![vowel_piece("a", 1200, 440.0), vowel_piece("i", 800, 440.0)],
        };

        let mut track = TrackBuffer::new(44100).unwrap();
        SentenceGenerator::cpu()
            .generate(&fetcher, &sentence, &mut track)
            .unwrap();

        // No trailing cross-fade past the last note.
        assert_eq!(track.len(), 2000);
        assert!((track.cursor() - 2000.0).abs() < 1e-9);
        assert!(track.max_value().unwrap() > 0.1, "Sentence should be audible");
    }

    #[test]
    fn boundary_is_click_free() {
        // Same source and pitch on both sides: with continuous phase the
        // sample-to-sample step across the boundary stays in the same
        // range as within a piece.
        let fetcher = MapFetcher::with_sine(&["a", "i"], 440.0, 44100);
        let sentence = Sentence {
            pieces: vec![vowel_piece("a", 1000, 440.0), vowel_piece("i", 1000, 440.0)],
        };

        let mut track = TrackBuffer::new(44100).unwrap();
        SentenceGenerator::cpu()
            .generate(&fetcher, &sentence, &mut track)
            .unwrap();

        let mut out = vec![0.0f32; 2000];
        track.get_samples(0, &mut out).unwrap();

        // Max slope of a 440 Hz unit sine at 44100 Hz is ~0.0627.
        let boundary_step = (out[1000] - out[999]).abs();
        assert!(
            boundary_step < 0.08,
            "Click at note boundary: step {boundary_step}"
        );
    }

    #[test]
    fn vowel_follows_freq_map() {
        // Count sign changes to estimate the rendered pitch.
        let fetcher = MapFetcher::with_sine(&["a"], 440.0, 44100);
        let length = 44100u32;
        let sentence = Sentence {
            pieces: vec![vowel_piece("a", length, 220.0)],
        };

        let mut track = TrackBuffer::new(44100).unwrap();
        SentenceGenerator::cpu()
            .generate(&fetcher, &sentence, &mut track)
            .unwrap();

        let mut out = vec![0.0f32; length as usize];
        track.get_samples(0, &mut out).unwrap();
        let crossings = out
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();
        // 220 Hz over one second: ~440 zero crossings.
        assert!(
            (crossings as i64 - 440).abs() < 30,
            "Expected ~440 crossings for 220 Hz, got {crossings}"
        );
    }

    #[test]
    fn consonant_preserves_transient() {
        // A source with a distinctive ramp head: the consonant renderer
        // must replay it linearly, not loop it by phase.
        let head: Vec<f32> = (0..2000).map(|i| i as f32 / 2000.0).collect();
        let mut fetcher = MapFetcher::with_sine(&[], 440.0, 44100);
        fetcher
            .sources
            .insert("k".to_string(), (head, 44100, 440.0));

        let piece = Piece {
            lyric: "k".to_string(),
            is_vowel: false,
            weight: 0.0,
            volume: 1.0,
            length: 1000,
            freq_map: vec![440.0; 1000],
        };
        let sentence = Sentence { pieces: vec![piece] };

        let mut track = TrackBuffer::new(44100).unwrap();
        SentenceGenerator::cpu()
            .generate(&fetcher, &sentence, &mut track)
            .unwrap();

        for &i in &[100u32, 500, 900] {
            let got = track.sample(i).unwrap();
            let want = i as f32 / 2000.0;
            assert!(
                (got - want).abs() < 1e-3,
                "Transient not preserved at {i}: got {got}, want {want}"
            );
        }
    }

    #[test]
    fn missing_lyric_aborts_before_writing() {
        let fetcher = MapFetcher::with_sine(&["a"], 440.0, 44100);
        let sentence = Sentence {
            pieces: vec![vowel_piece("a", 1000, 440.0), vowel_piece("nope", 1000, 440.0)],
        };

        let mut track = TrackBuffer::new(44100).unwrap();
        let result = SentenceGenerator::cpu().generate(&fetcher, &sentence, &mut track);

        assert!(matches!(result, Err(CantusError::Generation { .. })));
        assert_eq!(track.len(), 0, "No partial sentence may be written");
        assert_eq!(track.cursor(), 0.0);
    }

    #[test]
    fn freq_map_length_mismatch_rejected() {
        let fetcher = MapFetcher::with_sine(&["a"], 440.0, 44100);
        let mut piece = vowel_piece("a", 1000, 440.0);
        piece.freq_map.truncate(500);
        let sentence = Sentence { pieces: vec![piece] };

        let mut track = TrackBuffer::new(44100).unwrap();
        let result = SentenceGenerator::cpu().generate(&fetcher, &sentence, &mut track);
        assert!(matches!(result, Err(CantusError::Generation { .. })));
    }

    #[test]
    fn sentence_json_roundtrip() {
        let sentence = Sentence {
            pieces: vec![vowel_piece("a", 4, 440.0)],
        };
        let json = serde_json::to_string(&sentence).unwrap();
        let back = Sentence::from_json(&json).unwrap();
        assert_eq!(back.pieces.len(), 1);
        assert_eq!(back.pieces[0].lyric, "a");
        assert_eq!(back.pieces[0].length, 4);
        assert_eq!(back.total_length(), 4);
    }

    #[test]
    fn json_defaults_for_weight_and_volume() {
        let json = r#"{"pieces":[{"lyric":"a","is_vowel":true,"length":2,"freq_map":[440.0,440.0]}]}"#;
        let sentence = Sentence::from_json(json).unwrap();
        assert!((sentence.pieces[0].weight - 0.1).abs() < 1e-6);
        assert!((sentence.pieces[0].volume - 1.0).abs() < 1e-6);
    }
}
