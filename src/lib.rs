//! cantus — the sample-accurate rendering core of a singing-voice
//! synthesis engine.
//!
//! Given a sequence of lyric pieces with target pitches, durations and
//! cross-fade weights, it produces a continuous, phase-coherent
//! waveform per track and mixes tracks into a final output. Instrument
//! recordings are loaded once per bank and their fundamental frequency
//! is detected and cached in a sidecar file; tracks are disk-backed so
//! memory stays bounded for long renders.

pub mod error;
pub mod instrument;
pub mod pitch;
pub mod sentence;
pub mod track;
pub mod wav;

use std::path::Path;

pub use error::CantusError;
pub use instrument::{InstrumentBank, InstrumentSample};
pub use sentence::{Piece, Sentence, SentenceGenerator, SourceFetcher};
pub use track::{NoteBuffer, TrackBuffer, combine_tracks};

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Render one sentence into a fresh track through the CPU backend.
pub fn render_sentence(
    fetcher: &dyn SourceFetcher,
    sentence: &Sentence,
    rate: u32,
) -> Result<TrackBuffer, CantusError> {
    let mut track = TrackBuffer::new(rate)?;
    SentenceGenerator::cpu().generate(fetcher, sentence, &mut track)?;
    Ok(track)
}

/// Mix finished tracks and write the result as a 16-bit mono WAV file.
///
/// Must only run after every contributing track has finished
/// generating; each track self-normalizes by its volume-over-peak
/// ratio before the sum.
pub fn mix_to_wav(
    tracks: &mut [TrackBuffer],
    rate: u32,
    path: &Path,
) -> Result<(), CantusError> {
    let mut sum = TrackBuffer::new(rate)?;
    combine_tracks(&mut sum, tracks)?;
    wav::write_track_wav(&mut sum, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn write_sine_wav(path: &Path, freq: f32, sample_rate: u32, duration: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let n = (sample_rate as f32 * duration) as usize;
        for i in 0..n {
            let s = (2.0 * PI * freq * i as f32 / sample_rate as f32).sin() * 0.8;
            writer.write_sample((s * 32767.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn end_to_end_bank_sentence_mixdown() {
        let dir = tempfile::tempdir().unwrap();
        write_sine_wav(&dir.path().join("a.wav"), 440.0, 44100, 1.0);
        write_sine_wav(&dir.path().join("o.wav"), 330.0, 44100, 1.0);

        let mut bank = InstrumentBank::new(dir.path());
        bank.ensure(["a", "o"]).unwrap();

        let lead = Sentence {
            pieces: vec![
                Piece {
                    lyric: "a".to_string(),
                    is_vowel: true,
                    weight: 0.1,
                    volume: 1.0,
                    length: 4410,
                    freq_map: vec![440.0; 4410],
                },
                Piece {
                    lyric: "o".to_string(),
                    is_vowel: true,
                    weight: 0.1,
                    volume: 1.0,
                    length: 4410,
                    freq_map: vec![330.0; 4410],
                },
            ],
        };
        let harmony = Sentence {
            pieces: vec![Piece {
                lyric: "o".to_string(),
                is_vowel: true,
                weight: 0.1,
                volume: 0.5,
                length: 6000,
                freq_map: vec![220.0; 6000],
            }],
        };

        let mut track_a = render_sentence(&bank, &lead, 44100).unwrap();
        let track_b = render_sentence(&bank, &harmony, 44100).unwrap();

        assert_eq!(track_a.len(), 8820);
        assert!(track_a.max_value().unwrap() > 0.1);

        let out = dir.path().join("mix.wav");
        mix_to_wav(&mut [track_a, track_b], 44100, &out).unwrap();

        let reader = hound::WavReader::open(&out).unwrap();
        assert_eq!(reader.spec().sample_rate, 44100);
        assert_eq!(reader.len(), 8820, "Mix length is the longest track");
    }
}
