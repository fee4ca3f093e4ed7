//! WAV decoding and encoding for instrument recordings and finished tracks.
//!
//! Decoding accepts integer (8/16/24/32 bit) and float WAV files and
//! downmixes multichannel input to mono. Encoding writes a track as
//! 16-bit mono PCM, normalized by the track's effective volume.

use std::path::Path;

use crate::error::CantusError;
use crate::track::TrackBuffer;

/// A decoded mono recording.
#[derive(Debug, Clone)]
pub struct DecodedSample {
    /// Native sample rate of the recording.
    pub sample_rate: u32,
    /// Mono f32 samples.
    pub samples: Vec<f32>,
    /// Peak absolute amplitude of the payload.
    pub peak: f32,
}

impl DecodedSample {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decode a WAV file into a mono sample buffer.
///
/// Header and payload errors both surface as `CantusError::Decode` with
/// nothing retained.
pub fn read_wav(path: &Path) -> Result<DecodedSample, CantusError> {
    let decode_err = |reason: String| CantusError::Decode {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = hound::WavReader::open(path).map_err(|e| decode_err(format!("{e}")))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(decode_err("zero channels".to_string()));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| decode_err(format!("{e}")))?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(|e| decode_err(format!("{e}")))?
        }
    };

    let samples = downmix(&interleaved, channels);
    if samples.is_empty() {
        return Err(decode_err("empty payload".to_string()));
    }

    let peak = samples.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
    Ok(DecodedSample {
        sample_rate: spec.sample_rate,
        samples,
        peak,
    })
}

/// Average interleaved channels down to mono.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Write a finished track to a 16-bit mono WAV file at the track rate.
///
/// Samples are normalized by the track's effective volume so the loudest
/// sample lands at the nominal track volume.
pub fn write_track_wav(track: &mut TrackBuffer, path: &Path) -> Result<(), CantusError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: track.rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let pcm = track.pcm_i16()?;
    let mut writer = hound::WavWriter::create(path, spec).map_err(hound_io)?;
    for sample in pcm {
        writer.write_sample(sample).map_err(hound_io)?;
    }
    writer.finalize().map_err(hound_io)?;
    Ok(())
}

fn hound_io(e: hound::Error) -> CantusError {
    match e {
        hound::Error::IoError(io) => CantusError::BufferIo(io),
        other => CantusError::BufferIo(std::io::Error::other(format!("{other}"))),
    }
}
