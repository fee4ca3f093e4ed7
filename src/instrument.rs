//! Instrument sample loading and the origin-frequency cache.
//!
//! An `InstrumentSample` is one source recording loaded into memory
//! together with its detected fundamental pitch. Detection is expensive,
//! so the result is memoized in a plain-text `.freq` sidecar next to the
//! recording. The sidecar carries a content digest of the samples; if
//! the recording is replaced, the stale cache is ignored and detection
//! reruns.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::CantusError;
use crate::pitch;
use crate::sentence::{PieceSource, SourceFetcher};
use crate::wav;

/// One loaded source recording plus its cached origin frequency.
#[derive(Debug, Clone)]
pub struct InstrumentSample {
    sample_rate: u32,
    samples: Vec<f32>,
    peak: f32,
    origin_freq: f32,
}

impl InstrumentSample {
    /// Load `<root>/<name>.wav` (or `<root>/<group>/<name>.wav`), then
    /// fetch the origin frequency from the `.freq` sidecar or run
    /// detection and write the sidecar back.
    ///
    /// Any decode failure leaves no partial state; the caller simply
    /// never receives an instance. Sidecar write failure is non-fatal.
    pub fn load(root: &Path, name: &str, group: Option<&str>) -> Result<Self, CantusError> {
        let wav_path = sample_path(root, name, group, "wav");
        let decoded = wav::read_wav(&wav_path)?;

        let freq_path = sample_path(root, name, group, "freq");
        let origin_freq = fetch_origin_freq(&freq_path, &wav_path, &decoded)?;

        Ok(InstrumentSample {
            sample_rate: decoded.sample_rate,
            samples: decoded.samples,
            peak: decoded.peak,
            origin_freq,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn peak(&self) -> f32 {
        self.peak
    }

    /// Fundamental pitch of the recording, in Hz. Always positive.
    pub fn origin_freq(&self) -> f32 {
        self.origin_freq
    }

    /// Borrowed view used by sentence generation.
    pub fn as_source(&self) -> PieceSource<'_> {
        PieceSource {
            samples: &self.samples,
            sample_rate: self.sample_rate,
            origin_freq: self.origin_freq,
        }
    }
}

fn sample_path(root: &Path, name: &str, group: Option<&str>, ext: &str) -> PathBuf {
    match group {
        Some(g) => root.join(g).join(format!("{name}.{ext}")),
        None => root.join(format!("{name}.{ext}")),
    }
}

/// Read the cached frequency, or detect and write it back.
fn fetch_origin_freq(
    freq_path: &Path,
    wav_path: &Path,
    decoded: &wav::DecodedSample,
) -> Result<f32, CantusError> {
    let digest = content_digest(&decoded.samples);
    if let Some(freq) = read_sidecar(freq_path, &digest) {
        return Ok(freq);
    }

    let freq = pitch::detect_frequency(&decoded.samples, decoded.sample_rate).ok_or_else(|| {
        CantusError::Decode {
            path: wav_path.to_path_buf(),
            reason: "no detectable fundamental frequency".to_string(),
        }
    })?;
    info!(
        path = %wav_path.display(),
        freq_hz = freq,
        "detected origin frequency"
    );

    // Best effort: a read-only sample directory still renders fine, the
    // detection just reruns next time.
    if let Err(e) = fs::write(freq_path, format!("{freq}\n{digest}\n")) {
        warn!(
            path = %freq_path.display(),
            error = %e,
            "could not write frequency sidecar"
        );
    }
    Ok(freq)
}

/// Parse a sidecar file: frequency on line 1, optional content digest on
/// line 2. A one-line file (the original cache layout) is accepted with
/// the digest check skipped; a digest mismatch invalidates the cache.
fn read_sidecar(path: &Path, digest: &str) -> Option<f32> {
    let text = fs::read_to_string(path).ok()?;
    let mut lines = text.lines();
    let freq: f32 = lines.next()?.trim().parse().ok()?;
    if freq <= 0.0 || !freq.is_finite() {
        return None;
    }
    match lines.next().map(str::trim) {
        Some(cached) if !cached.is_empty() && cached != digest => None,
        _ => Some(freq),
    }
}

/// Hex SHA-256 over the raw little-endian sample bytes.
fn content_digest(samples: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for &s in samples {
        hasher.update(s.to_le_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Load-once registry of instrument samples rooted at one directory.
///
/// Keys are `name` or `group/name`, matching the lyric identities a
/// sentence refers to. Each recording is loaded (and its frequency
/// fetched) at most once per bank.
#[derive(Debug)]
pub struct InstrumentBank {
    root: PathBuf,
    loaded: HashMap<String, InstrumentSample>,
}

impl InstrumentBank {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        InstrumentBank {
            root: root.into(),
            loaded: HashMap::new(),
        }
    }

    /// Get a sample, loading it on first use. The returned reference is
    /// also reachable afterwards through the `SourceFetcher` impl under
    /// the key `name` or `group/name`.
    pub fn get(&mut self, name: &str, group: Option<&str>) -> Result<&InstrumentSample, CantusError> {
        let key = match group {
            Some(g) => format!("{g}/{name}"),
            None => name.to_string(),
        };
        if !self.loaded.contains_key(&key) {
            let sample = InstrumentSample::load(&self.root, name, group)?;
            self.loaded.insert(key.clone(), sample);
        }
        Ok(&self.loaded[&key])
    }

    /// Load every distinct lyric in `lyrics` up front, so generation can
    /// fetch with `&self` and a missing recording fails before any
    /// samples are written.
    pub fn ensure<'a>(&mut self, lyrics: impl IntoIterator<Item = &'a str>) -> Result<(), CantusError> {
        for lyric in lyrics {
            match lyric.split_once('/') {
                Some((group, name)) => self.get(name, Some(group))?,
                None => self.get(lyric, None)?,
            };
        }
        Ok(())
    }
}

impl SourceFetcher for InstrumentBank {
    fn fetch(&self, lyric: &str) -> Option<PieceSource<'_>> {
        self.loaded.get(lyric).map(|s| s.as_source())
    }
}
