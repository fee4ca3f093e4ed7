use std::fmt;
use std::io;
use std::path::PathBuf;

/// Error type for the rendering core.
///
/// Sidecar-cache I/O problems are intentionally not represented here:
/// an unreadable sidecar falls back to detection, and a failed sidecar
/// write is logged and swallowed.
#[derive(Debug)]
pub enum CantusError {
    /// A source recording is missing or malformed. A failed load
    /// retains no partial state.
    Decode { path: PathBuf, reason: String },
    /// A piece could not be synthesized. Fatal to the whole sentence.
    Generation { lyric: String, reason: String },
    /// Backing-storage paging failed. Fatal to the affected track.
    BufferIo(io::Error),
    /// A note synthesized at one rate was blended into a track running
    /// at another. Blending it anyway would silently shift pitch and
    /// duration, so the write is refused.
    RateMismatch { note_rate: u32, track_rate: u32 },
}

impl fmt::Display for CantusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CantusError::Decode { path, reason } => {
                write!(f, "Failed to decode '{}': {reason}", path.display())
            }
            CantusError::Generation { lyric, reason } => {
                write!(f, "Failed to generate piece '{lyric}': {reason}")
            }
            CantusError::BufferIo(e) => write!(f, "Track buffer I/O error: {e}"),
            CantusError::RateMismatch {
                note_rate,
                track_rate,
            } => {
                write!(
                    f,
                    "Cannot blend a {note_rate} Hz note into a {track_rate} Hz track"
                )
            }
        }
    }
}

impl std::error::Error for CantusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CantusError::BufferIo(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CantusError {
    fn from(e: io::Error) -> Self {
        CantusError::BufferIo(e)
    }
}
