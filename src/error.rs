//! Error types for the codecs, the edit API and the timer service.

use crate::model::Channel;
use std::collections::TryReserveError;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors returned by the project and MIDI codecs.
///
/// The `Display` text is short enough to show directly in a status line.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The file does not exist.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The file exists but could not be read.
    #[error("File read error: {}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file could not be created or fully written.
    #[error("File write error: {}", .path.display())]
    FileWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Bad magic, truncated header or a malformed chunk.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// A well-formed file using a feature we do not handle (MIDI format 2, SMPTE timing).
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A project file written by a newer version.
    #[error("Incompatible version {found} (max supported: {supported})")]
    VersionMismatch { found: u8, supported: u8 },

    /// A buffer allocation failed.
    #[error("Out of memory")]
    OutOfMemory(#[from] TryReserveError),

    /// The removable storage is not mounted.
    #[error("SD card not mounted")]
    StorageNotMounted,
}

impl CodecError {
    /// Maps an I/O error raised while reading `path`.
    pub(crate) fn read(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            CodecError::FileNotFound(path.to_path_buf())
        } else {
            CodecError::FileRead {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// Maps an I/O error raised while writing `path`.
    pub(crate) fn write(path: &Path, source: io::Error) -> Self {
        CodecError::FileWrite {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        CodecError::InvalidFormat(reason.into())
    }
}

/// Errors returned by the engine's edit API.
///
/// None of these are raised on the real-time path; they only tell the caller
/// that an edit did not happen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    /// The composition lock could not be acquired within the edit timeout.
    #[error("sequencer busy, edit dropped")]
    Busy,

    /// The note index does not exist on the channel.
    #[error("no note {index} on {channel} ({len} notes)")]
    NoteIndex {
        channel: Channel,
        index: usize,
        len: usize,
    },
}

/// Errors raised by a [`TimerService`](crate::sequencer::TimerService).
#[derive(Debug, Error)]
pub enum TimerError {
    /// The timer could not be created.
    #[error("failed to create timer '{name}': {reason}")]
    Create { name: &'static str, reason: String },

    /// The timer could not be started.
    #[error("failed to start timer '{name}': {reason}")]
    Start { name: &'static str, reason: String },

    /// Playback was requested before the engine's timers were created.
    #[error("sequencer not initialized")]
    NotInitialized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_error_mapping() {
        let path = Path::new("music/song.mcs");
        let err = CodecError::read(path, io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, CodecError::FileNotFound(ref p) if p == path));

        let err = CodecError::read(path, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, CodecError::FileRead { .. }));
    }

    #[test]
    fn test_user_facing_messages() {
        assert_eq!(CodecError::StorageNotMounted.to_string(), "SD card not mounted");
        assert_eq!(
            CodecError::VersionMismatch {
                found: 3,
                supported: 2
            }
            .to_string(),
            "Incompatible version 3 (max supported: 2)"
        );
        let err = EditError::NoteIndex {
            channel: Channel::Two,
            index: 5,
            len: 2,
        };
        assert_eq!(err.to_string(), "no note 5 on channel 2 (2 notes)");
    }
}
