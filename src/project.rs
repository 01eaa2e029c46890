//! Native project files (.mcs).
//!
//! Compositions are saved in a compact little-endian binary layout that
//! preserves every sequencer field exactly:
//!
//! ```text
//! "MSCS" version:u8 flags:u8
//! tempo:u16 ts_num:u8 ts_den:u8 division:u8 length_bars:u16 loop:u8
//! ch1_instrument:u8 ch2_instrument:u8            (version >= 2 only)
//! ch1_count:u16 { start:u16 duration:u16 pitch:u8 velocity:u8 enabled:u8 }*
//! ch2_count:u16 { ... }*
//! ```
//!
//! Decoding never touches the caller's composition until the whole file has
//! been read successfully.

use crate::error::CodecError;
use crate::model::{Composition, NoteEvent, StepDivision};
use crate::storage::{has_extension, Storage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// File magic, the bytes `M S C S`.
pub const PROJECT_MAGIC: [u8; 4] = *b"MSCS";

/// Newest layout version this build reads and the one it writes.
pub const PROJECT_VERSION: u8 = 2;

/// Extension used for project files.
pub const PROJECT_EXTENSION: &str = ".mcs";

/// Default directory for projects, relative to the storage root.
pub const PROJECT_DIR: &str = "music";

/// Header (6) + metadata (8) + both channel counts (4).
const MIN_FILE_SIZE: usize = 18;

/// Size of one encoded note record.
const NOTE_RECORD_SIZE: usize = 7;

/// Summary of a project file, read from its header only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectInfo {
    /// File name without directory.
    pub filename: String,
    /// Layout version found in the file.
    pub version: u8,
    /// Tempo in beats per minute, as stored.
    pub tempo: u16,
    /// Length in bars, as stored.
    pub length_bars: u16,
    /// Raw division value (steps per whole note).
    pub division: u8,
    /// Number of notes declared for channel 1.
    pub channel1_notes: u16,
    /// Last write time in seconds since the Unix epoch, if the storage knows it.
    pub modified: Option<u64>,
}

/// Little-endian cursor over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn u8(&mut self) -> Option<u8> {
        let value = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(value)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.data.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn bytes<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.data.get(self.pos..self.pos + N)?;
        self.pos += N;
        bytes.try_into().ok()
    }
}

fn truncated() -> CodecError {
    CodecError::invalid("truncated project file")
}

/// Encodes a composition in the current layout version.
///
/// # Errors
///
/// Returns `InvalidFormat` if a channel holds more notes than the 16-bit count
/// can express, or `OutOfMemory` if the output buffer cannot be allocated.
pub fn encode_project(composition: &Composition) -> Result<Vec<u8>, CodecError> {
    let mut data = Vec::new();
    data.try_reserve(
        MIN_FILE_SIZE + 2 + composition.note_count() * NOTE_RECORD_SIZE,
    )?;

    data.extend_from_slice(&PROJECT_MAGIC);
    data.push(PROJECT_VERSION);
    data.push(0); // flags, reserved

    data.extend_from_slice(&composition.tempo.to_le_bytes());
    data.push(composition.time_signature_num);
    data.push(composition.time_signature_den);
    data.push(composition.division.steps_per_whole());
    data.extend_from_slice(&composition.length_bars.to_le_bytes());
    data.push(u8::from(composition.loop_enabled));
    data.push(composition.channel1_instrument);
    data.push(composition.channel2_instrument);

    for notes in [&composition.channel1, &composition.channel2] {
        let count = u16::try_from(notes.len())
            .map_err(|_| CodecError::invalid(format!("too many notes: {}", notes.len())))?;
        data.extend_from_slice(&count.to_le_bytes());
        for note in notes.iter() {
            data.extend_from_slice(&note.start_step.to_le_bytes());
            data.extend_from_slice(&note.duration.to_le_bytes());
            data.push(note.pitch);
            data.push(note.velocity);
            data.push(u8::from(note.enabled));
        }
    }

    Ok(data)
}

/// Decodes a project file.
///
/// Tempo and length are re-clamped exactly as the engine clamps live edits.
/// Note records are read only while a full record remains; a channel whose
/// declared count runs past the end of the data keeps the notes read so far.
///
/// # Errors
///
/// * `InvalidFormat` - short file, wrong magic, unknown division, truncated header
/// * `VersionMismatch` - the file was written by a newer layout version
pub fn decode_project(data: &[u8]) -> Result<Composition, CodecError> {
    if data.len() < MIN_FILE_SIZE {
        return Err(CodecError::invalid(format!(
            "project file too short ({} bytes)",
            data.len()
        )));
    }

    let mut reader = Reader::new(data);
    let magic: [u8; 4] = reader.bytes().ok_or_else(truncated)?;
    if magic != PROJECT_MAGIC {
        tracing::warn!("Invalid project magic {:02X?}", magic);
        return Err(CodecError::invalid("bad project magic"));
    }

    let version = reader.u8().ok_or_else(truncated)?;
    if version > PROJECT_VERSION {
        tracing::warn!(
            "Unsupported project version {} (max {})",
            version,
            PROJECT_VERSION
        );
        return Err(CodecError::VersionMismatch {
            found: version,
            supported: PROJECT_VERSION,
        });
    }
    let _flags = reader.u8().ok_or_else(truncated)?;

    let mut composition = Composition::new();
    composition.tempo = reader.u16().ok_or_else(truncated)?;
    composition.time_signature_num = reader.u8().ok_or_else(truncated)?;
    composition.time_signature_den = reader.u8().ok_or_else(truncated)?;
    let division = reader.u8().ok_or_else(truncated)?;
    composition.division = StepDivision::from_steps(division)
        .ok_or_else(|| CodecError::invalid(format!("unknown step division {}", division)))?;
    composition.length_bars = reader.u16().ok_or_else(truncated)?;
    composition.loop_enabled = reader.u8().ok_or_else(truncated)? != 0;

    if version >= 2 {
        let ch1 = reader.u8().ok_or_else(truncated)?;
        let ch2 = reader.u8().ok_or_else(truncated)?;
        composition.channel1_instrument = ch1.min(127);
        composition.channel2_instrument = ch2.min(127);
    } else {
        composition.channel1_instrument = 0;
        composition.channel2_instrument = 0;
    }

    composition.set_tempo(composition.tempo);
    composition.set_length_bars(composition.length_bars);

    composition.channel1 = read_notes(&mut reader)?;
    composition.channel2 = read_notes(&mut reader)?;

    Ok(composition)
}

fn read_notes(reader: &mut Reader<'_>) -> Result<Vec<NoteEvent>, CodecError> {
    let declared = reader.u16().ok_or_else(truncated)?;
    let available = reader.remaining() / NOTE_RECORD_SIZE;
    let count = usize::from(declared).min(available);

    let mut notes = Vec::new();
    notes.try_reserve(count)?;
    for _ in 0..count {
        let (Some(start_step), Some(duration), Some(pitch), Some(velocity), Some(enabled)) = (
            reader.u16(),
            reader.u16(),
            reader.u8(),
            reader.u8(),
            reader.u8(),
        ) else {
            break;
        };
        let note = NoteEvent {
            start_step,
            duration,
            pitch,
            velocity,
            enabled: enabled != 0,
        };
        notes.push(note.normalized());
    }

    if count < usize::from(declared) {
        tracing::debug!(
            "Project channel declares {} notes, only {} present",
            declared,
            count
        );
    }
    Ok(notes)
}

/// Saves a composition to a project file.
///
/// # Errors
///
/// Returns `StorageNotMounted` before doing anything if the card is missing,
/// or `FileWrite` if the file cannot be written.
pub fn save_project<S: Storage + ?Sized>(
    storage: &S,
    path: impl AsRef<Path>,
    composition: &Composition,
) -> Result<(), CodecError> {
    let path = path.as_ref();
    if !storage.is_mounted() {
        return Err(CodecError::StorageNotMounted);
    }

    let data = encode_project(composition)?;
    storage
        .write(path, &data)
        .map_err(|e| CodecError::write(path, e))?;

    tracing::info!("Saved project {:?} ({} bytes)", path, data.len());
    Ok(())
}

/// Loads a project file into `composition`.
///
/// On error `composition` is left untouched.
pub fn load_project<S: Storage + ?Sized>(
    storage: &S,
    path: impl AsRef<Path>,
    composition: &mut Composition,
) -> Result<(), CodecError> {
    let path = path.as_ref();
    if !storage.is_mounted() {
        return Err(CodecError::StorageNotMounted);
    }

    let data = storage.read(path).map_err(|e| CodecError::read(path, e))?;
    let loaded = decode_project(&data)?;

    tracing::info!(
        "Loaded project {:?} (tempo={}, {} bars, {}+{} notes)",
        path,
        loaded.tempo,
        loaded.length_bars,
        loaded.channel1.len(),
        loaded.channel2.len()
    );
    *composition = loaded;
    Ok(())
}

/// Reads the summary of a project file without decoding its notes.
pub fn project_info<S: Storage + ?Sized>(
    storage: &S,
    path: impl AsRef<Path>,
) -> Result<ProjectInfo, CodecError> {
    let path = path.as_ref();
    if !storage.is_mounted() {
        return Err(CodecError::StorageNotMounted);
    }

    let data = storage.read(path).map_err(|e| CodecError::read(path, e))?;
    if data.len() < MIN_FILE_SIZE {
        return Err(truncated());
    }

    let mut reader = Reader::new(&data);
    let magic: [u8; 4] = reader.bytes().ok_or_else(truncated)?;
    if magic != PROJECT_MAGIC {
        return Err(CodecError::invalid("bad project magic"));
    }
    let version = reader.u8().ok_or_else(truncated)?;
    let _flags = reader.u8();
    let tempo = reader.u16().ok_or_else(truncated)?;
    let _ts = reader.bytes::<2>();
    let division = reader.u8().ok_or_else(truncated)?;
    let length_bars = reader.u16().ok_or_else(truncated)?;
    let _loop = reader.u8();
    if version >= 2 {
        let _instruments = reader.bytes::<2>();
    }
    let channel1_notes = reader.u16().ok_or_else(truncated)?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let modified = storage
        .modified(path)
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|since| since.as_secs());

    Ok(ProjectInfo {
        filename,
        version,
        tempo,
        length_bars,
        division,
        channel1_notes,
        modified,
    })
}

/// Returns the default project directory.
pub fn project_directory() -> PathBuf {
    PathBuf::from(PROJECT_DIR)
}

/// Creates the default project directory if it does not exist.
pub fn ensure_project_directory<S: Storage + ?Sized>(storage: &S) -> Result<(), CodecError> {
    if !storage.is_mounted() {
        return Err(CodecError::StorageNotMounted);
    }
    let dir = project_directory();
    storage
        .create_dir_all(&dir)
        .map_err(|e| CodecError::write(&dir, e))
}

/// Lists project files in `dir`, sorted by name.
///
/// If `dir` is the default project directory and does not exist yet, it is
/// created and an empty list is returned.
pub fn list_project_files<S: Storage + ?Sized>(
    storage: &S,
    dir: impl AsRef<Path>,
) -> Result<Vec<String>, CodecError> {
    let dir = dir.as_ref();
    if !storage.is_mounted() {
        return Err(CodecError::StorageNotMounted);
    }

    let names = match storage.list(dir) {
        Ok(names) => names,
        Err(_) if dir == project_directory() => {
            ensure_project_directory(storage)?;
            storage.list(dir).map_err(|e| CodecError::read(dir, e))?
        }
        Err(e) => return Err(CodecError::read(dir, e)),
    };

    let mut files: Vec<String> = names
        .into_iter()
        .filter(|name| has_extension(name, &[PROJECT_EXTENSION]))
        .collect();
    files.sort();

    tracing::debug!("Found {} project files in {:?}", files.len(), dir);
    Ok(files)
}
