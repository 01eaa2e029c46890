//! Standard MIDI File interchange.
//!
//! This module converts between compositions and Standard MIDI Files:
//! - Import reads format 0/1 files with PPQN timing and quantizes notes onto
//!   the step grid
//! - Export writes a single-track format 0 file at a fixed resolution

mod midi_export;
mod midi_import;

pub use midi_export::{encode_midi, export_midi};
pub use midi_import::{decode_midi, import_midi};

use crate::error::CodecError;
use crate::model::StepDivision;
use crate::storage::{has_extension, Storage};
use std::path::Path;

/// Pulses per quarter note written on export.
pub const EXPORT_PPQN: u16 = 480;

/// File extensions recognized as MIDI files.
pub const MIDI_EXTENSIONS: [&str; 2] = [".mid", ".midi"];

/// Standard MIDI note names for display purposes.
/// Maps MIDI note number (0-127) to note name within an octave.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Converts a MIDI note number to a human-readable note name with octave.
///
/// # Arguments
///
/// * `note` - MIDI note number (0-127)
///
/// # Returns
///
/// String representation like "C4" or "F#5"
///
/// # Examples
///
/// ```
/// use buzzseq::midi::note_to_name;
///
/// let name = note_to_name(60); // Middle C
/// assert_eq!(name, "C4");
/// ```
pub fn note_to_name(note: u8) -> String {
    let octave = i16::from(note / 12) - 1; // MIDI octave convention
    let note_index = usize::from(note % 12);
    format!("{}{}", NOTE_NAMES[note_index], octave)
}

/// Returns the number of MIDI ticks in one sequencer step (at least 1).
///
/// A whole note is four quarter notes, so a step lasts
/// `ppqn * 4 / division` ticks.
pub fn ticks_per_step(ppqn: u16, division: StepDivision) -> u32 {
    (u32::from(ppqn) * 4 / u32::from(division.steps_per_whole())).max(1)
}

/// Lists MIDI files in `dir`, sorted by name.
pub fn list_midi_files<S: Storage + ?Sized>(
    storage: &S,
    dir: impl AsRef<Path>,
) -> Result<Vec<String>, CodecError> {
    let dir = dir.as_ref();
    if !storage.is_mounted() {
        return Err(CodecError::StorageNotMounted);
    }

    let mut files: Vec<String> = storage
        .list(dir)
        .map_err(|e| CodecError::read(dir, e))?
        .into_iter()
        .filter(|name| has_extension(name, &MIDI_EXTENSIONS))
        .collect();
    files.sort();

    tracing::debug!("Found {} MIDI files in {:?}", files.len(), dir);
    Ok(files)
}
