//! buzzseq - A two-voice step sequencer for a single tone generator.
//!
//! This library provides the sequencer engine, its `.mcs` project format and
//! Standard MIDI File import/export.

pub mod audio;
pub mod error;
pub mod history;
pub mod midi;
pub mod model;
pub mod project;
pub mod sequencer;
pub mod storage;

// Re-export commonly used types
pub use error::{CodecError, EditError, TimerError};
pub use model::{Channel, Composition, NoteEvent, StepDivision};
pub use sequencer::{PlaybackState, Sequencer, SequencerConfig};
pub use storage::{FsStorage, MemoryStorage, Storage};
