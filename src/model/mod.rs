//! Sequencer data structures.
//!
//! This module provides the pure-data types shared by the engine and both
//! codecs: notes, the two-channel composition and the step grid parameters.

mod composition;
mod note;

pub use composition::{
    Channel, Composition, StepDivision, DEFAULT_TEMPO, MAX_LENGTH_BARS, MAX_TEMPO,
    MIN_LENGTH_BARS, MIN_TEMPO,
};
pub use note::{NoteEvent, DEFAULT_PITCH, DEFAULT_VELOCITY};
