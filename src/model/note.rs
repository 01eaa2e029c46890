//! Step-sequencer note representation.
//!
//! A note occupies a half-open range of steps `[start_step, start_step + duration)`
//! on one channel and carries pitch and velocity for the tone generator.

use serde::{Deserialize, Serialize};

/// Pitch used for notes created by grid toggles (middle C).
pub const DEFAULT_PITCH: u8 = 60;

/// Velocity used for notes created by grid toggles.
pub const DEFAULT_VELOCITY: u8 = 100;

/// Represents a single note on a sequencer channel.
///
/// Notes are stored in insertion order within a channel, not sorted by time.
/// When two notes on the same channel cover the same step, the one stored
/// first wins during playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteEvent {
    /// Step index where the note starts (0-based).
    pub start_step: u16,

    /// Duration in steps. Always at least 1.
    pub duration: u16,

    /// MIDI note number (0-127). 60 = Middle C.
    pub pitch: u8,

    /// Note velocity (0-127). Mapped to output duty during playback.
    pub velocity: u8,

    /// Disabled notes are kept in the composition but never sound or export.
    pub enabled: bool,
}

impl NoteEvent {
    /// Creates a new enabled note.
    ///
    /// # Arguments
    ///
    /// * `start_step` - Start position in steps
    /// * `duration` - Duration in steps (raised to 1 if zero)
    /// * `pitch` - MIDI note number (clamped to 127)
    /// * `velocity` - Note velocity (clamped to 127)
    ///
    /// # Examples
    ///
    /// ```
    /// use buzzseq::model::NoteEvent;
    ///
    /// // A quarter note of middle C on a sixteenth grid
    /// let note = NoteEvent::new(0, 4, 60, 100);
    /// assert_eq!(note.end_step(), 4);
    /// ```
    pub fn new(start_step: u16, duration: u16, pitch: u8, velocity: u8) -> Self {
        Self {
            start_step,
            duration: duration.max(1),
            pitch: pitch.min(127),
            velocity: velocity.min(127),
            enabled: true,
        }
    }

    /// Returns the end step of this note (exclusive).
    pub fn end_step(&self) -> u16 {
        self.start_step.saturating_add(self.duration)
    }

    /// Checks if this note sounds at a specific step.
    ///
    /// Disabled notes are never active.
    pub fn is_active_at(&self, step: u16) -> bool {
        let end = u32::from(self.start_step) + u32::from(self.duration);
        self.enabled && step >= self.start_step && u32::from(step) < end
    }

    /// Returns a copy with the field invariants restored.
    ///
    /// Used on notes that come from outside the engine (UI, decoders) so that
    /// a zero duration or an out-of-range pitch never reaches playback.
    pub fn normalized(self) -> Self {
        Self {
            duration: self.duration.max(1),
            pitch: self.pitch.min(127),
            velocity: self.velocity.min(127),
            ..self
        }
    }
}

impl Default for NoteEvent {
    fn default() -> Self {
        Self::new(0, 1, DEFAULT_PITCH, DEFAULT_VELOCITY)
    }
}
