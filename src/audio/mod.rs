//! Tone output for the sequencer.
//!
//! This module provides:
//! - The [`ToneOutput`] abstraction over a single square-wave generator
//! - Pitch and velocity mapping for that generator
//! - A rodio-backed implementation for desktop playback

pub mod engine;
pub mod tone;

pub use engine::{SquareTone, ToneStream};
pub use tone::{midi_to_frequency, velocity_to_duty, SilentTone, ToneOutput};
