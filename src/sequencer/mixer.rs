//! Step sound selection and two-voice time-division mixing.
//!
//! Only one physical tone generator exists. When both channels have a note on
//! the same step, the mixer alternates the generator between the two pitches on
//! a short fixed interval, which the ear hears as two simultaneous voices.

use super::playback::PlaybackState;
use crate::audio::tone::{midi_to_frequency, ToneOutput};
use crate::model::{Channel, Composition, NoteEvent};

/// Metronome click on the first step of a bar.
pub const BAR_CLICK: Voice = Voice {
    frequency: 1200,
    velocity: 80,
};

/// Metronome click on the other beats of a bar.
pub const BEAT_CLICK: Voice = Voice {
    frequency: 800,
    velocity: 60,
};

/// A pitch and loudness for the tone generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Voice {
    pub frequency: u32,
    pub velocity: u8,
}

impl Voice {
    pub fn from_note(note: &NoteEvent) -> Self {
        Self {
            frequency: midi_to_frequency(note.pitch),
            velocity: note.velocity,
        }
    }
}

/// What the generator should do for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepSound {
    #[default]
    Silence,
    /// A metronome click; notes on this step are suppressed.
    Click(Voice),
    /// Exactly one channel has a note.
    Single(Voice),
    /// Both channels have a note: alternate between channel 1 and channel 2.
    Dual(Voice, Voice),
}

/// Decides what sounds at `step`.
///
/// Each unmuted channel contributes its first enabled note covering the step
/// (storage order). With the metronome on, a step on a bar boundary plays the
/// bar click and a step on a beat boundary the beat click, replacing any notes.
pub fn plan_step(composition: &Composition, playback: &PlaybackState, step: u16) -> StepSound {
    if playback.metronome_enabled {
        let steps_per_bar = composition.steps_per_bar().max(1);
        let steps_per_beat = composition.steps_per_beat();
        if step % steps_per_bar == 0 {
            return StepSound::Click(BAR_CLICK);
        }
        if step % steps_per_beat == 0 {
            return StepSound::Click(BEAT_CLICK);
        }
    }

    let voice = |channel: Channel| {
        if playback.is_muted(channel) {
            None
        } else {
            composition.note_at(channel, step).map(Voice::from_note)
        }
    };

    match (voice(Channel::One), voice(Channel::Two)) {
        (Some(first), Some(second)) => StepSound::Dual(first, second),
        (Some(only), None) | (None, Some(only)) => StepSound::Single(only),
        (None, None) => StepSound::Silence,
    }
}

/// Drives the tone generator from [`StepSound`]s and mix ticks.
pub struct VoiceMixer {
    output: Box<dyn ToneOutput>,
    current: StepSound,
    /// In dual mode, true while channel 1's voice is sounding.
    first_voice: bool,
}

impl VoiceMixer {
    pub fn new(output: Box<dyn ToneOutput>) -> Self {
        Self {
            output,
            current: StepSound::Silence,
            first_voice: false,
        }
    }

    /// Starts sounding a step. Dual sounds begin on channel 1's voice.
    pub fn apply(&mut self, sound: StepSound) {
        self.current = sound;
        match sound {
            StepSound::Silence => self.output.off(),
            StepSound::Click(voice) | StepSound::Single(voice) => {
                self.output.sound(voice.frequency, voice.velocity)
            }
            StepSound::Dual(first, _) => {
                self.first_voice = true;
                self.output.sound(first.frequency, first.velocity);
            }
        }
    }

    /// Switches to the other voice if two are sounding.
    ///
    /// Returns false (and does nothing) outside dual mode.
    pub fn alternate(&mut self) -> bool {
        let StepSound::Dual(first, second) = self.current else {
            return false;
        };
        self.first_voice = !self.first_voice;
        let voice = if self.first_voice { first } else { second };
        self.output.sound(voice.frequency, voice.velocity);
        true
    }

    /// Silences the output and forgets the current sound.
    pub fn silence(&mut self) {
        self.current = StepSound::Silence;
        self.output.off();
    }

    /// Returns the sound of the current step.
    pub fn current(&self) -> StepSound {
        self.current
    }

    /// Returns true while two voices are being alternated.
    pub fn is_mixing(&self) -> bool {
        matches!(self.current, StepSound::Dual(..))
    }
}
