//! Two-channel composition container.
//!
//! A composition holds the note lists of both channels together with the
//! timing parameters (tempo, time signature, step division, length) that
//! define the step grid.

use super::note::NoteEvent;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Slowest accepted tempo in beats per minute.
pub const MIN_TEMPO: u16 = 30;

/// Fastest accepted tempo in beats per minute.
pub const MAX_TEMPO: u16 = 300;

/// Shortest composition length in bars.
pub const MIN_LENGTH_BARS: u16 = 1;

/// Longest composition length in bars.
pub const MAX_LENGTH_BARS: u16 = 64;

/// Default tempo in beats per minute.
pub const DEFAULT_TEMPO: u16 = 120;

/// Step resolution, expressed as steps per whole note.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StepDivision {
    Whole = 1,
    Half = 2,
    Quarter = 4,
    Eighth = 8,
    #[default]
    Sixteenth = 16,
    ThirtySecond = 32,
}

impl StepDivision {
    /// All divisions, coarsest first.
    pub const ALL: [StepDivision; 6] = [
        StepDivision::Whole,
        StepDivision::Half,
        StepDivision::Quarter,
        StepDivision::Eighth,
        StepDivision::Sixteenth,
        StepDivision::ThirtySecond,
    ];

    /// Returns the raw numeric value (steps per whole note).
    pub fn steps_per_whole(self) -> u8 {
        self as u8
    }

    /// Parses the raw numeric value used on disk and on the command line.
    pub fn from_steps(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.steps_per_whole() == value)
    }
}

impl fmt::Display for StepDivision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "1/{}", self.steps_per_whole())
    }
}

impl TryFrom<u8> for StepDivision {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_steps(value).ok_or(value)
    }
}

/// One of the two note sequences of a composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    One,
    Two,
}

impl Channel {
    /// Both channels in playback priority order.
    pub const BOTH: [Channel; 2] = [Channel::One, Channel::Two];

    /// Returns the zero-based index, which is also the MIDI channel number.
    pub fn index(self) -> usize {
        match self {
            Channel::One => 0,
            Channel::Two => 1,
        }
    }

    /// Maps a zero-based index to a channel. Only 0 and 1 are valid.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Channel::One),
            1 => Some(Channel::Two),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {}", self.index() + 1)
    }
}

impl TryFrom<u8> for Channel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_index(usize::from(value)).ok_or(value)
    }
}

/// A complete two-channel composition.
///
/// Tempo and length are clamped by their setters; the fields are public so the
/// codecs and the UI can read and fill them directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Composition {
    /// Tempo in beats per minute (30-300).
    pub tempo: u16,

    /// Time signature numerator (beats per bar).
    pub time_signature_num: u8,

    /// Time signature denominator (beat unit).
    pub time_signature_den: u8,

    /// Step resolution of the grid.
    pub division: StepDivision,

    /// Length in bars (1-64).
    pub length_bars: u16,

    /// MIDI program for channel 1 (0-127).
    pub channel1_instrument: u8,

    /// MIDI program for channel 2 (0-127).
    pub channel2_instrument: u8,

    /// Notes of channel 1 in insertion order.
    pub channel1: Vec<NoteEvent>,

    /// Notes of channel 2 in insertion order.
    pub channel2: Vec<NoteEvent>,

    /// Whether playback wraps to the loop start at the end.
    pub loop_enabled: bool,
}

impl Composition {
    /// Creates an empty composition: 120 BPM, 4/4, sixteenth steps, 4 bars, looping.
    pub fn new() -> Self {
        Self {
            tempo: DEFAULT_TEMPO,
            time_signature_num: 4,
            time_signature_den: 4,
            division: StepDivision::Sixteenth,
            length_bars: 4,
            channel1_instrument: 0,
            channel2_instrument: 0,
            channel1: Vec::new(),
            channel2: Vec::new(),
            loop_enabled: true,
        }
    }

    /// Sets the tempo, clamped to 30-300 BPM.
    pub fn set_tempo(&mut self, bpm: u16) {
        self.tempo = bpm.clamp(MIN_TEMPO, MAX_TEMPO);
    }

    /// Sets the length, clamped to 1-64 bars.
    pub fn set_length_bars(&mut self, bars: u16) {
        self.length_bars = bars.clamp(MIN_LENGTH_BARS, MAX_LENGTH_BARS);
    }

    /// Returns the number of steps in one bar.
    ///
    /// `division * num / den`, evaluated left to right in integer arithmetic.
    /// A zero denominator yields zero steps rather than a panic.
    pub fn steps_per_bar(&self) -> u16 {
        let whole = u32::from(self.division.steps_per_whole()) * u32::from(self.time_signature_num);
        let steps = whole
            .checked_div(u32::from(self.time_signature_den))
            .unwrap_or(0);
        saturate_u16(steps)
    }

    /// Returns the number of steps in one beat (never zero).
    pub fn steps_per_beat(&self) -> u16 {
        self.steps_per_bar()
            .checked_div(u16::from(self.time_signature_num))
            .unwrap_or(0)
            .max(1)
    }

    /// Returns the total number of steps in the composition.
    pub fn total_steps(&self) -> u16 {
        saturate_u16(u32::from(self.length_bars) * u32::from(self.steps_per_bar()))
    }

    /// Returns the duration of a single step in microseconds.
    ///
    /// A whole note lasts four beats; the whole-note duration is divided first
    /// and the result then divided by the division, in that order.
    pub fn step_duration_micros(&self) -> u64 {
        let whole_note_micros = (4 * 60_000_000u64) / u64::from(self.tempo.max(1));
        whole_note_micros / u64::from(self.division.steps_per_whole())
    }

    /// Returns the step interval as a [`Duration`] for timer scheduling.
    pub fn step_duration(&self) -> Duration {
        Duration::from_micros(self.step_duration_micros())
    }

    /// Returns the notes of one channel.
    pub fn notes(&self, channel: Channel) -> &[NoteEvent] {
        match channel {
            Channel::One => &self.channel1,
            Channel::Two => &self.channel2,
        }
    }

    /// Returns mutable access to the note list of one channel.
    pub fn notes_mut(&mut self, channel: Channel) -> &mut Vec<NoteEvent> {
        match channel {
            Channel::One => &mut self.channel1,
            Channel::Two => &mut self.channel2,
        }
    }

    /// Returns the instrument (MIDI program) of a channel.
    pub fn instrument(&self, channel: Channel) -> u8 {
        match channel {
            Channel::One => self.channel1_instrument,
            Channel::Two => self.channel2_instrument,
        }
    }

    /// Sets the instrument (MIDI program) of a channel, clamped to 127.
    pub fn set_instrument(&mut self, channel: Channel, program: u8) {
        let program = program.min(127);
        match channel {
            Channel::One => self.channel1_instrument = program,
            Channel::Two => self.channel2_instrument = program,
        }
    }

    /// Returns the index of the first note (storage order) sounding at `step`.
    pub fn note_index_at(&self, channel: Channel, step: u16) -> Option<usize> {
        self.notes(channel).iter().position(|n| n.is_active_at(step))
    }

    /// Returns the first note (storage order) sounding at `step`.
    pub fn note_at(&self, channel: Channel, step: u16) -> Option<&NoteEvent> {
        self.notes(channel).iter().find(|n| n.is_active_at(step))
    }

    /// Returns the number of notes on both channels.
    pub fn note_count(&self) -> usize {
        self.channel1.len() + self.channel2.len()
    }

    /// Returns the largest end step over both channels, or 0 when empty.
    pub fn max_end_step(&self) -> u16 {
        self.channel1
            .iter()
            .chain(self.channel2.iter())
            .map(NoteEvent::end_step)
            .max()
            .unwrap_or(0)
    }

    /// Clears all notes from both channels. Timing parameters are kept.
    pub fn clear(&mut self) {
        self.channel1.clear();
        self.channel2.clear();
    }
}

impl Default for Composition {
    fn default() -> Self {
        Self::new()
    }
}

fn saturate_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composition_defaults() {
        let comp = Composition::new();
        assert_eq!(comp.tempo, 120);
        assert_eq!(comp.time_signature_num, 4);
        assert_eq!(comp.time_signature_den, 4);
        assert_eq!(comp.division, StepDivision::Sixteenth);
        assert_eq!(comp.length_bars, 4);
        assert!(comp.loop_enabled);
        assert_eq!(comp.note_count(), 0);
    }

    #[test]
    fn test_derived_timing() {
        let comp = Composition::new();
        assert_eq!(comp.step_duration_micros(), 125_000);
        assert_eq!(comp.steps_per_bar(), 16);
        assert_eq!(comp.steps_per_beat(), 4);
        assert_eq!(comp.total_steps(), 64);

        let mut comp = Composition::new();
        comp.length_bars = 16;
        assert_eq!(comp.total_steps(), 256);
    }

    #[test]
    fn test_step_duration_division_order() {
        let mut comp = Composition::new();
        comp.set_tempo(700);
        assert_eq!(comp.tempo, 300);
        // (240_000_000 / 300) / 16 = 800_000 / 16
        assert_eq!(comp.step_duration_micros(), 50_000);

        comp.set_tempo(97);
        comp.division = StepDivision::ThirtySecond;
        // 240_000_000 / 97 = 2_474_226, / 32 = 77_319
        assert_eq!(comp.step_duration_micros(), 77_319);
    }

    #[test]
    fn test_odd_time_signature() {
        let mut comp = Composition::new();
        comp.time_signature_num = 3;
        comp.time_signature_den = 4;
        assert_eq!(comp.steps_per_bar(), 12);
        assert_eq!(comp.steps_per_beat(), 4);
        assert_eq!(comp.total_steps(), 48);

        comp.time_signature_num = 6;
        comp.time_signature_den = 8;
        comp.division = StepDivision::Eighth;
        assert_eq!(comp.steps_per_bar(), 6);
        assert_eq!(comp.steps_per_beat(), 1);
    }

    #[test]
    fn test_zero_denominator_does_not_panic() {
        let mut comp = Composition::new();
        comp.time_signature_den = 0;
        assert_eq!(comp.steps_per_bar(), 0);
        assert_eq!(comp.total_steps(), 0);
        assert_eq!(comp.steps_per_beat(), 1);
    }

    #[test]
    fn test_tempo_and_length_clamping() {
        let mut comp = Composition::new();
        for bpm in [0u16, 1, 29, 30, 120, 300, 301, u16::MAX] {
            comp.set_tempo(bpm);
            assert!((MIN_TEMPO..=MAX_TEMPO).contains(&comp.tempo));
        }
        comp.set_length_bars(0);
        assert_eq!(comp.length_bars, 1);
        comp.set_length_bars(100);
        assert_eq!(comp.length_bars, 64);
    }

    #[test]
    fn test_first_inserted_note_wins() {
        let mut comp = Composition::new();
        comp.channel1.push(NoteEvent::new(4, 4, 72, 100));
        comp.channel1.push(NoteEvent::new(0, 8, 60, 100));
        assert_eq!(comp.note_index_at(Channel::One, 5), Some(0));
        assert_eq!(comp.note_index_at(Channel::One, 1), Some(1));
        assert_eq!(comp.note_index_at(Channel::One, 8), None);
        assert_eq!(comp.note_at(Channel::One, 5).map(|n| n.pitch), Some(72));
    }

    #[test]
    fn test_division_and_channel_parsing() {
        assert_eq!(StepDivision::try_from(16), Ok(StepDivision::Sixteenth));
        assert_eq!(StepDivision::try_from(3), Err(3));
        assert_eq!(StepDivision::Eighth.to_string(), "1/8");
        assert_eq!(Channel::try_from(1), Ok(Channel::Two));
        assert!(Channel::try_from(2).is_err());
        assert_eq!(Channel::Two.index(), 1);
    }

    #[test]
    fn test_max_end_step() {
        let mut comp = Composition::new();
        assert_eq!(comp.max_end_step(), 0);
        comp.channel1.push(NoteEvent::new(0, 4, 60, 100));
        comp.channel2.push(NoteEvent::new(10, 6, 60, 100));
        assert_eq!(comp.max_end_step(), 16);
        comp.clear();
        assert_eq!(comp.note_count(), 0);
        assert_eq!(comp.tempo, 120);
    }
}
