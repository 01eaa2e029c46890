//! Single-voice tone output abstraction.
//!
//! The sequencer drives exactly one physical tone generator: a square-wave
//! source whose pitch is set in hertz and whose loudness is approximated by
//! its duty cycle.

/// Full-scale duty value (10-bit resolution).
pub const DUTY_MAX: u16 = 1023;

/// Quietest duty that is still audible on the output.
pub const DUTY_MIN_AUDIBLE: u16 = 64;

/// Loudest duty used; beyond 50% a square wave only gets thinner, not louder.
pub const DUTY_MAX_AUDIBLE: u16 = 512;

/// A monophonic tone generator.
///
/// Implementations must be cheap to call: the sequencer invokes them from
/// timer context on every step and every mix tick.
pub trait ToneOutput: Send {
    /// Sets the output frequency in hertz.
    fn set_frequency(&mut self, hz: u32);

    /// Sets the duty cycle (0 to [`DUTY_MAX`]); 0 is silence.
    fn set_amplitude(&mut self, duty: u16);

    /// Silences the output.
    fn off(&mut self);

    /// Sounds `hz` at the loudness of `velocity`.
    ///
    /// A zero frequency silences the output instead.
    fn sound(&mut self, hz: u32, velocity: u8) {
        if hz == 0 {
            self.off();
            return;
        }
        self.set_frequency(hz);
        self.set_amplitude(velocity_to_duty(velocity));
    }
}

impl<T: ToneOutput + ?Sized> ToneOutput for Box<T> {
    fn set_frequency(&mut self, hz: u32) {
        (**self).set_frequency(hz);
    }

    fn set_amplitude(&mut self, duty: u16) {
        (**self).set_amplitude(duty);
    }

    fn off(&mut self) {
        (**self).off();
    }
}

/// A tone output that discards everything, for hosts without audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentTone;

impl ToneOutput for SilentTone {
    fn set_frequency(&mut self, _hz: u32) {}
    fn set_amplitude(&mut self, _duty: u16) {}
    fn off(&mut self) {}
}

/// Equal-temperament frequencies for MIDI notes 0-127, rounded to whole hertz.
/// Note 69 (A4) is 440 Hz.
const FREQUENCY_TABLE: [u32; 128] = [
    8, 9, 9, 10, 10, 11, 12, 12, 13, 14, 15, 15, // -1
    16, 17, 18, 19, 21, 22, 23, 24, 26, 28, 29, 31, // 0
    33, 35, 37, 39, 41, 44, 46, 49, 52, 55, 58, 62, // 1
    65, 69, 73, 78, 82, 87, 92, 98, 104, 110, 117, 123, // 2
    131, 139, 147, 156, 165, 175, 185, 196, 208, 220, 233, 247, // 3
    262, 277, 294, 311, 330, 349, 370, 392, 415, 440, 466, 494, // 4
    523, 554, 587, 622, 659, 698, 740, 784, 831, 880, 932, 988, // 5
    1047, 1109, 1175, 1245, 1319, 1397, 1480, 1568, 1661, 1760, 1865, 1976, // 6
    2093, 2217, 2349, 2489, 2637, 2794, 2960, 3136, 3322, 3520, 3729, 3951, // 7
    4186, 4435, 4699, 4978, 5274, 5588, 5920, 6272, 6645, 7040, 7459, 7902, // 8
    8372, 8870, 9397, 9956, 10548, 11175, 11840, 12544, // 9
];

/// Converts a MIDI note number to a frequency in hertz.
///
/// Pitches above 127 are treated as 127.
pub fn midi_to_frequency(pitch: u8) -> u32 {
    FREQUENCY_TABLE[usize::from(pitch.min(127))]
}

/// Maps a velocity (0-127) to an output duty.
///
/// The curve is quadratic (`duty ∝ velocity²` over the full 10-bit range),
/// then clamped into the audible window
/// [`DUTY_MIN_AUDIBLE`]..=[`DUTY_MAX_AUDIBLE`].
pub fn velocity_to_duty(velocity: u8) -> u16 {
    let v = u32::from(velocity.min(127));
    let duty = v * v * u32::from(DUTY_MAX) / (127 * 127);
    let clamped = duty.clamp(u32::from(DUTY_MIN_AUDIBLE), u32::from(DUTY_MAX_AUDIBLE));
    u16::try_from(clamped).unwrap_or(DUTY_MAX_AUDIBLE)
}
