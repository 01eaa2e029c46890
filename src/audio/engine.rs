//! Desktop tone output.
//!
//! Renders the sequencer's single tone generator as a pulse wave through
//! rodio, so compositions can be auditioned on a workstation.

use super::tone::{ToneOutput, DUTY_MAX};
use anyhow::{Context, Result};
use rodio::{OutputStream, OutputStreamHandle, Source};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sample rate for tone rendering (44.1 kHz standard).
pub const SAMPLE_RATE: u32 = 44100;

/// Peak amplitude of the rendered wave, leaving headroom for the device.
const OUTPUT_GAIN: f32 = 0.25;

/// Generator parameters shared between the sequencer and the audio thread.
/// Uses atomics for lock-free access from the audio thread.
#[derive(Debug, Default)]
struct ToneState {
    /// Current frequency in hertz.
    frequency: AtomicU32,
    /// Current duty (0 = silent, 1023 = full scale).
    duty: AtomicU32,
}

/// Audio source producing a band-unlimited pulse wave.
/// Implements rodio's Source trait for playback.
struct PulseSource {
    state: Arc<ToneState>,
    /// Position within the current period, 0.0 to 1.0.
    phase: f32,
}

impl PulseSource {
    fn new(state: Arc<ToneState>) -> Self {
        Self { state, phase: 0.0 }
    }
}

impl Iterator for PulseSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let frequency = self.state.frequency.load(Ordering::Relaxed);
        let duty = self.state.duty.load(Ordering::Relaxed);
        if frequency == 0 || duty == 0 {
            self.phase = 0.0;
            return Some(0.0);
        }

        // Zero-mean pulse: the DC offset of an asymmetric duty is removed.
        let width = duty as f32 / (f32::from(DUTY_MAX) + 1.0);
        let high = if self.phase < width { 1.0 } else { 0.0 };
        let sample = (high - width) * OUTPUT_GAIN;

        self.phase += frequency as f32 / SAMPLE_RATE as f32;
        self.phase -= self.phase.floor();

        Some(sample)
    }
}

impl Source for PulseSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None // Infinite stream
    }
}

/// An open audio output device.
///
/// Must be kept alive (on the thread that opened it) for as long as sound
/// should be heard; dropping it closes the device.
pub struct ToneStream {
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
}

/// [`ToneOutput`] handle feeding a [`ToneStream`].
///
/// Cheap to clone and safe to move to the sequencer's timer threads.
#[derive(Debug, Clone)]
pub struct SquareTone {
    state: Arc<ToneState>,
}

impl ToneStream {
    /// Opens the default audio output and starts a silent pulse generator.
    ///
    /// # Errors
    ///
    /// Returns error if no audio output device can be opened.
    pub fn open() -> Result<(Self, SquareTone)> {
        let (stream, stream_handle) =
            OutputStream::try_default().context("Failed to open audio output")?;

        let state = Arc::new(ToneState::default());
        stream_handle
            .play_raw(PulseSource::new(Arc::clone(&state)))
            .context("Failed to start audio playback")?;

        tracing::info!("Tone output opened at {} Hz", SAMPLE_RATE);
        Ok((
            Self {
                _stream: stream,
                _stream_handle: stream_handle,
            },
            SquareTone { state },
        ))
    }
}

impl SquareTone {
    /// Returns the current frequency in hertz.
    pub fn frequency(&self) -> u32 {
        self.state.frequency.load(Ordering::Relaxed)
    }

    /// Returns the current duty (0 when silent).
    pub fn duty(&self) -> u16 {
        u16::try_from(self.state.duty.load(Ordering::Relaxed)).unwrap_or(DUTY_MAX)
    }
}

impl ToneOutput for SquareTone {
    fn set_frequency(&mut self, hz: u32) {
        self.state.frequency.store(hz, Ordering::Relaxed);
    }

    fn set_amplitude(&mut self, duty: u16) {
        self.state
            .duty
            .store(u32::from(duty.min(DUTY_MAX)), Ordering::Relaxed);
    }

    fn off(&mut self) {
        self.state.duty.store(0, Ordering::Relaxed);
    }
}
