//! The sequencer engine.
//!
//! [`Sequencer`] owns one [`Composition`] and its transport, clocks playback
//! from a periodic step timer, and offers the edit API used by the UI.
//!
//! Two execution contexts touch the engine concurrently: the caller's (edits,
//! transport control) and the timer service's (step and mix ticks). Edits wait
//! at most [`SequencerConfig::edit_lock_timeout`] for the composition and
//! report [`EditError::Busy`] on timeout. The step tick never waits: if the
//! composition is locked it keeps the previous output sounding for that step
//! and only advances the cursor.

mod mixer;
mod playback;
mod timer;

pub use mixer::{plan_step, StepSound, Voice, VoiceMixer, BAR_CLICK, BEAT_CLICK};
pub use playback::PlaybackState;
pub use timer::{PeriodicTimer, ThreadTimerService, TimerCallback, TimerService};

use crate::audio::ToneOutput;
use crate::error::{EditError, TimerError};
use crate::history::{HistoryManager, StateSnapshot};
use crate::model::{Channel, Composition, NoteEvent, StepDivision};
use parking_lot::{Mutex, MutexGuard, RwLock};
use playback::{Advance, StepLayout, Transport};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Name of the timer that advances the transport.
pub const STEP_TIMER_NAME: &str = "seq_step";

/// Name of the timer that alternates two voices.
pub const MIX_TIMER_NAME: &str = "seq_mix";

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerConfig {
    /// Longest time an edit waits for the composition lock.
    pub edit_lock_timeout: Duration,

    /// How long each voice sounds before switching when two channels play at
    /// once. Short enough to fuse into a chord, long enough for the pitch to
    /// register.
    pub mix_interval: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            edit_lock_timeout: Duration::from_millis(100),
            mix_interval: Duration::from_millis(20),
        }
    }
}

/// Called with the new cursor position after every step, from timer context.
pub type StepCallback = Arc<dyn Fn(u16) + Send + Sync>;

/// Called when playback starts (`true`) or stops (`false`).
pub type PlayStateCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    step: Option<StepCallback>,
    play_state: Option<PlayStateCallback>,
}

struct Timers {
    step: Box<dyn PeriodicTimer>,
    /// Missing if the mix timer could not be created; dual steps then sound
    /// channel 1 only.
    mix: Option<Box<dyn PeriodicTimer>>,
}

// Lock order: composition, then history, then transport. mixer, then timers.
struct Inner {
    config: SequencerConfig,
    composition: Mutex<Composition>,
    history: Mutex<HistoryManager>,
    transport: Mutex<Transport>,
    playing: AtomicBool,
    mixer: Mutex<VoiceMixer>,
    timer_service: Box<dyn TimerService>,
    timers: Mutex<Option<Timers>>,
    callbacks: RwLock<Callbacks>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.timers.get_mut().take();
        self.mixer.get_mut().silence();
    }
}

/// Handle to a sequencer engine.
///
/// Cloning yields another handle to the same engine. Timer callbacks hold
/// only weak references, so the engine shuts down when the last handle is
/// dropped.
#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<Inner>,
}

/// Exclusive access to the engine's composition.
///
/// The step clock keeps the previous output sounding while this guard is
/// held, so it should be dropped promptly. Dropping it re-reads the grid
/// layout (length, loop flag, tempo) for the transport.
pub struct CompositionGuard<'a> {
    composition: MutexGuard<'a, Composition>,
    transport: &'a Mutex<Transport>,
}

impl Deref for CompositionGuard<'_> {
    type Target = Composition;

    fn deref(&self) -> &Composition {
        &self.composition
    }
}

impl DerefMut for CompositionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Composition {
        &mut self.composition
    }
}

impl Drop for CompositionGuard<'_> {
    fn drop(&mut self) {
        self.transport.lock().refresh(&self.composition);
    }
}

fn note_mut(
    composition: &mut Composition,
    channel: Channel,
    index: usize,
) -> Result<&mut NoteEvent, EditError> {
    let notes = composition.notes_mut(channel);
    let len = notes.len();
    notes
        .get_mut(index)
        .ok_or(EditError::NoteIndex { channel, index, len })
}

impl Sequencer {
    /// Creates an engine with an empty composition.
    ///
    /// Nothing is clocked until [`init`](Self::init) has created the timers.
    pub fn new(
        output: Box<dyn ToneOutput>,
        timer_service: Box<dyn TimerService>,
        config: SequencerConfig,
    ) -> Self {
        let composition = Composition::new();
        let transport = Transport::new(&composition);
        Self {
            inner: Arc::new(Inner {
                config,
                composition: Mutex::new(composition),
                history: Mutex::new(HistoryManager::new()),
                transport: Mutex::new(transport),
                playing: AtomicBool::new(false),
                mixer: Mutex::new(VoiceMixer::new(output)),
                timer_service,
                timers: Mutex::new(None),
                callbacks: RwLock::new(Callbacks::default()),
            }),
        }
    }

    /// Creates an engine clocked by OS threads with the default configuration.
    pub fn with_thread_timers(output: Box<dyn ToneOutput>) -> Self {
        Self::new(
            output,
            Box::new(ThreadTimerService),
            SequencerConfig::default(),
        )
    }

    /// Returns the engine configuration.
    pub fn config(&self) -> &SequencerConfig {
        &self.inner.config
    }


    /// Creates the step and mix timers. Calling it again does nothing.
    ///
    /// Failing to create the mix timer is not fatal: playback then sounds only
    /// channel 1 when both channels have a note.
    ///
    /// # Errors
    ///
    /// Returns error if the step timer cannot be created.
    pub fn init(&self) -> Result<(), TimerError> {
        let mut timers = self.inner.timers.lock();
        if timers.is_some() {
            return Ok(());
        }

        tracing::info!("Initializing sequencer engine");
        let step = self
            .inner
            .timer_service
            .create(STEP_TIMER_NAME, self.timer_callback(Sequencer::process_step))?;
        let mix = match self
            .inner
            .timer_service
            .create(MIX_TIMER_NAME, self.timer_callback(Sequencer::mix_tick))
        {
            Ok(mix) => Some(mix),
            Err(e) => {
                tracing::warn!("{}; continuing without two-voice mixing", e);
                None
            }
        };

        *timers = Some(Timers { step, mix });
        Ok(())
    }

    /// Stops playback and releases the timers.
    pub fn deinit(&self) {
        self.stop();
        let timers = self.inner.timers.lock().take();
        if timers.is_some() {
            tracing::info!("Sequencer engine deinitialized");
        }
    }

    /// Returns true between [`init`](Self::init) and [`deinit`](Self::deinit).
    pub fn is_initialized(&self) -> bool {
        self.inner.timers.lock().is_some()
    }

    fn timer_callback(&self, tick: fn(&Sequencer)) -> TimerCallback {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                tick(&Sequencer { inner });
            }
        })
    }

    /// Sets the step-change notification. It runs in timer context and must
    /// not block.
    pub fn set_step_callback(&self, callback: impl Fn(u16) + Send + Sync + 'static) {
        self.inner.callbacks.write().step = Some(Arc::new(callback));
    }

    /// Sets the play-state notification.
    pub fn set_play_state_callback(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.inner.callbacks.write().play_state = Some(Arc::new(callback));
    }

    fn notify_step(&self, step: u16) {
        let callback = self.inner.callbacks.read().step.clone();
        if let Some(callback) = callback {
            callback(step);
        }
    }

    fn notify_play_state(&self, playing: bool) {
        let callback = self.inner.callbacks.read().play_state.clone();
        if let Some(callback) = callback {
            callback(playing);
        }
    }


    /// Starts playback from the current position.
    ///
    /// Does nothing if already playing. The current step sounds immediately;
    /// later steps follow on the step timer.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is not initialized or the step timer fails
    /// to start. Playback is not running in either case.
    pub fn play(&self) -> Result<(), TimerError> {
        if self.is_playing() {
            return Ok(());
        }

        // A busy composition still leaves the last known layout usable.
        let layout = match self
            .inner
            .composition
            .try_lock_for(self.inner.config.edit_lock_timeout)
        {
            Some(composition) => {
                let mut transport = self.inner.transport.lock();
                transport.refresh(&composition);
                transport.layout
            }
            None => self.inner.transport.lock().layout,
        };

        {
            let mut timers = self.inner.timers.lock();
            let timers = timers.as_mut().ok_or(TimerError::NotInitialized)?;
            if self.inner.playing.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            if let Err(e) = timers.step.start_periodic(layout.step_duration) {
                tracing::error!("{}", e);
                self.inner.playing.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        tracing::info!(
            "Starting playback at step {}, step duration {:?}",
            self.position(),
            layout.step_duration
        );
        self.notify_play_state(true);
        self.process_step();
        Ok(())
    }

    /// Stops playback and silences the output. Does nothing if stopped.
    pub fn stop(&self) {
        if !self.inner.playing.swap(false, Ordering::SeqCst) {
            return;
        }

        {
            let mut mixer = self.inner.mixer.lock();
            if let Some(timers) = self.inner.timers.lock().as_mut() {
                timers.step.stop();
                if let Some(mix) = timers.mix.as_mut() {
                    mix.stop();
                }
            }
            mixer.silence();
        }

        tracing::info!("Stopping playback at step {}", self.position());
        self.notify_play_state(false);
    }

    /// Starts or stops playback and returns the resulting playing state.
    pub fn toggle_playback(&self) -> Result<bool, TimerError> {
        if self.is_playing() {
            self.stop();
            Ok(false)
        } else {
            self.play()?;
            Ok(self.is_playing())
        }
    }

    /// Returns true while playback is running.
    pub fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::SeqCst)
    }

    /// Moves the cursor. Positions past the end wrap to 0.
    ///
    /// Fires the step notification with the resulting position.
    pub fn set_position(&self, step: u16) -> Result<(), EditError> {
        let position = {
            let composition = self.lock_composition()?;
            let mut transport = self.inner.transport.lock();
            transport.refresh(&composition);
            transport.state.current_step = if step >= transport.layout.total_steps {
                0
            } else {
                step
            };
            transport.state.current_step
        };
        self.notify_step(position);
        Ok(())
    }

    /// Returns the step that sounds next.
    pub fn position(&self) -> u16 {
        self.inner.transport.lock().state.current_step
    }

    /// Sets the loop region `[start, end)`. An `end` of 0 loops the whole
    /// composition, following later length changes.
    pub fn set_loop_region(&self, start: u16, end: u16) {
        let mut transport = self.inner.transport.lock();
        transport.state.loop_start = start;
        transport.state.loop_end = end;
    }

    /// Returns the loop region as `(start, end)`; `end` may be the 0 sentinel.
    pub fn loop_region(&self) -> (u16, u16) {
        let state = self.inner.transport.lock().state;
        (state.loop_start, state.loop_end)
    }

    /// Enables or disables wrapping at the loop end.
    pub fn set_loop_enabled(&self, enabled: bool) -> Result<(), EditError> {
        self.update_composition(|composition| composition.loop_enabled = enabled)
    }

    /// Returns whether playback wraps at the loop end.
    pub fn is_loop_enabled(&self) -> bool {
        self.inner.transport.lock().layout.loop_enabled
    }

    /// Mutes or unmutes a channel.
    pub fn set_channel_muted(&self, channel: Channel, muted: bool) {
        self.inner.transport.lock().state.set_muted(channel, muted);
    }

    pub fn is_channel_muted(&self, channel: Channel) -> bool {
        self.inner.transport.lock().state.is_muted(channel)
    }

    /// Enables or disables the metronome click.
    pub fn set_metronome(&self, enabled: bool) {
        self.inner.transport.lock().state.metronome_enabled = enabled;
    }

    pub fn is_metronome_enabled(&self) -> bool {
        self.inner.transport.lock().state.metronome_enabled
    }

    /// Returns a snapshot of the transport state.
    pub fn playback(&self) -> PlaybackState {
        let mut state = self.inner.transport.lock().state;
        state.is_playing = self.is_playing();
        state
    }


    /// Sets the tempo, clamped to 30-300 BPM.
    ///
    /// While playing, playback is stopped and restarted so the new step
    /// interval applies at once.
    pub fn set_tempo(&self, bpm: u16) -> Result<(), EditError> {
        self.with_restart(|seq| {
            seq.update_composition(|composition| composition.set_tempo(bpm))?;
            tracing::info!("Tempo set to {} BPM", seq.tempo()?);
            Ok(())
        })
    }

    /// Sets the step division, restarting playback like
    /// [`set_tempo`](Self::set_tempo). The cursor resets to 0 if it falls
    /// outside the new length.
    pub fn set_division(&self, division: StepDivision) -> Result<(), EditError> {
        self.with_restart(|seq| {
            seq.update_composition(|composition| composition.division = division)?;
            tracing::info!(
                "Division set to {}, total steps: {}",
                division,
                seq.inner.transport.lock().layout.total_steps
            );
            Ok(())
        })
    }

    /// Sets the length, clamped to 1-64 bars.
    ///
    /// An unset loop end, or one beyond the new length, is moved to the new
    /// end. The cursor resets to 0 if it falls outside the new length.
    pub fn set_length_bars(&self, bars: u16) -> Result<(), EditError> {
        let mut composition = self.lock_composition()?;
        composition.set_length_bars(bars);

        let mut transport = self.inner.transport.lock();
        transport.refresh(&composition);
        let total = transport.layout.total_steps;
        if transport.state.loop_end == 0 || transport.state.loop_end > total {
            transport.state.loop_end = total;
        }
        tracing::debug!("Length set to {} bars ({} steps)", composition.length_bars, total);
        Ok(())
    }

    pub fn tempo(&self) -> Result<u16, EditError> {
        self.with_composition(|composition| composition.tempo)
    }

    pub fn division(&self) -> Result<StepDivision, EditError> {
        self.with_composition(|composition| composition.division)
    }

    pub fn length_bars(&self) -> Result<u16, EditError> {
        self.with_composition(|composition| composition.length_bars)
    }

    fn with_restart(
        &self,
        change: impl FnOnce(&Self) -> Result<(), EditError>,
    ) -> Result<(), EditError> {
        let was_playing = self.is_playing();
        if was_playing {
            self.stop();
        }
        let result = change(self);
        if was_playing {
            if let Err(e) = self.play() {
                tracing::warn!("Failed to restart playback: {}", e);
            }
        }
        result
    }


    /// Appends a note to a channel and returns its index.
    pub fn add_note(&self, channel: Channel, note: NoteEvent) -> Result<usize, EditError> {
        self.edit("Add note", |composition| {
            let notes = composition.notes_mut(channel);
            notes.push(note.normalized());
            Ok(notes.len() - 1)
        })
    }

    /// Removes a note and returns it.
    pub fn remove_note(&self, channel: Channel, index: usize) -> Result<NoteEvent, EditError> {
        self.edit("Remove note", |composition| {
            let len = composition.notes(channel).len();
            if index >= len {
                return Err(EditError::NoteIndex { channel, index, len });
            }
            Ok(composition.notes_mut(channel).remove(index))
        })
    }

    /// Sets a note's pitch (clamped to 127).
    pub fn set_note_pitch(&self, channel: Channel, index: usize, pitch: u8) -> Result<(), EditError> {
        self.edit("Set pitch", |composition| {
            note_mut(composition, channel, index)?.pitch = pitch.min(127);
            Ok(())
        })
    }

    /// Sets a note's duration (at least 1 step).
    pub fn set_note_duration(
        &self,
        channel: Channel,
        index: usize,
        duration: u16,
    ) -> Result<(), EditError> {
        self.edit("Set duration", |composition| {
            note_mut(composition, channel, index)?.duration = duration.max(1);
            Ok(())
        })
    }

    /// Sets a note's velocity (clamped to 127).
    pub fn set_note_velocity(
        &self,
        channel: Channel,
        index: usize,
        velocity: u8,
    ) -> Result<(), EditError> {
        self.edit("Set velocity", |composition| {
            note_mut(composition, channel, index)?.velocity = velocity.min(127);
            Ok(())
        })
    }

    /// Removes the note covering `step`, or adds a one-step note there.
    ///
    /// # Returns
    ///
    /// true if a note was added, false if one was removed.
    pub fn toggle_note_at(
        &self,
        channel: Channel,
        step: u16,
        pitch: u8,
        velocity: u8,
    ) -> Result<bool, EditError> {
        self.edit("Toggle note", |composition| {
            match composition.note_index_at(channel, step) {
                Some(index) => {
                    composition.notes_mut(channel).remove(index);
                    Ok(false)
                }
                None => {
                    composition
                        .notes_mut(channel)
                        .push(NoteEvent::new(step, 1, pitch, velocity));
                    Ok(true)
                }
            }
        })
    }

    /// Returns the index of the first note (storage order) sounding at `step`.
    pub fn find_note_index_at(&self, channel: Channel, step: u16) -> Result<Option<usize>, EditError> {
        self.with_composition(|composition| composition.note_index_at(channel, step))
    }

    /// Returns a copy of the first note (storage order) sounding at `step`.
    pub fn find_note_at(&self, channel: Channel, step: u16) -> Result<Option<NoteEvent>, EditError> {
        self.with_composition(|composition| composition.note_at(channel, step).copied())
    }

    /// Removes every note of one channel.
    pub fn clear_channel(&self, channel: Channel) -> Result<(), EditError> {
        self.edit("Clear channel", |composition| {
            composition.notes_mut(channel).clear();
            Ok(())
        })
    }

    /// Removes every note of both channels.
    pub fn clear_all(&self) -> Result<(), EditError> {
        self.edit("Clear all", |composition| {
            composition.clear();
            Ok(())
        })
    }

    /// Reverts the most recent edit. Returns false if there was none.
    pub fn undo(&self) -> Result<bool, EditError> {
        let mut composition = self.lock_composition()?;
        let undone = self.inner.history.lock().undo(&mut composition);
        if let Some(description) = undone {
            self.inner.transport.lock().refresh(&composition);
            tracing::debug!("Undo: {}", description);
        }
        Ok(undone.is_some())
    }

    /// Re-applies the most recently undone edit. Returns false if there was none.
    pub fn redo(&self) -> Result<bool, EditError> {
        let mut composition = self.lock_composition()?;
        let redone = self.inner.history.lock().redo(&mut composition);
        if let Some(description) = redone {
            self.inner.transport.lock().refresh(&composition);
            tracing::debug!("Redo: {}", description);
        }
        Ok(redone.is_some())
    }

    pub fn can_undo(&self) -> bool {
        self.inner.history.lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.inner.history.lock().can_redo()
    }

    /// Runs an undoable edit.
    ///
    /// The snapshot is recorded only if `apply` succeeds; `apply` must
    /// validate before it mutates.
    fn edit<R>(
        &self,
        description: &'static str,
        apply: impl FnOnce(&mut Composition) -> Result<R, EditError>,
    ) -> Result<R, EditError> {
        let mut composition = self.lock_composition()?;
        let snapshot = StateSnapshot::new(&composition, description);
        let result = apply(&mut composition)?;
        self.inner.history.lock().push_undo(snapshot);
        Ok(result)
    }

    /// Runs a non-undoable change that may affect the grid layout.
    fn update_composition(&self, apply: impl FnOnce(&mut Composition)) -> Result<(), EditError> {
        let mut composition = self.lock_composition()?;
        apply(&mut composition);
        self.inner.transport.lock().refresh(&composition);
        Ok(())
    }

    fn with_composition<R>(&self, read: impl FnOnce(&Composition) -> R) -> Result<R, EditError> {
        let composition = self.lock_composition()?;
        Ok(read(&composition))
    }

    fn lock_composition(&self) -> Result<MutexGuard<'_, Composition>, EditError> {
        self.inner
            .composition
            .try_lock_for(self.inner.config.edit_lock_timeout)
            .ok_or_else(|| {
                tracing::warn!("Composition lock timed out, edit dropped");
                EditError::Busy
            })
    }


    /// Returns a copy of the composition.
    pub fn composition(&self) -> Result<Composition, EditError> {
        self.with_composition(Composition::clone)
    }

    /// Grants exclusive access to the composition (for loading, importing,
    /// changing instruments or the time signature). Changes made through the
    /// guard are not recorded for undo.
    pub fn composition_mut(&self) -> Result<CompositionGuard<'_>, EditError> {
        Ok(CompositionGuard {
            composition: self.lock_composition()?,
            transport: &self.inner.transport,
        })
    }

    /// Installs a new composition (after a load or import) and clears the
    /// undo history.
    pub fn replace_composition(&self, composition: Composition) -> Result<(), EditError> {
        let mut current = self.lock_composition()?;
        *current = composition;
        self.inner.history.lock().clear();

        let mut transport = self.inner.transport.lock();
        transport.refresh(&current);
        if transport.state.loop_end > transport.layout.total_steps {
            transport.state.loop_end = 0;
        }
        Ok(())
    }


    /// Sounds the current step and advances the cursor. Runs on every step tick.
    fn process_step(&self) {
        if !self.is_playing() {
            return;
        }

        let sound = match self.inner.composition.try_lock() {
            Some(composition) => {
                let mut transport = self.inner.transport.lock();
                transport.layout = StepLayout::of(&composition);
                let step = transport.state.current_step;
                Some(plan_step(&composition, &transport.state, step))
            }
            None => {
                tracing::trace!("Composition busy, holding previous output");
                None
            }
        };
        if let Some(sound) = sound {
            self.render(sound);
        }

        let advance = self.inner.transport.lock().advance();
        match advance {
            Advance::Moved(step) => self.notify_step(step),
            Advance::Finished => {
                tracing::debug!("End of composition reached");
                self.stop();
            }
        }
    }

    fn render(&self, sound: StepSound) {
        let mut mixer = self.inner.mixer.lock();
        if !self.is_playing() {
            return;
        }
        let was_mixing = mixer.is_mixing();
        mixer.apply(sound);

        let mut timers = self.inner.timers.lock();
        let Some(mix) = timers.as_mut().and_then(|t| t.mix.as_mut()) else {
            return;
        };
        if !mixer.is_mixing() {
            mix.stop();
        } else if !(was_mixing && mix.is_running()) {
            // Back-to-back dual steps keep the running mix clock.
            if let Err(e) = mix.start_periodic(self.inner.config.mix_interval) {
                tracing::warn!("{}", e);
            }
        }
    }

    /// Switches between the two voices of a dual step. Runs on every mix tick.
    fn mix_tick(&self) {
        if let Some(mut mixer) = self.inner.mixer.try_lock() {
            mixer.alternate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mixer::recording::{RecordingTone, ToneCall};
    use super::timer::manual::ManualTimerService;
    use super::*;
    use crate::history::MAX_HISTORY_SIZE;
    use crate::model::{DEFAULT_PITCH, DEFAULT_VELOCITY};

    struct Harness {
        seq: Sequencer,
        timers: ManualTimerService,
        tone: RecordingTone,
        steps: Arc<Mutex<Vec<u16>>>,
        play_states: Arc<Mutex<Vec<bool>>>,
    }

    fn harness_with(config: SequencerConfig, timers: ManualTimerService) -> Harness {
        let tone = RecordingTone::new();
        let seq = Sequencer::new(Box::new(tone.clone()), Box::new(timers.clone()), config);
        seq.init().unwrap();

        let steps = Arc::new(Mutex::new(Vec::new()));
        let play_states = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&steps);
        seq.set_step_callback(move |step| s.lock().push(step));
        let p = Arc::clone(&play_states);
        seq.set_play_state_callback(move |playing| p.lock().push(playing));

        Harness {
            seq,
            timers,
            tone,
            steps,
            play_states,
        }
    }

    fn harness() -> Harness {
        harness_with(SequencerConfig::default(), ManualTimerService::new())
    }

    fn note(start: u16, duration: u16, pitch: u8) -> NoteEvent {
        NoteEvent::new(start, duration, pitch, 127)
    }

    #[test]
    fn test_init_creates_timers_once() {
        let h = harness();
        assert!(h.seq.is_initialized());
        assert!(h.timers.exists(STEP_TIMER_NAME));
        assert!(h.timers.exists(MIX_TIMER_NAME));
        assert!(!h.timers.is_running(STEP_TIMER_NAME));

        h.seq.init().unwrap();
        h.seq.deinit();
        assert!(!h.seq.is_initialized());
    }

    #[test]
    fn test_play_requires_init() {
        let seq = Sequencer::new(
            Box::new(RecordingTone::new()),
            Box::new(ManualTimerService::new()),
            SequencerConfig::default(),
        );
        assert!(matches!(seq.play(), Err(TimerError::NotInitialized)));
        assert!(!seq.is_playing());
    }

    #[test]
    fn test_play_sounds_first_step_immediately() {
        let h = harness();
        h.seq.add_note(Channel::One, note(0, 2, 69)).unwrap();

        h.seq.play().unwrap();
        assert!(h.seq.is_playing());
        assert_eq!(
            h.timers.period(STEP_TIMER_NAME),
            Some(Duration::from_micros(125_000))
        );
        assert_eq!(h.tone.sounding(), Some(440));
        assert_eq!(*h.play_states.lock(), vec![true]);
        assert_eq!(*h.steps.lock(), vec![1]);
        assert_eq!(h.seq.position(), 1);

        // Second call is a no-op.
        h.seq.play().unwrap();
        assert_eq!(h.timers.starts(STEP_TIMER_NAME), 1);
        assert_eq!(*h.play_states.lock(), vec![true]);
    }

    #[test]
    fn test_steps_follow_the_timer() {
        let h = harness();
        h.seq.add_note(Channel::One, note(0, 1, 69)).unwrap();
        h.seq.add_note(Channel::One, note(2, 1, 57)).unwrap();

        h.seq.play().unwrap();
        assert_eq!(h.tone.sounding(), Some(440));
        assert!(h.timers.fire(STEP_TIMER_NAME));
        assert_eq!(h.tone.sounding(), None);
        assert!(h.timers.fire(STEP_TIMER_NAME));
        assert_eq!(h.tone.sounding(), Some(220));
        assert_eq!(*h.steps.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_loop_wraps_at_sentinel_end() {
        let h = harness();
        h.seq.set_length_bars(1).unwrap();
        h.seq.set_loop_region(0, 0);
        h.seq.set_position(15).unwrap();
        h.steps.lock().clear();

        h.seq.play().unwrap();
        assert!(h.seq.is_playing());
        assert_eq!(h.seq.position(), 0);
        assert_eq!(*h.steps.lock(), vec![0]);
    }

    #[test]
    fn test_no_loop_stops_at_end() {
        let h = harness();
        h.seq.set_length_bars(1).unwrap();
        h.seq.set_loop_enabled(false).unwrap();
        h.seq.set_position(15).unwrap();
        h.steps.lock().clear();

        h.seq.play().unwrap();
        assert!(!h.seq.is_playing());
        assert!(h.steps.lock().is_empty());
        assert_eq!(*h.play_states.lock(), vec![true, false]);
        assert!(!h.timers.is_running(STEP_TIMER_NAME));
        assert_eq!(h.tone.calls().last(), Some(&ToneCall::Off));
    }

    #[test]
    fn test_two_voices_alternate() {
        let h = harness();
        h.seq.add_note(Channel::One, note(0, 1, 69)).unwrap();
        h.seq.add_note(Channel::Two, note(0, 1, 57)).unwrap();

        h.seq.play().unwrap();
        assert_eq!(h.tone.sounding(), Some(440));
        assert_eq!(
            h.timers.period(MIX_TIMER_NAME),
            Some(Duration::from_millis(20))
        );

        assert!(h.timers.fire(MIX_TIMER_NAME));
        assert_eq!(h.tone.sounding(), Some(220));
        assert!(h.timers.fire(MIX_TIMER_NAME));
        assert_eq!(h.tone.sounding(), Some(440));

        // Step 1 is empty: mixing stops and the output goes quiet.
        assert!(h.timers.fire(STEP_TIMER_NAME));
        assert!(!h.timers.is_running(MIX_TIMER_NAME));
        assert_eq!(h.tone.sounding(), None);
    }

    #[test]
    fn test_consecutive_dual_steps_keep_mix_clock() {
        let h = harness();
        h.seq.add_note(Channel::One, note(0, 2, 69)).unwrap();
        h.seq.add_note(Channel::Two, note(0, 2, 57)).unwrap();

        h.seq.play().unwrap();
        assert_eq!(h.timers.starts(MIX_TIMER_NAME), 1);
        assert!(h.timers.fire(MIX_TIMER_NAME));
        assert_eq!(h.tone.sounding(), Some(220));

        // Step 1 is dual again: same clock, alternation restarts on channel 1.
        assert!(h.timers.fire(STEP_TIMER_NAME));
        assert!(h.timers.is_running(MIX_TIMER_NAME));
        assert_eq!(h.timers.starts(MIX_TIMER_NAME), 1);
        assert_eq!(h.tone.sounding(), Some(440));

        h.seq.stop();
        assert!(!h.timers.is_running(MIX_TIMER_NAME));
        h.seq.set_position(0).unwrap();
        h.seq.play().unwrap();
        assert_eq!(h.timers.starts(MIX_TIMER_NAME), 2);
    }

    #[test]
    fn test_single_voice_stops_mixing() {
        let h = harness();
        h.seq.add_note(Channel::One, note(0, 2, 69)).unwrap();
        h.seq.add_note(Channel::Two, note(0, 1, 57)).unwrap();

        h.seq.play().unwrap();
        assert!(h.timers.is_running(MIX_TIMER_NAME));
        h.timers.fire(STEP_TIMER_NAME);
        assert!(!h.timers.is_running(MIX_TIMER_NAME));
        assert_eq!(h.tone.sounding(), Some(440));
    }

    #[test]
    fn test_missing_mix_timer_degrades_to_first_voice() {
        let timers = ManualTimerService::new();
        timers.fail_create(MIX_TIMER_NAME);
        let h = harness_with(SequencerConfig::default(), timers);
        assert!(h.seq.is_initialized());

        h.seq.add_note(Channel::One, note(0, 1, 69)).unwrap();
        h.seq.add_note(Channel::Two, note(0, 1, 57)).unwrap();
        h.seq.play().unwrap();
        assert_eq!(h.tone.sounding(), Some(440));
        assert!(!h.timers.fire(MIX_TIMER_NAME));
    }

    #[test]
    fn test_metronome_replaces_notes() {
        let h = harness();
        h.seq.add_note(Channel::One, note(0, 8, 69)).unwrap();
        h.seq.add_note(Channel::Two, note(0, 8, 57)).unwrap();
        h.seq.set_metronome(true);

        h.seq.play().unwrap();
        assert_eq!(h.tone.sounding(), Some(1200));
        assert!(!h.timers.is_running(MIX_TIMER_NAME));

        h.timers.fire(STEP_TIMER_NAME);
        assert!(h.timers.is_running(MIX_TIMER_NAME));
        h.timers.fire(STEP_TIMER_NAME);
        h.timers.fire(STEP_TIMER_NAME);
        h.timers.fire(STEP_TIMER_NAME);
        assert_eq!(h.tone.sounding(), Some(800));
        assert!(!h.timers.is_running(MIX_TIMER_NAME));
    }

    #[test]
    fn test_muted_channel_is_skipped() {
        let h = harness();
        h.seq.add_note(Channel::One, note(0, 1, 69)).unwrap();
        h.seq.add_note(Channel::Two, note(0, 1, 57)).unwrap();
        h.seq.set_channel_muted(Channel::One, true);
        assert!(h.seq.is_channel_muted(Channel::One));

        h.seq.play().unwrap();
        assert_eq!(h.tone.sounding(), Some(220));
        assert!(!h.timers.is_running(MIX_TIMER_NAME));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let h = harness();
        h.seq.play().unwrap();
        h.seq.stop();
        h.seq.stop();
        assert_eq!(*h.play_states.lock(), vec![true, false]);
        assert!(!h.timers.is_running(STEP_TIMER_NAME));
        // Ticks after stop do nothing.
        assert!(!h.timers.fire(STEP_TIMER_NAME));
    }

    #[test]
    fn test_toggle_playback() {
        let h = harness();
        assert!(h.seq.toggle_playback().unwrap());
        assert!(!h.seq.toggle_playback().unwrap());
        assert!(!h.seq.is_playing());
    }

    #[test]
    fn test_tempo_change_restarts_timer() {
        let h = harness();
        h.seq.play().unwrap();
        h.seq.set_tempo(60).unwrap();

        assert!(h.seq.is_playing());
        assert_eq!(h.seq.tempo(), Ok(60));
        assert_eq!(h.timers.starts(STEP_TIMER_NAME), 2);
        assert_eq!(
            h.timers.period(STEP_TIMER_NAME),
            Some(Duration::from_micros(250_000))
        );
        assert_eq!(*h.play_states.lock(), vec![true, false, true]);

        h.seq.set_tempo(1000).unwrap();
        assert_eq!(h.seq.tempo(), Ok(300));
    }

    #[test]
    fn test_division_change_resets_cursor() {
        let h = harness();
        h.seq.set_position(40).unwrap();
        assert_eq!(h.seq.position(), 40);

        h.seq.set_division(StepDivision::Quarter).unwrap();
        assert_eq!(h.seq.division(), Ok(StepDivision::Quarter));
        assert_eq!(h.seq.position(), 0);
    }

    #[test]
    fn test_length_change_adjusts_loop_end() {
        let h = harness();
        h.seq.set_length_bars(2).unwrap();
        assert_eq!(h.seq.loop_region(), (0, 32));

        h.seq.set_loop_region(4, 30);
        h.seq.set_length_bars(1).unwrap();
        assert_eq!(h.seq.loop_region(), (4, 16));

        h.seq.set_length_bars(500).unwrap();
        assert_eq!(h.seq.length_bars(), Ok(64));
        assert_eq!(h.seq.loop_region(), (4, 16));
    }

    #[test]
    fn test_set_position_wraps_and_notifies() {
        let h = harness();
        h.seq.set_position(10).unwrap();
        h.seq.set_position(64).unwrap();
        assert_eq!(h.seq.position(), 0);
        assert_eq!(*h.steps.lock(), vec![10, 0]);
    }

    #[test]
    fn test_toggle_note_at() {
        let h = harness();
        assert_eq!(
            h.seq
                .toggle_note_at(Channel::Two, 5, DEFAULT_PITCH, DEFAULT_VELOCITY),
            Ok(true)
        );
        let added = h.seq.find_note_at(Channel::Two, 5).unwrap().unwrap();
        assert_eq!(added, NoteEvent::new(5, 1, 60, 100));

        assert_eq!(
            h.seq
                .toggle_note_at(Channel::Two, 5, DEFAULT_PITCH, DEFAULT_VELOCITY),
            Ok(false)
        );
        assert_eq!(h.seq.find_note_index_at(Channel::Two, 5), Ok(None));
    }

    #[test]
    fn test_first_inserted_note_is_found() {
        let h = harness();
        h.seq.add_note(Channel::One, note(4, 4, 72)).unwrap();
        h.seq.add_note(Channel::One, note(0, 8, 60)).unwrap();
        assert_eq!(h.seq.find_note_index_at(Channel::One, 5), Ok(Some(0)));
        assert_eq!(h.seq.find_note_index_at(Channel::One, 2), Ok(Some(1)));
    }

    #[test]
    fn test_note_setters() {
        let h = harness();
        let index = h.seq.add_note(Channel::One, note(0, 4, 60)).unwrap();
        h.seq.set_note_pitch(Channel::One, index, 200).unwrap();
        h.seq.set_note_duration(Channel::One, index, 0).unwrap();
        h.seq.set_note_velocity(Channel::One, index, 10).unwrap();

        let edited = h.seq.composition().unwrap().channel1[index];
        assert_eq!(edited.pitch, 127);
        assert_eq!(edited.duration, 1);
        assert_eq!(edited.velocity, 10);

        let removed = h.seq.remove_note(Channel::One, index).unwrap();
        assert_eq!(removed, edited);
        assert_eq!(h.seq.composition().unwrap().note_count(), 0);
    }

    #[test]
    fn test_bad_index_takes_no_snapshot() {
        let h = harness();
        let err = h.seq.set_note_pitch(Channel::Two, 3, 64).unwrap_err();
        assert_eq!(
            err,
            EditError::NoteIndex {
                channel: Channel::Two,
                index: 3,
                len: 0
            }
        );
        assert!(h.seq.remove_note(Channel::One, 0).is_err());
        assert!(!h.seq.can_undo());
    }

    #[test]
    fn test_undo_depth() {
        let h = harness();
        let mut states = vec![h.seq.composition().unwrap()];
        for i in 0..11u16 {
            h.seq.add_note(Channel::One, note(i, 1, 60)).unwrap();
            states.push(h.seq.composition().unwrap());
        }

        for expected in states[1..11].iter().rev() {
            assert_eq!(h.seq.undo(), Ok(true));
            assert_eq!(&h.seq.composition().unwrap(), expected);
        }
        assert_eq!(h.seq.undo(), Ok(false));
        assert_eq!(states.len() - 2, MAX_HISTORY_SIZE);

        assert!(h.seq.can_redo());
        assert_eq!(h.seq.redo(), Ok(true));
        assert_eq!(h.seq.composition().unwrap(), states[2]);
    }

    #[test]
    fn test_clear_and_undo() {
        let h = harness();
        h.seq.add_note(Channel::One, note(0, 1, 60)).unwrap();
        h.seq.add_note(Channel::Two, note(0, 1, 62)).unwrap();

        h.seq.clear_channel(Channel::One).unwrap();
        assert_eq!(h.seq.composition().unwrap().note_count(), 1);
        h.seq.clear_all().unwrap();
        assert_eq!(h.seq.composition().unwrap().note_count(), 0);

        assert_eq!(h.seq.undo(), Ok(true));
        assert_eq!(h.seq.undo(), Ok(true));
        assert_eq!(h.seq.composition().unwrap().note_count(), 2);
    }

    #[test]
    fn test_edit_times_out_while_composition_held() {
        let config = SequencerConfig {
            edit_lock_timeout: Duration::from_millis(5),
            ..SequencerConfig::default()
        };
        let h = harness_with(config, ManualTimerService::new());

        let guard = h.seq.composition_mut().unwrap();
        assert_eq!(
            h.seq.add_note(Channel::One, note(0, 1, 60)),
            Err(EditError::Busy)
        );
        drop(guard);
        assert!(h.seq.add_note(Channel::One, note(0, 1, 60)).is_ok());
    }

    #[test]
    fn test_busy_step_holds_output_and_advances() {
        let h = harness();
        h.seq.add_note(Channel::One, note(0, 1, 69)).unwrap();
        h.seq.play().unwrap();
        assert_eq!(h.tone.sounding(), Some(440));
        h.tone.clear();

        {
            let _guard = h.seq.composition_mut().unwrap();
            assert!(h.timers.fire(STEP_TIMER_NAME));
            assert!(h.tone.calls().is_empty());
        }
        assert_eq!(h.seq.position(), 2);
        assert_eq!(*h.steps.lock(), vec![1, 2]);
    }

    #[test]
    fn test_composition_guard_refreshes_layout() {
        let h = harness();
        {
            let mut composition = h.seq.composition_mut().unwrap();
            composition.loop_enabled = false;
            composition.set_instrument(Channel::Two, 42);
        }
        assert!(!h.seq.is_loop_enabled());
        assert_eq!(h.seq.composition().unwrap().channel2_instrument, 42);
        assert!(!h.seq.can_undo());
    }

    #[test]
    fn test_replace_composition_clears_history() {
        let h = harness();
        h.seq.add_note(Channel::One, note(0, 1, 60)).unwrap();
        h.seq.set_position(60).unwrap();
        assert!(h.seq.can_undo());

        let mut loaded = Composition::new();
        loaded.set_length_bars(1);
        loaded.channel2.push(note(3, 2, 64));
        h.seq.replace_composition(loaded.clone()).unwrap();

        assert_eq!(h.seq.composition().unwrap(), loaded);
        assert!(!h.seq.can_undo());
        assert_eq!(h.seq.position(), 0);
    }

    #[test]
    fn test_deinit_stops_playback() {
        let h = harness();
        h.seq.play().unwrap();
        h.seq.deinit();
        assert!(!h.seq.is_playing());
        assert!(matches!(h.seq.play(), Err(TimerError::NotInitialized)));
    }

    #[test]
    fn test_playback_snapshot() {
        let h = harness();
        h.seq.set_metronome(true);
        h.seq.set_loop_region(2, 8);
        h.seq.play().unwrap();
        let state = h.seq.playback();
        assert!(state.is_playing);
        assert!(state.metronome_enabled);
        assert_eq!((state.loop_start, state.loop_end), (2, 8));
    }

    #[test]
    fn test_thread_timers_play_to_the_end() {
        let seq = Sequencer::with_thread_timers(Box::new(RecordingTone::new()));
        seq.init().unwrap();
        seq.set_tempo(300).unwrap();
        seq.set_division(StepDivision::ThirtySecond).unwrap();
        seq.set_length_bars(1).unwrap();
        seq.set_loop_enabled(false).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        seq.set_play_state_callback(move |playing| {
            let _ = tx.send(playing);
        });

        seq.play().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        // 32 steps of 25 ms each.
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)), Ok(false));
        assert!(!seq.is_playing());
        seq.deinit();
    }
}
