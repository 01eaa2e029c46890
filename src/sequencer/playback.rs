//! Transport state: cursor, loop region, mutes.

use crate::model::{Channel, Composition};
use serde::Serialize;
use std::time::Duration;

/// Runtime playback state. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackState {
    /// Whether the step clock is running.
    pub is_playing: bool,

    /// Step that will sound on the next step tick.
    pub current_step: u16,

    /// First step of the loop region.
    pub loop_start: u16,

    /// End of the loop region (exclusive). 0 means "end of the composition".
    pub loop_end: u16,

    pub channel1_muted: bool,
    pub channel2_muted: bool,

    /// Whether bar and beat clicks replace the notes on those steps.
    pub metronome_enabled: bool,
}

impl PlaybackState {
    /// Returns whether a channel is muted.
    pub fn is_muted(&self, channel: Channel) -> bool {
        match channel {
            Channel::One => self.channel1_muted,
            Channel::Two => self.channel2_muted,
        }
    }

    /// Mutes or unmutes a channel.
    pub fn set_muted(&mut self, channel: Channel, muted: bool) {
        match channel {
            Channel::One => self.channel1_muted = muted,
            Channel::Two => self.channel2_muted = muted,
        }
    }

    /// Resolves the loop end sentinel against the composition length.
    pub fn effective_loop_end(&self, total_steps: u16) -> u16 {
        if self.loop_end == 0 {
            total_steps
        } else {
            self.loop_end
        }
    }
}

/// The parts of a composition the step clock needs without taking the
/// composition lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StepLayout {
    pub total_steps: u16,
    pub loop_enabled: bool,
    pub step_duration: Duration,
}

impl StepLayout {
    pub fn of(composition: &Composition) -> Self {
        Self {
            total_steps: composition.total_steps(),
            loop_enabled: composition.loop_enabled,
            step_duration: composition.step_duration(),
        }
    }
}

/// Result of advancing the transport by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advance {
    /// The cursor moved (possibly wrapped) to this step.
    Moved(u16),
    /// The end was reached with looping disabled.
    Finished,
}

/// Playback state plus the last observed composition layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transport {
    pub state: PlaybackState,
    pub layout: StepLayout,
}

impl Transport {
    pub fn new(composition: &Composition) -> Self {
        Self {
            state: PlaybackState::default(),
            layout: StepLayout::of(composition),
        }
    }

    /// Moves the cursor past the step that just sounded.
    ///
    /// Reaching the loop end wraps to the loop start when looping is enabled;
    /// otherwise the transport reports [`Advance::Finished`] and the cursor is
    /// left where it was. A loop start at or beyond the loop end wraps to 0.
    pub fn advance(&mut self) -> Advance {
        let next = self.state.current_step.saturating_add(1);
        let end = self.state.effective_loop_end(self.layout.total_steps);

        if next < end {
            self.state.current_step = next;
            return Advance::Moved(next);
        }

        if !self.layout.loop_enabled {
            return Advance::Finished;
        }

        let start = if self.state.loop_start < end {
            self.state.loop_start
        } else {
            0
        };
        self.state.current_step = start;
        Advance::Moved(start)
    }

    /// Re-reads the layout from the composition and pulls the cursor back
    /// inside it.
    pub fn refresh(&mut self, composition: &Composition) {
        self.layout = StepLayout::of(composition);
        if self.state.current_step >= self.layout.total_steps {
            self.state.current_step = 0;
        }
    }
}
