//! Standard MIDI File (SMF) export functionality.
//!
//! Exports a composition as a single-track Format 0 file that any MIDI
//! sequencer or player can open.
//!
//! # Limitations (Information Degradation)
//!
//! - Disabled notes are not exported at all
//! - Loop settings are not exported
//! - The step grid is not recorded; re-importing quantizes to whatever
//!   division the importer asks for
//!
//! # Format Details
//!
//! One `MTrk` chunk at [`EXPORT_PPQN`](super::EXPORT_PPQN) containing, at
//! tick 0, the tempo, time signature and one program change per channel,
//! followed by the note events of both channels (channel 1 on MIDI channel 0,
//! channel 2 on MIDI channel 1) and End of Track.

use super::{ticks_per_step, EXPORT_PPQN};
use crate::error::CodecError;
use crate::model::{Channel, Composition, MAX_TEMPO, MIN_TEMPO};
use crate::storage::Storage;
use std::path::Path;

/// Writes a variable-length quantity (VLQ) used for delta times in MIDI.
///
/// VLQ encodes values using 7 bits per byte, with the MSB indicating
/// whether more bytes follow (1 = more bytes, 0 = last byte).
fn write_vlq(value: u32, buffer: &mut Vec<u8>) {
    let mut bytes = [0u8; 5];
    let mut count = 0;
    let mut temp = value;
    loop {
        bytes[count] = (temp & 0x7F) as u8;
        count += 1;
        temp >>= 7;
        if temp == 0 {
            break;
        }
    }

    // Most significant group first; every byte but the last has the
    // continuation bit set.
    for i in (0..count).rev() {
        if i > 0 {
            buffer.push(bytes[i] | 0x80);
        } else {
            buffer.push(bytes[i]);
        }
    }
}

/// MIDI event types for track data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MidiEvent {
    NoteOn {
        channel: u8,
        pitch: u8,
        velocity: u8,
    },
    NoteOff {
        channel: u8,
        pitch: u8,
    },
    ProgramChange {
        channel: u8,
        program: u8,
    },
    /// Set tempo: microseconds per quarter note
    SetTempo {
        microseconds_per_beat: u32,
    },
    TimeSignature {
        numerator: u8,
        denominator_power: u8,
    },
    EndOfTrack,
}

/// A MIDI event at an absolute tick.
struct TimedEvent {
    tick: u32,
    event: MidiEvent,
    /// Orders events on the same tick (lower first): setup events, then
    /// note-offs, then note-ons.
    priority: u8,
}

impl TimedEvent {
    fn new(tick: u32, event: MidiEvent) -> Self {
        let priority = match event {
            MidiEvent::SetTempo { .. } => 0,
            MidiEvent::TimeSignature { .. } => 1,
            MidiEvent::ProgramChange { .. } => 2,
            MidiEvent::NoteOff { .. } => 10,
            MidiEvent::NoteOn { .. } => 11,
            MidiEvent::EndOfTrack => 255,
        };
        Self {
            tick,
            event,
            priority,
        }
    }
}

/// Writes a single MIDI event to the buffer (without delta time).
fn write_event(event: &MidiEvent, buffer: &mut Vec<u8>) {
    match *event {
        MidiEvent::NoteOn {
            channel,
            pitch,
            velocity,
        } => {
            buffer.push(0x90 | (channel & 0x0F));
            buffer.push(pitch & 0x7F);
            buffer.push(velocity & 0x7F);
        }
        MidiEvent::NoteOff { channel, pitch } => {
            buffer.push(0x80 | (channel & 0x0F));
            buffer.push(pitch & 0x7F);
            buffer.push(0);
        }
        MidiEvent::ProgramChange { channel, program } => {
            buffer.push(0xC0 | (channel & 0x0F));
            buffer.push(program.min(127));
        }
        MidiEvent::SetTempo {
            microseconds_per_beat,
        } => {
            // Meta event: FF 51 03 tt tt tt
            buffer.extend_from_slice(&[0xFF, 0x51, 0x03]);
            buffer.extend_from_slice(&microseconds_per_beat.to_be_bytes()[1..]);
        }
        MidiEvent::TimeSignature {
            numerator,
            denominator_power,
        } => {
            // Meta event: FF 58 04 nn dd cc bb
            // cc = MIDI clocks per metronome click (24 = quarter note)
            // bb = 32nd notes per quarter note (8)
            buffer.extend_from_slice(&[0xFF, 0x58, 0x04, numerator, denominator_power, 24, 8]);
        }
        MidiEvent::EndOfTrack => {
            // Meta event: FF 2F 00
            buffer.extend_from_slice(&[0xFF, 0x2F, 0x00]);
        }
    }
}

/// Calculates the power of 2 for a time signature denominator.
///
/// E.g., 4 -> 2 (2^2 = 4), 8 -> 3 (2^3 = 8). Non-powers round down.
fn denominator_to_power(denom: u8) -> u8 {
    denom.checked_ilog2().map_or(0, |p| p as u8)
}

/// Collects every event of the composition, sorted for writing.
fn collect_events(composition: &Composition) -> Result<Vec<TimedEvent>, CodecError> {
    let mut events = Vec::new();
    events.try_reserve(4 + composition.note_count() * 2)?;

    let tempo = u32::from(composition.tempo.clamp(MIN_TEMPO, MAX_TEMPO));
    events.push(TimedEvent::new(
        0,
        MidiEvent::SetTempo {
            microseconds_per_beat: 60_000_000 / tempo,
        },
    ));
    events.push(TimedEvent::new(
        0,
        MidiEvent::TimeSignature {
            numerator: composition.time_signature_num,
            denominator_power: denominator_to_power(composition.time_signature_den),
        },
    ));

    let step_ticks = ticks_per_step(EXPORT_PPQN, composition.division);
    for channel in Channel::BOTH {
        let midi_channel = channel.index() as u8;
        events.push(TimedEvent::new(
            0,
            MidiEvent::ProgramChange {
                channel: midi_channel,
                program: composition.instrument(channel),
            },
        ));

        for note in composition.notes(channel).iter().filter(|n| n.enabled) {
            let start = u32::from(note.start_step) * step_ticks;
            let end = (u32::from(note.start_step) + u32::from(note.duration)) * step_ticks;
            events.push(TimedEvent::new(
                start,
                MidiEvent::NoteOn {
                    channel: midi_channel,
                    pitch: note.pitch,
                    velocity: note.velocity,
                },
            ));
            events.push(TimedEvent::new(
                end,
                MidiEvent::NoteOff {
                    channel: midi_channel,
                    pitch: note.pitch,
                },
            ));
        }
    }

    events.sort_by(|a, b| a.tick.cmp(&b.tick).then(a.priority.cmp(&b.priority)));
    let last_tick = events.last().map_or(0, |e| e.tick);
    events.push(TimedEvent::new(last_tick, MidiEvent::EndOfTrack));
    Ok(events)
}

/// Builds the track chunk data from sorted timed events.
fn build_track_data(events: &[TimedEvent]) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Vec::new();
    // Longest events are 7 bytes plus up to 5 bytes of delta.
    buffer.try_reserve(events.len() * 12)?;

    let mut last_tick = 0u32;
    for timed_event in events {
        write_vlq(timed_event.tick.saturating_sub(last_tick), &mut buffer);
        write_event(&timed_event.event, &mut buffer);
        last_tick = timed_event.tick;
    }
    Ok(buffer)
}

/// Encodes a composition as a Standard MIDI File.
///
/// # Errors
///
/// Returns `OutOfMemory` if the output buffer cannot be allocated.
pub fn encode_midi(composition: &Composition) -> Result<Vec<u8>, CodecError> {
    let events = collect_events(composition)?;
    let track_data = build_track_data(&events)?;
    let track_len = u32::try_from(track_data.len())
        .map_err(|_| CodecError::invalid("track too long"))?;

    let mut data = Vec::new();
    data.try_reserve(22 + track_data.len())?;

    // Header chunk (MThd)
    data.extend_from_slice(b"MThd");
    data.extend_from_slice(&6u32.to_be_bytes());
    data.extend_from_slice(&0u16.to_be_bytes()); // Format 0
    data.extend_from_slice(&1u16.to_be_bytes()); // One track
    data.extend_from_slice(&EXPORT_PPQN.to_be_bytes());

    // Track chunk (MTrk)
    data.extend_from_slice(b"MTrk");
    data.extend_from_slice(&track_len.to_be_bytes());
    data.extend_from_slice(&track_data);

    tracing::debug!("Encoded {} MIDI events ({} bytes)", events.len(), data.len());
    Ok(data)
}

/// Exports a composition to a Standard MIDI File.
///
/// # Arguments
///
/// * `storage` - Where to write the file
/// * `path` - Output file path
/// * `composition` - The composition to export
///
/// # Errors
///
/// Returns `StorageNotMounted` if the card is missing, or `FileWrite` if the
/// file cannot be written.
pub fn export_midi<S: Storage + ?Sized>(
    storage: &S,
    path: impl AsRef<Path>,
    composition: &Composition,
) -> Result<(), CodecError> {
    let path = path.as_ref();
    if !storage.is_mounted() {
        tracing::warn!("SD card not mounted");
        return Err(CodecError::StorageNotMounted);
    }

    let data = encode_midi(composition)?;
    storage
        .write(path, &data)
        .map_err(|e| CodecError::write(path, e))?;

    tracing::info!("Exported MIDI file {:?} ({} bytes)", path, data.len());
    Ok(())
}
