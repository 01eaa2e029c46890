//! Standard MIDI File (SMF) import functionality.
//!
//! Reads format 0 and 1 files and quantizes their notes onto the step grid
//! of a caller-chosen division. Only MIDI channels 0 and 1 carry notes into
//! the composition (channel 1 and channel 2); everything else is ignored.

use super::ticks_per_step;
use crate::error::CodecError;
use crate::model::{
    Channel, Composition, NoteEvent, StepDivision, DEFAULT_TEMPO, MAX_LENGTH_BARS, MAX_TEMPO,
    MIN_LENGTH_BARS, MIN_TEMPO,
};
use crate::storage::Storage;
use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::path::Path;

/// Bar size assumed when the time signature yields no steps per bar.
const FALLBACK_STEPS_PER_BAR: u32 = 16;

/// A note-on still waiting for its note-off.
struct OpenNote {
    channel: Channel,
    pitch: u8,
    velocity: u8,
    start_tick: u32,
}

/// Quantizes tick positions onto steps, rounding to the nearest step.
struct Quantizer {
    ticks_per_step: u32,
}

impl Quantizer {
    fn step(&self, tick: u32) -> u32 {
        tick.saturating_add(self.ticks_per_step / 2) / self.ticks_per_step
    }
}

/// Decodes a Standard MIDI File into a new composition.
///
/// The result starts from `base` with its notes cleared, `division` as the
/// step division and a tempo of 120 BPM; the time signature and instruments
/// of `base` are kept unless the file sets them.
///
/// # Errors
///
/// - `InvalidFormat` if the data is not a parseable MIDI file
/// - `UnsupportedFormat` for format 2 files and SMPTE timing
pub fn decode_midi(
    data: &[u8],
    base: &Composition,
    division: StepDivision,
) -> Result<Composition, CodecError> {
    let smf = Smf::parse(data).map_err(|e| CodecError::invalid(e.to_string()))?;

    if smf.header.format == Format::Sequential {
        return Err(CodecError::UnsupportedFormat(
            "MIDI format 2 not supported".to_string(),
        ));
    }
    let ppqn = match smf.header.timing {
        Timing::Metrical(ticks) => ticks.as_int(),
        Timing::Timecode(..) => {
            return Err(CodecError::UnsupportedFormat(
                "SMPTE timing not supported".to_string(),
            ))
        }
    };

    let mut composition = base.clone();
    composition.clear();
    composition.division = division;
    composition.tempo = DEFAULT_TEMPO;

    let quantizer = Quantizer {
        ticks_per_step: ticks_per_step(ppqn, division),
    };
    // Open notes are matched across track boundaries.
    let mut open_notes: Vec<OpenNote> = Vec::new();
    let mut max_step = 0u32;

    for track in &smf.tracks {
        let mut tick = 0u32;
        for event in track {
            tick = tick.saturating_add(event.delta.as_int());
            match event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(uspq)) => {
                    let uspq = uspq.as_int();
                    if uspq > 0 {
                        let bpm = (60_000_000 / uspq)
                            .clamp(u32::from(MIN_TEMPO), u32::from(MAX_TEMPO));
                        composition.tempo = bpm as u16;
                    }
                }
                TrackEventKind::Meta(MetaMessage::TimeSignature(numerator, power, _, _)) => {
                    match 1u8.checked_shl(u32::from(power)) {
                        Some(denominator) if numerator > 0 => {
                            composition.time_signature_num = numerator;
                            composition.time_signature_den = denominator;
                        }
                        _ => tracing::debug!(
                            "Ignoring time signature {}/2^{}",
                            numerator,
                            power
                        ),
                    }
                }
                TrackEventKind::Midi { channel, message } => {
                    let Some(channel) = Channel::from_index(usize::from(channel.as_int())) else {
                        continue;
                    };
                    match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            open_notes.push(OpenNote {
                                channel,
                                pitch: key.as_int(),
                                velocity: vel.as_int(),
                                start_tick: tick,
                            });
                        }
                        MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                            let pitch = key.as_int();
                            let Some(index) = open_notes
                                .iter()
                                .position(|n| n.channel == channel && n.pitch == pitch)
                            else {
                                continue;
                            };
                            let open = open_notes.remove(index);

                            let start = quantizer.step(open.start_tick);
                            let end = quantizer.step(tick);
                            let duration = if end > start { end - start } else { 1 };
                            max_step = max_step.max(start.saturating_add(duration));

                            composition.notes_mut(channel).push(NoteEvent::new(
                                saturate_u16(start),
                                saturate_u16(duration),
                                open.pitch,
                                open.velocity,
                            ));
                        }
                        MidiMessage::ProgramChange { program } => {
                            composition.set_instrument(channel, program.as_int());
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    if !open_notes.is_empty() {
        tracing::debug!("Dropped {} notes without a note-off", open_notes.len());
    }

    // Shortest whole-bar length covering every note (at least one bar).
    let steps_per_bar = match u32::from(composition.steps_per_bar()) {
        0 => FALLBACK_STEPS_PER_BAR,
        steps => steps,
    };
    let bars = saturate_u16(max_step.div_ceil(steps_per_bar));
    composition.length_bars = bars.clamp(MIN_LENGTH_BARS, MAX_LENGTH_BARS);

    Ok(composition)
}

fn saturate_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

/// Imports a Standard MIDI File into `composition`.
///
/// On success the composition is replaced by the decoded one; on any error
/// it is left untouched.
///
/// # Arguments
///
/// * `storage` - Where to read the file from
/// * `path` - Path to the .mid file
/// * `composition` - The composition to replace
/// * `division` - Step division to quantize notes onto
pub fn import_midi<S: Storage + ?Sized>(
    storage: &S,
    path: impl AsRef<Path>,
    composition: &mut Composition,
    division: StepDivision,
) -> Result<(), CodecError> {
    let path = path.as_ref();
    if !storage.is_mounted() {
        tracing::warn!("SD card not mounted");
        return Err(CodecError::StorageNotMounted);
    }

    let data = storage.read(path).map_err(|e| CodecError::read(path, e))?;
    let imported = decode_midi(&data, composition, division)?;

    tracing::info!(
        "Imported MIDI file {:?}: {} + {} notes, {} bars",
        path,
        imported.channel1.len(),
        imported.channel2.len(),
        imported.length_bars
    );
    *composition = imported;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::encode_midi;
    use crate::storage::MemoryStorage;

    /// Builds a MIDI file from raw track bodies (End of Track is appended).
    fn smf(format: u16, division: [u8; 2], tracks: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"MThd");
        data.extend_from_slice(&6u32.to_be_bytes());
        data.extend_from_slice(&format.to_be_bytes());
        data.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        data.extend_from_slice(&division);
        for body in tracks {
            let mut track = body.to_vec();
            track.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
            data.extend_from_slice(b"MTrk");
            data.extend_from_slice(&(track.len() as u32).to_be_bytes());
            data.extend_from_slice(&track);
        }
        data
    }

    const PPQN_480: [u8; 2] = [0x01, 0xE0];

    #[test]
    fn test_import_single_note() {
        // Note on 60 at tick 0, note off at tick 480.
        let data = smf(
            0,
            PPQN_480,
            &[&[0x00, 0x90, 60, 100, 0x83, 0x60, 0x80, 60, 0]],
        );
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Sixteenth).unwrap();

        assert_eq!(comp.channel1, vec![NoteEvent::new(0, 4, 60, 100)]);
        assert!(comp.channel2.is_empty());
        assert_eq!(comp.tempo, 120);
        assert_eq!(comp.division, StepDivision::Sixteenth);
        assert_eq!(comp.length_bars, 1);
    }

    #[test]
    fn test_note_on_zero_velocity_ends_note() {
        // Running status; the second event is note-on 64 with velocity 0.
        let data = smf(0, PPQN_480, &[&[0x00, 0x90, 64, 90, 0x81, 0x70, 64, 0]]);
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Sixteenth).unwrap();
        assert_eq!(comp.channel1, vec![NoteEvent::new(0, 2, 64, 90)]);
    }

    #[test]
    fn test_first_open_note_is_closed() {
        // Two overlapping note-ons on the same pitch; the first note-off
        // closes the earliest one.
        let data = smf(
            0,
            [0x00, 0x78], // 120 ticks per quarter, 30 per sixteenth step
            &[&[
                0x00, 0x90, 60, 100, // tick 0
                30, 0x90, 60, 50, // tick 30
                30, 0x80, 60, 0, // tick 60
                60, 0x80, 60, 0, // tick 120
            ]],
        );
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Sixteenth).unwrap();
        assert_eq!(
            comp.channel1,
            vec![NoteEvent::new(0, 2, 60, 100), NoteEvent::new(1, 3, 60, 50)]
        );
    }

    #[test]
    fn test_short_notes_get_one_step() {
        let data = smf(0, PPQN_480, &[&[0x00, 0x91, 72, 80, 10, 0x81, 72, 0]]);
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Sixteenth).unwrap();
        assert!(comp.channel1.is_empty());
        assert_eq!(comp.channel2, vec![NoteEvent::new(0, 1, 72, 80)]);
    }

    #[test]
    fn test_other_channels_and_unclosed_notes_ignored() {
        let data = smf(
            0,
            PPQN_480,
            &[&[
                0x00, 0x92, 60, 100, // channel 3
                0x00, 0x99, 36, 100, // drums
                0x00, 0x90, 62, 100, // never closed
                0x83, 0x60, 0x82, 60, 0, 0x00, 0x89, 36, 0,
            ]],
        );
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Sixteenth).unwrap();
        assert_eq!(comp.note_count(), 0);
        assert_eq!(comp.length_bars, 1);
    }

    #[test]
    fn test_tempo_time_signature_and_programs() {
        let data = smf(
            1,
            PPQN_480,
            &[
                &[
                    0x00, 0xFF, 0x51, 0x03, 0x09, 0x27, 0xC0, // 600000 us = 100 BPM
                    0x00, 0xFF, 0x58, 0x04, 3, 2, 24, 8, // 3/4
                ],
                &[0x00, 0xC0, 19, 0x00, 0xC1, 40, 0x00, 0xC5, 7],
            ],
        );
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Eighth).unwrap();
        assert_eq!(comp.tempo, 100);
        assert_eq!((comp.time_signature_num, comp.time_signature_den), (3, 4));
        assert_eq!(comp.channel1_instrument, 19);
        assert_eq!(comp.channel2_instrument, 40);
        assert_eq!(comp.division, StepDivision::Eighth);
    }

    #[test]
    fn test_tempo_clamped() {
        // 100000 us per quarter = 600 BPM
        let data = smf(0, PPQN_480, &[&[0x00, 0xFF, 0x51, 0x03, 0x01, 0x86, 0xA0]]);
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Sixteenth).unwrap();
        assert_eq!(comp.tempo, 300);
    }

    #[test]
    fn test_notes_across_tracks() {
        let data = smf(
            1,
            PPQN_480,
            &[
                &[0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20],
                &[0x00, 0x90, 60, 100, 0x83, 0x60, 0x80, 60, 0],
                &[0x83, 0x60, 0x91, 67, 100, 0x83, 0x60, 0x81, 67, 0],
            ],
        );
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Sixteenth).unwrap();
        assert_eq!(comp.tempo, 120);
        assert_eq!(comp.channel1, vec![NoteEvent::new(0, 4, 60, 100)]);
        assert_eq!(comp.channel2, vec![NoteEvent::new(4, 4, 67, 100)]);
    }

    #[test]
    fn test_length_from_last_note() {
        // Note ends at step 20 of a 16-step bar.
        let data = smf(0, PPQN_480, &[&[0x00, 0x90, 60, 100, 0x92, 0x60, 0x80, 60, 0]]);
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Sixteenth).unwrap();
        assert_eq!(comp.channel1, vec![NoteEvent::new(0, 20, 60, 100)]);
        assert_eq!(comp.length_bars, 2);
    }

    #[test]
    fn test_empty_file_is_one_bar() {
        let data = smf(0, PPQN_480, &[&[]]);
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Sixteenth).unwrap();
        assert_eq!(comp.note_count(), 0);
        assert_eq!(comp.length_bars, 1);
    }

    #[test]
    fn test_long_file_clamped_to_max_bars() {
        // Note ends at step 1040 (65 bars of 16 steps).
        let data = smf(
            0,
            [0x00, 0x04], // 4 ticks per quarter, 1 tick per step
            &[&[0x00, 0x90, 60, 100, 0x88, 0x10, 0x80, 60, 0]],
        );
        let comp = decode_midi(&data, &Composition::new(), StepDivision::Sixteenth).unwrap();
        assert_eq!(comp.channel1, vec![NoteEvent::new(0, 1040, 60, 100)]);
        assert_eq!(comp.length_bars, MAX_LENGTH_BARS);
    }

    #[test]
    fn test_zero_step_bar_falls_back_to_sixteen_steps() {
        // A base whose 1/8 time signature leaves a whole-note division with
        // no steps per bar.
        let mut base = Composition::new();
        base.time_signature_num = 1;
        base.time_signature_den = 8;
        let data = smf(0, PPQN_480, &[&[0x00, 0x90, 60, 100, 0x82, 0xAC, 0x00, 0x80, 60, 0]]);
        let comp = decode_midi(&data, &base, StepDivision::Whole).unwrap();
        assert_eq!(comp.steps_per_bar(), 0);
        // 20 whole notes end at step 20: two 16-step bars.
        assert_eq!(comp.channel1, vec![NoteEvent::new(0, 20, 60, 100)]);
        assert_eq!(comp.length_bars, 2);
    }

    #[test]
    fn test_unsupported_formats() {
        let data = smf(2, PPQN_480, &[&[], &[]]);
        assert!(matches!(
            decode_midi(&data, &Composition::new(), StepDivision::Sixteenth),
            Err(CodecError::UnsupportedFormat(_))
        ));

        // -25 fps, 40 ticks per frame
        let data = smf(0, [0xE7, 0x28], &[&[]]);
        assert!(matches!(
            decode_midi(&data, &Composition::new(), StepDivision::Sixteenth),
            Err(CodecError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decode_midi(b"not a midi file", &Composition::new(), StepDivision::Sixteenth),
            Err(CodecError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_base_settings_kept() {
        let mut base = Composition::new();
        base.time_signature_num = 6;
        base.time_signature_den = 8;
        base.channel2_instrument = 12;
        base.loop_enabled = false;
        base.channel1.push(NoteEvent::new(3, 1, 50, 50));

        let data = smf(0, PPQN_480, &[&[]]);
        let comp = decode_midi(&data, &base, StepDivision::Quarter).unwrap();
        assert_eq!(comp.note_count(), 0);
        assert_eq!((comp.time_signature_num, comp.time_signature_den), (6, 8));
        assert_eq!(comp.channel2_instrument, 12);
        assert!(!comp.loop_enabled);
        assert_eq!(comp.division, StepDivision::Quarter);
    }

    #[test]
    fn test_import_exported_file() {
        let mut comp = Composition::new();
        comp.set_tempo(140);
        comp.channel1.push(NoteEvent::new(0, 4, 60, 100));
        comp.channel1.push(NoteEvent::new(4, 2, 62, 90));
        comp.channel2.push(NoteEvent::new(8, 8, 48, 70));
        comp.channel2_instrument = 33;

        let storage = MemoryStorage::new();
        crate::midi::export_midi(&storage, "song.mid", &comp).unwrap();

        let mut imported = Composition::new();
        import_midi(&storage, "song.mid", &mut imported, StepDivision::Sixteenth).unwrap();
        assert_eq!(imported.tempo, 140);
        assert_eq!(imported.channel1, comp.channel1);
        assert_eq!(imported.channel2, comp.channel2);
        assert_eq!(imported.channel2_instrument, 33);
        assert_eq!(imported.length_bars, 1);

        // Quantizing the same file to eighths halves every position.
        let data = encode_midi(&comp).unwrap();
        let eighths = decode_midi(&data, &Composition::new(), StepDivision::Eighth).unwrap();
        assert_eq!(
            eighths.channel1,
            vec![NoteEvent::new(0, 2, 60, 100), NoteEvent::new(2, 1, 62, 90)]
        );
    }

    #[test]
    fn test_failed_import_leaves_composition() {
        let storage = MemoryStorage::new();
        storage.insert("bad.mid", b"MThd".to_vec());

        let mut comp = Composition::new();
        comp.channel1.push(NoteEvent::new(0, 1, 60, 100));
        let before = comp.clone();

        assert!(import_midi(&storage, "bad.mid", &mut comp, StepDivision::Sixteenth).is_err());
        assert!(matches!(
            import_midi(&storage, "missing.mid", &mut comp, StepDivision::Sixteenth),
            Err(CodecError::FileNotFound(_))
        ));
        assert_eq!(comp, before);
    }
}
