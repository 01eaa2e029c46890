//! buzzseq - play and convert two-voice step sequencer compositions.
//!
//! # Usage
//!
//! ```bash
//! buzzseq play music/song.mcs --metronome   # Play a project through the sound card
//! buzzseq play tune.mid --division 8 --loop # Import a MIDI file and loop it
//! buzzseq convert music/song.mcs song.mid   # Export a project as a MIDI file
//! buzzseq info music/song.mcs               # Print a JSON summary
//! buzzseq list music                        # List projects and MIDI files
//! ```
//!
//! Set `RUST_LOG=buzzseq=debug` for engine logging.

use anyhow::{bail, Context, Result};
use buzzseq::audio::{SilentTone, ToneOutput, ToneStream};
use buzzseq::midi::{self, note_to_name, MIDI_EXTENSIONS};
use buzzseq::project::{self, PROJECT_EXTENSION};
use buzzseq::{Channel, Composition, FsStorage, Sequencer, StepDivision};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// What the invocation should do.
enum Command {
    Play(PathBuf),
    Convert { input: PathBuf, output: PathBuf },
    Info(PathBuf),
    List(PathBuf),
}

/// Command-line options for the application.
struct CliOptions {
    command: Command,
    /// Step division used when importing MIDI files.
    division: StepDivision,
    /// Loop playback instead of stopping at the end.
    looping: bool,
    /// Play the metronome click instead of the composition's notes on beats.
    metronome: bool,
    /// Directory that file arguments are resolved against.
    root: PathBuf,
}

fn print_usage(program: &str) {
    eprintln!("buzzseq - Two-voice step sequencer");
    eprintln!();
    eprintln!("Usage: {} <COMMAND> [OPTIONS]", program);
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  play FILE          Play a .mcs project or .mid file");
    eprintln!("  convert IN OUT     Convert between .mcs and .mid");
    eprintln!("  info FILE          Print a JSON summary of a file");
    eprintln!("  list DIR           List project and MIDI files in a directory");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -d, --division N   Steps per whole note for MIDI import (1-32, default 16)");
    eprintln!("  -l, --loop         Loop playback");
    eprintln!("  -m, --metronome    Enable the metronome click");
    eprintln!("  -r, --root DIR     Resolve file arguments against DIR (default .)");
    eprintln!("  -h, --help         Print this help message");
}

impl CliOptions {
    /// Parses command-line arguments.
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let program = args.first().map_or("buzzseq", String::as_str);
        let mut positional: Vec<&str> = Vec::new();
        let mut division = StepDivision::Sixteenth;
        let mut looping = false;
        let mut metronome = false;
        let mut root = PathBuf::from(".");
        let mut i = 1;

        while i < args.len() {
            match args[i].as_str() {
                "--division" | "-d" => {
                    i += 1;
                    let value = args.get(i).context("--division requires a value")?;
                    let steps: u8 = value
                        .parse()
                        .with_context(|| format!("Invalid division: {}", value))?;
                    division = StepDivision::from_steps(steps).with_context(|| {
                        format!("Division must be 1, 2, 4, 8, 16 or 32, got {}", steps)
                    })?;
                }
                "--loop" | "-l" => looping = true,
                "--metronome" | "-m" => metronome = true,
                "--root" | "-r" => {
                    i += 1;
                    root = PathBuf::from(args.get(i).context("--root requires a directory")?);
                }
                "--help" | "-h" => {
                    print_usage(program);
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
                other => positional.push(other),
            }
            i += 1;
        }

        let command = match positional.as_slice() {
            ["play", file] => Command::Play(PathBuf::from(file)),
            ["convert", input, output] => Command::Convert {
                input: PathBuf::from(input),
                output: PathBuf::from(output),
            },
            ["info", file] => Command::Info(PathBuf::from(file)),
            ["list"] => Command::List(project::project_directory()),
            ["list", dir] => Command::List(PathBuf::from(dir)),
            _ => {
                print_usage(program);
                std::process::exit(1);
            }
        };

        Ok(Self {
            command,
            division,
            looping,
            metronome,
            root,
        })
    }
}

/// Kind of file, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Project,
    Midi,
}

impl FileKind {
    fn of(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(PROJECT_EXTENSION) {
            Ok(FileKind::Project)
        } else if MIDI_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
            Ok(FileKind::Midi)
        } else {
            bail!("Unrecognized file type: {}", path.display())
        }
    }
}

fn load_composition(storage: &FsStorage, path: &Path, division: StepDivision) -> Result<Composition> {
    let mut composition = Composition::new();
    let loaded = match FileKind::of(path)? {
        FileKind::Project => project::load_project(storage, path, &mut composition),
        FileKind::Midi => midi::import_midi(storage, path, &mut composition, division),
    };
    loaded.with_context(|| format!("Failed to load {}", path.display()))?;
    Ok(composition)
}

fn save_composition(storage: &FsStorage, path: &Path, composition: &Composition) -> Result<()> {
    let saved = match FileKind::of(path)? {
        FileKind::Project => project::save_project(storage, path, composition),
        FileKind::Midi => midi::export_midi(storage, path, composition),
    };
    saved.with_context(|| format!("Failed to write {}", path.display()))
}

/// JSON summary of a decoded composition.
#[derive(Serialize)]
struct CompositionSummary {
    tempo: u16,
    time_signature: String,
    division: String,
    length_bars: u16,
    total_steps: u16,
    loop_enabled: bool,
    channels: Vec<ChannelSummary>,
}

#[derive(Serialize)]
struct ChannelSummary {
    channel: u8,
    instrument: u8,
    /// Notes as "NAME@START+DURATION", disabled notes in parentheses.
    notes: Vec<String>,
}

impl CompositionSummary {
    fn of(composition: &Composition) -> Self {
        let channels = Channel::BOTH
            .iter()
            .map(|&channel| ChannelSummary {
                channel: channel.index() as u8 + 1,
                instrument: composition.instrument(channel),
                notes: composition
                    .notes(channel)
                    .iter()
                    .map(|note| {
                        let text = format!(
                            "{}@{}+{}",
                            note_to_name(note.pitch),
                            note.start_step,
                            note.duration
                        );
                        if note.enabled {
                            text
                        } else {
                            format!("({})", text)
                        }
                    })
                    .collect(),
            })
            .collect();

        Self {
            tempo: composition.tempo,
            time_signature: format!(
                "{}/{}",
                composition.time_signature_num, composition.time_signature_den
            ),
            division: composition.division.to_string(),
            length_bars: composition.length_bars,
            total_steps: composition.total_steps(),
            loop_enabled: composition.loop_enabled,
            channels,
        }
    }
}

fn info(storage: &FsStorage, path: &Path, division: StepDivision) -> Result<()> {
    let json = match FileKind::of(path)? {
        FileKind::Project => {
            let info = project::project_info(storage, path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::to_string_pretty(&info)?
        }
        FileKind::Midi => {
            let composition = load_composition(storage, path, division)?;
            serde_json::to_string_pretty(&CompositionSummary::of(&composition))?
        }
    };
    println!("{}", json);
    Ok(())
}

fn list(storage: &FsStorage, dir: &Path) -> Result<()> {
    let projects = project::list_project_files(storage, dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    let midi_files = midi::list_midi_files(storage, dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?;

    for name in projects.iter().chain(midi_files.iter()) {
        println!("{}", name);
    }
    if projects.is_empty() && midi_files.is_empty() {
        eprintln!("No project or MIDI files in {}", dir.display());
    }
    Ok(())
}

fn play(storage: &FsStorage, path: &Path, cli: &CliOptions) -> Result<()> {
    let composition = load_composition(storage, path, cli.division)?;

    // The stream must stay alive on this thread for the whole playback.
    let (_stream, output): (Option<ToneStream>, Box<dyn ToneOutput>) = match ToneStream::open() {
        Ok((stream, tone)) => (Some(stream), Box::new(tone) as Box<dyn ToneOutput>),
        Err(e) => {
            tracing::warn!("{:#}; playing silently", e);
            (None, Box::new(SilentTone) as Box<dyn ToneOutput>)
        }
    };

    let sequencer = Sequencer::with_thread_timers(output);
    sequencer.replace_composition(composition)?;
    sequencer.set_loop_enabled(cli.looping)?;
    sequencer.set_metronome(cli.metronome);

    let (stopped_tx, stopped_rx) = crossbeam_channel::bounded(1);
    sequencer.set_play_state_callback(move |playing| {
        if !playing {
            let _ = stopped_tx.try_send(());
        }
    });
    sequencer.set_step_callback(|step| tracing::trace!("Step {}", step));

    sequencer.init()?;
    sequencer.play()?;
    eprintln!(
        "Playing {} ({} BPM, {} bars){}",
        path.display(),
        sequencer.tempo()?,
        sequencer.length_bars()?,
        if cli.looping { ", Ctrl-C to stop" } else { "" }
    );

    stopped_rx
        .recv()
        .context("Sequencer stopped unexpectedly")?;
    sequencer.deinit();
    Ok(())
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let storage = FsStorage::new(&cli.root);
    match &cli.command {
        Command::Play(path) => play(&storage, path, &cli),
        Command::Convert { input, output } => {
            let composition = load_composition(&storage, input, cli.division)?;
            save_composition(&storage, output, &composition)?;
            eprintln!("Wrote {}", output.display());
            Ok(())
        }
        Command::Info(path) => info(&storage, path, cli.division),
        Command::List(dir) => list(&storage, dir),
    }
}
