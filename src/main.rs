use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

mod dsp;
mod source;

use dsp::registry::StageRole;
use dsp::{PipelineEngine, StageRegistry, TickOutput};
use source::{CaptureSource, FileSource, PcmReader, Playback};

#[derive(Parser)]
#[command(name = "cadenza")]
#[command(about = "Music analysis pipeline: constant-Q spectrum and note detection")]
struct Args {
    /// Audio file to analyse (MP3, WAV, M4A, OGG, etc.)
    input_file: Option<String>,

    /// Analyse the default input device instead of a file
    #[arg(long)]
    live: bool,

    /// Stage selection as registry indices in slot order, e.g. "0,2,3"
    #[arg(short, long, default_value = "0,2,3")]
    stages: String,

    /// Smoothing depth (spectra averaged per bin)
    #[arg(long, default_value = "3")]
    smoothing: usize,

    /// Tick interval in milliseconds
    #[arg(long, default_value = "50")]
    tick_ms: u64,

    /// Analysis stream decimation factor (playback rate / analysis rate)
    #[arg(long, default_value = "4")]
    decimation: u32,

    /// Stage settings file
    #[arg(long, default_value = "stage_settings.json")]
    settings: PathBuf,

    /// Playback volume 0.0 - 1.0
    #[arg(long, default_value = "1.0")]
    volume: f32,

    /// Emit ticks as JSON lines instead of the text meter
    #[arg(long)]
    json: bool,

    /// List available stages and exit
    #[arg(long)]
    list_stages: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut registry = StageRegistry::load(Some(args.settings.clone()));
    registry.wait_ready();

    if args.list_stages {
        for descriptor in registry.descriptors() {
            let role = match descriptor.role {
                StageRole::Processor => "processor",
                StageRole::Detector { primary: true } => "detector (primary)",
                StageRole::Detector { primary: false } => "detector",
            };
            println!("{:3}  {:24} {}", descriptor.index, descriptor.name, role);
        }
        return Ok(());
    }

    if !args.settings.exists() {
        registry.save_settings(&args.settings)?;
        info!("wrote default stage settings to {}", args.settings.display());
    }

    let mut engine = PipelineEngine::new(registry, args.smoothing);
    engine.apply_selection(&parse_selection(&args.stages)?)?;

    if args.live {
        run_live(engine, args.tick_ms, args.json)
    } else {
        let path = args
            .input_file
            .as_deref()
            .context("an input file is required unless --live is given")?;
        run_file(engine, path, &args)
    }
}

fn run_file(mut engine: PipelineEngine, path: &str, args: &Args) -> Result<()> {
    let file = FileSource::load(path, args.decimation)?;
    let mut playback = Playback::new()?;
    let mut pair = file.source_pair(playback.cursor());

    playback.start_file(&file)?;
    playback.set_volume(args.volume);
    info!("analysing {} ({:.1}s)", path, file.duration_seconds());

    while !playback.is_finished() {
        let tick = engine.run_tick(&mut pair);
        let seconds = pair.playback.position() as f64
            / (file.sample_rate() as f64 * file.channels() as f64);
        render_tick(seconds, &tick, args.json);
        thread::sleep(Duration::from_millis(args.tick_ms));
    }
    playback.stop();
    Ok(())
}

fn run_live(mut engine: PipelineEngine, tick_ms: u64, json: bool) -> Result<()> {
    let capture = CaptureSource::open()?;
    let mut pair = capture.source_pair();
    info!(
        "capturing from default input at {} Hz; Ctrl-C to stop",
        capture.sample_rate()
    );

    loop {
        capture.drain();
        let tick = engine.run_tick(&mut pair);
        let seconds = pair.playback.position() as f64 / capture.sample_rate() as f64;
        render_tick(seconds, &tick, json);
        thread::sleep(Duration::from_millis(tick_ms));
    }
}

fn render_tick(seconds: f64, tick: &TickOutput, json: bool) {
    if json {
        if tick.analysis.is_some() {
            if let Ok(line) = serde_json::to_string(tick) {
                println!("{}", line);
            }
        }
        return;
    }

    let Some(analysis) = &tick.analysis else {
        return;
    };
    let mut line = format!(
        "{:7.2}s  avg {:9.3}  max {:9.3}",
        seconds, analysis.avg_gain, analysis.max_gain
    );
    if !tick.detection.detections.is_empty() {
        let notes: Vec<String> = tick
            .detection
            .detections
            .iter()
            .take(4)
            .map(|d| format!("{:.1}Hz ({:.2})", d.frequency, d.magnitude))
            .collect();
        line.push_str("  | ");
        line.push_str(&notes.join("  "));
    }
    println!("{}", line);
}

fn parse_selection(stages: &str) -> Result<BTreeMap<usize, usize>> {
    let mut selection = BTreeMap::new();
    for (slot, entry) in stages
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .enumerate()
    {
        let index: usize = entry
            .trim()
            .parse()
            .with_context(|| format!("bad stage index {:?}", entry))?;
        selection.insert(slot, index);
    }
    Ok(selection)
}
