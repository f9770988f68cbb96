// src/main.rs

use anyhow::{Result, anyhow};
use clap::{Parser, ValueEnum};
use simplelog::{Config, LevelFilter, WriteLogger};
use std::fs::File;
use std::io;
use std::path::PathBuf;

use ficus::audio::AudioServer;
use ficus::config::{load_settings, save_settings};
use ficus::control::{LogObserver, run_control_loop};
use ficus::{CaptureFormat, Engine};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[value(rename_all = "lower")]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the application log level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Log file path
    #[arg(long, value_name = "FILE", default_value = "ficus.log")]
    log_file: PathBuf,

    /// Number of sample banks
    #[arg(long, value_name = "COUNT")]
    banks: Option<usize>,

    /// Hardware channels for both capture and playback
    #[arg(long, value_name = "COUNT")]
    channels: Option<usize>,

    /// Directory capture files are written to
    #[arg(long, value_name = "DIR")]
    capture_dir: Option<PathBuf>,

    /// Sample format of capture files
    #[arg(long, value_name = "FORMAT")]
    capture_format: Option<CaptureFormat>,

    /// Requested audio period in frames
    #[arg(long, value_name = "NUM_FRAMES")]
    audio_buffer_frames: Option<u32>,

    /// Fixed seed for speed rate-matching, for reproducible playback
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,

    /// Preload a bank, e.g. --load 0=loops/drums.wav (repeatable)
    #[arg(long, value_name = "BANK=PATH", value_parser = parse_preload)]
    load: Vec<(usize, PathBuf)>,

    /// Write the effective settings back to the configuration file
    #[arg(long)]
    save_settings: bool,
}

fn parse_preload(arg: &str) -> Result<(usize, PathBuf)> {
    let (bank, path) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("expected BANK=PATH, got {:?}", arg))?;
    let bank = bank
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid bank {:?}", bank))?;
    Ok((bank, PathBuf::from(path)))
}

fn main() -> Result<()> {
    let args = Args::parse();

    // --- Setup logging ---
    let log_level = match args.log_level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    };
    WriteLogger::init(log_level, Config::default(), File::create(&args.log_file)?)?;

    // --- Settings: persisted, then command-line overrides ---
    let mut settings = load_settings().unwrap_or_else(|e| {
        log::warn!("[Main] Could not load settings, using defaults: {}", e);
        Default::default()
    });
    if let Some(banks) = args.banks {
        settings.banks = banks;
    }
    if let Some(channels) = args.channels {
        settings.channels = channels;
    }
    if let Some(dir) = args.capture_dir {
        settings.capture_dir = dir;
    }
    if let Some(format) = args.capture_format {
        settings.capture_format = format;
    }
    if let Some(frames) = args.audio_buffer_frames {
        settings.audio_buffer_frames = frames;
    }
    if args.seed.is_some() {
        settings.random_seed = args.seed;
    }
    settings.validate()?;
    if args.save_settings {
        save_settings(&settings)?;
        log::info!("[Main] Settings saved");
    }

    // --- Start the engine ---
    let server = AudioServer::connect(&settings)?;
    let (engine, callback) = Engine::new(&settings, server.sample_rate())?;
    for (bank, path) in &args.load {
        match engine.load_file(*bank, path) {
            Ok(frames) => println!("bank {}: {} ({} frames)", bank, path.display(), frames),
            Err(e) => eprintln!("bank {}: {}", bank, e),
        }
    }
    let _streams = server.start(callback, engine.xrun_reporter())?;

    println!(
        "\nficus v{} - {} banks, {} channels at {} Hz. Type 'quit' to exit.\n",
        env!("CARGO_PKG_VERSION"),
        engine.bank_count(),
        engine.channel_count(),
        engine.sample_rate()
    );

    // --- Control loop on stdin; blocks until quit or EOF ---
    let mut observer = LogObserver;
    run_control_loop(&engine, io::stdin().lock(), io::stdout(), &mut observer)?;

    // --- Shutdown ---
    log::info!("Shutting down...");
    engine.shutdown();
    Ok(())
}
