//! Line-oriented control surface over an [`Engine`].
//!
//! One command per line, e.g. `load 3 kick.wav`, `speed 3 -1.5`,
//! `route out 3 0 on`, `route mon 0 1 on`, `capture 5 10` (seconds) or `capture 5 4800f` (frames).

use anyhow::{Result, anyhow, bail};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;

use crate::bank::{BankStatus, Direction};
use crate::capture::CaptureLength;
use crate::engine::{Engine, EngineMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSide {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillScope {
    Playback,
    Capture,
    Everything,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Load { bank: usize, path: PathBuf },
    Play { bank: usize },
    Kill { bank: usize },
    Speed { bank: usize, speed: f32 },
    RampUp { bank: usize, fraction: f32 },
    RampDown { bank: usize, fraction: f32 },
    Loop { bank: usize, enabled: bool },
    Capture { bank: usize, length: CaptureLength },
    StopCapture { bank: usize },
    Route { side: RouteSide, bank: usize, channel: usize, enabled: bool },
    Monitor { input: usize, output: usize, enabled: bool },
    Status { bank: Option<usize> },
    KillAll { scope: KillScope },
    Quit,
}

fn parse_num<T: FromStr>(token: Option<&str>, what: &str) -> Result<T> {
    let token = token.ok_or_else(|| anyhow!("missing {}", what))?;
    token
        .parse()
        .map_err(|_| anyhow!("invalid {}: {:?}", what, token))
}

fn parse_switch(token: Option<&str>) -> Result<bool> {
    match token {
        Some("on" | "1" | "true") => Ok(true),
        Some("off" | "0" | "false") => Ok(false),
        Some(other) => bail!("expected on/off, got {:?}", other),
        None => bail!("missing on/off"),
    }
}

fn parse_length(token: Option<&str>) -> Result<CaptureLength> {
    match token {
        None => Ok(CaptureLength::Unbounded),
        Some(token) => match token.strip_suffix('f') {
            Some(frames) => Ok(CaptureLength::Frames(parse_num(Some(frames), "frame count")?)),
            None => Ok(CaptureLength::Seconds(parse_num(Some(token), "seconds")?)),
        },
    }
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| anyhow!("empty command"))?;
        let command = match verb {
            "load" => {
                let bank = parse_num(words.next(), "bank")?;
                let rest: Vec<&str> = words.by_ref().collect();
                if rest.is_empty() {
                    bail!("missing path");
                }
                Command::Load {
                    bank,
                    path: PathBuf::from(rest.join(" ")),
                }
            }
            "play" => Command::Play { bank: parse_num(words.next(), "bank")? },
            "kill" => Command::Kill { bank: parse_num(words.next(), "bank")? },
            "speed" => Command::Speed {
                bank: parse_num(words.next(), "bank")?,
                speed: parse_num(words.next(), "speed")?,
            },
            "rampup" => Command::RampUp {
                bank: parse_num(words.next(), "bank")?,
                fraction: parse_num(words.next(), "fraction")?,
            },
            "rampdown" => Command::RampDown {
                bank: parse_num(words.next(), "bank")?,
                fraction: parse_num(words.next(), "fraction")?,
            },
            "loop" => Command::Loop {
                bank: parse_num(words.next(), "bank")?,
                enabled: parse_switch(words.next())?,
            },
            "capture" => Command::Capture {
                bank: parse_num(words.next(), "bank")?,
                length: parse_length(words.next())?,
            },
            "stopcapture" => Command::StopCapture { bank: parse_num(words.next(), "bank")? },
            "route" => match words.next() {
                Some("mon") => Command::Monitor {
                    input: parse_num(words.next(), "input channel")?,
                    output: parse_num(words.next(), "output channel")?,
                    enabled: parse_switch(words.next())?,
                },
                side => Command::Route {
                    side: match side {
                        Some("in") => RouteSide::In,
                        Some("out") => RouteSide::Out,
                        other => bail!("expected in/out/mon, got {:?}", other),
                    },
                    bank: parse_num(words.next(), "bank")?,
                    channel: parse_num(words.next(), "channel")?,
                    enabled: parse_switch(words.next())?,
                },
            },
            "status" => Command::Status {
                bank: words.next().map(|t| parse_num(Some(t), "bank")).transpose()?,
            },
            "killall" => Command::KillAll {
                scope: match words.next() {
                    None => KillScope::Everything,
                    Some("play") => KillScope::Playback,
                    Some("capture") => KillScope::Capture,
                    Some(other) => bail!("expected play/capture, got {:?}", other),
                },
            },
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command {:?}", other),
        };
        if let Some(extra) = words.next() {
            bail!("unexpected argument {:?}", extra);
        }
        Ok(command)
    }
}

/// Told about every bank a command touched.
pub trait StatusObserver {
    fn bank_changed(&mut self, status: &BankStatus);

    fn metrics_changed(&mut self, _metrics: &EngineMetrics) {}
}

/// Writes state changes to the log.
pub struct LogObserver;

impl StatusObserver for LogObserver {
    fn bank_changed(&mut self, status: &BankStatus) {
        log::info!(
            "[Control] bank {}: playing={} looping={} capturing={} speed={}{} pos={}/{}",
            status.index,
            status.playing,
            status.looping,
            status.capturing,
            if status.reverse { "-" } else { "" },
            status.speed,
            status.position,
            status.source_frames
        );
        if let Some(fault) = status.capture_fault {
            log::warn!("[Control] bank {} capture fault: {:?}", status.index, fault);
        }
    }

    fn metrics_changed(&mut self, metrics: &EngineMetrics) {
        log::info!(
            "[Control] streamers={} capture_overruns={} xruns={}",
            metrics.active_streamers,
            metrics.capture_overruns,
            metrics.server_xruns
        );
    }
}

pub enum Reply {
    Done(String),
    Quit,
}

fn describe(status: &BankStatus) -> String {
    format!(
        "bank {}: {}{}{} speed {}{} ramp {}/{} frame {}/{} captured {}",
        status.index,
        if status.playing { "playing" } else { "stopped" },
        if status.looping { " looping" } else { "" },
        if status.capturing { " capturing" } else { "" },
        if status.reverse { "-" } else { "" },
        status.speed,
        status.ramp_up,
        status.ramp_down,
        status.position,
        status.source_frames,
        status.captured_frames
    )
}

/// Runs one command against the engine and notifies `observer` of the result.
pub fn apply(engine: &Engine, command: Command, observer: &mut dyn StatusObserver) -> Result<Reply> {
    let touched = match &command {
        Command::Load { bank, .. }
        | Command::Play { bank }
        | Command::Kill { bank }
        | Command::Speed { bank, .. }
        | Command::RampUp { bank, .. }
        | Command::RampDown { bank, .. }
        | Command::Loop { bank, .. }
        | Command::Capture { bank, .. }
        | Command::StopCapture { bank }
        | Command::Route { bank, .. } => Some(*bank),
        _ => None,
    };

    let message = match command {
        Command::Load { bank, path } => {
            let frames = engine.load_file(bank, &path)?;
            format!("loaded {} frames", frames)
        }
        Command::Play { bank } => {
            engine.start_playback(bank)?;
            "playing".to_string()
        }
        Command::Kill { bank } => format!("was playing: {}", engine.kill_playback(bank)?),
        Command::Speed { bank, speed } => {
            engine.set_speed(bank, speed)?;
            "ok".to_string()
        }
        Command::RampUp { bank, fraction } => {
            engine.set_ramp_up(bank, fraction)?;
            "ok".to_string()
        }
        Command::RampDown { bank, fraction } => {
            engine.set_ramp_down(bank, fraction)?;
            "ok".to_string()
        }
        Command::Loop { bank, enabled } => {
            engine.set_loop(bank, enabled)?;
            "ok".to_string()
        }
        Command::Capture { bank, length } => {
            engine.start_capture(bank, length)?;
            format!("capturing to {}", engine.capture_path(bank)?.display())
        }
        Command::StopCapture { bank } => {
            let was = engine.kill_capture(bank)?;
            format!(
                "was capturing: {} ({} frames in last file)",
                was,
                engine.duration_frames(bank, Direction::In)?
            )
        }
        Command::Route {
            side,
            bank,
            channel,
            enabled,
        } => {
            match side {
                RouteSide::In => engine.set_capture_route(bank, channel, enabled)?,
                RouteSide::Out => engine.set_playback_route(bank, channel, enabled)?,
            }
            "ok".to_string()
        }
        Command::Monitor {
            input,
            output,
            enabled,
        } => {
            engine.set_monitor(input, output, enabled)?;
            "ok".to_string()
        }
        Command::Status { bank: Some(bank) } => describe(&engine.status(bank)?),
        Command::Status { bank: None } => {
            let metrics = engine.metrics();
            observer.metrics_changed(&metrics);
            let mut lines: Vec<String> = engine
                .statuses()
                .iter()
                .filter(|s| s.playing || s.capturing || s.source_frames > 0)
                .map(describe)
                .collect();
            lines.push(format!(
                "streamers {} capture overruns {} xruns {}",
                metrics.active_streamers, metrics.capture_overruns, metrics.server_xruns
            ));
            lines.join("\n")
        }
        Command::KillAll { scope } => {
            let played = match scope {
                KillScope::Playback | KillScope::Everything => engine.kill_all_playback(),
                KillScope::Capture => 0,
            };
            let captured = match scope {
                KillScope::Capture | KillScope::Everything => engine.kill_all_capture(),
                KillScope::Playback => 0,
            };
            for status in engine.statuses() {
                observer.bank_changed(&status);
            }
            format!("stopped {} playing, {} capturing", played, captured)
        }
        Command::Quit => return Ok(Reply::Quit),
    };

    if let Some(bank) = touched {
        observer.bank_changed(&engine.status(bank)?);
    }
    Ok(Reply::Done(message))
}

/// Reads commands from `input` until `quit` or end of input, answering on `output`.
pub fn run_control_loop<R: BufRead, W: Write>(
    engine: &Engine,
    input: R,
    mut output: W,
    observer: &mut dyn StatusObserver,
) -> Result<()> {
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let reply = line
            .parse::<Command>()
            .and_then(|command| apply(engine, command, observer));
        match reply {
            Ok(Reply::Done(message)) => writeln!(output, "{}", message)?,
            Ok(Reply::Quit) => break,
            Err(e) => {
                log::warn!("[Control] {:?} failed: {}", line, e);
                writeln!(output, "error: {}", e)?;
            }
        }
        output.flush()?;
    }
    Ok(())
}
