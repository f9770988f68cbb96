use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, TryRecvError};

use crate::bank::{Bank, CaptureFault};
use crate::engine::Shared;
use crate::error::{EngineError, EngineResult};
use crate::ring::RingConsumer;

/// Frame limit meaning "until killed".
pub const UNBOUNDED_FRAMES: u64 = u64::MAX;

/// How long a capture runs before stopping by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureLength {
    Unbounded,
    Seconds(u32),
    Frames(u64),
}

impl CaptureLength {
    /// Frame limit at `sample_rate`. A zero length is unbounded.
    pub fn to_frames(self, sample_rate: u32) -> u64 {
        match self {
            CaptureLength::Unbounded | CaptureLength::Seconds(0) | CaptureLength::Frames(0) => {
                UNBOUNDED_FRAMES
            }
            CaptureLength::Seconds(s) => s as u64 * sample_rate as u64,
            CaptureLength::Frames(f) => f,
        }
    }
}

/// Sample encoding of capture files.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CaptureFormat {
    Pcm8,
    #[default]
    Pcm16,
    Pcm24,
    Pcm32,
    Float32,
}

impl CaptureFormat {
    fn wav_spec(self, sample_rate: u32) -> hound::WavSpec {
        let (bits_per_sample, sample_format) = match self {
            CaptureFormat::Pcm8 => (8, hound::SampleFormat::Int),
            CaptureFormat::Pcm16 => (16, hound::SampleFormat::Int),
            CaptureFormat::Pcm24 => (24, hound::SampleFormat::Int),
            CaptureFormat::Pcm32 => (32, hound::SampleFormat::Int),
            CaptureFormat::Float32 => (32, hound::SampleFormat::Float),
        };
        hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample,
            sample_format,
        }
    }

    fn full_scale(self) -> f64 {
        match self {
            CaptureFormat::Pcm8 => i8::MAX as f64,
            CaptureFormat::Pcm16 => i16::MAX as f64,
            CaptureFormat::Pcm24 => 8_388_607.0,
            CaptureFormat::Pcm32 => i32::MAX as f64,
            CaptureFormat::Float32 => 1.0,
        }
    }
}

/// An open mono capture file.
pub struct CaptureTarget {
    writer: hound::WavWriter<BufWriter<File>>,
    path: PathBuf,
    format: CaptureFormat,
}

impl CaptureTarget {
    pub fn create(path: &Path, format: CaptureFormat, sample_rate: u32) -> EngineResult<Self> {
        let open_err = |reason: String| EngineError::CaptureOpen {
            path: path.to_path_buf(),
            reason,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| open_err(e.to_string()))?;
            }
        }
        let writer = hound::WavWriter::create(path, format.wav_spec(sample_rate))
            .map_err(|e| open_err(e.to_string()))?;
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            format,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, sample: f32) -> hound::Result<()> {
        let sample = sample.clamp(-1.0, 1.0);
        match self.format {
            CaptureFormat::Float32 => self.writer.write_sample(sample),
            format => {
                let scaled = (sample as f64 * format.full_scale()).round() as i32;
                self.writer.write_sample(scaled)
            }
        }
    }

    fn finalize(self) -> hound::Result<()> {
        self.writer.finalize()
    }
}

pub enum CaptureCommand {
    Start { bank: usize, target: CaptureTarget },
    Shutdown,
}

/// Single worker that turns the input channel rings into per-bank capture files.
pub(crate) struct CaptureWriter {
    shared: Arc<Shared>,
    inputs: Vec<RingConsumer>,
    commands: mpsc::Receiver<CaptureCommand>,
    targets: Vec<Option<CaptureTarget>>,
    armed: usize,
    /// Channel samples gathered for the frame being assembled.
    frame: Vec<f32>,
    filled: usize,
    seen_overruns: u64,
}

impl CaptureWriter {
    pub(crate) fn new(
        shared: Arc<Shared>,
        inputs: Vec<RingConsumer>,
        commands: mpsc::Receiver<CaptureCommand>,
    ) -> Self {
        let banks = shared.banks.len();
        let channels = inputs.len();
        Self {
            shared,
            inputs,
            commands,
            targets: (0..banks).map(|_| None).collect(),
            armed: 0,
            frame: vec![0.0; channels],
            filled: 0,
            seen_overruns: 0,
        }
    }

    pub(crate) fn run(mut self) {
        log::info!("[CaptureWriter] started with {} input channels", self.inputs.len());
        'outer: loop {
            loop {
                match self.commands.try_recv() {
                    Ok(CaptureCommand::Shutdown) | Err(TryRecvError::Disconnected) => break 'outer,
                    Ok(CaptureCommand::Start { bank, target }) => self.arm(bank, target),
                    Err(TryRecvError::Empty) => break,
                }
            }
            self.reap_killed();

            if self.armed == 0 {
                self.shared.tap_active.store(false, Ordering::SeqCst);
                log::debug!("[CaptureWriter] idle");
                match self.commands.recv() {
                    Ok(CaptureCommand::Start { bank, target }) => self.arm(bank, target),
                    Ok(CaptureCommand::Shutdown) | Err(_) => break 'outer,
                }
                continue;
            }

            if !self.fill_frame() {
                if self.shared.shutdown.load(Ordering::SeqCst) {
                    break 'outer;
                }
                continue;
            }
            self.check_overruns();
            self.write_frame();
        }

        self.shared.tap_active.store(false, Ordering::SeqCst);
        for index in 0..self.targets.len() {
            self.disarm(index);
        }
        log::info!("[CaptureWriter] stopped");
    }

    fn arm(&mut self, index: usize, target: CaptureTarget) {
        let Some(bank) = self.shared.banks.get(index) else {
            return;
        };
        log::info!("[CaptureWriter] bank {} capturing to {:?}", index, target.path());
        bank.capture.accumulated.store(0, Ordering::SeqCst);
        bank.capture.file_frames.store(0, Ordering::SeqCst);
        if self.targets[index].replace(target).is_none() {
            self.armed += 1;
            if self.armed == 1 {
                self.open_tap();
            }
        }
    }

    /// First bank armed: stale input is dropped and the tap reopened.
    fn open_tap(&mut self) {
        self.shared.tap_active.store(false, Ordering::SeqCst);
        for input in &mut self.inputs {
            input.clear();
        }
        self.filled = 0;
        self.seen_overruns = self.shared.capture_overruns.load(Ordering::SeqCst);
        self.shared.tap_active.store(true, Ordering::SeqCst);
    }

    fn reap_killed(&mut self) {
        for index in 0..self.targets.len() {
            if self.targets[index].is_some()
                && self.shared.banks[index].capture.kill.load(Ordering::SeqCst)
            {
                self.disarm(index);
            }
        }
    }

    /// Finalises a bank's file and clears its capture state.
    fn disarm(&mut self, index: usize) {
        let Some(target) = self.targets[index].take() else {
            return;
        };
        self.armed -= 1;
        let bank: &Bank = &self.shared.banks[index];
        let path = target.path().to_path_buf();
        if let Err(e) = target.finalize() {
            log::error!("[CaptureWriter] finalising {:?} failed: {}", path, e);
            bank.capture.set_fault(Some(CaptureFault::Io));
        }
        log::info!(
            "[CaptureWriter] bank {} stopped after {} frames",
            index,
            bank.capture.file_frames.load(Ordering::SeqCst)
        );
        bank.capture.accumulated.store(0, Ordering::SeqCst);
        bank.capture.kill.store(false, Ordering::SeqCst);
        bank.capture.capturing.store(false, Ordering::SeqCst);
    }

    /// Gathers one sample per channel. Returns false if the wait was cut short
    /// by shutdown or a kill; the partial frame is kept for the next call.
    fn fill_frame(&mut self) -> bool {
        let shared = &self.shared;
        let targets = &self.targets;
        let cancelled = || {
            shared.shutdown.load(Ordering::SeqCst)
                || targets.iter().enumerate().any(|(index, target)| {
                    target.is_some() && shared.banks[index].capture.kill.load(Ordering::SeqCst)
                })
        };
        while self.filled < self.inputs.len() {
            match self.inputs[self.filled].dequeue_unless(&cancelled) {
                Some(sample) => {
                    self.frame[self.filled] = sample;
                    self.filled += 1;
                }
                None => return false,
            }
        }
        self.filled = 0;
        true
    }

    fn check_overruns(&mut self) {
        let overruns = self.shared.capture_overruns.load(Ordering::SeqCst);
        if overruns == self.seen_overruns {
            return;
        }
        log::warn!(
            "[CaptureWriter] {} input frames dropped",
            overruns.saturating_sub(self.seen_overruns)
        );
        self.seen_overruns = overruns;
        for (index, target) in self.targets.iter().enumerate() {
            if target.is_some() {
                self.shared.banks[index]
                    .capture
                    .set_fault(Some(CaptureFault::Overrun));
            }
        }
    }

    fn write_frame(&mut self) {
        for index in 0..self.targets.len() {
            let Some(target) = self.targets[index].as_mut() else {
                continue;
            };
            let bank = &self.shared.banks[index];
            let sample = self.shared.routing.capture_mix(index, &self.frame);

            let finished = match target.write(sample) {
                Ok(()) => {
                    let written = bank.capture.accumulated.fetch_add(1, Ordering::SeqCst) + 1;
                    bank.capture.file_frames.store(written, Ordering::SeqCst);
                    written >= bank.capture.limit.load(Ordering::SeqCst)
                        || bank.capture.kill.load(Ordering::SeqCst)
                }
                Err(e) => {
                    log::error!("[CaptureWriter] write to {:?} failed: {}", target.path(), e);
                    bank.capture.set_fault(Some(CaptureFault::Io));
                    true
                }
            };
            if finished {
                self.disarm(index);
            }
        }
    }
}
