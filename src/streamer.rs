use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::bank::Bank;
use crate::error::{EngineError, EngineResult};
use crate::ring::RingProducer;
use crate::transform::{advance, envelope_gain, frame_step, repeat_count};
use crate::wav::WavFrameReader;

pub type SourceReader = WavFrameReader<BufReader<File>>;

/// What a streamer thread owns while it runs and hands back when it exits.
pub struct StreamerParts {
    pub producer: RingProducer,
    pub source: Option<SourceReader>,
}

/// Either the idle parts of a bank's streamer or the handle of the thread using them.
pub(crate) struct WorkerSlot {
    parts: Option<StreamerParts>,
    handle: Option<JoinHandle<Option<StreamerParts>>>,
}

impl WorkerSlot {
    pub(crate) fn idle(parts: StreamerParts) -> Self {
        Self {
            parts: Some(parts),
            handle: None,
        }
    }

    pub(crate) fn take_handle(&mut self) -> Option<JoinHandle<Option<StreamerParts>>> {
        self.handle.take()
    }

    pub(crate) fn put_parts(&mut self, parts: StreamerParts) {
        self.parts = Some(parts);
    }

    pub(crate) fn parts_mut(&mut self) -> Option<&mut StreamerParts> {
        self.parts.as_mut()
    }

    pub(crate) fn take_parts(&mut self) -> Option<StreamerParts> {
        self.parts.take()
    }

    pub(crate) fn set_handle(&mut self, handle: JoinHandle<Option<StreamerParts>>) {
        self.handle = Some(handle);
    }
}

/// Joins a finished (or finishing) streamer and returns its parts to the slot.
///
/// Must not be called with the slot locked: the exiting thread takes that lock
/// to retire.
pub(crate) fn reclaim(bank: &Bank) -> EngineResult<()> {
    let handle = bank.worker.lock().take_handle();
    let Some(handle) = handle else {
        return Ok(());
    };
    match handle.join() {
        Ok(Some(parts)) => {
            bank.worker.lock().put_parts(parts);
            Ok(())
        }
        Ok(None) | Err(_) => {
            log::error!("[Streamer:{}] worker exited without returning its ring", bank.index());
            Err(EngineError::WorkerPanicked(bank.index()))
        }
    }
}

/// Starts a streamer thread for `bank`. The caller holds the engine's lifecycle
/// lock, has reclaimed any previous worker, and has checked a source is loaded.
pub(crate) fn spawn(bank: &Arc<Bank>, seed: Option<u64>) -> EngineResult<()> {
    let mut slot = bank.worker.lock();
    let Some(parts) = slot.take_parts() else {
        return Err(EngineError::WorkerPanicked(bank.index()));
    };
    if parts.source.is_none() {
        let index = bank.index();
        slot.put_parts(parts);
        return Err(EngineError::NoSource(index));
    }

    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ bank.index() as u64),
        None => StdRng::from_os_rng(),
    };

    let flags = &bank.flags;
    flags.kill.store(false, Ordering::SeqCst);
    flags.user_interrupt.store(false, Ordering::SeqCst);
    flags.playing.store(true, Ordering::SeqCst);
    flags.worker_alive.store(true, Ordering::SeqCst);

    // Parts travel over a channel so a failed spawn does not lose the ring.
    let (parts_tx, parts_rx) = mpsc::channel::<StreamerParts>();
    let thread_bank = Arc::clone(bank);
    let spawned = thread::Builder::new()
        .name(format!("ficus-streamer-{}", bank.index()))
        .spawn(move || {
            let parts = parts_rx.recv().ok()?;
            PlaybackStreamer::new(thread_bank, parts, rng).map(PlaybackStreamer::run)
        });

    match spawned {
        Ok(handle) => {
            // The receiver only goes away if the thread died before its first line.
            let _ = parts_tx.send(parts);
            slot.set_handle(handle);
            log::info!("[Streamer:{}] started", bank.index());
            Ok(())
        }
        Err(e) => {
            flags.playing.store(false, Ordering::SeqCst);
            flags.worker_alive.store(false, Ordering::SeqCst);
            slot.put_parts(parts);
            log::error!("[Streamer:{}] failed to spawn: {}", bank.index(), e);
            Err(EngineError::Spawn(e))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Seeking,
    Streaming,
    WaitingForBufferSpace,
    WaitingForDrain,
    Terminated,
}

enum Exit {
    Retire,
    Restart,
}

/// Per-bank playback worker: reads the source, shapes each frame and feeds
/// the bank's output ring until killed or the pass ends.
pub struct PlaybackStreamer {
    bank: Arc<Bank>,
    producer: RingProducer,
    source: SourceReader,
    rng: StdRng,
}

impl PlaybackStreamer {
    fn new(bank: Arc<Bank>, parts: StreamerParts, rng: StdRng) -> Option<Self> {
        let StreamerParts { producer, source } = parts;
        Some(Self {
            bank,
            producer,
            source: source?,
            rng,
        })
    }

    fn run(mut self) -> StreamerParts {
        let index = self.bank.index();
        let mut state = StreamerState::Seeking;
        loop {
            state = match state {
                StreamerState::Seeking => self.seek(),
                StreamerState::Streaming => self.stream_frame(),
                StreamerState::WaitingForBufferSpace => self.wait_for_space(),
                StreamerState::WaitingForDrain => self.wait_for_drain(),
                StreamerState::Terminated => match self.try_retire() {
                    Exit::Retire => break,
                    Exit::Restart => StreamerState::Streaming,
                },
            };
        }
        log::info!("[Streamer:{}] terminated", index);
        StreamerParts {
            producer: self.producer,
            source: Some(self.source),
        }
    }

    fn killed(&self) -> bool {
        self.bank.flags.kill.load(Ordering::SeqCst)
    }

    fn interrupted(&self) -> bool {
        self.bank.flags.user_interrupt.load(Ordering::SeqCst)
    }

    fn seek(&mut self) -> StreamerState {
        let flags = &self.bank.flags;
        // A pending flush must be acknowledged first or stale samples would precede the new pass.
        self.bank.drained.wait_until(|| {
            !flags.flush.load(Ordering::SeqCst) || flags.kill.load(Ordering::SeqCst)
        });
        if self.killed() {
            return StreamerState::Terminated;
        }

        let start = if self.bank.params.reverse.load(Ordering::Relaxed) {
            self.source.frames().saturating_sub(1)
        } else {
            0
        };
        self.source.seek(start);
        self.bank.position.store(start as i64, Ordering::Relaxed);
        log::debug!("[Streamer:{}] seek to frame {}", self.bank.index(), start);
        StreamerState::Streaming
    }

    /// Asks the mix callback to drop everything queued so the restart is clean.
    fn begin_restart(&self) {
        let flags = &self.bank.flags;
        flags.flush.store(true, Ordering::SeqCst);
        flags.playing.store(true, Ordering::SeqCst);
        flags.user_interrupt.store(false, Ordering::SeqCst);
        log::debug!("[Streamer:{}] retrigger", self.bank.index());
    }

    #[cfg_attr(feature = "hotpath", hotpath::measure)]
    fn stream_frame(&mut self) -> StreamerState {
        if self.killed() {
            return StreamerState::Terminated;
        }
        if self.interrupted() {
            self.begin_restart();
            return StreamerState::Seeking;
        }
        if self.producer.is_full() {
            return StreamerState::WaitingForBufferSpace;
        }

        let frames = self.source.frames();
        let read_pos = self.bank.position.load(Ordering::Relaxed);
        let sample = match self.source.read_frame() {
            Ok(Some(sample)) => sample,
            Ok(None) => return self.end_of_pass(),
            Err(e) => {
                // A read error ends playback even when looping.
                log::error!("[Streamer:{}] read failed at frame {}: {}", self.bank.index(), read_pos, e);
                self.bank.flags.playing.store(false, Ordering::SeqCst);
                return StreamerState::Terminated;
            }
        };

        let params = &self.bank.params;
        let speed = params.speed.load();
        let reverse = params.reverse.load(Ordering::Relaxed);
        let gain = envelope_gain(read_pos, frames, params.ramp_up.load(), params.ramp_down.load(), reverse);
        let step = frame_step(speed, &mut self.rng);
        let head = advance(read_pos, step, reverse, frames);
        let repeats = repeat_count(speed, &mut self.rng);

        let out = sample * gain;
        let flags = &self.bank.flags;
        for _ in 0..repeats {
            let cancelled =
                || flags.kill.load(Ordering::SeqCst) || flags.user_interrupt.load(Ordering::SeqCst);
            if self.producer.enqueue_unless(out, cancelled).is_err() {
                break;
            }
        }
        flags.can_process.store(true, Ordering::SeqCst);

        self.bank.position.store(head.position, Ordering::Relaxed);
        if head.wrapped {
            return self.end_of_pass();
        }
        self.source.seek(head.position as u64);
        StreamerState::Streaming
    }

    fn end_of_pass(&mut self) -> StreamerState {
        if self.killed() {
            return StreamerState::Terminated;
        }
        if self.interrupted() {
            return StreamerState::Streaming;
        }
        if self.bank.is_looping() {
            return StreamerState::Seeking;
        }
        self.bank.flags.playing.store(false, Ordering::SeqCst);
        log::debug!("[Streamer:{}] end of file, waiting for drain", self.bank.index());
        StreamerState::WaitingForDrain
    }

    fn wait_for_space(&mut self) -> StreamerState {
        let flags = &self.bank.flags;
        self.producer.wait_vacant(|| {
            flags.kill.load(Ordering::SeqCst) || flags.user_interrupt.load(Ordering::SeqCst)
        });
        StreamerState::Streaming
    }

    fn wait_for_drain(&mut self) -> StreamerState {
        let flags = &self.bank.flags;
        self.bank.drained.wait_until(|| {
            !flags.can_process.load(Ordering::SeqCst)
                || flags.kill.load(Ordering::SeqCst)
                || flags.user_interrupt.load(Ordering::SeqCst)
        });
        StreamerState::Terminated
    }

    /// Decides under the slot lock whether this thread exits, so a concurrent
    /// retrigger either lands before (restart) or after (fresh spawn) the exit.
    fn try_retire(&mut self) -> Exit {
        let _slot = self.bank.worker.lock();
        let flags = &self.bank.flags;
        if flags.kill.load(Ordering::SeqCst) {
            flags.flush.store(true, Ordering::SeqCst);
            flags.playing.store(false, Ordering::SeqCst);
            flags.worker_alive.store(false, Ordering::SeqCst);
            Exit::Retire
        } else if flags.user_interrupt.load(Ordering::SeqCst) {
            Exit::Restart
        } else {
            flags.worker_alive.store(false, Ordering::SeqCst);
            Exit::Retire
        }
    }
}
