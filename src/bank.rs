use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::ring::{RingProducer, RingWaker};
use crate::signal::Signal;
use crate::streamer::{StreamerParts, WorkerSlot};

/// An `f32` readable and writable in one word from any thread.
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Why a bank's capture stopped early or lost audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureFault {
    /// Writing the capture file failed; capture of the bank was stopped.
    Io = 1,
    /// The capture writer fell behind the hardware and input frames were dropped.
    Overrun = 2,
}

impl CaptureFault {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Io),
            2 => Some(Self::Overrun),
            _ => None,
        }
    }
}

/// Which side of a bank a duration query refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The last capture file written for the bank.
    In,
    /// The loaded playback source.
    Out,
}

/// Playback parameters, written by control threads and read per frame by the streamer.
pub struct PlaybackParams {
    /// Speed magnitude; the sign lives in `reverse`.
    pub speed: AtomicF32,
    pub reverse: AtomicBool,
    pub ramp_up: AtomicF32,
    pub ramp_down: AtomicF32,
    pub looping: AtomicBool,
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self {
            speed: AtomicF32::new(1.0),
            reverse: AtomicBool::new(false),
            ramp_up: AtomicF32::new(0.0),
            ramp_down: AtomicF32::new(0.0),
            looping: AtomicBool::new(false),
        }
    }
}

/// Control flags shared between control threads, the bank's streamer and the mix callback.
#[derive(Default)]
pub struct BankFlags {
    /// The output ring holds samples the mix callback should consume.
    pub can_process: AtomicBool,
    /// Retrigger requested while a streamer is alive.
    pub user_interrupt: AtomicBool,
    /// Streamer must terminate.
    pub kill: AtomicBool,
    /// Streamer asks the mix callback to discard everything buffered.
    pub flush: AtomicBool,
    pub playing: AtomicBool,
    /// A streamer thread owns this bank. Only changed while holding the worker slot.
    pub worker_alive: AtomicBool,
}

#[derive(Default)]
pub struct CaptureState {
    pub capturing: AtomicBool,
    pub kill: AtomicBool,
    /// Frames to capture before stopping; `UNBOUNDED_FRAMES` means until killed.
    pub limit: AtomicU64,
    /// Frames written since this capture started. Reset to 0 when capture stops.
    pub accumulated: AtomicU64,
    /// Length of the capture file last written for this bank.
    pub file_frames: AtomicU64,
    fault: AtomicU8,
}

impl CaptureState {
    pub fn fault(&self) -> Option<CaptureFault> {
        CaptureFault::from_u8(self.fault.load(Ordering::Relaxed))
    }

    pub fn set_fault(&self, fault: Option<CaptureFault>) {
        self.fault
            .store(fault.map_or(0, |f| f as u8), Ordering::Relaxed);
    }
}

/// Point-in-time view of a bank, for status queries and observers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BankStatus {
    pub index: usize,
    pub playing: bool,
    pub looping: bool,
    pub capturing: bool,
    pub position: i64,
    pub source_frames: u64,
    pub speed: f32,
    pub reverse: bool,
    pub ramp_up: f32,
    pub ramp_down: f32,
    /// Frames written by the capture in progress; 0 when not capturing.
    pub capture_progress: u64,
    /// Length of the last capture file.
    pub captured_frames: u64,
    pub capture_fault: Option<CaptureFault>,
}

/// One sample bank: a playback source, a capture target and the flags tying
/// its streamer, the capture writer and the mix callback together.
pub struct Bank {
    index: usize,
    pub params: PlaybackParams,
    pub flags: BankFlags,
    /// Frame the streamer will read next.
    pub position: AtomicI64,
    /// Frame count of the loaded source, 0 when the bank is empty.
    pub source_frames: AtomicU64,
    pub capture: CaptureState,
    /// Raised by the mix callback when the output ring drains or a flush completes.
    pub drained: Signal,
    /// Wakes the streamer when it is parked on a full output ring.
    pub space: RingWaker,
    pub(crate) worker: Mutex<WorkerSlot>,
}

impl Bank {
    pub(crate) fn new(index: usize, producer: RingProducer) -> Self {
        let space = producer.waker();
        Self {
            index,
            params: PlaybackParams::default(),
            flags: BankFlags::default(),
            position: AtomicI64::new(0),
            source_frames: AtomicU64::new(0),
            capture: CaptureState::default(),
            drained: Signal::new(),
            space,
            worker: Mutex::new(WorkerSlot::idle(StreamerParts {
                producer,
                source: None,
            })),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Signed speed: negative means reverse.
    pub fn set_speed(&self, signed_speed: f32) {
        self.params.reverse.store(signed_speed < 0.0, Ordering::Relaxed);
        self.params.speed.store(signed_speed.abs());
    }

    pub fn set_ramp_up(&self, fraction: f32) {
        self.params.ramp_up.store(fraction.clamp(0.0, 1.0));
    }

    pub fn set_ramp_down(&self, fraction: f32) {
        self.params.ramp_down.store(fraction.clamp(0.0, 1.0));
    }

    pub fn set_looping(&self, looping: bool) {
        self.params.looping.store(looping, Ordering::Relaxed);
    }

    pub fn is_playing(&self) -> bool {
        self.flags.playing.load(Ordering::SeqCst)
    }

    pub fn is_looping(&self) -> bool {
        self.params.looping.load(Ordering::Relaxed)
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.capturing.load(Ordering::SeqCst)
    }

    /// Puts speed, direction and envelope back to their load-time defaults.
    pub fn reset_playback(&self) {
        self.set_speed(1.0);
        self.set_ramp_up(0.0);
        self.set_ramp_down(0.0);
        self.position.store(0, Ordering::Relaxed);
    }

    /// Wakes the streamer wherever it is parked so it re-reads its flags.
    pub fn wake_streamer(&self) {
        self.space.wake_producer();
        self.drained.notify();
    }

    pub fn status(&self) -> BankStatus {
        BankStatus {
            index: self.index,
            playing: self.is_playing(),
            looping: self.is_looping(),
            capturing: self.is_capturing(),
            position: self.position.load(Ordering::Relaxed),
            source_frames: self.source_frames.load(Ordering::Relaxed),
            speed: self.params.speed.load(),
            reverse: self.params.reverse.load(Ordering::Relaxed),
            ramp_up: self.params.ramp_up.load(),
            ramp_down: self.params.ramp_down.load(),
            capture_progress: self.capture.accumulated.load(Ordering::Relaxed),
            captured_frames: self.capture.file_frames.load(Ordering::Relaxed),
            capture_fault: self.capture.fault(),
        }
    }
}
