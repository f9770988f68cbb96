use parking_lot::Mutex;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bank::{Bank, BankStatus, Direction};
use crate::capture::{CaptureCommand, CaptureLength, CaptureTarget, CaptureWriter};
use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::mixer::MixCallback;
use crate::ring::{RingWaker, ring_buffer};
use crate::routing::{ChannelRouting, MonitorRouting};
use crate::streamer;
use crate::wav::WavFrameReader;

/// State read by the mix callback and both kinds of worker.
pub(crate) struct Shared {
    pub(crate) banks: Vec<Arc<Bank>>,
    pub(crate) routing: ChannelRouting,
    pub(crate) monitor: MonitorRouting,
    /// The capture writer wants input; the tap drops everything otherwise.
    pub(crate) tap_active: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    pub(crate) capture_overruns: AtomicU64,
    pub(crate) server_xruns: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineMetrics {
    /// Input frames the capture tap dropped because the writer fell behind.
    pub capture_overruns: u64,
    /// Stream errors reported by the audio server.
    pub server_xruns: u64,
    pub active_streamers: usize,
}

/// Handed to the audio driver so stream errors show up in [`EngineMetrics`].
#[derive(Clone)]
pub struct XrunReporter {
    shared: Arc<Shared>,
}

impl XrunReporter {
    pub fn report(&self) {
        self.shared.server_xruns.fetch_add(1, Ordering::Relaxed);
    }
}

/// How long `start_capture` waits for the writer to let go of a killed bank.
const CAPTURE_RELEASE_TIMEOUT: Duration = Duration::from_millis(500);

/// The sample engine: every control and status operation on banks.
///
/// All methods take `&self`, so an `Arc<Engine>` can be shared between control
/// threads. The matching [`MixCallback`] is returned from [`Engine::new`] and
/// belongs to the audio thread.
pub struct Engine {
    shared: Arc<Shared>,
    settings: EngineSettings,
    sample_rate: u32,
    /// Serialises worker spawn/join so two callers never race on a bank's thread.
    lifecycle: Mutex<()>,
    /// Serialises capture start/kill so a stale kill cannot leak into a new capture.
    capture_control: Mutex<()>,
    capture_tx: Mutex<Option<mpsc::Sender<CaptureCommand>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    input_wakers: Vec<RingWaker>,
}

impl Engine {
    pub fn new(settings: &EngineSettings, sample_rate: u32) -> EngineResult<(Engine, MixCallback)> {
        settings.validate()?;
        if sample_rate == 0 {
            return Err(EngineError::InvalidConfig("sample rate must be non-zero".to_string()));
        }
        let channels = settings.channels;

        let mut banks = Vec::with_capacity(settings.banks);
        let mut outputs = Vec::with_capacity(settings.banks);
        for index in 0..settings.banks {
            let (producer, consumer) = ring_buffer(settings.output_buffer_frames);
            banks.push(Arc::new(Bank::new(index, producer)));
            outputs.push(consumer);
        }

        let mut tap_rings = Vec::with_capacity(channels);
        let mut writer_rings = Vec::with_capacity(channels);
        for _ in 0..channels {
            let (producer, consumer) = ring_buffer(settings.input_buffer_frames);
            tap_rings.push(producer);
            writer_rings.push(consumer);
        }
        let input_wakers = writer_rings.iter().map(|ring| ring.waker()).collect();

        let shared = Arc::new(Shared {
            banks,
            routing: ChannelRouting::new(settings.banks, channels),
            monitor: MonitorRouting::new(channels),
            tap_active: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            capture_overruns: AtomicU64::new(0),
            server_xruns: AtomicU64::new(0),
        });

        let (capture_tx, capture_rx) = mpsc::channel();
        let writer = CaptureWriter::new(Arc::clone(&shared), writer_rings, capture_rx);
        let writer_handle = thread::Builder::new()
            .name("ficus-capture".to_string())
            .spawn(move || writer.run())
            .map_err(EngineError::Spawn)?;

        let callback = MixCallback::new(Arc::clone(&shared), tap_rings, outputs, channels);
        log::info!(
            "[Engine] {} banks, {} channels at {} Hz",
            settings.banks,
            channels,
            sample_rate
        );

        let engine = Engine {
            shared,
            settings: settings.clone(),
            sample_rate,
            lifecycle: Mutex::new(()),
            capture_control: Mutex::new(()),
            capture_tx: Mutex::new(Some(capture_tx)),
            writer: Mutex::new(Some(writer_handle)),
            input_wakers,
        };
        Ok((engine, callback))
    }

    fn bank(&self, index: usize) -> EngineResult<&Arc<Bank>> {
        self.shared
            .banks
            .get(index)
            .ok_or(EngineError::InvalidBank(index))
    }

    pub fn bank_count(&self) -> usize {
        self.shared.banks.len()
    }

    pub fn channel_count(&self) -> usize {
        self.shared.routing.channels()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn xrun_reporter(&self) -> XrunReporter {
        XrunReporter {
            shared: Arc::clone(&self.shared),
        }
    }

    // --- Playback ---

    /// Loads a WAV file into a bank, stopping whatever the bank was playing.
    pub fn load_file(&self, index: usize, path: &Path) -> EngineResult<u64> {
        let bank = self.bank(index)?;
        let file = File::open(path).map_err(|source| EngineError::SourceOpen {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = WavFrameReader::new(BufReader::new(file), path).map_err(|e| {
            EngineError::SourceFormat {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        let frames = reader.frames();

        let _lifecycle = self.lifecycle.lock();
        self.kill_worker(bank);
        streamer::reclaim(bank)?;
        {
            let mut slot = bank.worker.lock();
            let parts = slot
                .parts_mut()
                .ok_or(EngineError::WorkerPanicked(index))?;
            parts.source = Some(reader);
        }
        bank.source_frames.store(frames, Ordering::SeqCst);
        bank.reset_playback();
        log::info!("[Engine] bank {} loaded {:?} ({} frames)", index, path, frames);
        Ok(frames)
    }

    /// Starts playback, or retriggers it from the top if the bank is already playing.
    pub fn start_playback(&self, index: usize) -> EngineResult<()> {
        let bank = self.bank(index)?;
        let _lifecycle = self.lifecycle.lock();
        {
            let slot = bank.worker.lock();
            let flags = &bank.flags;
            if flags.worker_alive.load(Ordering::SeqCst) {
                flags.kill.store(false, Ordering::SeqCst);
                flags.playing.store(true, Ordering::SeqCst);
                flags.user_interrupt.store(true, Ordering::SeqCst);
                drop(slot);
                bank.wake_streamer();
                log::debug!("[Engine] bank {} retriggered", index);
                return Ok(());
            }
        }
        streamer::reclaim(bank)?;
        streamer::spawn(bank, self.settings.random_seed)
    }

    /// Stops a bank's playback. Returns whether it was playing.
    pub fn kill_playback(&self, index: usize) -> EngineResult<bool> {
        let bank = self.bank(index)?;
        Ok(self.kill_worker(bank))
    }

    fn kill_worker(&self, bank: &Bank) -> bool {
        let slot = bank.worker.lock();
        let flags = &bank.flags;
        if !flags.worker_alive.load(Ordering::SeqCst) {
            return false;
        }
        flags.user_interrupt.store(false, Ordering::SeqCst);
        flags.kill.store(true, Ordering::SeqCst);
        let was_playing = flags.playing.swap(false, Ordering::SeqCst);
        drop(slot);
        bank.wake_streamer();
        log::debug!("[Engine] bank {} killed", bank.index());
        was_playing
    }

    pub fn kill_all_playback(&self) -> usize {
        self.shared
            .banks
            .iter()
            .filter(|bank| self.kill_worker(bank))
            .count()
    }

    /// Negative speeds play in reverse.
    pub fn set_speed(&self, index: usize, signed_speed: f32) -> EngineResult<()> {
        let bank = self.bank(index)?;
        if !signed_speed.is_finite() {
            return Err(EngineError::InvalidParameter(format!("speed {signed_speed}")));
        }
        bank.set_speed(signed_speed);
        Ok(())
    }

    pub fn set_ramp_up(&self, index: usize, fraction: f32) -> EngineResult<()> {
        let bank = self.bank(index)?;
        if !fraction.is_finite() {
            return Err(EngineError::InvalidParameter(format!("ramp up {fraction}")));
        }
        bank.set_ramp_up(fraction);
        Ok(())
    }

    pub fn set_ramp_down(&self, index: usize, fraction: f32) -> EngineResult<()> {
        let bank = self.bank(index)?;
        if !fraction.is_finite() {
            return Err(EngineError::InvalidParameter(format!("ramp down {fraction}")));
        }
        bank.set_ramp_down(fraction);
        Ok(())
    }

    pub fn set_loop(&self, index: usize, looping: bool) -> EngineResult<()> {
        self.bank(index)?.set_looping(looping);
        Ok(())
    }

    // --- Capture ---

    pub fn capture_path(&self, index: usize) -> EngineResult<PathBuf> {
        self.bank(index)?;
        Ok(self
            .settings
            .capture_dir
            .join(format!("{}{}.wav", self.settings.capture_prefix, index)))
    }

    /// Arms a bank to record its capture mix into its capture file.
    pub fn start_capture(&self, index: usize, length: CaptureLength) -> EngineResult<()> {
        let bank = self.bank(index)?;
        let _control = self.capture_control.lock();
        if bank.is_capturing() && bank.capture.kill.load(Ordering::SeqCst) {
            self.await_capture_release(bank);
        }
        if bank.is_capturing() {
            return Err(EngineError::AlreadyCapturing(index));
        }
        let path = self.capture_path(index)?;
        let target = CaptureTarget::create(&path, self.settings.capture_format, self.sample_rate)?;

        let capture = &bank.capture;
        capture.kill.store(false, Ordering::SeqCst);
        capture
            .limit
            .store(length.to_frames(self.sample_rate), Ordering::SeqCst);
        capture.set_fault(None);
        capture.accumulated.store(0, Ordering::SeqCst);
        capture.capturing.store(true, Ordering::SeqCst);

        let sent = match self.capture_tx.lock().as_ref() {
            Some(tx) => tx.send(CaptureCommand::Start { bank: index, target }).is_ok(),
            None => false,
        };
        if !sent {
            capture.capturing.store(false, Ordering::SeqCst);
            return Err(EngineError::CaptureWriterStopped);
        }
        log::info!("[Engine] bank {} capture armed ({:?})", index, length);
        Ok(())
    }

    /// Stops a bank's capture. Returns whether it was capturing.
    ///
    /// The file is finalised by the writer thread shortly after; `is_capturing`
    /// stays true until then. `start_capture` on the same bank waits for it.
    pub fn kill_capture(&self, index: usize) -> EngineResult<bool> {
        let bank = self.bank(index)?;
        Ok(self.kill_capture_of(bank))
    }

    fn kill_capture_of(&self, bank: &Bank) -> bool {
        let _control = self.capture_control.lock();
        let was_capturing = bank.is_capturing();
        if was_capturing {
            bank.capture.kill.store(true, Ordering::SeqCst);
            self.wake_capture_writer();
        }
        was_capturing
    }

    /// Kills are finished by the writer thread; give it a moment to finalise.
    fn await_capture_release(&self, bank: &Bank) {
        let deadline = Instant::now() + CAPTURE_RELEASE_TIMEOUT;
        while bank.is_capturing() && Instant::now() < deadline {
            self.wake_capture_writer();
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn kill_all_capture(&self) -> usize {
        self.shared
            .banks
            .iter()
            .filter(|bank| self.kill_capture_of(bank))
            .count()
    }

    fn wake_capture_writer(&self) {
        for waker in &self.input_wakers {
            waker.wake_consumer();
        }
    }

    // --- Routing ---

    pub fn set_capture_route(&self, index: usize, channel: usize, enabled: bool) -> EngineResult<()> {
        self.shared.routing.set_capture_route(index, channel, enabled)
    }

    pub fn set_playback_route(&self, index: usize, channel: usize, enabled: bool) -> EngineResult<()> {
        self.shared.routing.set_playback_route(index, channel, enabled)
    }

    /// Passes hardware input channel `input` straight through to output channel `output`.
    pub fn set_monitor(&self, input: usize, output: usize, enabled: bool) -> EngineResult<()> {
        self.shared.monitor.set(input, output, enabled)?;
        log::debug!("[Engine] monitor {} -> {} {}", input, output, if enabled { "on" } else { "off" });
        Ok(())
    }

    // --- Status ---

    pub fn is_playing(&self, index: usize) -> EngineResult<bool> {
        Ok(self.bank(index)?.is_playing())
    }

    pub fn is_capturing(&self, index: usize) -> EngineResult<bool> {
        Ok(self.bank(index)?.is_capturing())
    }

    pub fn is_looping(&self, index: usize) -> EngineResult<bool> {
        Ok(self.bank(index)?.is_looping())
    }

    /// Length in frames of the loaded source (`Out`) or of the last capture (`In`).
    pub fn duration_frames(&self, index: usize, direction: Direction) -> EngineResult<u64> {
        let bank = self.bank(index)?;
        Ok(match direction {
            Direction::In => bank.capture.file_frames.load(Ordering::SeqCst),
            Direction::Out => bank.source_frames.load(Ordering::SeqCst),
        })
    }

    pub fn position(&self, index: usize) -> EngineResult<i64> {
        Ok(self.bank(index)?.position.load(Ordering::Relaxed))
    }

    pub fn status(&self, index: usize) -> EngineResult<BankStatus> {
        Ok(self.bank(index)?.status())
    }

    pub fn statuses(&self) -> Vec<BankStatus> {
        self.shared.banks.iter().map(|bank| bank.status()).collect()
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            capture_overruns: self.shared.capture_overruns.load(Ordering::Relaxed),
            server_xruns: self.shared.server_xruns.load(Ordering::Relaxed),
            active_streamers: self
                .shared
                .banks
                .iter()
                .filter(|bank| bank.flags.worker_alive.load(Ordering::SeqCst))
                .count(),
        }
    }

    // --- Teardown ---

    /// Kills every worker, finalises open capture files and joins all threads.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[Engine] shutting down");

        {
            let _lifecycle = self.lifecycle.lock();
            for bank in &self.shared.banks {
                self.kill_worker(bank);
                if let Err(e) = streamer::reclaim(bank) {
                    log::warn!("[Engine] {}", e);
                }
            }
        }

        if let Some(tx) = self.capture_tx.lock().take() {
            let _ = tx.send(CaptureCommand::Shutdown);
        }
        self.wake_capture_writer();
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                log::error!("[Engine] capture writer panicked");
            }
        }
        log::info!("[Engine] stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
