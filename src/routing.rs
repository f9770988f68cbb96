use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{EngineError, EngineResult};

/// Bank × channel switch matrices for the capture mix (which input channels a
/// bank records) and the playback mix (which output channels a bank feeds).
///
/// Written by control threads, read every frame by the mix callback and the
/// capture writer. Every cell is a single atomic, so no locks on the read side.
pub struct ChannelRouting {
    banks: usize,
    channels: usize,
    capture: Vec<AtomicBool>,
    playback: Vec<AtomicBool>,
}

impl ChannelRouting {
    pub fn new(banks: usize, channels: usize) -> Self {
        let cells = || (0..banks * channels).map(|_| AtomicBool::new(false)).collect();
        Self {
            banks,
            channels,
            capture: cells(),
            playback: cells(),
        }
    }

    pub fn banks(&self) -> usize {
        self.banks
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    fn cell(&self, bank: usize, channel: usize) -> EngineResult<usize> {
        if bank >= self.banks {
            return Err(EngineError::InvalidBank(bank));
        }
        if channel >= self.channels {
            return Err(EngineError::InvalidChannel(channel));
        }
        Ok(bank * self.channels + channel)
    }

    pub fn set_capture_route(&self, bank: usize, channel: usize, enabled: bool) -> EngineResult<()> {
        let cell = self.cell(bank, channel)?;
        self.capture[cell].store(enabled, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_playback_route(&self, bank: usize, channel: usize, enabled: bool) -> EngineResult<()> {
        let cell = self.cell(bank, channel)?;
        self.playback[cell].store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Hot-path read; callers pass indices they already bounded.
    #[inline]
    pub fn capture_enabled(&self, bank: usize, channel: usize) -> bool {
        self.capture[bank * self.channels + channel].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn playback_enabled(&self, bank: usize, channel: usize) -> bool {
        self.playback[bank * self.channels + channel].load(Ordering::Relaxed)
    }

    /// Sums the input channels routed into `bank`'s capture mix.
    pub fn capture_mix(&self, bank: usize, frame: &[f32]) -> f32 {
        frame
            .iter()
            .take(self.channels)
            .enumerate()
            .filter(|(channel, _)| self.capture_enabled(bank, *channel))
            .map(|(_, sample)| *sample)
            .sum()
    }
}

/// Input channel × output channel switches for passing hardware input straight
/// to the outputs.
pub struct MonitorRouting {
    channels: usize,
    cells: Vec<AtomicBool>,
    /// Count of enabled cells, so the callback can skip monitoring entirely.
    enabled: AtomicUsize,
}

impl MonitorRouting {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            cells: (0..channels * channels).map(|_| AtomicBool::new(false)).collect(),
            enabled: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, input: usize, output: usize, enabled: bool) -> EngineResult<()> {
        for channel in [input, output] {
            if channel >= self.channels {
                return Err(EngineError::InvalidChannel(channel));
            }
        }
        let was = self.cells[input * self.channels + output].swap(enabled, Ordering::Relaxed);
        match (was, enabled) {
            (false, true) => {
                self.enabled.fetch_add(1, Ordering::Release);
            }
            (true, false) => {
                self.enabled.fetch_sub(1, Ordering::Release);
            }
            _ => {}
        }
        Ok(())
    }

    #[inline]
    pub fn enabled(&self, input: usize, output: usize) -> bool {
        self.cells[input * self.channels + output].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.enabled.load(Ordering::Acquire) > 0
    }
}
