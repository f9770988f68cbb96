//! The realtime half of the engine.
//!
//! Nothing in here may block, allocate or log. Rings are touched only through
//! `try_enqueue`, `try_dequeue` and `clear`, and wake-ups go out via
//! `Signal::notify_rt`.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::engine::Shared;
use crate::ring::{RingConsumer, RingProducer, ring_buffer};
use crate::routing::MonitorRouting;

/// Per input channel. Only needs to bridge the gap between the input and
/// output callbacks of a split driver.
const MONITOR_RING_FRAMES: usize = 8192;

/// Called once per hardware period with interleaved input and output buffers.
pub struct MixCallback {
    tap: CaptureTap,
    mixer: Mixer,
}

impl MixCallback {
    pub(crate) fn new(
        shared: Arc<Shared>,
        inputs: Vec<RingProducer>,
        outputs: Vec<RingConsumer>,
        channels: usize,
    ) -> Self {
        let (monitor_in, monitor_out) = (0..channels)
            .map(|_| ring_buffer(MONITOR_RING_FRAMES))
            .unzip();
        Self {
            tap: CaptureTap {
                shared: Arc::clone(&shared),
                inputs,
                monitor: monitor_in,
                channels,
            },
            mixer: Mixer {
                shared,
                outputs,
                monitor: monitor_out,
                channels,
            },
        }
    }

    /// `input` may be empty when there is no capture device.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        self.tap.process(input);
        self.mixer.process(output);
    }

    /// For drivers that deliver input and output in separate callbacks.
    pub fn split(self) -> (CaptureTap, Mixer) {
        (self.tap, self.mixer)
    }

    pub fn channels(&self) -> usize {
        self.mixer.channels
    }
}

/// Pushes hardware input into the per-channel capture rings, and into the
/// monitor rings while any monitor route is on.
pub struct CaptureTap {
    shared: Arc<Shared>,
    inputs: Vec<RingProducer>,
    monitor: Vec<RingProducer>,
    channels: usize,
}

impl CaptureTap {
    pub fn process(&mut self, input: &[f32]) {
        let capture = self.shared.tap_active.load(Ordering::Acquire);
        let monitor = self.shared.monitor.active();
        if input.is_empty() || !(capture || monitor) {
            return;
        }
        for frame in input.chunks_exact(self.channels) {
            if capture && !push_frame(&mut self.inputs, frame) {
                self.shared.capture_overruns.fetch_add(1, Ordering::Relaxed);
            }
            if monitor {
                // A full monitor ring just loses the frame.
                push_frame(&mut self.monitor, frame);
            }
        }
    }
}

/// All or nothing, so the channel rings never drift apart.
fn push_frame(rings: &mut [RingProducer], frame: &[f32]) -> bool {
    if !rings.iter().all(|ring| ring.vacant() > 0) {
        return false;
    }
    for (ring, sample) in rings.iter_mut().zip(frame) {
        let _ = ring.try_enqueue(*sample);
    }
    true
}

/// Drains every bank's output ring into the routed output channels, then adds
/// monitored input.
pub struct Mixer {
    shared: Arc<Shared>,
    outputs: Vec<RingConsumer>,
    monitor: Vec<RingConsumer>,
    channels: usize,
}

impl Mixer {
    pub fn process(&mut self, output: &mut [f32]) {
        output.fill(0.0);
        let shared = &*self.shared;
        let monitor = shared.monitor.active();
        if !monitor {
            for ring in self.monitor.iter_mut().filter(|ring| !ring.is_empty()) {
                ring.clear();
            }
        }
        for frame in output.chunks_exact_mut(self.channels) {
            if monitor {
                add_monitor(&mut self.monitor, &shared.monitor, frame);
            }
            for (index, ring) in self.outputs.iter_mut().enumerate() {
                let bank = &shared.banks[index];
                let flags = &bank.flags;

                if flags.flush.load(Ordering::SeqCst) {
                    ring.clear();
                    flags.can_process.store(false, Ordering::SeqCst);
                    flags.flush.store(false, Ordering::SeqCst);
                    bank.drained.notify_rt();
                    continue;
                }
                if !flags.can_process.load(Ordering::SeqCst) {
                    continue;
                }
                if ring.is_empty() {
                    flags.can_process.store(false, Ordering::SeqCst);
                    // The streamer may have pushed between the check and the store.
                    if ring.is_empty() {
                        bank.drained.notify_rt();
                        continue;
                    }
                    flags.can_process.store(true, Ordering::SeqCst);
                }
                if flags.user_interrupt.load(Ordering::SeqCst) || flags.kill.load(Ordering::SeqCst) {
                    continue;
                }

                let Some(sample) = ring.try_dequeue() else {
                    continue;
                };
                for (channel, out) in frame.iter_mut().enumerate() {
                    if shared.routing.playback_enabled(index, channel) {
                        *out += sample;
                    }
                }
            }
        }
    }
}

fn add_monitor(rings: &mut [RingConsumer], routes: &MonitorRouting, frame: &mut [f32]) {
    if rings.iter().any(|ring| ring.is_empty()) {
        return;
    }
    for (input, ring) in rings.iter_mut().enumerate() {
        let Some(sample) = ring.try_dequeue() else {
            continue;
        };
        for (output, out) in frame.iter_mut().enumerate() {
            if routes.enabled(input, output) {
                *out += sample;
            }
        }
    }
}
