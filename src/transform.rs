//! Per-frame playback math: how far the playhead moves, how often a frame is
//! repeated and how loud it is. Everything here is pure so the streamer's
//! behaviour can be pinned down with a seeded RNG.

use rand::Rng;

/// Number of output copies per source frame at speed 0.
const MAX_SLOW_REPEATS: f32 = 4.0;

/// Where the playhead lands after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Playhead {
    pub position: i64,
    /// The step ran off the end (forward) or underflowed the start (reverse).
    pub wrapped: bool,
}

/// Source frames to skip per read. Above 1x the fractional part is resolved by
/// a coin weighted by that fraction, so the average step equals `speed`.
pub fn frame_step<R: Rng + ?Sized>(speed: f32, rng: &mut R) -> i64 {
    if speed.is_nan() || speed <= 1.0 {
        return 1;
    }
    let whole = speed.floor();
    let frac = speed - whole;
    let mut step = whole as i64;
    if frac > 0.0 && (rng.random_range(0..100) as f32) < frac * 100.0 {
        step += 1;
    }
    step
}

/// Moves `position` by `step` frames in the playback direction.
///
/// Forward steps that run past the end are reported as wrapped with the
/// position reduced modulo `frames`. A reverse step below frame 0 wraps to the
/// last frame.
pub fn advance(position: i64, step: i64, reverse: bool, frames: u64) -> Playhead {
    let frames = frames.max(1) as i64;
    if reverse {
        let next = position - step;
        if next < 0 {
            Playhead {
                position: frames - 1,
                wrapped: true,
            }
        } else {
            Playhead {
                position: next,
                wrapped: false,
            }
        }
    } else {
        let next = position + step;
        Playhead {
            position: next.rem_euclid(frames),
            wrapped: next >= frames,
        }
    }
}

/// How many times a source frame is written to the output ring. Below 1x a
/// frame is duplicated up to `MAX_SLOW_REPEATS` times; a fractional remainder
/// adds one more copy at random.
pub fn repeat_count<R: Rng + ?Sized>(speed: f32, rng: &mut R) -> usize {
    if speed.is_nan() || speed >= 1.0 {
        return 1;
    }
    let slow = (1.0 - speed.max(0.0)) * MAX_SLOW_REPEATS;
    let mut count = (slow.round() as usize).max(1);
    if slow.fract() > 0.0 && (rng.random_range(0..100) as f32) < (1.0 - speed) * 100.0 {
        count += 1;
    }
    count
}

/// Linear fade gain for the frame at `position`.
///
/// The ramp-up region covers the first `ramp_up` fraction of the file in the
/// playback direction and the ramp-down region the last `ramp_down` fraction.
/// Where both overlap the quieter one wins.
pub fn envelope_gain(position: i64, frames: u64, ramp_up: f32, ramp_down: f32, reverse: bool) -> f32 {
    if frames == 0 {
        return 1.0;
    }
    let total = frames as f32;
    let pos = position as f32;
    // Distance travelled from the start of the pass and distance left to its end.
    let (from_start, to_end) = if reverse {
        (total - pos, pos)
    } else {
        (pos, total - pos)
    };

    let mut gain = 1.0f32;
    let up_len = total * ramp_up.clamp(0.0, 1.0);
    if up_len > 0.0 && from_start < up_len {
        gain = gain.min(from_start / up_len);
    }
    let down_len = total * ramp_down.clamp(0.0, 1.0);
    if down_len > 0.0 && to_end < down_len {
        gain = gain.min(to_end / down_len);
    }
    gain.clamp(0.0, 1.0)
}
