use approx::assert_relative_eq;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use ficus::{
    CaptureFault, CaptureFormat, CaptureLength, Direction, Engine, EngineError, EngineSettings,
    MixCallback,
};

const CHANNELS: usize = 2;
const RING: usize = 16;

fn settings(dir: &Path) -> EngineSettings {
    EngineSettings {
        banks: 4,
        channels: CHANNELS,
        output_buffer_frames: RING,
        input_buffer_frames: 256,
        capture_dir: dir.to_path_buf(),
        capture_format: CaptureFormat::Float32,
        random_seed: Some(7),
        ..EngineSettings::default()
    }
}

fn write_wav(dir: &Path, name: &str, samples: &[f32]) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 48000,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for s in samples {
        writer.write_sample(*s).unwrap();
    }
    writer.finalize().unwrap();
    path
}

/// Frame `i` holds `(i + 1) / len`, so no frame is silent and each is identifiable.
fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| (i + 1) as f32 / len as f32).collect()
}

fn wait_until(what: &str, mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Runs the callback for `frames` frames with silent input; returns channel 0 and 1.
fn pump(callback: &mut MixCallback, frames: usize) -> (Vec<f32>, Vec<f32>) {
    let input = vec![0.0; frames * CHANNELS];
    let mut output = vec![0.0; frames * CHANNELS];
    callback.process(&input, &mut output);
    let left = output.iter().step_by(CHANNELS).copied().collect();
    let right = output.iter().skip(1).step_by(CHANNELS).copied().collect();
    (left, right)
}

/// Pumps one frame at a time until a non-silent sample comes out of channel 0.
fn next_audible(callback: &mut MixCallback) -> f32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (left, _) = pump(callback, 1);
        if left[0] != 0.0 {
            return left[0];
        }
        assert!(Instant::now() < deadline, "no audio came out");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_two_routed_banks_sum_and_unrouted_channel_stays_silent() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    engine.load_file(0, &write_wav(dir.path(), "a.wav", &[0.3; 64])).unwrap();
    engine.load_file(1, &write_wav(dir.path(), "b.wav", &[0.4; 64])).unwrap();
    engine.set_playback_route(0, 0, true).unwrap();
    engine.set_playback_route(1, 0, true).unwrap();

    engine.start_playback(0).unwrap();
    engine.start_playback(1).unwrap();
    wait_until("both rings to fill", || {
        engine.position(0).unwrap() == RING as i64 && engine.position(1).unwrap() == RING as i64
    });

    let (left, right) = pump(&mut callback, 4);
    for (l, r) in left.iter().zip(&right) {
        assert_relative_eq!(*l, 0.7, epsilon = 1e-6);
        assert_eq!(*r, 0.0);
    }
}

#[test]
fn test_speed_two_advances_two_frames_per_read() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    let samples = ramp(64);
    engine.load_file(0, &write_wav(dir.path(), "r.wav", &samples)).unwrap();
    engine.set_playback_route(0, 0, true).unwrap();
    engine.set_speed(0, 2.0).unwrap();

    engine.start_playback(0).unwrap();
    // RING reads fill the ring; each read moves two frames.
    wait_until("ring to fill", || engine.position(0).unwrap() == 2 * RING as i64);

    let (left, _) = pump(&mut callback, RING);
    for (k, sample) in left.iter().enumerate() {
        assert_relative_eq!(*sample, samples[2 * k]);
    }
}

#[test]
fn test_reverse_starts_at_last_frame_and_walks_back() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    let samples = ramp(64);
    engine.load_file(0, &write_wav(dir.path(), "r.wav", &samples)).unwrap();
    engine.set_playback_route(0, 0, true).unwrap();
    engine.set_speed(0, -1.0).unwrap();

    engine.start_playback(0).unwrap();
    wait_until("ring to fill", || engine.position(0).unwrap() == 63 - RING as i64);

    let (left, _) = pump(&mut callback, RING);
    for (k, sample) in left.iter().enumerate() {
        assert_relative_eq!(*sample, samples[63 - k]);
    }
}

#[test]
fn test_reverse_underflow_wraps_to_last_frame_and_ends_pass() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    let samples = ramp(8);
    engine.load_file(0, &write_wav(dir.path(), "r.wav", &samples)).unwrap();
    engine.set_playback_route(0, 0, true).unwrap();
    engine.set_speed(0, -1.0).unwrap();

    engine.start_playback(0).unwrap();
    wait_until("pass to end", || !engine.is_playing(0).unwrap());
    assert_eq!(engine.position(0).unwrap(), 7);

    let (left, _) = pump(&mut callback, 8);
    for (k, sample) in left.iter().enumerate() {
        assert_relative_eq!(*sample, samples[7 - k]);
    }
    // Once drained the worker retires on its own.
    wait_until("streamer to retire", || {
        pump(&mut callback, 1);
        engine.metrics().active_streamers == 0
    });
}

#[test]
fn test_ramp_up_envelope_on_output() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(
        &EngineSettings {
            output_buffer_frames: 2048,
            ..settings(dir.path())
        },
        48000,
    )
    .unwrap();
    engine.load_file(0, &write_wav(dir.path(), "one.wav", &[1.0; 1000])).unwrap();
    engine.set_playback_route(0, 0, true).unwrap();
    engine.set_ramp_up(0, 0.1).unwrap();

    engine.start_playback(0).unwrap();
    wait_until("whole file to be queued", || !engine.is_playing(0).unwrap());

    let (left, _) = pump(&mut callback, 1000);
    assert_relative_eq!(left[0], 0.0);
    assert_relative_eq!(left[50], 0.5, epsilon = 1e-6);
    assert_relative_eq!(left[100], 1.0);
    assert_relative_eq!(left[999], 1.0);
}

#[test]
fn test_looping_bank_restarts_from_the_top() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    let samples = ramp(8);
    engine.load_file(0, &write_wav(dir.path(), "l.wav", &samples)).unwrap();
    engine.set_playback_route(0, 0, true).unwrap();
    engine.set_loop(0, true).unwrap();

    engine.start_playback(0).unwrap();
    let mut heard = Vec::new();
    while heard.len() < 24 {
        heard.push(next_audible(&mut callback));
    }
    for (k, sample) in heard.iter().enumerate() {
        assert_relative_eq!(*sample, samples[k % 8]);
    }
    assert!(engine.is_playing(0).unwrap());
    assert!(engine.kill_playback(0).unwrap());
}

#[test]
fn test_retrigger_restarts_without_second_worker() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    let samples = ramp(64);
    engine.load_file(0, &write_wav(dir.path(), "t.wav", &samples)).unwrap();
    engine.set_playback_route(0, 0, true).unwrap();

    engine.start_playback(0).unwrap();
    wait_until("ring to fill", || engine.position(0).unwrap() == RING as i64);
    let (left, _) = pump(&mut callback, 4);
    assert_relative_eq!(left[3], samples[3]);

    engine.start_playback(0).unwrap();
    assert_eq!(engine.metrics().active_streamers, 1);
    // Stale samples are flushed; the first thing heard is the top of the file.
    assert_relative_eq!(next_audible(&mut callback), samples[0]);
    assert_relative_eq!(next_audible(&mut callback), samples[1]);
    assert!(engine.is_playing(0).unwrap());
    assert_eq!(engine.metrics().active_streamers, 1);
}

#[test]
fn test_kill_while_parked_on_buffer_space_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    let samples = ramp(64);
    engine.load_file(0, &write_wav(dir.path(), "k.wav", &samples)).unwrap();
    engine.set_playback_route(0, 0, true).unwrap();

    engine.start_playback(0).unwrap();
    wait_until("ring to fill", || engine.position(0).unwrap() == RING as i64);

    assert!(engine.kill_playback(0).unwrap());
    assert!(!engine.is_playing(0).unwrap());
    wait_until("streamer to exit", || engine.metrics().active_streamers == 0);

    // Killed output is discarded, and a fresh start plays from the top.
    engine.start_playback(0).unwrap();
    assert_relative_eq!(next_audible(&mut callback), samples[0]);
}

#[test]
fn test_kill_while_parked_on_drain_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    engine.load_file(0, &write_wav(dir.path(), "d.wav", &ramp(8))).unwrap();

    engine.start_playback(0).unwrap();
    // Nothing consumes the ring, so the worker ends up waiting for the drain.
    wait_until("pass to end", || !engine.is_playing(0).unwrap());
    assert_eq!(engine.metrics().active_streamers, 1);

    assert!(!engine.kill_playback(0).unwrap());
    wait_until("streamer to exit", || engine.metrics().active_streamers == 0);
}

#[test]
fn test_load_replaces_playing_source() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    engine.load_file(0, &write_wav(dir.path(), "a.wav", &ramp(64))).unwrap();
    engine.set_speed(0, -3.0).unwrap();
    engine.start_playback(0).unwrap();

    let frames = engine.load_file(0, &write_wav(dir.path(), "b.wav", &ramp(10))).unwrap();
    assert_eq!(frames, 10);
    assert_eq!(engine.duration_frames(0, Direction::Out).unwrap(), 10);
    assert!(!engine.is_playing(0).unwrap());
    assert_eq!(engine.metrics().active_streamers, 0);
    let status = engine.status(0).unwrap();
    assert_eq!(status.speed, 1.0);
    assert!(!status.reverse);
}

#[test]
fn test_non_wav_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, b"definitely not audio").unwrap();
    assert!(matches!(
        engine.load_file(0, &path),
        Err(EngineError::SourceFormat { .. })
    ));
}

/// Feeds `frames` input frames with every channel at `level`.
fn feed(callback: &mut MixCallback, frames: usize, level: f32) {
    let input = vec![level; frames * CHANNELS];
    let mut output = vec![0.0; frames * CHANNELS];
    callback.process(&input, &mut output);
}

#[test]
fn test_capture_stops_itself_at_frame_limit() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    engine.set_capture_route(0, 0, true).unwrap();
    engine.set_capture_route(0, 1, true).unwrap();

    engine.start_capture(0, CaptureLength::Frames(100)).unwrap();
    assert!(engine.is_capturing(0).unwrap());
    assert!(matches!(
        engine.start_capture(0, CaptureLength::Frames(100)),
        Err(EngineError::AlreadyCapturing(0))
    ));

    wait_until("capture to finish", || {
        feed(&mut callback, 10, 0.25);
        !engine.is_capturing(0).unwrap()
    });

    let status = engine.status(0).unwrap();
    assert_eq!(status.capture_progress, 0);
    assert_eq!(status.captured_frames, 100);
    assert_eq!(status.capture_fault, None);
    assert_eq!(engine.duration_frames(0, Direction::In).unwrap(), 100);

    let mut reader = hound::WavReader::open(engine.capture_path(0).unwrap()).unwrap();
    let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 100);
    for s in samples {
        // Both routed channels at 0.25 sum to 0.5.
        assert_relative_eq!(s, 0.5);
    }
}

#[test]
fn test_kill_capture_stops_before_limit() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    engine.set_capture_route(1, 1, true).unwrap();

    engine.start_capture(1, CaptureLength::Unbounded).unwrap();
    wait_until("some frames to land", || {
        feed(&mut callback, 10, 0.1);
        engine.status(1).unwrap().capture_progress > 0
    });

    assert!(engine.kill_capture(1).unwrap());
    wait_until("capture to stop", || !engine.is_capturing(1).unwrap());
    let status = engine.status(1).unwrap();
    assert_eq!(status.capture_progress, 0);
    assert!(status.captured_frames > 0);

    let reader = hound::WavReader::open(engine.capture_path(1).unwrap()).unwrap();
    assert_eq!(reader.len() as u64, status.captured_frames);
    assert!(!engine.kill_capture(1).unwrap());
}

#[test]
fn test_kill_capture_without_any_input_still_stops() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _callback) = Engine::new(&settings(dir.path()), 48000).unwrap();

    engine.start_capture(2, CaptureLength::Seconds(0)).unwrap();
    // Give the writer time to arm and park on empty input.
    thread::sleep(Duration::from_millis(20));
    assert!(engine.kill_capture(2).unwrap());
    wait_until("capture to stop", || !engine.is_capturing(2).unwrap());
    assert_eq!(engine.duration_frames(2, Direction::In).unwrap(), 0);

    // The bank can be armed again straight away.
    engine.start_capture(2, CaptureLength::Frames(5)).unwrap();
    assert_eq!(engine.kill_all_capture(), 1);
}

#[test]
fn test_shutdown_finalises_open_captures() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    engine.set_capture_route(0, 0, true).unwrap();
    engine.start_capture(0, CaptureLength::Unbounded).unwrap();
    wait_until("some frames to land", || {
        feed(&mut callback, 10, 0.5);
        engine.status(0).unwrap().capture_progress > 0
    });

    engine.shutdown();
    assert!(!engine.is_capturing(0).unwrap());
    let reader = hound::WavReader::open(engine.capture_path(0).unwrap()).unwrap();
    assert!(reader.len() > 0);
}

#[test]
fn test_capture_started_right_after_setup_records() {
    for _ in 0..10 {
        let dir = tempfile::tempdir().unwrap();
        let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
        engine.set_capture_route(0, 0, true).unwrap();
        engine.start_capture(0, CaptureLength::Frames(100)).unwrap();

        wait_until("capture to finish", || {
            feed(&mut callback, 10, 0.25);
            !engine.is_capturing(0).unwrap()
        });
        assert_eq!(engine.duration_frames(0, Direction::In).unwrap(), 100);
    }
}

#[test]
fn test_capture_can_restart_straight_after_kill() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _callback) = Engine::new(&settings(dir.path()), 48000).unwrap();

    engine.start_capture(3, CaptureLength::Unbounded).unwrap();
    assert!(engine.kill_capture(3).unwrap());
    engine.start_capture(3, CaptureLength::Frames(5)).unwrap();
    assert!(engine.is_capturing(3).unwrap());
    assert_eq!(engine.kill_all_capture(), 1);
}

#[test]
fn test_overrun_is_counted_and_flagged() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(
        &EngineSettings {
            input_buffer_frames: 4,
            ..settings(dir.path())
        },
        48000,
    )
    .unwrap();
    engine.set_capture_route(0, 0, true).unwrap();
    engine.start_capture(0, CaptureLength::Unbounded).unwrap();

    wait_until("input frames to be dropped", || {
        feed(&mut callback, 4096, 0.1);
        engine.metrics().capture_overruns > 0
    });
    wait_until("overrun fault", || {
        feed(&mut callback, 1, 0.1);
        engine.status(0).unwrap().capture_fault == Some(CaptureFault::Overrun)
    });
    // An overrun is reported but the capture keeps going.
    assert!(engine.is_capturing(0).unwrap());
    assert!(engine.kill_capture(0).unwrap());
}

#[cfg(target_os = "linux")]
#[test]
fn test_write_failure_stops_capture_with_io_fault() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    // Every flush to /dev/full fails with ENOSPC.
    std::os::unix::fs::symlink("/dev/full", engine.capture_path(0).unwrap()).unwrap();
    engine.set_capture_route(0, 0, true).unwrap();
    engine.start_capture(0, CaptureLength::Unbounded).unwrap();

    wait_until("capture to fail", || {
        feed(&mut callback, 64, 0.5);
        !engine.is_capturing(0).unwrap()
    });
    assert_eq!(engine.status(0).unwrap().capture_fault, Some(CaptureFault::Io));
    assert!(!engine.kill_capture(0).unwrap());
}

#[test]
fn test_monitor_passes_input_to_routed_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    engine.set_monitor(0, 1, true).unwrap();
    engine.set_monitor(1, 1, true).unwrap();

    let input = [0.25f32, 0.5].repeat(4);
    let mut output = vec![1.0; 8];
    callback.process(&input, &mut output);
    for frame in output.chunks(CHANNELS) {
        assert_eq!(frame[0], 0.0);
        assert_relative_eq!(frame[1], 0.75);
    }

    engine.set_monitor(1, 1, false).unwrap();
    callback.process(&input, &mut output);
    for frame in output.chunks(CHANNELS) {
        assert_eq!(frame[0], 0.0);
        assert_relative_eq!(frame[1], 0.25);
    }

    engine.set_monitor(0, 1, false).unwrap();
    callback.process(&input, &mut output);
    assert!(output.iter().all(|s| *s == 0.0));
    assert!(matches!(
        engine.set_monitor(0, CHANNELS, true),
        Err(EngineError::InvalidChannel(_))
    ));
}

#[test]
fn test_retrigger_after_pass_end_plays_again() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, mut callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    let samples = ramp(8);
    engine.load_file(0, &write_wav(dir.path(), "p.wav", &samples)).unwrap();
    engine.set_playback_route(0, 0, true).unwrap();

    engine.start_playback(0).unwrap();
    wait_until("pass to end", || !engine.is_playing(0).unwrap());
    assert_eq!(engine.metrics().active_streamers, 1);

    engine.start_playback(0).unwrap();
    assert!(engine.is_playing(0).unwrap());
    assert_relative_eq!(next_audible(&mut callback), samples[0]);
    assert_eq!(engine.metrics().active_streamers, 1);
}

#[test]
fn test_read_error_stops_looping_bank() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _callback) = Engine::new(
        &EngineSettings {
            output_buffer_frames: 65_536,
            ..settings(dir.path())
        },
        48000,
    )
    .unwrap();
    let path = write_wav(dir.path(), "gone.wav", &ramp(20_000));
    engine.load_file(0, &path).unwrap();
    engine.set_loop(0, true).unwrap();

    // Cut the file away under the open reader.
    std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(0)
        .unwrap();

    engine.start_playback(0).unwrap();
    wait_until("streamer to give up", || engine.metrics().active_streamers == 0);
    assert!(!engine.is_playing(0).unwrap());
}

#[test]
fn test_shutdown_with_capture_waiting_on_input() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _callback) = Engine::new(&settings(dir.path()), 48000).unwrap();
    engine.load_file(1, &write_wav(dir.path(), "s.wav", &ramp(64))).unwrap();
    engine.start_playback(1).unwrap();
    engine.start_capture(0, CaptureLength::Unbounded).unwrap();
    thread::sleep(Duration::from_millis(20));

    engine.shutdown();
    assert!(!engine.is_capturing(0).unwrap());
    assert_eq!(engine.metrics().active_streamers, 0);
    let reader = hound::WavReader::open(engine.capture_path(0).unwrap()).unwrap();
    assert_eq!(reader.len(), 0);
}
