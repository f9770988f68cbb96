use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, Stream, StreamConfig, SupportedBufferSize};

use crate::config::EngineSettings;
use crate::engine::XrunReporter;
use crate::mixer::MixCallback;

/// Opened audio devices and the stream configuration both streams will use.
pub struct AudioServer {
    output: cpal::Device,
    input: Option<cpal::Device>,
    config: StreamConfig,
}

/// Keeps the running streams alive; dropping it stops audio.
pub struct AudioStreams {
    _output: Stream,
    _input: Option<Stream>,
}

fn pick_host() -> cpal::Host {
    let jack = cpal::available_hosts()
        .into_iter()
        .find(|id| id.name() == "JACK")
        .and_then(|id| cpal::host_from_id(id).ok());
    match jack {
        Some(host) => {
            log::info!("[Cpal] Using JACK host");
            host
        }
        None => {
            let host = cpal::default_host();
            log::info!("[Cpal] JACK unavailable, using {:?} host", host.id());
            host
        }
    }
}

impl AudioServer {
    pub fn connect(settings: &EngineSettings) -> Result<Self> {
        let host = pick_host();
        let output = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device available"))?;
        log::info!(
            "[Cpal] Output device: {}",
            output.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let channels = settings.channels as u16;
        let sample_rate = output.default_output_config()?.sample_rate();

        log::debug!("[Cpal] Supported output configs:");
        for config in output.supported_output_configs()? {
            log::debug!(
                "  - Channels: {}, Sample Rate: {}-{}, Format: {:?}",
                config.channels(),
                config.min_sample_rate().0,
                config.max_sample_rate().0,
                config.sample_format()
            );
        }

        let supported = output
            .supported_output_configs()?
            .find(|c| {
                c.channels() == channels
                    && c.sample_format() == SampleFormat::F32
                    && c.min_sample_rate() <= sample_rate
                    && sample_rate <= c.max_sample_rate()
            })
            .ok_or_else(|| anyhow!("No supported F32 config with {} channels found", channels))?;

        let buffer_size = match supported.buffer_size() {
            SupportedBufferSize::Range { min, max } => {
                BufferSize::Fixed(settings.audio_buffer_frames.clamp(*min, *max))
            }
            SupportedBufferSize::Unknown => BufferSize::Default,
        };
        let config = StreamConfig {
            channels,
            sample_rate,
            buffer_size,
        };

        let input = host.default_input_device().filter(|device| {
            let usable = device
                .supported_input_configs()
                .map(|mut configs| {
                    configs.any(|c| c.channels() == channels && c.sample_format() == SampleFormat::F32)
                })
                .unwrap_or(false);
            if !usable {
                log::warn!("[Cpal] Input device has no F32 config with {} channels; capture disabled", channels);
            }
            usable
        });

        log::info!(
            "[Cpal] Using config: SampleRate: {}, Channels: {}, Buffer: {:?}",
            config.sample_rate.0,
            config.channels,
            config.buffer_size
        );
        Ok(Self {
            output,
            input,
            config,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Builds the streams and hands each half of the callback to its stream.
    pub fn start(self, callback: MixCallback, xruns: XrunReporter) -> Result<AudioStreams> {
        let (mut tap, mut mixer) = callback.split();

        let output_xruns = xruns.clone();
        let output = self.output.build_output_stream(
            &self.config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| mixer.process(data),
            move |err| {
                output_xruns.report();
                log::error!("[CpalCallback] Output stream error: {}", err);
            },
            None,
        )?;

        let input = match &self.input {
            Some(device) => {
                let stream = device.build_input_stream(
                    &self.config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| tap.process(data),
                    move |err| {
                        xruns.report();
                        log::error!("[CpalCallback] Input stream error: {}", err);
                    },
                    None,
                )?;
                stream.play()?;
                Some(stream)
            }
            None => None,
        };

        output.play()?;
        log::info!("[Cpal] Streams running");
        Ok(AudioStreams {
            _output: output,
            _input: input,
        })
    }
}
