use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::capture::CaptureFormat;
use crate::error::{EngineError, EngineResult};

/// Settings that are saved to the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub banks: usize,
    /// Hardware channels, used for both input and output.
    pub channels: usize,
    /// Output ring capacity per bank, in samples.
    pub output_buffer_frames: usize,
    /// Input ring capacity per hardware channel, in samples.
    pub input_buffer_frames: usize,
    pub capture_dir: PathBuf,
    pub capture_prefix: String,
    pub capture_format: CaptureFormat,
    pub audio_buffer_frames: u32,
    /// Fixed seed for the rate-matching dice. `None` seeds from the OS.
    pub random_seed: Option<u64>,
}

/// Default settings for a new installation.
impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            banks: 48,
            channels: 8,
            output_buffer_frames: 65_536,
            input_buffer_frames: 192_000,
            capture_dir: default_capture_dir(),
            capture_prefix: "bank".to_string(),
            capture_format: CaptureFormat::Pcm16,
            audio_buffer_frames: 256,
            random_seed: None,
        }
    }
}

fn default_capture_dir() -> PathBuf {
    dirs::audio_dir()
        .or_else(dirs::home_dir)
        .map(|dir| dir.join("ficus"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl EngineSettings {
    /// Rejects settings an engine cannot be built from.
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |what: &str| -> EngineResult<()> {
            Err(EngineError::InvalidConfig(format!("{what} must be at least 1")))
        };
        if self.banks == 0 {
            return invalid("banks");
        }
        if self.channels == 0 {
            return invalid("channels");
        }
        if self.output_buffer_frames == 0 {
            return invalid("output_buffer_frames");
        }
        if self.input_buffer_frames == 0 {
            return invalid("input_buffer_frames");
        }
        Ok(())
    }
}

/// Loads settings from disk.
pub fn load_settings() -> Result<EngineSettings> {
    let settings: EngineSettings = confy::load("ficus", "settings")?;
    Ok(settings)
}

/// Saves settings to disk.
pub fn save_settings(settings: &EngineSettings) -> Result<()> {
    confy::store("ficus", "settings", settings)?;
    Ok(())
}
