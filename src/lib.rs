pub mod audio;
pub mod bank;
pub mod capture;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod mixer;
pub mod ring;
pub mod routing;
pub mod signal;
pub mod streamer;
pub mod transform;
pub mod wav;

pub use bank::{BankStatus, CaptureFault, Direction};
pub use capture::{CaptureFormat, CaptureLength};
pub use config::EngineSettings;
pub use engine::{Engine, EngineMetrics, XrunReporter};
pub use error::{EngineError, EngineResult};
pub use mixer::MixCallback;
