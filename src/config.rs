//! Runtime settings, read from a RON file.
//!
//! Every field has a default matching the glasses' factory network setup, so
//! a file only needs to name what differs:
//!
//! ```ron
//! (
//!     dwell_threshold: 15,
//!     regions: [
//!         (id: 1, corners: [(100.0, 100.0), (300.0, 100.0), (300.0, 300.0), (100.0, 300.0)]),
//!     ],
//! )
//! ```

use crate::{
    detector::Marker,
    frame_channel::FrameShape,
    stream_sync::SyncLimits,
};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, io, net::SocketAddr, path::Path, time::Duration};

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(ron::error::SpannedError),
    Serialize(ron::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read settings: {}", e),
            ConfigError::Parse(e) => write!(f, "bad settings file: {}", e),
            ConfigError::Serialize(e) => write!(f, "could not write settings: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ron::error::SpannedError> for ConfigError {
    fn from(value: ron::error::SpannedError) -> Self {
        Self::Parse(value)
    }
}

impl From<ron::Error> for ConfigError {
    fn from(value: ron::Error) -> Self {
        Self::Serialize(value)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Where the data stream is requested from.
    pub data_peer: SocketAddr,
    pub video_uri: String,
    /// Root of the REST API used for calibration.
    pub calibration_url: String,
    pub frame_shape: FrameShape,
    pub frame_rate: f64,
    pub frame_pool_size: usize,
    pub dwell_window: usize,
    pub dwell_threshold: usize,
    /// Subtracted from the gaze pixel position, in pixels.
    pub gaze_offset: (i32, i32),
    pub headless: bool,
    pub keepalive_interval_ms: u64,
    pub serial_baud: u32,
    pub max_video_lead_ms: f64,
    pub max_pending_samples: usize,
    pub max_pending_markers: usize,
    pub regions: Vec<Marker>,
}

impl Default for Settings {
    fn default() -> Self {
        let limits = SyncLimits::default();
        Self {
            data_peer: SocketAddr::from(([192, 168, 71, 50], 49152)),
            video_uri: "rtsp://192.168.71.50:8554/live/scene".to_string(),
            calibration_url: "http://192.168.71.50".to_string(),
            frame_shape: FrameShape::default(),
            frame_rate: 25.0,
            frame_pool_size: 1,
            dwell_window: 30,
            dwell_threshold: 10,
            gaze_offset: (0, 0),
            headless: false,
            keepalive_interval_ms: 1000,
            serial_baud: 115200,
            max_video_lead_ms: limits.max_video_lead_ms,
            max_pending_samples: limits.max_pending_samples,
            max_pending_markers: limits.max_pending_markers,
            regions: Vec::new(),
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(ron::from_str(&text)?)
    }

    /// `path` if given, the defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn sync_limits(&self) -> SyncLimits {
        SyncLimits {
            max_video_lead_ms: self.max_video_lead_ms,
            max_pending_samples: self.max_pending_samples,
            max_pending_markers: self.max_pending_markers,
        }
    }
}
