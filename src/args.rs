// Commandline argument parser using clap for gazecontrol and glasses-sim

use crate::config::Settings;
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf};

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct GazeArgs {
    /// Serial port the actuator listens on. Without one, commands are only
    /// logged
    pub port: Option<PathBuf>,

    /// Settings file in RON format
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Run without the terminal dashboard; stop with Ctrl-C
    #[arg(long)]
    pub headless: bool,

    /// Frames a marker must win within the window before it is sent
    #[arg(short = 't', long = "threshold")]
    pub threshold: Option<usize>,

    /// Number of recent frames the dwell vote looks at
    #[arg(short = 'w', long = "window")]
    pub window: Option<usize>,

    /// Baud rate of the serial port
    #[arg(short = 'b', long = "baud")]
    pub baud: Option<u32>,

    /// Run against simulated glasses and a synthetic video stream
    #[arg(long)]
    pub simulate: bool,

    /// Calibrate before starting; a failed calibration aborts
    #[arg(long)]
    pub calibrate: bool,
}

impl GazeArgs {
    /// Let the command line override what the settings file says.
    pub fn apply(&self, settings: &mut Settings) {
        if self.headless {
            settings.headless = true;
        }
        if let Some(threshold) = self.threshold {
            settings.dwell_threshold = threshold;
        }
        if let Some(window) = self.window {
            settings.dwell_window = window;
        }
        if let Some(baud) = self.baud {
            settings.serial_baud = baud;
        }
    }
}

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct SimArgs {
    /// Address to listen for subscriptions on
    #[arg(short = 'l', long = "listen", default_value = "127.0.0.1:49152")]
    pub listen: SocketAddr,

    /// Gaze samples per second
    #[arg(short = 'r', long = "rate", default_value_t = 50.0)]
    pub rate: f64,

    /// Amplitude of the jitter added to each gaze sample, in normalized units
    #[arg(short = 'n', long = "noise", default_value_t = 0.005)]
    pub noise: f64,
}
