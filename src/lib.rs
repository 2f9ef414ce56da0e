//! gazecontrol turns where the wearer of a pair of Tobii Glasses 2 is
//! looking into commands for a serial-connected actuator.
//!
//! The glasses publish two streams that know nothing about each other: an
//! RTSP scene video and a UDP feed of gaze samples interleaved with sync
//! markers that tie the telemetry clock to the video clock. For every video
//! frame we find the gaze sample that belongs to it ([`stream_sync`]), look
//! up which fiducial marker in the frame the gaze falls on ([`detector`]),
//! and only once the wearer has kept looking at the same marker for long
//! enough ([`dwell_filter`]) is its id written to the actuator ([`output`]).
//!
//! Frames come off a decoder thread through a small fixed pool of buffers
//! ([`frame_channel`]) so that a slow consumer makes us drop frames rather
//! than fall behind. Both streams have to be kept alive by re-sending a
//! subscription request ([`keepalive`]), and the glasses can be calibrated
//! over their REST API ([`calibration`]).
//!
//! [`control_loop`] wires all of this together; the `gazecontrol` binary
//! drives it either headless or from a terminal [`gui`].

pub mod args;
pub mod calibration;
pub mod config;
pub mod control_loop;
pub mod detector;
pub mod dummy_glasses;
pub mod dwell_filter;
pub mod eye_tracking;
pub mod ffmpeg_decoder;
pub mod frame_channel;
pub mod gui;
pub mod keepalive;
pub mod output;
pub mod stream_sync;
pub mod telemetry;
