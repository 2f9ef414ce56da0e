//! A [`FrameDecoder`] that lets an `ffmpeg` child process do the RTSP and
//! H.264 work and reads packed BGR frames from its stdout.

use crate::frame_channel::{DecodeError, FrameDecoder, FrameShape, Interrupt};
use log::{debug, info, warn};
use std::{
    io::{ErrorKind, Read},
    process::{Child, ChildStdout, Command, Stdio},
    sync::{Arc, Mutex, PoisonError},
};

/// Socket timeout for RTSP input, in microseconds. Without it ffmpeg waits
/// forever on glasses that went away.
const RTSP_TIMEOUT_US: u64 = 5_000_000;

pub struct FfmpegDecoder {
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    shape: FrameShape,
    frame_rate: f64,
    frames: u64,
}

fn ffmpeg_command(uri: &str, shape: FrameShape) -> Command {
    let scale_arg = format!("scale={}:{}", shape.width, shape.height);
    let pix_fmt = if shape.channels == 1 { "gray" } else { "bgr24" };

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-fflags")
        .arg("nobuffer")
        .arg("-flags")
        .arg("low_delay");

    if uri.starts_with("rtsp://") {
        cmd.arg("-rtsp_transport")
            .arg("tcp")
            .arg("-timeout")
            .arg(RTSP_TIMEOUT_US.to_string());
    }

    cmd.arg("-i")
        .arg(uri)
        .arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg(pix_fmt)
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
    cmd
}

impl FfmpegDecoder {
    /// Start `ffmpeg` on `uri`, scaling every frame to `shape`.
    ///
    /// The rawvideo pipe carries no timestamps, so presentation times are
    /// reconstructed from the frame count at `frame_rate`.
    pub fn spawn(uri: &str, shape: FrameShape, frame_rate: f64) -> Result<Self, DecodeError> {
        let mut child = ffmpeg_command(uri, shape)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(DecodeError::Spawn)?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(DecodeError::NoOutput);
        };

        info!("FfmpegDecoder : reading {} as {}x{}", uri, shape.width, shape.height);
        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdout,
            shape,
            frame_rate,
            frames: 0,
        })
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn shape(&self) -> FrameShape {
        self.shape
    }

    fn decode_into(&mut self, buf: &mut [u8]) -> Result<Option<f64>, DecodeError> {
        match self.stdout.read_exact(buf) {
            Ok(()) => {
                let pts_ms = self.frames as f64 * 1000.0 / self.frame_rate;
                self.frames += 1;
                Ok(Some(pts_ms))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(DecodeError::Io(e)),
        }
    }

    /// Kills the child, which closes its stdout and ends a blocked read.
    fn interrupter(&self) -> Option<Interrupt> {
        let child = Arc::clone(&self.child);
        Some(Arc::new(move || {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = child.kill() {
                debug!("FfmpegDecoder : kill: {}", e);
            }
        }))
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = child.kill() {
            warn!("FfmpegDecoder : could not kill ffmpeg: {}", e);
        }
        let _ = child.wait();
    }
}
