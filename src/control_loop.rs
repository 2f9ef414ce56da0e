//! Ties the streams together: one step per video frame, from telemetry in
//! to actuator command out.

use crate::{
    calibration::{CalibrationError, CalibrationSession, CalibrationState},
    detector::{marker_at, MarkerDetector, MarkerId},
    dwell_filter::DwellFilter,
    eye_tracking::EyeTracking,
    frame_channel::{FrameChannel, FrameShape, FrameStats, StopHandle, VideoFrame},
    keepalive::KeepAlive,
    output::LineSink,
    stream_sync::{StreamSync, SyncStats},
    telemetry::GazeSample,
};
use log::{info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Something that can hand over whatever telemetry has arrived.
pub trait TelemetrySource: Send {
    /// Move pending packets into `sync` without blocking; returns how many.
    fn read_into(&mut self, sync: &mut StreamSync) -> usize;
    fn stop(&mut self) {}
}

impl TelemetrySource for EyeTracking {
    fn read_into(&mut self, sync: &mut StreamSync) -> usize {
        EyeTracking::read_into(self, sync)
    }

    fn stop(&mut self) {
        EyeTracking::stop(self)
    }
}

/// Something that produces video frames, blocking until one is ready.
pub trait FrameSource: Send {
    /// `None` once the stream is over.
    fn next_frame(&mut self) -> Option<VideoFrame>;
    fn stats(&self) -> FrameStats {
        FrameStats::default()
    }
    fn stop(&mut self) {}

    /// For sources whose `next_frame` can block for a long time.
    fn stop_handle(&self) -> Option<StopHandle> {
        None
    }
}

impl FrameSource for FrameChannel {
    fn next_frame(&mut self) -> Option<VideoFrame> {
        self.read()
    }

    fn stats(&self) -> FrameStats {
        FrameChannel::stats(self)
    }

    fn stop(&mut self) {
        FrameChannel::stop(self)
    }

    fn stop_handle(&self) -> Option<StopHandle> {
        Some(FrameChannel::stop_handle(self))
    }
}

/// What happened during one step, for whoever is watching.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    pub frame_pts_ms: f64,
    /// Telemetry packets read this step.
    pub packets: usize,
    /// Last known gaze; may be older than this frame.
    pub gaze: Option<GazeSample>,
    pub gaze_px: Option<(i32, i32)>,
    pub markers: usize,
    pub candidate: Option<MarkerId>,
    pub ratified: Option<MarkerId>,
    pub calibration: Option<CalibrationState>,
    pub sync: SyncStats,
    pub frames: FrameStats,
}

/// Ends [`ControlLoop::run`] from another thread, even while the loop is
/// waiting on a frame.
#[derive(Clone)]
pub struct LoopStopper {
    halt: Arc<AtomicBool>,
    frames: Option<StopHandle>,
}

impl LoopStopper {
    pub fn stop(&self) {
        self.halt.store(true, Ordering::SeqCst);
        if let Some(frames) = self.frames.as_ref() {
            frames.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }
}

pub struct ControlLoop {
    telemetry: Box<dyn TelemetrySource>,
    frames: Box<dyn FrameSource>,
    detector: Box<dyn MarkerDetector>,
    sink: Box<dyn LineSink>,
    sync: StreamSync,
    dwell: DwellFilter,
    calibration: Option<CalibrationSession>,
    gaze: Option<GazeSample>,
    gaze_offset: (i32, i32),
    keepalives: Vec<KeepAlive>,
    halt: Arc<AtomicBool>,
}

/// Gaze position on a frame, in pixels, with the offset applied.
pub fn gaze_to_pixels(gaze: &GazeSample, shape: FrameShape, offset: (i32, i32)) -> (i32, i32) {
    let x = (shape.width as f64 * gaze.x).round() as i32 - offset.0;
    let y = (shape.height as f64 * gaze.y).round() as i32 - offset.1;
    (x, y)
}

impl ControlLoop {
    pub fn new(
        telemetry: Box<dyn TelemetrySource>,
        frames: Box<dyn FrameSource>,
        detector: Box<dyn MarkerDetector>,
        sink: Box<dyn LineSink>,
        sync: StreamSync,
        dwell: DwellFilter,
    ) -> Self {
        Self {
            telemetry,
            frames,
            detector,
            sink,
            sync,
            dwell,
            calibration: None,
            gaze: None,
            gaze_offset: (0, 0),
            keepalives: Vec::new(),
            halt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Hold a stream subscription for as long as the loop runs. It is
    /// stopped in [`ControlLoop::shutdown`].
    pub fn with_keepalive(mut self, keepalive: KeepAlive) -> Self {
        self.keepalives.push(keepalive);
        self
    }

    pub fn with_calibration(mut self, session: CalibrationSession) -> Self {
        self.calibration = Some(session);
        self
    }

    pub fn with_gaze_offset(mut self, offset: (i32, i32)) -> Self {
        self.gaze_offset = offset;
        self
    }

    pub fn set_threshold(&mut self, threshold: usize) {
        self.dwell.set_threshold(threshold);
    }

    pub fn threshold(&self) -> usize {
        self.dwell.threshold()
    }

    pub fn set_window(&mut self, window_len: usize) {
        self.dwell.set_window(window_len);
    }

    pub fn window(&self) -> usize {
        self.dwell.window_len()
    }

    pub fn set_gaze_offset(&mut self, offset: (i32, i32)) {
        self.gaze_offset = offset;
    }

    pub fn gaze_offset(&self) -> (i32, i32) {
        self.gaze_offset
    }

    pub fn calibration_state(&self) -> Option<CalibrationState> {
        self.calibration.as_ref().map(CalibrationSession::state)
    }

    /// Kick off a calibration. Does nothing if no calibration endpoint is
    /// attached.
    pub fn start_calibration(&mut self) -> Result<(), CalibrationError> {
        match self.calibration.as_mut() {
            Some(session) => session.start(),
            None => {
                warn!("ControlLoop : no calibration endpoint, ignoring request");
                Ok(())
            }
        }
    }

    /// Process the next frame. Returns `None` when the video has ended.
    pub fn step(&mut self) -> Option<StepReport> {
        let packets = self.telemetry.read_into(&mut self.sync);

        let frame = self.frames.next_frame()?;
        self.sync.add_frame_pts(frame.pts_ms);
        if let Some(gaze) = self.sync.sync() {
            self.gaze = Some(gaze);
        }

        let markers = self.detector.detect(&frame);
        let mut report = StepReport {
            frame_pts_ms: frame.pts_ms,
            packets,
            gaze: self.gaze,
            markers: markers.len(),
            ..Default::default()
        };

        if let Some(gaze) = self.gaze {
            let (x, y) = gaze_to_pixels(&gaze, frame.shape, self.gaze_offset);
            report.gaze_px = Some((x, y));
            report.candidate = marker_at(&markers, x as f32, y as f32);
            report.ratified = self.dwell.process(report.candidate);
        }

        if let Some(id) = report.ratified {
            info!("ControlLoop : detected marker {}", id);
            self.emit(&id.to_string());
        }

        let finished = self.calibration.as_mut().and_then(CalibrationSession::update);
        if let Some(code) = finished.and_then(|s| s.status_code()) {
            self.emit(code);
        }
        report.calibration = self.calibration_state();
        report.sync = self.sync.stats();
        report.frames = self.frames.stats();

        Some(report)
    }

    fn emit(&mut self, token: &str) {
        if let Err(e) = self.sink.write_line(token) {
            warn!("ControlLoop : could not write '{}': {}", token, e);
        }
    }

    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            halt: Arc::clone(&self.halt),
            frames: self.frames.stop_handle(),
        }
    }

    /// Step until the video ends or a [`LoopStopper`] fires. Returns the
    /// number of frames processed.
    pub fn run(&mut self) -> u64 {
        let mut frames = 0;
        while !self.halt.load(Ordering::SeqCst) {
            if self.step().is_none() {
                break;
            }
            frames += 1;
        }
        if self.halt.load(Ordering::SeqCst) {
            info!("ControlLoop : stopped after {} frames", frames);
        } else {
            info!("ControlLoop : video stream ended");
        }
        frames
    }

    /// Stop the producers. The subscriptions go first so the glasses stop
    /// sending before the decoder is torn down.
    pub fn shutdown(&mut self) {
        self.telemetry.stop();
        self.keepalives.iter_mut().for_each(KeepAlive::stop);
        self.frames.stop();
        info!("ControlLoop : terminated.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::CalibrationTransport,
        detector::{FixedRegions, Marker},
        frame_channel::{DecodeError, FrameDecoder, Interrupt},
        keepalive::StreamKind,
        stream_sync::{ClockRatio, SyncLimits},
        telemetry::{SyncMarker, TelemetryEvent},
    };
    use serde_json::{json, Value};
    use std::{
        collections::VecDeque,
        io::{self, ErrorKind},
        net::UdpSocket,
        sync::{mpsc, Mutex},
        thread,
        time::{Duration, Instant},
    };

    /// Telemetry is scripted per step: each call hands over the next batch.
    struct ScriptedTelemetry {
        batches: VecDeque<Vec<TelemetryEvent>>,
        stopped: Arc<AtomicBool>,
    }

    impl TelemetrySource for ScriptedTelemetry {
        fn read_into(&mut self, sync: &mut StreamSync) -> usize {
            let batch = self.batches.pop_front().unwrap_or_default();
            let n = batch.len();
            batch.into_iter().for_each(|e| sync.add_telemetry(e));
            n
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Blank frames every 40ms, then end of stream.
    struct BlankFrames {
        shape: FrameShape,
        remaining: usize,
        pts_ms: f64,
    }

    impl FrameSource for BlankFrames {
        fn next_frame(&mut self) -> Option<VideoFrame> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            let frame = VideoFrame {
                pixels: Vec::new(),
                shape: self.shape,
                pts_ms: self.pts_ms,
            };
            self.pts_ms += 40.0;
            Some(frame)
        }
    }

    struct ChannelSink(mpsc::Sender<String>);

    impl LineSink for ChannelSink {
        fn write_line(&mut self, token: &str) -> io::Result<()> {
            self.0
                .send(token.to_string())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver gone"))
        }
    }

    fn shape() -> FrameShape {
        FrameShape {
            width: 100,
            height: 100,
            channels: 1,
        }
    }

    fn square(id: MarkerId, x: f32, y: f32, side: f32) -> Marker {
        Marker {
            id,
            corners: vec![(x, y), (x + side, y), (x + side, y + side), (x, y + side)],
        }
    }

    fn gaze(x: f64, y: f64, ts: i64) -> TelemetryEvent {
        TelemetryEvent::Gaze(GazeSample { x, y, ts })
    }

    /// A loop whose telemetry clock ticks once per millisecond, with a sync
    /// marker at t=0 and the given gaze per frame.
    fn build(
        per_frame: Vec<Vec<TelemetryEvent>>,
        frames: usize,
        regions: Vec<Marker>,
        window: usize,
        threshold: usize,
    ) -> (ControlLoop, mpsc::Receiver<String>, Arc<AtomicBool>) {
        let mut batches: VecDeque<_> = per_frame.into();
        let mut first = vec![TelemetryEvent::Sync(SyncMarker { pts: 0, ts: 0 })];
        first.extend(batches.pop_front().unwrap_or_default());
        batches.push_front(first);

        let stopped = Arc::new(AtomicBool::new(false));
        let telemetry = ScriptedTelemetry {
            batches,
            stopped: Arc::clone(&stopped),
        };
        let frames = BlankFrames {
            shape: shape(),
            remaining: frames,
            pts_ms: 0.0,
        };
        let (tx, rx) = mpsc::channel();
        let sync = StreamSync::new(
            ClockRatio {
                video_ticks_per_ms: 90,
                telemetry_ticks_per_ms: 1,
            },
            SyncLimits::default(),
        );

        let control = ControlLoop::new(
            Box::new(telemetry),
            Box::new(frames),
            Box::new(FixedRegions::new(regions)),
            Box::new(ChannelSink(tx)),
            sync,
            DwellFilter::new(window, threshold),
        );
        (control, rx, stopped)
    }

    #[test]
    fn test_pixel_mapping() {
        let g = GazeSample {
            x: 0.5,
            y: 0.25,
            ts: 0,
        };
        assert_eq!(gaze_to_pixels(&g, FrameShape::default(), (0, 0)), (960, 270));
        assert_eq!(gaze_to_pixels(&g, FrameShape::default(), (10, -5)), (950, 275));
    }

    #[test]
    fn test_steady_gaze_is_ratified() {
        // frame k is at 40k ms; gaze sample for it lands just before
        let per_frame = (0..6).map(|k| vec![gaze(0.5, 0.5, 40 * k)]).collect();
        let (mut control, rx, _) = build(per_frame, 6, vec![square(4, 40.0, 40.0, 20.0)], 5, 3);

        let reports: Vec<_> = std::iter::from_fn(|| control.step()).collect();
        assert_eq!(reports.len(), 6);

        assert_eq!(reports[0].gaze_px, Some((50, 50)));
        assert!(reports.iter().all(|r| r.candidate == Some(4)));

        // empty slots win until the third hit
        assert_eq!(reports[1].ratified, None);
        assert_eq!(reports[2].ratified, Some(4));

        // ratified ids are forwarded on every frame
        let sent: Vec<String> = rx.try_iter().collect();
        assert_eq!(sent, vec!["4", "4", "4", "4"]);
    }

    #[test]
    fn test_glance_is_not_ratified() {
        // one frame on the marker, the rest elsewhere
        let per_frame = (0..6)
            .map(|k| {
                let x = if k == 2 { 0.5 } else { 0.05 };
                vec![gaze(x, 0.5, 40 * k)]
            })
            .collect();
        let (mut control, rx, _) = build(per_frame, 6, vec![square(4, 40.0, 40.0, 20.0)], 5, 3);

        while control.step().is_some() {}
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_no_gaze_means_no_vote() {
        let (mut control, rx, _) = build(vec![], 4, vec![square(4, 0.0, 0.0, 100.0)], 1, 1);

        let report = control.step().unwrap();
        assert_eq!(report.gaze, None);
        assert_eq!(report.candidate, None);
        assert_eq!(report.markers, 1);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_last_known_gaze_is_kept() {
        let per_frame = vec![vec![gaze(0.5, 0.5, 0)]];
        let (mut control, rx, _) = build(per_frame, 3, vec![square(9, 40.0, 40.0, 20.0)], 1, 1);

        for _ in 0..3 {
            let report = control.step().unwrap();
            assert_eq!(report.gaze.map(|g| g.ts), Some(0));
            assert_eq!(report.ratified, Some(9));
        }
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn test_offset_moves_gaze_off_marker() {
        let per_frame = vec![vec![gaze(0.5, 0.5, 0)]];
        let (mut control, _rx, _) = build(per_frame, 2, vec![square(9, 40.0, 40.0, 20.0)], 1, 1);
        control.set_gaze_offset((30, 0));

        let report = control.step().unwrap();
        assert_eq!(report.gaze_px, Some((20, 50)));
        assert_eq!(report.candidate, None);
    }

    #[test]
    fn test_setters() {
        let (mut control, _rx, _) = build(vec![], 1, vec![], 30, 10);
        control.set_threshold(12);
        control.set_window(20);
        assert_eq!(control.threshold(), 12);
        assert_eq!(control.window(), 20);
        assert_eq!(control.calibration_state(), None);
        assert!(control.start_calibration().is_ok());
    }

    #[test]
    fn test_end_of_video() {
        let (mut control, _rx, stopped) = build(vec![], 3, vec![], 5, 3);

        assert_eq!(control.run(), 3);
        assert!(control.step().is_none());
        assert!(!control.stopper().is_stopped());

        control.shutdown();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_run_honours_stop() {
        let (mut control, _rx, _) = build(vec![], 100, vec![], 5, 3);
        control.stopper().stop();
        assert_eq!(control.run(), 0);
    }

    /// One frame, then nothing until interrupted, like a camera that went
    /// quiet.
    struct QuietCamera {
        served: bool,
        wake_rx: mpsc::Receiver<()>,
        wake_tx: Arc<Mutex<mpsc::Sender<()>>>,
    }

    impl FrameDecoder for QuietCamera {
        fn shape(&self) -> FrameShape {
            shape()
        }

        fn decode_into(&mut self, _buf: &mut [u8]) -> Result<Option<f64>, DecodeError> {
            if !self.served {
                self.served = true;
                return Ok(Some(0.0));
            }
            let _ = self.wake_rx.recv();
            Ok(None)
        }

        fn interrupter(&self) -> Option<Interrupt> {
            let wake_tx = Arc::clone(&self.wake_tx);
            Some(Arc::new(move || {
                let _ = wake_tx.lock().unwrap().send(());
            }))
        }
    }

    #[test]
    fn test_stopper_ends_blocked_run() {
        let (wake_tx, wake_rx) = mpsc::channel();
        let mut channel = FrameChannel::new(
            QuietCamera {
                served: false,
                wake_rx,
                wake_tx: Arc::new(Mutex::new(wake_tx)),
            },
            2,
        );
        channel.start().unwrap();

        let telemetry = ScriptedTelemetry {
            batches: VecDeque::new(),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        let (tx, _rx) = mpsc::channel();
        let mut control = ControlLoop::new(
            Box::new(telemetry),
            Box::new(channel),
            Box::new(FixedRegions::new(vec![])),
            Box::new(ChannelSink(tx)),
            StreamSync::default(),
            DwellFilter::new(5, 3),
        );

        let stopper = control.stopper();
        let signal = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            stopper.stop();
        });

        let started = Instant::now();
        assert_eq!(control.run(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        signal.join().unwrap();

        control.shutdown();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_shutdown_ends_video_subscription() {
        let device = UdpSocket::bind("127.0.0.1:0").unwrap();
        device
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let keepalive = KeepAlive::subscribe(
            device.local_addr().unwrap(),
            StreamKind::Video,
            Duration::from_millis(10),
        )
        .unwrap();

        let (control, _rx, _) = build(vec![], 1, vec![], 5, 3);
        let mut control = control.with_keepalive(keepalive);

        let mut buf = [0u8; 256];
        let (len, _) = device.recv_from(&mut buf).unwrap();
        let request: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(request["type"], "live.video.unicast");

        control.shutdown();
        device.set_nonblocking(true).unwrap();
        while device.recv_from(&mut buf).is_ok() {}

        thread::sleep(Duration::from_millis(50));
        let after = device.recv_from(&mut buf);
        assert!(matches!(after, Err(e) if e.kind() == ErrorKind::WouldBlock));
    }

    struct InstantCalibration;

    impl CalibrationTransport for InstantCalibration {
        fn post(&mut self, path: &str, _body: Option<&Value>) -> Result<Value, CalibrationError> {
            Ok(match path {
                "/api/projects" => json!({ "pr_id": "p" }),
                "/api/participants" => json!({ "pa_id": "a" }),
                "/api/calibrations" => json!({ "ca_id": "c" }),
                _ => json!({}),
            })
        }

        fn get(&mut self, _path: &str) -> Result<Value, CalibrationError> {
            Ok(json!({ "ca_state": "calibrated" }))
        }
    }

    #[test]
    fn test_calibration_status_is_forwarded() {
        let (control, rx, _) = build(vec![], 3, vec![], 5, 3);
        let mut control = control.with_calibration(CalibrationSession::new(InstantCalibration));
        assert_eq!(control.calibration_state(), Some(CalibrationState::Idle));

        control.start_calibration().unwrap();
        let report = control.step().unwrap();
        assert_eq!(report.calibration, Some(CalibrationState::Calibrated));

        control.step().unwrap();
        let sent: Vec<String> = rx.try_iter().collect();
        assert_eq!(sent, vec!["C"]);
    }
}
