//! Stand-ins for the glasses, for running the pipeline on a desk.
//!
//! [`DummyGlasses`] answers a data-stream subscription the way the device
//! does, and [`TestPatternDecoder`] stands in for the scene camera.

use crate::frame_channel::{DecodeError, FrameDecoder, FrameShape};
use log::{debug, info, warn};
use rand::prelude::*;
use serde_json::{json, Value};
use std::{
    f64::consts::PI,
    io::{self, ErrorKind},
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// A sync marker goes out with every this many gaze samples.
const SAMPLES_PER_MARKER: u64 = 10;

/// How long the simulated wearer looks at each point.
const FIXATION: Duration = Duration::from_secs(2);

pub struct DummyGlasses {
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
    addr: SocketAddr,
    keepalives: Arc<AtomicU64>,
    samples: Arc<AtomicU64>,
}

enum Signal {
    Noise(f64),
    Stop,
}

impl DummyGlasses {
    /// Listen on `bind` at 50 samples a second.
    pub fn start(bind: SocketAddr) -> io::Result<Self> {
        Self::with_rate(bind, 50.0, 0.005)
    }

    pub fn with_rate(bind: SocketAddr, rate: f64, noise: f64) -> io::Result<Self> {
        Self::with_clock(bind, rate, noise, Instant::now())
    }

    /// Listen on `bind`. Nothing is sent until the first data-stream
    /// subscription arrives; after that samples go to whoever subscribed
    /// last. Telemetry ts and marker pts both count from `epoch`, so a
    /// [`TestPatternDecoder`] sharing the epoch lines up with the markers.
    pub fn with_clock(
        bind: SocketAddr,
        rate: f64,
        noise: f64,
        epoch: Instant,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;

        let (tx, rx) = mpsc::channel::<Signal>();
        let keepalives = Arc::new(AtomicU64::new(0));
        let samples = Arc::new(AtomicU64::new(0));
        let th_keepalives = Arc::clone(&keepalives);
        let th_samples = Arc::clone(&samples);
        let period = Duration::from_secs_f64(1.0 / rate.max(1.0));

        let handle = thread::Builder::new()
            .name("dummy-glasses".to_string())
            .spawn(move || {
                let fixations = simulated_fixations();
                let mut rng = thread_rng();
                let mut noise = noise.abs();
                let mut subscriber = None;
                let mut buf = [0u8; 1024];

                loop {
                    match rx.try_recv() {
                        Ok(Signal::Noise(new_noise)) => noise = new_noise.abs(),
                        Ok(Signal::Stop) | Err(mpsc::TryRecvError::Disconnected) => break,
                        Err(mpsc::TryRecvError::Empty) => {}
                    }

                    loop {
                        match socket.recv_from(&mut buf) {
                            Ok((len, from)) => match subscription(&buf[..len]) {
                                Some(Subscription::Data) => {
                                    th_keepalives.fetch_add(1, Ordering::Relaxed);
                                    if subscriber != Some(from) {
                                        info!("DummyGlasses : streaming to {}", from);
                                    }
                                    subscriber = Some(from);
                                }
                                Some(Subscription::Other) => {
                                    th_keepalives.fetch_add(1, Ordering::Relaxed);
                                }
                                None => {}
                            },
                            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(e) => {
                                debug!("DummyGlasses : receive failed: {}", e);
                                break;
                            }
                        }
                    }

                    if let Some(peer) = subscriber {
                        let elapsed = epoch.elapsed();
                        let n = th_samples.fetch_add(1, Ordering::Relaxed);
                        let ts = elapsed.as_micros() as i64;

                        let i = (elapsed.as_millis() / FIXATION.as_millis()) as usize;
                        let (x, y) = fixations[i % fixations.len()];
                        let gaze = json!({
                            "ts": ts,
                            "s": 0,
                            "gidx": n,
                            "l": 0,
                            "gp": [
                                x + rng.gen_range(-noise..=noise),
                                y + rng.gen_range(-noise..=noise),
                            ],
                        });
                        send(&socket, &gaze, peer);

                        if n % SAMPLES_PER_MARKER == 0 {
                            let pts = elapsed.as_millis() as i64 * 90;
                            send(&socket, &json!({ "ts": ts, "s": 0, "pts": pts, "pv": 7 }), peer);
                        }
                    }

                    spin_sleep::sleep(period);
                }
            })?;

        info!("DummyGlasses : listening on {}", addr);
        Ok(DummyGlasses {
            handle: Some(handle),
            tx,
            addr,
            keepalives,
            samples,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Subscription requests received so far.
    pub fn keepalives(&self) -> u64 {
        self.keepalives.load(Ordering::Relaxed)
    }

    pub fn samples_sent(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn set_noise(&self, noise: f64) {
        let _ = self.tx.send(Signal::Noise(noise));
    }

    pub fn stop(&mut self) {
        let _ = self.tx.send(Signal::Stop);
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                warn!("DummyGlasses : thread panicked");
            }
            info!("DummyGlasses : terminated.");
        }
    }
}

impl Drop for DummyGlasses {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Subscription {
    Data,
    /// Any other stream. The video comes from the camera, not from us.
    Other,
}

fn subscription(packet: &[u8]) -> Option<Subscription> {
    let value = serde_json::from_slice::<Value>(packet).ok()?;
    if value.get("op").and_then(Value::as_str) != Some("start") {
        return None;
    }
    match value.get("type").and_then(Value::as_str) {
        Some("live.data.unicast") => Some(Subscription::Data),
        _ => Some(Subscription::Other),
    }
}

fn send(socket: &UdpSocket, packet: &Value, peer: SocketAddr) {
    if let Err(e) = socket.send_to(packet.to_string().as_bytes(), peer) {
        debug!("DummyGlasses : send to {} failed: {}", peer, e);
    }
}

/// Where the simulated wearer looks, in order, one point per fixation.
pub fn simulated_fixations() -> Vec<(f64, f64)> {
    fixation_points(8, 0.3)
}

/// `n` points evenly spaced on a circle around the image centre, in
/// normalized image coordinates.
fn fixation_points(n: usize, radius: f64) -> Vec<(f64, f64)> {
    (0..n.max(1))
        .map(|v| (v as f64 / n.max(1) as f64) * 2.0 * PI)
        .map(|angle| (0.5 + angle.cos() * radius, 0.5 + angle.sin() * radius))
        .collect()
}

/// Synthetic scene camera: flat frames whose brightness steps with the frame
/// index, delivered in real time.
pub struct TestPatternDecoder {
    shape: FrameShape,
    frame_rate: f64,
    limit: Option<u64>,
    emitted: u64,
    /// Frame slot on the epoch's clock that goes out next.
    next_index: u64,
    epoch: Option<Instant>,
}

impl TestPatternDecoder {
    pub fn new(shape: FrameShape, frame_rate: f64) -> Self {
        Self {
            shape,
            frame_rate: frame_rate.max(1.0),
            limit: None,
            emitted: 0,
            next_index: 0,
            epoch: None,
        }
    }

    /// End the stream after `frames` frames.
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Count presentation time from `epoch` instead of from the first frame.
    /// A camera that is switched on late starts at the frame that is due
    /// now.
    pub fn with_epoch(mut self, epoch: Instant) -> Self {
        self.epoch = Some(epoch);
        self
    }
}

impl FrameDecoder for TestPatternDecoder {
    fn shape(&self) -> FrameShape {
        self.shape
    }

    fn decode_into(&mut self, buf: &mut [u8]) -> Result<Option<f64>, DecodeError> {
        if self.limit.map_or(false, |limit| self.emitted >= limit) {
            return Ok(None);
        }

        let epoch = match self.epoch {
            Some(epoch) => epoch,
            None => {
                let now = Instant::now();
                self.epoch = Some(now);
                now
            }
        };
        if self.emitted == 0 {
            self.next_index = (epoch.elapsed().as_secs_f64() * self.frame_rate).floor() as u64;
        }

        let pts_ms = self.next_index as f64 * 1000.0 / self.frame_rate;
        let due = epoch + Duration::from_secs_f64(pts_ms / 1000.0);
        let now = Instant::now();
        if due > now {
            spin_sleep::sleep(due - now);
        }

        buf.fill((self.emitted % 256) as u8);
        self.emitted += 1;
        self.next_index += 1;
        Ok(Some(pts_ms))
    }
}
