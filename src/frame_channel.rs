//! Hands decoded video frames from a decoder thread to the control loop.
//!
//! The decoder writes into a small pool of preallocated slots. Slot indices
//! travel between the two threads over two bounded channels: a free list the
//! decoder takes from, and a ready queue the consumer takes from. Whoever
//! holds an index owns that slot, so a slot is never written while it is
//! being copied out. When the decoder finds no free slot it still decodes
//! (the stream has to advance) but throws the frame away; it never waits on
//! a slow consumer.

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// How often a blocked [`FrameChannel::read`] looks at the stop flag.
const READ_POLL: Duration = Duration::from_millis(50);

/// Dimensions of a packed 8-bit frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct FrameShape {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl FrameShape {
    pub fn byte_len(&self) -> usize {
        self.width * self.height * self.channels
    }
}

impl Default for FrameShape {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            channels: 3,
        }
    }
}

/// A frame owned by the consumer. Never backed by a pool slot.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub pixels: Vec<u8>,
    pub shape: FrameShape,
    /// Presentation time in milliseconds.
    pub pts_ms: f64,
}

/// Errors a decoder may report. End of stream is not one of them.
#[derive(Debug)]
pub enum DecodeError {
    /// Starting the decoder failed.
    Spawn(io::Error),

    /// Reading from the decoder failed.
    Io(io::Error),

    /// The decoder has no output pipe to read frames from.
    NoOutput,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::Spawn(error) => write!(f, "could not start decoder: {}", error),
            DecodeError::Io(error) => write!(f, "decoder io error: {}", error),
            DecodeError::NoOutput => write!(f, "decoder has no output"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// The video decoding capability.
pub trait FrameDecoder: Send {
    /// The shape of every frame this decoder produces.
    fn shape(&self) -> FrameShape;

    /// Decode the next frame into `buf`, which is exactly
    /// `self.shape().byte_len()` long, and return its presentation time in
    /// milliseconds. `Ok(None)` means the stream has ended.
    fn decode_into(&mut self, buf: &mut [u8]) -> Result<Option<f64>, DecodeError>;

    /// Something another thread can call to make a blocked
    /// [`FrameDecoder::decode_into`] return. Decoders that never block for
    /// long don't need one.
    fn interrupter(&self) -> Option<Interrupt> {
        None
    }
}

pub type Interrupt = Arc<dyn Fn() + Send + Sync>;

/// Stops a [`FrameChannel`] from any thread, including one the channel's
/// consumer is blocked on.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    interrupt: Option<Interrupt>,
}

impl StopHandle {
    /// Ask the decoder thread to exit and wake up anyone blocked in
    /// [`FrameChannel::read`]. Does not wait for the thread.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(interrupt) = self.interrupt.as_ref() {
            interrupt();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum FrameChannelError {
    AlreadyStarted,
    Spawn(io::Error),
}

impl fmt::Display for FrameChannelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameChannelError::AlreadyStarted => write!(f, "frame channel already started"),
            FrameChannelError::Spawn(error) => write!(f, "could not spawn decoder thread: {}", error),
        }
    }
}

impl std::error::Error for FrameChannelError {}

/// Snapshot of the channel's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub decoded: u64,
    pub delivered: u64,
    pub dropped: u64,
    /// Most slots ever out of the free list at once.
    pub peak_in_use: usize,
}

#[derive(Debug, Default)]
struct Counters {
    decoded: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
}

impl Counters {
    fn acquire(&self) {
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_use.fetch_max(now, Ordering::SeqCst);
    }

    fn release(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }

    fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

type Slots = Arc<Vec<Mutex<Vec<u8>>>>;

/// Bounded, copy-out frame pipeline between a decoder thread and one
/// consumer.
pub struct FrameChannel {
    shape: FrameShape,
    slots: Slots,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    interrupt: Option<Interrupt>,
    decoder: Option<Box<dyn FrameDecoder>>,
    ready_rx: Option<Receiver<(usize, f64)>>,
    free_tx: Option<SyncSender<usize>>,
    handle: Option<JoinHandle<()>>,
}

impl FrameChannel {
    /// Preallocate `pool_size` slots (at least one) shaped for `decoder`.
    pub fn new(decoder: impl FrameDecoder + 'static, pool_size: usize) -> Self {
        let shape = decoder.shape();
        let slots = (0..pool_size.max(1))
            .map(|_| Mutex::new(vec![0u8; shape.byte_len()]))
            .collect();

        Self {
            shape,
            slots: Arc::new(slots),
            counters: Arc::new(Counters::default()),
            stop: Arc::new(AtomicBool::new(false)),
            interrupt: decoder.interrupter(),
            decoder: Some(Box::new(decoder)),
            ready_rx: None,
            free_tx: None,
            handle: None,
        }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// Start decoding on a dedicated thread.
    pub fn start(&mut self) -> Result<(), FrameChannelError> {
        let decoder = self.decoder.take().ok_or(FrameChannelError::AlreadyStarted)?;
        let n = self.slots.len();

        let (free_tx, free_rx) = mpsc::sync_channel(n);
        let (ready_tx, ready_rx) = mpsc::sync_channel(n);
        for i in 0..n {
            // cannot block, the channel holds exactly `n`
            let _ = free_tx.send(i);
        }

        let worker = DecodeWorker {
            decoder,
            slots: Arc::clone(&self.slots),
            counters: Arc::clone(&self.counters),
            stop: Arc::clone(&self.stop),
            free_rx,
            free_tx: free_tx.clone(),
            ready_tx,
        };

        let handle = thread::Builder::new()
            .name("frame-decoder".to_string())
            .spawn(move || worker.run())
            .map_err(FrameChannelError::Spawn)?;

        self.handle = Some(handle);
        self.ready_rx = Some(ready_rx);
        self.free_tx = Some(free_tx);
        Ok(())
    }

    /// Wait for the next decoded frame and return a copy of the freshest one
    /// available. Returns `None` once the decoder has exited and nothing is
    /// left to read, once the channel has been stopped, or if it was never
    /// started.
    pub fn read(&mut self) -> Option<VideoFrame> {
        let ready_rx = self.ready_rx.as_ref()?;
        let first = loop {
            if self.stop.load(Ordering::SeqCst) {
                return None;
            }
            match ready_rx.recv_timeout(READ_POLL) {
                Ok(first) => break first,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        };
        Some(self.take_freshest(first))
    }

    /// Like [`FrameChannel::read`], but returns `None` immediately when no
    /// new frame is ready.
    pub fn try_read(&mut self) -> Option<VideoFrame> {
        let first = self.ready_rx.as_ref()?.try_recv().ok()?;
        Some(self.take_freshest(first))
    }

    fn take_freshest(&self, first: (usize, f64)) -> VideoFrame {
        let mut newest = first;
        if let Some(ready_rx) = self.ready_rx.as_ref() {
            while let Ok(next) = ready_rx.try_recv() {
                self.release(newest.0);
                self.counters.dropped();
                newest = next;
            }
        }

        let (slot, pts_ms) = newest;
        let pixels = self.slots[slot]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.release(slot);
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);

        VideoFrame {
            pixels,
            shape: self.shape,
            pts_ms,
        }
    }

    fn release(&self, slot: usize) {
        self.counters.release();
        if let Some(free_tx) = self.free_tx.as_ref() {
            // the decoder may already be gone, in which case nobody needs it
            let _ = free_tx.try_send(slot);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            decoded: self.counters.decoded.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            peak_in_use: self.counters.peak_in_use.load(Ordering::SeqCst),
        }
    }

    /// A handle that stops this channel from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
            interrupt: self.interrupt.clone(),
        }
    }

    /// Tell the decoder thread to exit and wait for it. Frames still queued
    /// are discarded.
    pub fn stop(&mut self) {
        self.stop_handle().stop();

        // unblock a decoder waiting on a full ready queue
        if let Some(ready_rx) = self.ready_rx.as_ref() {
            while let Ok((slot, _)) = ready_rx.try_recv() {
                self.release(slot);
                self.counters.dropped();
            }
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("FrameChannel : decoder thread panicked");
            }
        }

        if let Some(ready_rx) = self.ready_rx.as_ref() {
            while let Ok((slot, _)) = ready_rx.try_recv() {
                self.release(slot);
                self.counters.dropped();
            }
        }
    }
}

impl Drop for FrameChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DecodeWorker {
    decoder: Box<dyn FrameDecoder>,
    slots: Slots,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    free_rx: Receiver<usize>,
    free_tx: SyncSender<usize>,
    ready_tx: SyncSender<(usize, f64)>,
}

impl DecodeWorker {
    fn give_back(&self, slot: usize) {
        self.counters.release();
        let _ = self.free_tx.try_send(slot);
    }

    fn run(mut self) {
        let mut scratch = Vec::new();

        while !self.stop.load(Ordering::SeqCst) {
            let slot = self.free_rx.try_recv().ok();

            let decoded = match slot {
                Some(i) => {
                    self.counters.acquire();
                    let mut buf = self.slots[i].lock().unwrap_or_else(PoisonError::into_inner);
                    self.decoder.decode_into(&mut buf)
                }
                None => {
                    scratch.resize(self.decoder.shape().byte_len(), 0);
                    self.decoder.decode_into(&mut scratch)
                }
            };

            match decoded {
                Ok(Some(pts_ms)) => {
                    self.counters.decoded.fetch_add(1, Ordering::Relaxed);
                    let Some(i) = slot else {
                        debug!("FrameChannel : no free slot, dropping frame at {}ms", pts_ms);
                        self.counters.dropped();
                        continue;
                    };
                    match self.ready_tx.try_send((i, pts_ms)) {
                        Ok(()) => {}
                        Err(TrySendError::Full((i, _))) => {
                            debug!("FrameChannel : ready queue full, dropping frame at {}ms", pts_ms);
                            self.counters.dropped();
                            self.give_back(i);
                        }
                        Err(TrySendError::Disconnected((i, _))) => {
                            self.counters.dropped();
                            self.give_back(i);
                            break;
                        }
                    }
                }
                Ok(None) => {
                    info!("FrameChannel : end of stream");
                    if let Some(i) = slot {
                        self.give_back(i);
                    }
                    break;
                }
                Err(e) => {
                    error!("FrameChannel : decoder failed: {}", e);
                    if let Some(i) = slot {
                        self.give_back(i);
                    }
                    break;
                }
            }
        }

        info!("FrameChannel : decoder terminated.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const SHAPE: FrameShape = FrameShape {
        width: 16,
        height: 8,
        channels: 3,
    };

    /// Fills every frame with its own index, so a torn or recycled slot
    /// shows up as mixed bytes.
    struct CountingDecoder {
        next: u64,
        limit: Option<u64>,
        delay: Duration,
    }

    impl CountingDecoder {
        fn new(limit: Option<u64>, delay: Duration) -> Self {
            Self {
                next: 0,
                limit,
                delay,
            }
        }
    }

    impl FrameDecoder for CountingDecoder {
        fn shape(&self) -> FrameShape {
            SHAPE
        }

        fn decode_into(&mut self, buf: &mut [u8]) -> Result<Option<f64>, DecodeError> {
            if self.limit.map_or(false, |limit| self.next >= limit) {
                return Ok(None);
            }
            thread::sleep(self.delay);
            for (k, b) in buf.iter_mut().enumerate() {
                // write in two passes so a concurrent reader could catch it half done
                if k % 2 == 0 {
                    *b = self.next as u8;
                }
            }
            for (k, b) in buf.iter_mut().enumerate() {
                if k % 2 == 1 {
                    *b = self.next as u8;
                }
            }
            let pts = self.next as f64 * 40.0;
            self.next += 1;
            Ok(Some(pts))
        }
    }

    struct FailingDecoder;

    impl FrameDecoder for FailingDecoder {
        fn shape(&self) -> FrameShape {
            SHAPE
        }

        fn decode_into(&mut self, _buf: &mut [u8]) -> Result<Option<f64>, DecodeError> {
            Err(DecodeError::NoOutput)
        }
    }

    /// Serves one frame, then blocks like a dead network stream until it is
    /// interrupted.
    struct StallingDecoder {
        served: bool,
        wake_rx: Receiver<()>,
        wake_tx: Arc<Mutex<mpsc::Sender<()>>>,
    }

    impl StallingDecoder {
        fn new() -> Self {
            let (wake_tx, wake_rx) = mpsc::channel();
            Self {
                served: false,
                wake_rx,
                wake_tx: Arc::new(Mutex::new(wake_tx)),
            }
        }
    }

    impl FrameDecoder for StallingDecoder {
        fn shape(&self) -> FrameShape {
            SHAPE
        }

        fn decode_into(&mut self, buf: &mut [u8]) -> Result<Option<f64>, DecodeError> {
            if !self.served {
                self.served = true;
                buf.fill(0);
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

    fn assert_whole(frame: &VideoFrame) {
        let expected = (frame.pts_ms / 40.0) as u64 as u8;
        assert_eq!(frame.pixels.len(), SHAPE.byte_len());
        assert!(frame.pixels.iter().all(|&b| b == expected));
    }

    #[test]
    fn test_fast_consumer_sees_ordered_frames() {
        let mut channel = FrameChannel::new(
            CountingDecoder::new(Some(20), Duration::from_millis(2)),
            3,
        );
        channel.start().unwrap();

        let mut last_pts = -1.0;
        while let Some(frame) = channel.read() {
            assert_whole(&frame);
            assert!(frame.pts_ms > last_pts);
            last_pts = frame.pts_ms;
        }

        let stats = channel.stats();
        assert_eq!(stats.decoded, 20);
        assert_eq!(stats.delivered + stats.dropped, 20);
        assert!(stats.delivered > 0);
        assert!(stats.peak_in_use <= 3);
    }

    #[test]
    fn test_slow_consumer_forces_drops() {
        let mut channel = FrameChannel::new(CountingDecoder::new(Some(300), Duration::ZERO), 2);
        channel.start().unwrap();

        let mut reads = 0;
        while let Some(frame) = channel.read() {
            assert_whole(&frame);
            reads += 1;
            thread::sleep(Duration::from_millis(3));
        }

        let stats = channel.stats();
        assert_eq!(stats.delivered, reads);
        assert_eq!(stats.decoded, 300);
        assert_eq!(stats.delivered + stats.dropped, stats.decoded);
        assert!(stats.dropped > 0);
        assert!(stats.peak_in_use <= 2);
    }

    #[test]
    fn test_end_of_stream() {
        let mut channel = FrameChannel::new(CountingDecoder::new(Some(0), Duration::ZERO), 1);
        channel.start().unwrap();
        assert_eq!(channel.read(), None);
        assert_eq!(channel.read(), None);
    }

    #[test]
    fn test_decoder_failure() {
        let mut channel = FrameChannel::new(FailingDecoder, 1);
        channel.start().unwrap();
        assert_eq!(channel.read(), None);
        assert_eq!(channel.stats().decoded, 0);
    }

    #[test]
    fn test_not_started() {
        let mut channel = FrameChannel::new(FailingDecoder, 1);
        assert_eq!(channel.try_read(), None);
        assert_eq!(channel.read(), None);
    }

    #[test]
    fn test_start_twice() {
        let mut channel = FrameChannel::new(CountingDecoder::new(Some(1), Duration::ZERO), 1);
        channel.start().unwrap();
        assert!(matches!(
            channel.start(),
            Err(FrameChannelError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_stop_endless_stream() {
        let mut channel = FrameChannel::new(
            CountingDecoder::new(None, Duration::from_millis(1)),
            2,
        );
        channel.start().unwrap();
        assert!(channel.read().is_some());
        assert!(channel.is_running());

        channel.stop();
        assert!(!channel.is_running());
        assert_eq!(channel.read(), None);

        let stats = channel.stats();
        assert_eq!(stats.delivered + stats.dropped, stats.decoded);
    }

    #[test]
    fn test_stop_handle_unblocks_read() {
        let mut channel = FrameChannel::new(StallingDecoder::new(), 2);
        channel.start().unwrap();
        assert!(channel.read().is_some());

        let handle = channel.stop_handle();
        assert!(!handle.is_stopped());
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.stop();
        });

        let started = Instant::now();
        assert_eq!(channel.read(), None);
        assert!(started.elapsed() < Duration::from_secs(1));
        stopper.join().unwrap();

        // the decoder was woken up, so joining it does not hang either
        channel.stop();
        assert!(!channel.is_running());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(channel.stop_handle().is_stopped());
    }
}
