//! Keeps a unicast live-stream subscription open on the glasses.
//!
//! The glasses only keep streaming to a client that keeps asking for it, so
//! each stream gets its own [`KeepAlive`] that repeats the start request on a
//! timer until it is stopped.

use log::{info, warn};
use serde_json::json;
use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::Duration,
};

/// Which of the two live streams a subscription is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Data,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Data => write!(f, "data"),
        }
    }
}

/// The start request for `kind`, as it goes on the wire.
pub fn subscription_request(kind: StreamKind) -> Vec<u8> {
    json!({
        "op": "start",
        "type": format!("live.{}.unicast", kind),
        "key": "anything",
    })
    .to_string()
    .into_bytes()
}

/// The any-address of `peer`'s family, on a port the OS picks.
pub fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

/// Somewhere we can send datagrams to.
pub trait DatagramSink: Send + Sync {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize>;
}

impl DatagramSink for UdpSocket {
    fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, peer)
    }
}

enum Signal {
    Stop,
}

/// A running keepalive. Stops on [`KeepAlive::stop`] or when dropped.
pub struct KeepAlive {
    kind: StreamKind,
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
}

impl KeepAlive {
    /// Send the start request for `kind` to `peer` right away, then again
    /// every `interval` on a background thread. Only the first send can
    /// fail the call; later failures are logged and retried next tick.
    pub fn start<S>(
        transport: Arc<S>,
        peer: SocketAddr,
        kind: StreamKind,
        interval: Duration,
    ) -> io::Result<Self>
    where
        S: DatagramSink + ?Sized + 'static,
    {
        let request = subscription_request(kind);
        transport.send_to(&request, peer)?;

        let (tx, rx) = mpsc::channel::<Signal>();
        let handle = thread::Builder::new()
            .name(format!("keepalive-{}", kind))
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = transport.send_to(&request, peer) {
                            warn!("KeepAlive({}) : send to {} failed: {}", kind, peer, e);
                        }
                    }
                    Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!("KeepAlive({}) : subscribed to {}", kind, peer);
        Ok(Self {
            kind,
            handle: Some(handle),
            tx,
        })
    }

    /// Like [`KeepAlive::start`], on a socket of its own. For streams we
    /// don't read through that socket, such as the video, which arrives
    /// over RTSP.
    pub fn subscribe(peer: SocketAddr, kind: StreamKind, interval: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(unspecified_for(peer))?;
        Self::start(Arc::new(socket), peer, kind, interval)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn stop(&mut self) {
        let _ = self.tx.send(Signal::Stop);
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                warn!("KeepAlive({}) : sender thread panicked", self.kind);
            }
            info!("KeepAlive({}) : terminated.", self.kind);
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}
