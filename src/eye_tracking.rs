//! The data-stream side of the glasses: one UDP socket that both keeps the
//! subscription alive and receives the telemetry it produces.

use crate::{
    keepalive::{unspecified_for, KeepAlive, StreamKind},
    stream_sync::StreamSync,
    telemetry::TelemetryEvent,
};
use log::{debug, error, warn};
use std::{
    io::{self, ErrorKind},
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    time::Duration,
};

/// Largest datagram the glasses send is well under this.
const MAX_DATAGRAM: usize = 2048;

pub struct EyeTracking {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    keepalive: KeepAlive,
    buf: Vec<u8>,
}

impl EyeTracking {
    /// Subscribe to the data stream at `peer`, repeating the request every
    /// `interval`. The glasses answer to whatever port the request came
    /// from, so the keepalive goes out on the socket we read from.
    pub fn start(peer: SocketAddr, interval: Duration) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(unspecified_for(peer))?);
        socket.set_nonblocking(true)?;

        let keepalive = KeepAlive::start(Arc::clone(&socket), peer, StreamKind::Data, interval)?;

        Ok(Self {
            socket,
            peer,
            keepalive,
            buf: vec![0; MAX_DATAGRAM],
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Move everything that has arrived so far into `sync` without waiting.
    /// Returns how many packets were read, including ones that were skipped.
    pub fn read_into(&mut self, sync: &mut StreamSync) -> usize {
        let mut count = 0;
        loop {
            let len = match self.socket.recv_from(&mut self.buf) {
                Ok((len, _)) => len,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("EyeTracking : receive failed: {}", e);
                    break;
                }
            };
            count += 1;

            match TelemetryEvent::from_bytes(&self.buf[..len]) {
                Ok(TelemetryEvent::Other(value)) => {
                    if value.get("marker2d").is_some() {
                        debug!("EyeTracking : marker2d {}", value);
                    }
                }
                Ok(event) => sync.add_telemetry(event),
                Err(e) => warn!("EyeTracking : dropping packet: {}", e),
            }
        }
        count
    }

    pub fn stop(&mut self) {
        self.keepalive.stop();
    }
}
