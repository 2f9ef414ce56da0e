//! Where ratified detections and calibration status go.
//!
//! The actuator on the other end reads one CRLF-terminated token per line:
//! a marker id, or a calibration status code.

use log::info;
use serial2::SerialPort;
use std::{
    io::{self, Write},
    path::Path,
};

pub trait LineSink: Send {
    /// Write `token` followed by CRLF.
    fn write_line(&mut self, token: &str) -> io::Result<()>;
}

/// The usual sink: a serial port.
pub struct SerialSink {
    port: SerialPort,
}

impl SerialSink {
    pub fn open(path: impl AsRef<Path>, baud: u32) -> io::Result<Self> {
        let port = SerialPort::open(path.as_ref(), baud)?;
        info!(
            "SerialSink : opened {} at {} baud",
            path.as_ref().display(),
            baud
        );
        Ok(Self { port })
    }
}

impl LineSink for SerialSink {
    fn write_line(&mut self, token: &str) -> io::Result<()> {
        self.port.write_all(format!("{}\r\n", token).as_bytes())
    }
}

/// Used when no port was given: the tokens only show up in the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl LineSink for LogSink {
    fn write_line(&mut self, token: &str) -> io::Result<()> {
        info!("LogSink : {}", token);
        Ok(())
    }
}

/// Wraps any writer, e.g. a file or a pipe to another program.
pub struct WriterSink<W: Write + Send> {
    inner: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> LineSink for WriterSink<W> {
    fn write_line(&mut self, token: &str) -> io::Result<()> {
        write!(self.inner, "{}\r\n", token)?;
        self.inner.flush()
    }
}
