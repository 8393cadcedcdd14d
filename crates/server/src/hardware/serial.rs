//! Serial-port backed hardware
//!
//! USB-serial adapters and NMEA receivers are both plain serial ports opened
//! 8N1 without flow control through the `serialport` crate.

use super::{NmeaListener, NmeaSource, SerialLink, SerialOpener};
use crate::error::{AssetError, AssetResult};
use common::ThreadGroup;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Device read timeout; bounds how long a reader holds the device lock
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

pub const WRITE_TIMEOUT: Duration = Duration::from_millis(50);

/// Size of a single device read
pub const READ_BUFFER_SIZE: usize = 2048;

/// Longest frame kept while waiting for a delimiter
pub const MAX_FRAME_LEN: usize = 64 * 1024;

fn open_port(path: &str, baud: u32) -> AssetResult<Box<dyn SerialPort>> {
    serialport::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()
        .map_err(|e| AssetError::HardwareUnavailable(format!("{}: {}", path, e)))
}

/// Opens real serial devices
pub struct SystemSerial;

impl SerialOpener for SystemSerial {
    fn open(&self, path: &str, baud: u32) -> AssetResult<Box<dyn SerialLink>> {
        let port = open_port(path, baud)?;
        info!("Opened serial port: {} at {} baud", path, baud);
        Ok(Box::new(SystemLink { port }))
    }
}

struct SystemLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for SystemLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.set_timeout(WRITE_TIMEOUT)?;
        let result = self.port.write_all(data).and_then(|_| self.port.flush());
        self.port.set_timeout(READ_TIMEOUT)?;
        result
    }
}

/// Splits a byte stream into frames on a single delimiter byte
///
/// Delimiters are not part of a frame and empty frames are skipped. A frame
/// that grows past its limit without a delimiter is emitted as is.
#[derive(Debug, Clone)]
pub struct FrameSplitter {
    delimiter: u8,
    max_len: usize,
    pending: Vec<u8>,
}

impl FrameSplitter {
    pub fn new(delimiter: u8) -> Self {
        Self::with_limit(delimiter, MAX_FRAME_LEN)
    }

    pub fn with_limit(delimiter: u8, max_len: usize) -> Self {
        Self {
            delimiter,
            max_len: max_len.max(1),
            pending: Vec::new(),
        }
    }

    /// Feed bytes and collect every frame they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if byte == self.delimiter {
                if !self.pending.is_empty() {
                    frames.push(std::mem::take(&mut self.pending));
                }
                continue;
            }
            self.pending.push(byte);
            if self.pending.len() >= self.max_len {
                frames.push(std::mem::take(&mut self.pending));
            }
        }
        frames
    }

    /// Bytes received after the last delimiter
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

/// NMEA receiver on a serial port
pub struct SerialNmeaSource {
    path: String,
    baud: u32,
    threads: Option<ThreadGroup>,
}

impl SerialNmeaSource {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            threads: None,
        }
    }
}

impl NmeaSource for SerialNmeaSource {
    fn register(&mut self, listener: NmeaListener) -> AssetResult<()> {
        let mut port = open_port(&self.path, self.baud)?;
        info!("Opened NMEA receiver {} at {} baud", self.path, self.baud);

        let mut group = ThreadGroup::new("gnss-receiver");
        let path = self.path.clone();
        group
            .spawn("gnss-receiver", move |token| {
                let mut splitter = FrameSplitter::new(b'\n');
                let mut buf = [0u8; READ_BUFFER_SIZE];
                while !token.is_cancelled() {
                    let n = match port.read(&mut buf) {
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                        Err(e) => {
                            warn!("NMEA receiver {} failed: {}", path, e);
                            break;
                        }
                    };
                    for frame in splitter.push(&buf[..n]) {
                        let sentence = String::from_utf8_lossy(&frame);
                        let sentence = sentence.trim_end_matches('\r');
                        if sentence.starts_with('$') {
                            listener(sentence.to_string());
                        } else {
                            debug!("Skipping non-NMEA line from {}", path);
                        }
                    }
                }
            })
            .map_err(|e| AssetError::Internal(format!("spawn gnss receiver: {}", e)))?;

        self.threads = Some(group);
        Ok(())
    }

    fn unregister(&mut self) {
        if let Some(mut group) = self.threads.take() {
            group.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_drops_delimiters_and_empty_frames() {
        let mut splitter = FrameSplitter::new(b',');
        let frames = splitter.push(b"a,,bc,");
        assert_eq!(frames, vec![b"a".to_vec(), b"bc".to_vec()]);
        assert!(splitter.pending().is_empty());
    }

    #[test]
    fn test_splitter_keeps_partial_frame() {
        let mut splitter = FrameSplitter::new(b'\n');
        assert!(splitter.push(b"hel").is_empty());
        assert_eq!(splitter.pending(), b"hel");
        assert_eq!(splitter.push(b"lo\nwo"), vec![b"hello".to_vec()]);
        assert_eq!(splitter.pending(), b"wo");
    }

    #[test]
    fn test_splitter_flushes_oversized_frame() {
        let mut splitter = FrameSplitter::with_limit(b'\n', 4);
        assert_eq!(splitter.push(b"abcdef"), vec![b"abcd".to_vec()]);
        assert_eq!(splitter.pending(), b"ef");
    }

    #[test]
    fn test_open_missing_device_is_unavailable() {
        let result = SystemSerial.open("/dev/does-not-exist-hermes", 9600);
        assert!(matches!(result, Err(AssetError::HardwareUnavailable(_))));
    }
}
