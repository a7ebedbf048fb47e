//! Concrete transports
//!
//! - [`TcpTransport`]: networked sensor, native socket read timeouts
//! - [`ReaderTransport`]: serial port (opened at the configured baud rate),
//!   capture file or stdin, read on a helper thread so `read_line` can honour
//!   its timeout

use crate::error::{ConnectionError, LinkError};
use crate::link::{LinkOptions, LinkTarget, Transport};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Lines buffered between the reader thread and the consumer
const READER_CHANNEL_CAPACITY: usize = 1024;

/// Read timeout of a serial port; bounds how long a closed link's reader thread lingers
const SERIAL_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Smallest socket timeout; a zero timeout would block forever
const MIN_SOCKET_TIMEOUT: Duration = Duration::from_millis(1);

fn line_from_bytes(mut bytes: Vec<u8>) -> String {
    while matches!(bytes.last(), Some(b'\n' | b'\r')) {
        bytes.pop();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Line transport over a TCP connection
#[derive(Debug, Default)]
pub struct TcpTransport {
    reader: Option<BufReader<TcpStream>>,
    partial: Vec<u8>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, target: &LinkTarget, options: &LinkOptions) -> Result<(), ConnectionError> {
        let LinkTarget::Tcp(addr) = target else {
            return Err(ConnectionError::InvalidTarget(format!(
                "{target} is not a TCP address"
            )));
        };

        let open_err = |source: io::Error| ConnectionError::Open {
            target: target.to_string(),
            source,
        };

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "address did not resolve");
        for socket_addr in addr.to_socket_addrs().map_err(open_err)? {
            match TcpStream::connect_timeout(&socket_addr, options.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).map_err(open_err)?;
                    self.reader = Some(BufReader::new(stream));
                    self.partial.clear();
                    return Ok(());
                }
                Err(e) => last_err = e,
            }
        }
        Err(open_err(last_err))
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let reader = self.reader.as_mut().ok_or(LinkError::NotOpen)?;
        reader
            .get_ref()
            .set_read_timeout(Some(timeout.max(MIN_SOCKET_TIMEOUT)))?;

        // A timeout mid-line leaves the bytes read so far in `partial`
        match reader.read_until(b'\n', &mut self.partial) {
            // Peer closed after an unterminated last line; report it before the close
            Ok(0) if !self.partial.is_empty() => {
                Ok(Some(line_from_bytes(std::mem::take(&mut self.partial))))
            }
            Ok(0) => Err(LinkError::Closed),
            Ok(_) if self.partial.ends_with(b"\n") => {
                Ok(Some(line_from_bytes(std::mem::take(&mut self.partial))))
            }
            Ok(_) => Ok(None),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(LinkError::Io(e)),
        }
    }

    fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.get_ref().shutdown(std::net::Shutdown::Both);
        }
        self.partial.clear();
    }
}

#[derive(Debug)]
enum ReaderEvent {
    Line(String),
    Eof,
    Failed(io::Error),
}

/// Line transport over any blocking reader, pumped by a helper thread
///
/// End of input is terminal for regular files and stdin; for serial ports it
/// is treated as a lost link so the manager reopens the port.
#[derive(Debug, Default)]
pub struct ReaderTransport {
    rx: Option<Receiver<ReaderEvent>>,
    closed: Arc<AtomicBool>,
    eof_is_terminal: bool,
}

impl ReaderTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start pumping lines from an already opened reader
    ///
    /// Read timeouts from `reader` are retried; a line split across them is
    /// kept whole.
    pub fn attach<R: Read + Send + 'static>(&mut self, reader: R, eof_is_terminal: bool) {
        self.closed.store(true, Ordering::Relaxed);
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(READER_CHANNEL_CAPACITY);
        let watched = Arc::clone(&closed);
        thread::spawn(move || pump(BufReader::new(reader), tx, &watched));
        self.rx = Some(rx);
        self.closed = closed;
        self.eof_is_terminal = eof_is_terminal;
    }
}

fn pump<R: BufRead>(mut reader: R, tx: SyncSender<ReaderEvent>, closed: &AtomicBool) {
    let mut buf = Vec::new();
    loop {
        if closed.load(Ordering::Relaxed) {
            return;
        }
        let event = match reader.read_until(b'\n', &mut buf) {
            Ok(0) if buf.is_empty() => ReaderEvent::Eof,
            Ok(_) => ReaderEvent::Line(line_from_bytes(std::mem::take(&mut buf))),
            Err(e) if is_timeout(&e) => continue,
            Err(e) => ReaderEvent::Failed(e),
        };
        let stop = !matches!(event, ReaderEvent::Line(_));
        if tx.send(event).is_err() || stop {
            return;
        }
    }
}

impl Transport for ReaderTransport {
    fn open(&mut self, target: &LinkTarget, options: &LinkOptions) -> Result<(), ConnectionError> {
        match target {
            LinkTarget::Stdin => {
                self.attach(io::stdin(), true);
                Ok(())
            }
            LinkTarget::Device(path) => {
                let open_err = |source: io::Error| ConnectionError::Open {
                    target: target.to_string(),
                    source,
                };
                if fs::metadata(path).map_err(open_err)?.is_file() {
                    let file = File::open(path).map_err(open_err)?;
                    debug!(path = %path.display(), "replaying capture file");
                    self.attach(file, true);
                } else {
                    let port = serialport::new(path.to_string_lossy(), options.baud)
                        .timeout(SERIAL_POLL_TIMEOUT)
                        .open()
                        .map_err(|e| open_err(io::Error::from(e)))?;
                    debug!(path = %path.display(), baud = options.baud, "opened serial port");
                    self.attach(port, false);
                }
                Ok(())
            }
            LinkTarget::Tcp(_) => Err(ConnectionError::InvalidTarget(format!(
                "{target} needs a TCP transport"
            ))),
        }
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let rx = self.rx.as_ref().ok_or(LinkError::NotOpen)?;
        let end = || {
            if self.eof_is_terminal {
                LinkError::EndOfStream
            } else {
                LinkError::Closed
            }
        };
        match rx.recv_timeout(timeout) {
            Ok(ReaderEvent::Line(line)) => Ok(Some(line)),
            Ok(ReaderEvent::Eof) => Err(end()),
            Ok(ReaderEvent::Failed(e)) => Err(LinkError::Io(e)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(end()),
        }
    }

    fn close(&mut self) {
        // The helper thread exits after its current read
        self.closed.store(true, Ordering::Relaxed);
        self.rx = None;
    }
}

/// Transport suited to a target
pub fn transport_for(target: &LinkTarget) -> Box<dyn Transport + Send> {
    match target {
        LinkTarget::Tcp(_) => Box::new(TcpTransport::new()),
        LinkTarget::Device(_) | LinkTarget::Stdin => Box::new(ReaderTransport::new()),
    }
}
