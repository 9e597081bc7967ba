//! Framed request/response transport to one model endpoint, plus the async
//! push path interrupts arrive on (§4.A).
//!
//! There is no async runtime here: the trap handler blocks the faulting
//! thread synchronously inside [`Transport::send`], so there is nothing to
//! yield to. A background thread owns the read half of the connection and
//! either completes the one in-flight [`Transport::send`] rendezvous or hands
//! a pushed `INTERRUPT` frame to the caller-supplied sink.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use icd3_protocol::{Command, Message, MESSAGE_LEN};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport connection lost")]
    Lost,
    #[error("no response within the configured timeout")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(#[from] icd3_protocol::DecodeError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl RawStream {
    fn try_clone(&self) -> io::Result<RawStream> {
        Ok(match self {
            RawStream::Tcp(s) => RawStream::Tcp(s.try_clone()?),
            RawStream::Unix(s) => RawStream::Unix(s.try_clone()?),
        })
    }

    fn shutdown(&self) {
        let _ = match self {
            RawStream::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            RawStream::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }
}

impl Read for RawStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RawStream::Tcp(s) => s.read(buf),
            RawStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for RawStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RawStream::Tcp(s) => s.write(buf),
            RawStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RawStream::Tcp(s) => s.flush(),
            RawStream::Unix(s) => s.flush(),
        }
    }
}

type PushSink = dyn Fn(u32, u32) + Send + Sync;

struct Rendezvous {
    slot: Mutex<Option<Message>>,
    cv: Condvar,
}

/// A connected endpoint. Every `send` is a full round trip: write the
/// request, then block until the reader thread delivers the matching
/// response or the timeout elapses. Only one request may be in flight at a
/// time, enforced by `call_lock`.
pub struct Transport {
    write_half: Mutex<RawStream>,
    call_lock: Mutex<()>,
    rendezvous: Arc<Rendezvous>,
    closed: Arc<AtomicBool>,
    timeout: Duration,
    reader: Option<JoinHandle<()>>,
    raw: RawStream,
}

/// Parses `endpoint` the way `EngineConfig` does: a string that parses as a
/// `host:port` socket address dials TCP, anything else is treated as a
/// filesystem path and dials a Unix domain socket.
fn dial(endpoint: &str) -> io::Result<RawStream> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        Ok(RawStream::Tcp(TcpStream::connect(addr)?))
    } else {
        Ok(RawStream::Unix(UnixStream::connect(endpoint)?))
    }
}

impl Transport {
    /// Connects to `endpoint` and starts the background reader thread.
    /// `on_push` is invoked from the reader thread whenever the model sends
    /// an `INTERRUPT` frame; it must not block.
    pub fn connect(
        endpoint: &str,
        timeout: Duration,
        on_push: impl Fn(u32, u32) + Send + Sync + 'static,
    ) -> Result<Transport, TransportError> {
        let stream = dial(endpoint)?;
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;

        let rendezvous = Arc::new(Rendezvous {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        });
        let closed = Arc::new(AtomicBool::new(false));
        let on_push: Arc<PushSink> = Arc::new(on_push);

        let reader = std::thread::Builder::new()
            .name("icd3-transport-reader".into())
            .spawn({
                let rendezvous = Arc::clone(&rendezvous);
                let closed = Arc::clone(&closed);
                move || reader_loop(read_half, rendezvous, closed, on_push)
            })
            .expect("spawning the transport reader thread");

        Ok(Transport {
            write_half: Mutex::new(write_half),
            call_lock: Mutex::new(()),
            rendezvous,
            closed,
            timeout,
            reader: Some(reader),
            raw: stream,
        })
    }

    /// Sends `request` and blocks for the matching response, up to the
    /// endpoint's configured timeout.
    pub fn send(&self, request: &Message) -> Result<Message, TransportError> {
        let _call_guard = self.call_lock.lock().unwrap();

        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Lost);
        }

        {
            let mut w = self.write_half.lock().unwrap();
            w.write_all(&request.encode())?;
        }

        let deadline = Instant::now() + self.timeout;
        let mut slot = self.rendezvous.slot.lock().unwrap();
        loop {
            if let Some(msg) = slot.take() {
                return Ok(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Lost);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            let (guard, result) = self
                .rendezvous
                .cv
                .wait_timeout(slot, deadline - now)
                .unwrap();
            slot = guard;
            if result.timed_out() && slot.is_none() {
                return Err(TransportError::Timeout);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.raw.shutdown();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

fn reader_loop(
    mut read_half: RawStream,
    rendezvous: Arc<Rendezvous>,
    closed: Arc<AtomicBool>,
    on_push: Arc<PushSink>,
) {
    let mut buf = [0u8; MESSAGE_LEN];
    loop {
        if let Err(err) = read_half.read_exact(&mut buf) {
            tracing::debug!(error = %err, "transport reader exiting");
            break;
        }
        match Message::decode(&buf) {
            Ok(msg) if msg.command == Command::Interrupt => {
                on_push(msg.device_id, msg.address);
            }
            Ok(msg) => {
                let mut slot = rendezvous.slot.lock().unwrap();
                *slot = Some(msg);
                rendezvous.cv.notify_all();
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed frame");
            }
        }
    }
    closed.store(true, Ordering::Release);
    rendezvous.cv.notify_all();
}
