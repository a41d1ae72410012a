//! Duplex byte streams to the controller.
//!
//! Both channels are either TCP loopback or Unix domain sockets. Sockets
//! run non-blocking; readers poll with a short sleep on `WouldBlock` so
//! shutdown is always noticed, and writers retry partial writes with a
//! bounded backoff (10 ms × attempt, capped at 2 s). A failed write bumps
//! a counter and abandons the frame; it never tears the worker down.

use std::io::{self, IoSlice, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{IpcType, WorkerArgs};
use crate::daemon::metrics::Metrics;
use crate::error::Transience;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint `{raw}`: {reason}")]
    InvalidEndpoint { raw: String, reason: String },
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn transience(&self) -> Transience {
        match self {
            TransportError::InvalidEndpoint { .. } => Transience::Permanent,
            TransportError::Connect { .. } | TransportError::Io(_) => Transience::Retryable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn main_from_args(args: &WorkerArgs) -> Result<Self, TransportError> {
        Self::build(args, &args.port_or_uds)
    }

    pub fn feedback_from_args(args: &WorkerArgs) -> Result<Self, TransportError> {
        Self::build(args, &args.feedback_port_or_uds)
    }

    fn build(args: &WorkerArgs, raw: &str) -> Result<Self, TransportError> {
        match args.ipc_type {
            IpcType::AfUnix => Ok(Endpoint::Unix(PathBuf::from(raw))),
            IpcType::AfInet => {
                let port = raw
                    .parse::<u16>()
                    .map_err(|err| TransportError::InvalidEndpoint {
                        raw: raw.to_string(),
                        reason: err.to_string(),
                    })?;
                Ok(Endpoint::Tcp {
                    host: args.loopback_host().to_string(),
                    port,
                })
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Endpoint::Tcp { host, port } => format!("{host}:{port}"),
            Endpoint::Unix(path) => path.display().to_string(),
        }
    }
}

pub enum Conn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_PAUSE: Duration = Duration::from_millis(100);

impl Conn {
    /// Connect with a short retry loop: the controller listens before it
    /// spawns the worker, but the accept queue may lag at startup.
    pub fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let mut last = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(CONNECT_PAUSE);
            }
            let result = match endpoint {
                Endpoint::Tcp { host, port } => {
                    let addr = if host.contains(':') {
                        format!("[{host}]:{port}")
                    } else {
                        format!("{host}:{port}")
                    };
                    TcpStream::connect(addr).map(Conn::Tcp)
                }
                Endpoint::Unix(path) => UnixStream::connect(path).map(Conn::Unix),
            };
            match result {
                Ok(conn) => {
                    conn.set_nonblocking(true)?;
                    if let Conn::Tcp(stream) = &conn {
                        let _ = stream.set_nodelay(true);
                    }
                    return Ok(conn);
                }
                Err(err) => last = Some(err),
            }
        }
        Err(TransportError::Connect {
            endpoint: endpoint.describe(),
            source: last.unwrap_or_else(|| io::Error::other("no attempts made")),
        })
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Conn::Tcp(s) => s.try_clone().map(Conn::Tcp),
            Conn::Unix(s) => s.try_clone().map(Conn::Unix),
        }
    }

    fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        match self {
            Conn::Tcp(s) => s.set_nonblocking(on),
            Conn::Unix(s) => s.set_nonblocking(on),
        }
    }

    pub fn shutdown(&self) {
        match self {
            Conn::Tcp(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            Conn::Unix(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.read(buf),
            Conn::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.write(buf),
            Conn::Unix(s) => s.write(buf),
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Conn::Tcp(s) => s.write_vectored(bufs),
            Conn::Unix(s) => s.write_vectored(bufs),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Tcp(s) => s.flush(),
            Conn::Unix(s) => s.flush(),
        }
    }
}

/// One non-blocking read step for a reactor loop.
pub enum ReadEvent {
    Data(usize),
    WouldBlock,
    Eof,
    Failed(io::Error),
}

pub fn read_chunk(conn: &mut Conn, scratch: &mut [u8]) -> ReadEvent {
    match conn.read(scratch) {
        Ok(0) => ReadEvent::Eof,
        Ok(n) => ReadEvent::Data(n),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => ReadEvent::WouldBlock,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => ReadEvent::WouldBlock,
        Err(err) => ReadEvent::Failed(err),
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(u64::from(attempt).saturating_mul(10).min(2_000))
}

/// Socket writer with the retry discipline shared by the response path and
/// the checkpoint writer.
pub struct RetryWriter {
    conn: Conn,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
}

impl RetryWriter {
    pub fn new(conn: Conn, metrics: Arc<Metrics>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            conn,
            metrics,
            shutdown,
        }
    }

    /// Write one frame fully, backing off on transient refusals. A hard
    /// failure abandons the frame and bumps `write_failure_counter`; the
    /// shutdown flag only cuts the backoff loop short so teardown never
    /// hangs behind a congested peer.
    pub fn write_frame(&mut self, frame: &[u8]) {
        let mut written = 0usize;
        let mut attempt = 0u32;
        while written < frame.len() {
            match self.conn.write(&frame[written..]) {
                Ok(0) => {
                    self.metrics.bump(&self.metrics.write_failure_counter);
                    tracing::warn!(written, "peer stopped accepting bytes mid-frame");
                    return;
                }
                Ok(n) => {
                    written += n;
                    attempt = 0;
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    if self.shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    attempt += 1;
                    std::thread::sleep(backoff_delay(attempt));
                }
                Err(err) => {
                    self.metrics.bump(&self.metrics.write_failure_counter);
                    tracing::warn!(%err, written, "frame write failed");
                    return;
                }
            }
        }
    }

    /// Write a run of frames, at most `max_batch` per syscall, advancing a
    /// cursor across partially written buffers.
    pub fn write_batched(&mut self, frames: &[Vec<u8>], max_batch: usize) {
        for group in frames.chunks(max_batch.max(1)) {
            let mut idx = 0usize;
            let mut offset = 0usize;
            let mut attempt = 0u32;
            while idx < group.len() {
                let mut slices = Vec::with_capacity(group.len() - idx);
                slices.push(IoSlice::new(&group[idx][offset..]));
                for frame in &group[idx + 1..] {
                    slices.push(IoSlice::new(frame));
                }
                match self.conn.write_vectored(&slices) {
                    Ok(0) => {
                        self.metrics.bump(&self.metrics.write_failure_counter);
                        tracing::warn!("peer stopped accepting bytes mid-batch");
                        return;
                    }
                    Ok(mut n) => {
                        attempt = 0;
                        while n > 0 && idx < group.len() {
                            let remaining = group[idx].len() - offset;
                            if n >= remaining {
                                n -= remaining;
                                idx += 1;
                                offset = 0;
                            } else {
                                offset += n;
                                n = 0;
                            }
                        }
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::Interrupted =>
                    {
                        if self.shutdown.load(Ordering::Relaxed) {
                            return;
                        }
                        attempt += 1;
                        std::thread::sleep(backoff_delay(attempt));
                    }
                    Err(err) => {
                        self.metrics.bump(&self.metrics.write_failure_counter);
                        tracing::warn!(%err, "batched write failed");
                        return;
                    }
                }
            }
        }
    }

    pub fn shutdown_conn(&self) {
        self.conn.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let args = WorkerArgs {
            appname: "t".into(),
            ipc_type: IpcType::AfInet,
            port_or_uds: port.to_string(),
            feedback_port_or_uds: "0".into(),
            worker_id: "w0".into(),
            batch_size: 1,
            feedback_batch_size: 1,
            diag_dir: "/tmp".into(),
            ip_mode: crate::config::IpMode::Ipv4,
            breakpad_on: "false".into(),
            function_id: "f".into(),
            user_prefix: None,
        };
        let endpoint = Endpoint::main_from_args(&args).unwrap();
        let conn = Conn::connect(&endpoint).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (conn, peer)
    }

    #[test]
    fn writes_frames_fully() {
        let (conn, mut peer) = pair();
        let metrics = Arc::new(Metrics::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut writer = RetryWriter::new(conn, Arc::clone(&metrics), shutdown);

        writer.write_frame(b"hello");
        writer.write_batched(&[b"ab".to_vec(), b"cd".to_vec(), b"ef".to_vec()], 2);

        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut got = vec![0u8; 11];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"helloabcdef");
        assert_eq!(metrics.get(&metrics.write_failure_counter), 0);
    }

    #[test]
    fn endpoint_rejects_bad_port() {
        let mut args = pair_args();
        args.port_or_uds = "notaport".into();
        assert!(matches!(
            Endpoint::main_from_args(&args),
            Err(TransportError::InvalidEndpoint { .. })
        ));
    }

    fn pair_args() -> WorkerArgs {
        WorkerArgs {
            appname: "t".into(),
            ipc_type: IpcType::AfInet,
            port_or_uds: "1".into(),
            feedback_port_or_uds: "2".into(),
            worker_id: "w0".into(),
            batch_size: 1,
            feedback_batch_size: 1,
            diag_dir: "/tmp".into(),
            ip_mode: crate::config::IpMode::Ipv4,
            breakpad_on: "false".into(),
            function_id: "f".into(),
            user_prefix: None,
        }
    }
}
