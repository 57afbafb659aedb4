//! Transceiver (C3): byte-stream I/O consumed by the reactor.
//!
//! The source models the transceiver as a manually-polled non-blocking
//! state machine (`initialize`/`read`/`write` each return `None` on
//! completion or `NeedRead`/`NeedWrite` on would-block). Under `tokio`,
//! would-block is already the thing `.await` models — a task suspends
//! instead of returning a sentinel and being re-polled by a selector loop
//! — so this crate expresses the same contract (handshake, non-blocking
//! read/write, graceful close, diagnostics) as async trait methods rather
//! than reintroducing a hand-rolled readiness enum. [`reactor`](crate::reactor)
//! is still the thing that owns one task per registered handler and
//! enforces the "exactly one worker at a time" rule the source gets from
//! its consumed-token hand-off.

use std::{fmt, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::TransceiverError;

/// Who initiated a connection shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// This side is closing voluntarily (graceful shutdown, idle timeout).
    Local,
    /// The peer closed first.
    Peer,
    /// An unrecoverable transport error forced the close.
    Error,
}

/// Diagnostic snapshot of a transceiver, for logging and instrumentation.
#[derive(Debug, Clone)]
pub struct TransceiverInfo {
    /// Transport name (`"tcp"`, …).
    pub transport: &'static str,
    /// Local socket address, if connected.
    pub local_addr: Option<SocketAddr>,
    /// Peer socket address, if connected.
    pub peer_addr: Option<SocketAddr>,
}

/// Byte-stream transport consumed by a connection. One instance per
/// established (or being-established) socket.
#[async_trait]
pub trait Transceiver: Send + Sync {
    /// Complete any transport-level handshake (TLS, …) before application
    /// bytes may flow. The plain TCP transceiver's handshake is the
    /// connect/accept itself, so this is a no-op once constructed.
    async fn initialize(&mut self) -> Result<(), TransceiverError>;

    /// Fill `buf` completely or fail; never returns a short read.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransceiverError>;

    /// Write all of `buf` or fail.
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransceiverError>;

    /// Perform any shutdown handshake the transport requires.
    async fn closing(&mut self, initiator: CloseInitiator, cause: Option<&str>) -> Result<(), TransceiverError>;

    /// Release OS resources. Idempotent.
    async fn close(&mut self);

    /// OS-level handle, for diagnostics (`-1` if not applicable).
    fn native_handle(&self) -> i64;

    /// Transport name, e.g. `"tcp"`.
    fn protocol(&self) -> &'static str;

    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Structured diagnostic info.
    fn get_info(&self) -> TransceiverInfo;
}

/// Plain TCP transceiver over `tokio::net::TcpStream`.
///
/// Shaped around a bind/accept/local_addr transport contract with one
/// stream per connection, so the transport is pluggable without being tied
/// to TCP specifics; secure transport is out of scope here.
pub struct TcpTransceiver {
    stream: TcpStream,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl TcpTransceiver {
    /// Wrap an already-connected or already-accepted stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        Self { stream, local_addr, peer_addr }
    }

    /// Dial a TCP endpoint, applying `connect_timeout` if nonzero.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self, TransceiverError> {
        let connect = TcpStream::connect(addr);
        let stream = if connect_timeout.is_zero() {
            connect.await.map_err(|e| TransceiverError::ConnectFailed(e.to_string()))?
        } else {
            tokio::time::timeout(connect_timeout, connect)
                .await
                .map_err(|_| TransceiverError::ConnectFailed("connect timed out".into()))?
                .map_err(|e| TransceiverError::ConnectFailed(e.to_string()))?
        };
        stream.set_nodelay(true).ok();
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl Transceiver for TcpTransceiver {
    async fn initialize(&mut self) -> Result<(), TransceiverError> {
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransceiverError> {
        self.stream.read_exact(buf).await.map_err(|e| TransceiverError::Io(e.to_string()))?;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransceiverError> {
        self.stream.write_all(buf).await.map_err(|e| TransceiverError::Io(e.to_string()))?;
        self.stream.flush().await.map_err(|e| TransceiverError::Io(e.to_string()))?;
        Ok(())
    }

    async fn closing(&mut self, _initiator: CloseInitiator, _cause: Option<&str>) -> Result<(), TransceiverError> {
        self.stream.shutdown().await.map_err(|e| TransceiverError::Io(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    fn native_handle(&self) -> i64 {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            i64::from(self.stream.as_raw_fd())
        }
        #[cfg(not(unix))]
        {
            -1
        }
    }

    fn protocol(&self) -> &'static str {
        "tcp"
    }

    fn describe(&self) -> String {
        format!("tcp {} <-> {}", fmt_addr(self.local_addr), fmt_addr(self.peer_addr))
    }

    fn get_info(&self) -> TransceiverInfo {
        TransceiverInfo { transport: "tcp", local_addr: self.local_addr, peer_addr: self.peer_addr }
    }
}

fn fmt_addr(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "?".to_string(), |a| a.to_string())
}

impl fmt::Debug for TcpTransceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransceiver").field("info", &self.get_info()).finish()
    }
}

/// Idle-timeout decorator: schedules a heartbeat write at `idle_timeout / 2`
/// of write silence and fails the wrapped transceiver once `idle_timeout`
/// passes with no bytes read. `pylon_core::connection::Connection` already
/// derives the deadlines for its idle timer; this decorator is the place a
/// heartbeat frame is actually written to the wire when the driver tells it
/// to, and is where read silence gets turned into the `ConnectionIdle`
/// error the connection state machine expects to see.
pub struct IdleTimeoutTransceiver<T: Transceiver> {
    inner: T,
    idle_timeout: Duration,
}

impl<T: Transceiver> IdleTimeoutTransceiver<T> {
    /// Wrap `inner`, heartbeating at half of `idle_timeout`.
    #[must_use]
    pub fn new(inner: T, idle_timeout: Duration) -> Self {
        Self { inner, idle_timeout }
    }

    /// Half the configured idle timeout: the heartbeat-write cadence.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.idle_timeout / 2
    }

    /// Read with an idle-timeout deadline, mapping a stalled read to
    /// [`TransceiverError::Idle`] rather than hanging forever.
    pub async fn read_exact_with_idle(&mut self, buf: &mut [u8]) -> Result<(), TransceiverError> {
        tokio::time::timeout(self.idle_timeout, self.inner.read_exact(buf))
            .await
            .map_err(|_| TransceiverError::Idle(self.idle_timeout))?
    }

    /// Borrow the wrapped transceiver.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Write a bare `ValidateConnection` frame: the wire-level heartbeat
    /// that keeps the peer's own idle timer from expiring while this side
    /// has nothing else queued to send.
    pub async fn write_heartbeat(&mut self) -> Result<(), TransceiverError> {
        let bytes = pylon_proto::Message::new(pylon_proto::Body::ValidateConnection)
            .encode()
            .map_err(|e| TransceiverError::Io(e.to_string()))?;
        self.inner.write_all(&bytes).await
    }
}

#[async_trait]
impl<T: Transceiver> Transceiver for IdleTimeoutTransceiver<T> {
    async fn initialize(&mut self) -> Result<(), TransceiverError> {
        self.inner.initialize().await
    }

    /// Reads through the idle-timeout deadline rather than the bare
    /// transport read, so every caller going through the trait object gets
    /// read-silence enforcement for free.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransceiverError> {
        self.read_exact_with_idle(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), TransceiverError> {
        self.inner.write_all(buf).await
    }

    async fn closing(&mut self, initiator: CloseInitiator, cause: Option<&str>) -> Result<(), TransceiverError> {
        self.inner.closing(initiator, cause).await
    }

    async fn close(&mut self) {
        self.inner.close().await
    }

    fn native_handle(&self) -> i64 {
        self.inner.native_handle()
    }

    fn protocol(&self) -> &'static str {
        self.inner.protocol()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn get_info(&self) -> TransceiverInfo {
        self.inner.get_info()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn tcp_transceiver_round_trips_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpTransceiver::new(stream)
        });

        let mut client = TcpTransceiver::connect(addr, Duration::from_secs(1)).await.unwrap();
        let mut server = accept.await.unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpTransceiver::connect(addr, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn write_heartbeat_sends_a_validate_connection_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpTransceiver::new(stream)
        });

        let client = TcpTransceiver::connect(addr, Duration::from_secs(1)).await.unwrap();
        let mut idle = IdleTimeoutTransceiver::new(client, Duration::from_secs(60));
        idle.write_heartbeat().await.unwrap();

        let mut server = accept.await.unwrap();
        let mut header = [0u8; pylon_proto::MessageHeader::SIZE];
        server.read_exact(&mut header).await.unwrap();
        let decoded = pylon_proto::Message::decode(&header, 1024).unwrap();
        assert_eq!(decoded.body(), &pylon_proto::Body::ValidateConnection);
    }

    #[tokio::test]
    async fn idle_timeout_fails_stalled_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Never write anything back.
            tokio::time::sleep(Duration::from_millis(200)).await;
            stream
        });

        let client = TcpTransceiver::connect(addr, Duration::from_secs(1)).await.unwrap();
        let mut idle = IdleTimeoutTransceiver::new(client, Duration::from_millis(20));
        let mut buf = [0u8; 1];
        let result = idle.read_exact_with_idle(&mut buf).await;
        assert!(matches!(result, Err(TransceiverError::Idle(_))));
        let _ = accept.await;
    }
}
