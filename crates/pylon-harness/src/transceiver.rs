//! [`Transceiver`] implementation over `turmoil::net`, for driving
//! `pylon_server`'s real dispatch path inside a deterministic simulation.
//!
//! Mirrors `pylon_server::transceiver::TcpTransceiver` field-for-field;
//! the only difference is the stream type underneath.

use std::{fmt, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use pylon_server::{
    transceiver::{CloseInitiator, Transceiver, TransceiverInfo},
    TransceiverError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use turmoil::net::TcpStream;

/// Byte-stream transport over a turmoil-simulated TCP socket.
pub struct SimTransceiver {
    stream: TcpStream,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl SimTransceiver {
    /// Wrap an already-connected or already-accepted turmoil stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        Self { stream, local_addr, peer_addr }
    }

    /// Dial a simulated TCP endpoint, applying `connect_timeout` if nonzero.
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self, TransceiverError> {
        let connect = TcpStream::connect(addr);
        let stream = if connect_timeout.is_zero() {
            connect.await.map_err(|e| TransceiverError::ConnectFailed(e.to_string()))?
        } else {
            tokio::time::timeout(connect_timeout, connect)
                .await
                .map_err(|_| TransceiverError::ConnectFailed("connect timed out".into()))?
                .map_err(|e| TransceiverError::ConnectFailed(e.to_string()))?
        };
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl Transceiver for SimTransceiver {
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
        -1
    }

    fn protocol(&self) -> &'static str {
        "sim-tcp"
    }

    fn describe(&self) -> String {
        format!("sim-tcp {} <-> {}", fmt_addr(self.local_addr), fmt_addr(self.peer_addr))
    }

    fn get_info(&self) -> TransceiverInfo {
        TransceiverInfo { transport: "sim-tcp", local_addr: self.local_addr, peer_addr: self.peer_addr }
    }
}

fn fmt_addr(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "?".to_string(), |a| a.to_string())
}

impl fmt::Debug for SimTransceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimTransceiver").field("info", &self.get_info()).finish()
    }
}
