//! Client-side TCP dial and framed read/write helpers.
//!
//! Mirrors the shape of `pylon_server::transceiver::TcpTransceiver`, but
//! splits the stream into owned halves up front: the client's read loop and
//! its write path (request sends, timer-triggered closes) run on separate
//! tasks rather than sharing one `Mutex`-guarded stream the way the
//! single-reader server glue does.

use std::{net::SocketAddr, time::Duration};

use bytes::BytesMut;
use pylon_core::error::PylonError;
use pylon_proto::{Message, MessageHeader};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

/// Dial `addr`, applying `connect_timeout` if nonzero, and split the
/// resulting stream into owned read/write halves.
pub async fn dial(addr: SocketAddr, connect_timeout: Duration) -> Result<(OwnedReadHalf, OwnedWriteHalf), PylonError> {
    let connect = TcpStream::connect(addr);
    let stream = if connect_timeout.is_zero() {
        connect.await.map_err(PylonError::from)?
    } else {
        tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| PylonError::ConnectTimeout(connect_timeout))?
            .map_err(PylonError::from)?
    };
    stream.set_nodelay(true).ok();
    Ok(stream.into_split())
}

/// Read one complete framed message (header + body) off `read`.
pub async fn read_message_bytes(read: &mut OwnedReadHalf, message_size_max: usize) -> Result<BytesMut, PylonError> {
    let mut header_buf = [0u8; MessageHeader::SIZE];
    read.read_exact(&mut header_buf).await.map_err(PylonError::from)?;
    let declared =
        MessageHeader::from_bytes(&header_buf, message_size_max).map_err(PylonError::from)?.size() as usize;

    let mut full = BytesMut::with_capacity(declared);
    full.extend_from_slice(&header_buf);
    full.resize(declared, 0);
    read.read_exact(&mut full[MessageHeader::SIZE..]).await.map_err(PylonError::from)?;
    Ok(full)
}

/// Encode and write a complete message to `write`.
pub async fn write_message(write: &mut OwnedWriteHalf, message: &Message) -> Result<(), PylonError> {
    let bytes = message.encode().map_err(PylonError::from)?;
    write.write_all(&bytes).await.map_err(PylonError::from)?;
    write.flush().await.map_err(PylonError::from)?;
    Ok(())
}

/// Read one complete framed message, failing with
/// [`PylonError::ConnectionIdle`] rather than hanging forever if no byte
/// arrives within `idle_timeout`. Client-side equivalent of
/// `pylon_server::transceiver::IdleTimeoutTransceiver::read_exact_with_idle`,
/// shaped around this crate's split-half reads instead of a single
/// `Transceiver` trait object.
pub async fn read_message_bytes_with_idle(
    read: &mut OwnedReadHalf,
    idle_timeout: Duration,
    message_size_max: usize,
) -> Result<BytesMut, PylonError> {
    tokio::time::timeout(idle_timeout, read_message_bytes(read, message_size_max))
        .await
        .map_err(|_| PylonError::ConnectionIdle(idle_timeout))?
}

/// Half of `idle_timeout`: the cadence to write a keepalive
/// `ValidateConnection` frame, so the peer's own idle timer never expires
/// purely because this side has no requests to send.
#[must_use]
pub fn heartbeat_interval(idle_timeout: Duration) -> Duration {
    idle_timeout / 2
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn heartbeat_interval_is_half_idle_timeout() {
        assert_eq!(heartbeat_interval(Duration::from_secs(60)), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn read_message_bytes_with_idle_fails_on_stalled_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            stream
        });

        let (mut read, _write) = dial(addr, Duration::from_secs(1)).await.unwrap();
        let result = read_message_bytes_with_idle(&mut read, Duration::from_millis(20), 1024).await;
        assert!(matches!(result, Err(PylonError::ConnectionIdle(_))));
        let _ = accept.await;
    }
}
