//! End-to-end scenario tests driving [`SimServer`] over a turmoil network.
//!
//! Each test builds a raw client connection with `turmoil::net::TcpStream`
//! and drives the server side explicitly (`accept_connection`,
//! `process_next_message`) so assertions can interleave between steps, the
//! same oracle-pattern style the corpus uses for its own simulation tests.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use pylon_core::{connection::ConnectionConfig, Endpoint};
use pylon_harness::{InvariantRegistry, SimServer};
use pylon_proto::{Body, Identity, InvocationMode, Message, MessageHeader, ReplyBody, ReplyStatus, RequestBody};
use pylon_server::{
    adapter::{Current, DispatchFuture, DispatchResult, ObjectAdapter, Servant},
    ServerConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use turmoil::{net::TcpStream, Builder};

struct EchoServant;

impl Servant for EchoServant {
    fn dispatch(&self, _current: Current, params: Bytes) -> DispatchFuture {
        Box::pin(async move { Ok(DispatchResult::Ok(params)) })
    }
}

fn identity(name: &str) -> Identity {
    Identity { category: String::new(), name: name.into() }
}

fn request_message(request_id: i32, operation: &str, params: Bytes) -> Message {
    Message::new(Body::Request(RequestBody {
        request_id,
        identity: identity("echo"),
        facet: None,
        operation: operation.into(),
        mode: InvocationMode::Normal,
        context: Vec::new(),
        params,
    }))
}

async fn write_message(stream: &mut TcpStream, message: &Message) {
    let bytes = message.encode().expect("message encodes");
    stream.write_all(&bytes).await.expect("write succeeds");
}

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut header_buf = [0u8; MessageHeader::SIZE];
    stream.read_exact(&mut header_buf).await.expect("header read");
    let declared = MessageHeader::from_bytes(&header_buf, 1024 * 1024).expect("valid header").size() as usize;

    let mut full = vec![0u8; declared];
    full[..MessageHeader::SIZE].copy_from_slice(&header_buf);
    stream.read_exact(&mut full[MessageHeader::SIZE..]).await.expect("body read");
    Message::decode(&full, 1024 * 1024).expect("message decodes")
}

fn echo_adapter() -> Arc<ObjectAdapter> {
    let adapter =
        Arc::new(ObjectAdapter::new("Echo", vec![Endpoint::Tcp { host: "0.0.0.0".into(), port: 0, timeout_ms: 0 }]));
    adapter.add_servant(identity("echo"), None, Arc::new(EchoServant)).expect("fresh registration");
    adapter
}

/// Oracle: the server's outstanding-request bookkeeping must never report
/// more retired requests than were sent, on any empty snapshot.
fn assert_invariants_hold() {
    let registry = InvariantRegistry::standard();
    let snapshot = pylon_harness::SystemSnapshot::empty();
    registry.assert_all(&snapshot, "idle harness");
}

#[test]
fn two_way_request_round_trips_through_echo_servant() {
    assert_invariants_hold();

    let mut sim = Builder::new().build();

    sim.host("server", || async {
        let mut server = SimServer::bind("0.0.0.0:443").await?;
        server.add_adapter(echo_adapter()).await;

        let conn_id = server.accept_connection("Echo").await?;
        server.process_next_message(conn_id).await.expect("handshake validates");
        server.process_next_message(conn_id).await.expect("request dispatches");

        assert_eq!(server.connection_count().await, 1);
        Ok(())
    });

    sim.client("client", async {
        let mut stream = TcpStream::connect("server:443").await?;
        write_message(&mut stream, &Message::new(Body::ValidateConnection)).await;
        let payload = Bytes::from_static(b"hello");
        write_message(&mut stream, &request_message(1, "echo", payload.clone())).await;

        let reply = read_message(&mut stream).await;
        let Body::Reply(ReplyBody { request_id, status, payload: returned }) = reply.body() else {
            panic!("expected a reply body");
        };
        assert_eq!(*request_id, 1);
        assert_eq!(*status, ReplyStatus::Ok);
        assert_eq!(returned, &payload);
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn one_way_request_produces_no_reply() {
    let mut sim = Builder::new().build();

    sim.host("server", || async {
        let mut server = SimServer::bind("0.0.0.0:443").await?;
        server.add_adapter(echo_adapter()).await;

        let conn_id = server.accept_connection("Echo").await?;
        server.process_next_message(conn_id).await.expect("handshake validates");
        server.process_next_message(conn_id).await.expect("one-way dispatches silently");

        assert_eq!(server.connection_count().await, 1);
        Ok(())
    });

    sim.client("client", async {
        let mut stream = TcpStream::connect("server:443").await?;
        write_message(&mut stream, &Message::new(Body::ValidateConnection)).await;
        write_message(&mut stream, &request_message(0, "echo", Bytes::from_static(b"fire-and-forget"))).await;

        // No reply should arrive; confirm the connection simply stays open
        // by giving the server a moment and checking no bytes show up.
        let mut probe = [0u8; 1];
        let result = tokio::time::timeout(Duration::from_millis(50), stream.read(&mut probe)).await;
        assert!(result.is_err(), "one-way request must not produce a reply");
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn request_against_unknown_identity_replies_object_not_exist() {
    let mut sim = Builder::new().build();

    sim.host("server", || async {
        let mut server = SimServer::bind("0.0.0.0:443").await?;
        server.add_adapter(echo_adapter()).await;

        let conn_id = server.accept_connection("Echo").await?;
        server.process_next_message(conn_id).await.expect("handshake validates");
        server.process_next_message(conn_id).await.expect("dispatch completes with an error reply");
        Ok(())
    });

    sim.client("client", async {
        let mut stream = TcpStream::connect("server:443").await?;
        write_message(&mut stream, &Message::new(Body::ValidateConnection)).await;
        let message = Message::new(Body::Request(RequestBody {
            request_id: 9,
            identity: identity("does-not-exist"),
            facet: None,
            operation: "anything".into(),
            mode: InvocationMode::Normal,
            context: Vec::new(),
            params: Bytes::new(),
        }));
        write_message(&mut stream, &message).await;

        let reply = read_message(&mut stream).await;
        let Body::Reply(ReplyBody { status, .. }) = reply.body() else {
            panic!("expected a reply body");
        };
        assert_eq!(*status, ReplyStatus::ObjectNotExist);
        Ok(())
    });

    sim.run().unwrap();
}

#[test]
fn server_tracks_connections_across_multiple_accepts() {
    let mut sim = Builder::new().build();

    sim.host("server", || async {
        let mut server = SimServer::bind("0.0.0.0:443").await?;
        server.add_adapter(echo_adapter()).await;

        let first = server.accept_connection("Echo").await?;
        let second = server.accept_connection("Echo").await?;
        assert_ne!(first, second);
        assert_eq!(server.connection_count().await, 2);

        server.close_connection(first, "test teardown").await;
        assert_eq!(server.connection_count().await, 1);
        Ok(())
    });

    sim.client("client-a", async {
        let _stream = TcpStream::connect("server:443").await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    });

    sim.client("client-b", async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _stream = TcpStream::connect("server:443").await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    });

    sim.run().unwrap();
}

/// A silent connection gets dropped once `idle_timeout` elapses; a peer that
/// sends a bare `ValidateConnection` heartbeat more often than that never
/// does.
#[test]
fn idle_connection_is_closed_but_heartbeats_keep_it_alive() {
    let mut sim = Builder::new().build();

    // Generous relative to turmoil's injected message latency: the
    // heartbeat gap (idle_timeout / 5) must stay comfortably shorter than
    // idle_timeout even after jitter, and the silent peer's probe window
    // must comfortably exceed idle_timeout plus jitter.
    let idle_timeout = Duration::from_millis(500);
    let config = ServerConfig { connection: ConnectionConfig { idle_timeout, ..Default::default() }, ..Default::default() };

    sim.host("server", move || {
        let config = config.clone();
        async move {
            let mut server = SimServer::bind_with_config("0.0.0.0:443", config).await?;
            server.add_adapter(echo_adapter()).await;

            let silent = server.accept_connection("Echo").await?;
            server.process_next_message(silent).await.expect("silent peer's handshake validates");

            let heartbeat = server.accept_connection("Echo").await?;
            server.process_next_message(heartbeat).await.expect("heartbeat peer's handshake validates");
            for _ in 0..4 {
                server.process_next_message(heartbeat).await.expect("heartbeat keeps the idle timer from firing");
            }
            server.process_next_message(heartbeat).await.expect("request dispatches after heartbeats");

            Ok(())
        }
    });

    sim.client("silent", async move {
        let mut stream = TcpStream::connect("server:443").await?;
        write_message(&mut stream, &Message::new(Body::ValidateConnection)).await;

        // Never send anything else; the server's idle timer must fire and
        // close the connection out from under us.
        let mut probe = [0u8; 1];
        let read = tokio::time::timeout(idle_timeout * 4, stream.read(&mut probe)).await;
        let n = read.expect("server must close before the probe times out").expect("read does not error");
        assert_eq!(n, 0, "idle connection should see eof once the server closes it");
        Ok(())
    });

    sim.client("heartbeat", async move {
        // Connect after "silent" so the server's two sequential
        // `accept_connection` calls line up with these client names.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut stream = TcpStream::connect("server:443").await?;
        write_message(&mut stream, &Message::new(Body::ValidateConnection)).await;

        for _ in 0..4 {
            tokio::time::sleep(idle_timeout / 5).await;
            write_message(&mut stream, &Message::new(Body::ValidateConnection)).await;
        }

        let payload = Bytes::from_static(b"still-alive");
        write_message(&mut stream, &request_message(1, "echo", payload.clone())).await;
        let reply = read_message(&mut stream).await;
        let Body::Reply(ReplyBody { status, payload: returned, .. }) = reply.body() else {
            panic!("expected a reply body");
        };
        assert_eq!(*status, ReplyStatus::Ok);
        assert_eq!(returned, &payload);
        Ok(())
    });

    sim.run().unwrap();
}
