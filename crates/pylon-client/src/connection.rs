//! Client-side connection glue: owns a dialed TCP socket, the shared
//! [`Connection`] state machine, and the per-request reply correlation map.
//!
//! One background task (the "driver task") owns the [`Connection`] and the
//! write half of the socket; a second task does nothing but read framed
//! messages and forward them to the driver task over a channel, the same
//! split responsibility `pylon_server::Server::read_loop` /
//! `execute_actions` have on the server side. [`ClientConnection`] itself is
//! just a cheap, cloneable handle the request-handler cache and proxies hold
//! onto.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use pylon_core::{
    connection::{Connection, ConnectionAction, ConnectionConfig, TimerKind},
    error::PylonError,
};
use pylon_proto::{Body, Message, RequestBody};
use tokio::sync::{mpsc, oneshot};

use crate::{error::ClientError, timer::TimerSet, transceiver};

/// Maximum accepted message size; mirrors `pylon_server::DEFAULT_MESSAGE_SIZE_MAX`.
pub const DEFAULT_MESSAGE_SIZE_MAX: usize = 16 * 1024 * 1024;

enum DriverCommand {
    Invoke { request: RequestBody, twoway: bool, reply: oneshot::Sender<Result<Bytes, PylonError>> },
    Close { reason: String },
    /// Write a keepalive `ValidateConnection` frame; scheduled on its own
    /// task at half the idle timeout so the peer's own idle timer never
    /// expires purely because this side has nothing else queued to send.
    Heartbeat,
}

enum ReadEvent {
    Message(Message),
    Failed(PylonError),
}

/// A live, established connection to one peer endpoint.
///
/// Cheap to clone (an `Arc` around the channel handle); the real state lives
/// in the driver task. [`Self::is_alive`] lets the request-handler cache
/// decide whether a cached handle can still be reused without round
/// tripping through the driver task.
pub struct ClientConnection {
    commands: mpsc::UnboundedSender<DriverCommand>,
    alive: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl ClientConnection {
    /// Dial `addr` and bring the connection up to `Active`: send our
    /// `ValidateConnection` frame and self-transition immediately, rather
    /// than waiting for the peer to send one back. A request handler talks
    /// to exactly one peer, which only ever needs to observe one
    /// `ValidateConnection` per connection (the initiator's) — both sides
    /// sending one at each other as ICE's wire format nominally allows would
    /// double the handshake for no benefit, so this runtime elects the
    /// client as the sole sender.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Core`] if the dial or handshake write fails.
    pub async fn connect(addr: SocketAddr, config: ConnectionConfig) -> Result<Arc<Self>, ClientError> {
        let connect_timeout = config.connect_timeout;
        let idle_timeout = config.idle_timeout;
        let (read_half, mut write_half) = transceiver::dial(addr, connect_timeout).await?;

        let mut conn = Connection::<Instant>::new(Instant::now(), config);
        conn.initialize(Instant::now())?;
        transceiver::write_message(&mut write_half, &Message::new(Body::ValidateConnection)).await?;
        let validate_actions = conn.validate(Instant::now())?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();

        let alive = Arc::new(AtomicBool::new(true));

        tokio::spawn(read_loop(read_half, read_tx, idle_timeout));
        tokio::spawn(heartbeat_loop(command_tx.clone(), idle_timeout));

        let mut timers = TimerSet::new(timer_tx);
        apply_timer_actions(&mut timers, &validate_actions);

        let driver_alive = alive.clone();
        tokio::spawn(async move {
            run_driver(conn, write_half, timers, command_rx, timer_rx, read_rx, driver_alive).await;
        });

        Ok(Arc::new(Self { commands: command_tx, alive, peer: addr }))
    }

    /// Whether the driver task is still running. A cached handler that has
    /// died (peer closed, idle timeout, …) reports `false` here so the
    /// request-handler cache knows to redial rather than hand out a handle
    /// whose commands would just pile up unanswered.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// The peer address this connection was dialed to.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send `request` and await its reply. For a one-way request (`twoway`
    /// false) this resolves as soon as the driver task has handed the frame
    /// to the socket, with an empty payload.
    ///
    /// # Errors
    ///
    /// Returns the [`PylonError`] the connection or transport failed with.
    pub async fn invoke(&self, request: RequestBody, twoway: bool) -> Result<Bytes, PylonError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::Invoke { request, twoway, reply: reply_tx })
            .map_err(|_| PylonError::ConnectionLost("driver task gone".into()))?;
        reply_rx.await.map_err(|_| PylonError::ConnectionLost("driver task gone".into()))?
    }

    /// Begin a graceful close.
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.commands.send(DriverCommand::Close { reason: reason.into() });
    }
}

async fn read_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    tx: mpsc::UnboundedSender<ReadEvent>,
    idle_timeout: Duration,
) {
    loop {
        match transceiver::read_message_bytes_with_idle(&mut read_half, idle_timeout, DEFAULT_MESSAGE_SIZE_MAX).await {
            Ok(bytes) => match Message::decode(&bytes, DEFAULT_MESSAGE_SIZE_MAX) {
                Ok(message) => {
                    if tx.send(ReadEvent::Message(message)).is_err() {
                        return;
                    }
                },
                Err(err) => {
                    let _ = tx.send(ReadEvent::Failed(PylonError::from(err)));
                    return;
                },
            },
            Err(err) => {
                let _ = tx.send(ReadEvent::Failed(err));
                return;
            },
        }
    }
}

/// Send a [`DriverCommand::Heartbeat`] at half the idle timeout, for as long
/// as the driver task is still accepting commands. The driver task is the
/// connection's sole writer, so the actual frame goes out through
/// `run_driver` rather than from this task directly.
async fn heartbeat_loop(commands: mpsc::UnboundedSender<DriverCommand>, idle_timeout: Duration) {
    let interval = transceiver::heartbeat_interval(idle_timeout);
    loop {
        tokio::time::sleep(interval).await;
        if commands.send(DriverCommand::Heartbeat).is_err() {
            return;
        }
    }
}

fn apply_timer_actions(timers: &mut TimerSet, actions: &[ConnectionAction]) {
    for action in actions {
        match action {
            ConnectionAction::StartTimer { timer, duration } => timers.start(*timer, *duration),
            ConnectionAction::CancelTimer(timer) => timers.cancel(*timer),
            _ => {},
        }
    }
}

/// Map a fired timer to the typed error its expiry represents, per the
/// timeout taxonomy in `pylon_core::error`.
fn error_for_timer(timer: TimerKind, duration: Duration) -> PylonError {
    match timer {
        TimerKind::Connect => PylonError::ConnectTimeout(duration),
        TimerKind::Close => PylonError::CloseTimeout(duration),
        TimerKind::Idle => PylonError::ConnectionIdle(duration),
        TimerKind::Inactivity => PylonError::ConnectionLost("inactivity timeout".into()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_driver(
    mut conn: Connection<Instant>,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut timers: TimerSet,
    mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
    mut timer_rx: mpsc::UnboundedReceiver<TimerKind>,
    mut read_rx: mpsc::UnboundedReceiver<ReadEvent>,
    alive: Arc<AtomicBool>,
) {
    let mut pending: HashMap<i32, oneshot::Sender<Result<Bytes, PylonError>>> = HashMap::new();
    let timer_durations = timer_durations_from_config();

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    DriverCommand::Invoke { request, twoway, reply } => {
                        match conn.send_request(request, twoway, Instant::now()) {
                            Ok((request_id, actions)) => {
                                if twoway {
                                    pending.insert(request_id, reply);
                                } else {
                                    let _ = reply.send(Ok(Bytes::new()));
                                }
                                if !execute(&mut conn, &mut write_half, &mut timers, &mut pending, actions).await {
                                    break;
                                }
                            },
                            Err(err) => {
                                let _ = reply.send(Err(err));
                            },
                        }
                    },
                    DriverCommand::Close { reason } => {
                        let actions = conn.begin_close(reason, Instant::now());
                        if !execute(&mut conn, &mut write_half, &mut timers, &mut pending, actions).await {
                            break;
                        }
                    },
                    DriverCommand::Heartbeat => {
                        if let Err(err) =
                            transceiver::write_message(&mut write_half, &Message::new(Body::ValidateConnection)).await
                        {
                            fail_all(&mut pending, err);
                            break;
                        }
                    },
                }
            },
            timer = timer_rx.recv() => {
                let Some(timer) = timer else { continue };
                let actions = conn.on_timer_fired(timer, Instant::now());
                let closing = actions.iter().any(|a| matches!(a, ConnectionAction::Close { .. }));
                if closing {
                    let duration = timer_durations(timer);
                    fail_all(&mut pending, error_for_timer(timer, duration));
                }
                if !execute(&mut conn, &mut write_half, &mut timers, &mut pending, actions).await {
                    break;
                }
            },
            event = read_rx.recv() => {
                match event {
                    Some(ReadEvent::Message(message)) => {
                        match conn.handle_message(message, Instant::now()) {
                            Ok(actions) => {
                                if !execute(&mut conn, &mut write_half, &mut timers, &mut pending, actions).await {
                                    break;
                                }
                            },
                            Err(err) => {
                                fail_all(&mut pending, err);
                                break;
                            },
                        }
                    },
                    Some(ReadEvent::Failed(err)) => {
                        fail_all(&mut pending, err);
                        break;
                    },
                    None => {
                        fail_all(&mut pending, PylonError::ConnectionLost("read task ended".into()));
                        break;
                    },
                }
            },
        }
    }

    timers.cancel_all();
    alive.store(false, Ordering::Release);
}

fn timer_durations_from_config() -> impl Fn(TimerKind) -> Duration {
    // The connection doesn't expose its configured durations back out once
    // built; the fired-timer error only needs *a* duration for display, so
    // this mirrors the defaults rather than threading the config through
    // another layer.
    |timer| match timer {
        TimerKind::Connect => pylon_core::connection::DEFAULT_CONNECT_TIMEOUT,
        TimerKind::Close => pylon_core::connection::DEFAULT_CLOSE_TIMEOUT,
        TimerKind::Idle => pylon_core::connection::DEFAULT_IDLE_TIMEOUT,
        TimerKind::Inactivity => pylon_core::connection::DEFAULT_INACTIVITY_TIMEOUT,
    }
}

fn fail_all(pending: &mut HashMap<i32, oneshot::Sender<Result<Bytes, PylonError>>>, err: PylonError) {
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(err.clone()));
    }
}

async fn execute(
    conn: &mut Connection<Instant>,
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    timers: &mut TimerSet,
    pending: &mut HashMap<i32, oneshot::Sender<Result<Bytes, PylonError>>>,
    actions: Vec<ConnectionAction>,
) -> bool {
    for action in actions {
        match action {
            ConnectionAction::SendMessage(message) => {
                if let Err(err) = transceiver::write_message(write_half, &message).await {
                    fail_all(pending, err);
                    return false;
                }
            },
            ConnectionAction::StartTimer { timer, duration } => timers.start(timer, duration),
            ConnectionAction::CancelTimer(timer) => timers.cancel(timer),
            ConnectionAction::CompleteRequest { request_id, result } => {
                if let Some(tx) = pending.remove(&request_id) {
                    let _ = tx.send(result);
                }
            },
            ConnectionAction::Close { reason } => {
                tracing::debug!(%reason, "client connection closing");
                fail_all(pending, PylonError::ConnectionLost(reason));
                let _ = conn.finish();
                return false;
            },
            ConnectionAction::Finish => return false,
        }
    }
    true
}
