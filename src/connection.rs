//! Per-socket actor: a read pump decoding inbound envelopes and routing them
//! to game sessions, and a write pump draining the bounded outbound queue.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use uuid::Uuid;

use crate::error::GameError;
use crate::game::{Departure, GameCommand, GameHandle};
use crate::hub::Hub;
use crate::protocol::{ClientRequest, Envelope, Inbound};
use crate::types::{ConnectionId, GameId, User};

/// Socket timing and sizing limits.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for a single transport write.
    pub write_wait: Duration,
    /// Idle-read deadline; any inbound frame, keepalives included, refreshes it.
    pub pong_wait: Duration,
    /// Keepalive period, kept below `pong_wait`.
    pub ping_period: Duration,
    pub max_message_size: usize,
    pub send_queue: usize,
}

impl ConnectionConfig {
    pub fn new(write_wait: Duration, pong_wait: Duration, max_message_size: usize, send_queue: usize) -> Self {
        Self {
            write_wait,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_size,
            send_queue,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(60), 10_000, 256)
    }
}

/// Items on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close,
}

/// The send side of a connection, as held by game sessions.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: ConnectionId,
    pub user: User,
    tx: mpsc::Sender<Outbound>,
}

impl ConnHandle {
    pub fn new(id: ConnectionId, user: User, tx: mpsc::Sender<Outbound>) -> Self {
        Self { id, user, tx }
    }

    /// Queues an envelope. Waits while the queue is full; a closed queue drops it.
    pub async fn send(&self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(frame) => self.send_frame(frame).await,
            Err(e) => tracing::error!(conn = %self.id, "failed to encode {}: {}", envelope.action, e),
        }
    }

    pub async fn send_frame(&self, frame: String) {
        let _ = self.tx.send(Outbound::Frame(frame)).await;
    }

    pub async fn close(&self) {
        let _ = self.tx.send(Outbound::Close).await;
    }
}

/// Runs a connection until the transport fails, the peer goes idle, or the
/// queue is closed. The read pump runs on the calling task, the write pump on
/// its own.
pub async fn serve<W, R, E>(sink: W, stream: R, user: User, hub: Hub, config: ConnectionConfig)
where
    W: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    let id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(config.send_queue);
    let conn = ConnHandle::new(id, user.clone(), tx);

    hub.register(id, user.clone()).await;
    tracing::info!(conn = %id, user = %user.id, "connection opened for {}", user.name);

    let writer = tokio::spawn(write_pump(sink, rx, config.clone()));
    let joined = read_pump(stream, &conn, &hub, &config).await;

    for (game_id, handle) in joined {
        let _ = handle
            .send(GameCommand::Unregister {
                conn: id,
                user: user.id,
                departure: Departure::Disconnect,
            })
            .await;
        tracing::debug!(conn = %id, game_id = %game_id, "unregistered on disconnect");
    }
    hub.unregister(id).await;

    conn.close().await;
    drop(conn);
    let _ = writer.await;
    tracing::info!(conn = %id, "connection closed");
}

async fn read_pump<R, E>(
    mut stream: R,
    conn: &ConnHandle,
    hub: &Hub,
    config: &ConnectionConfig,
) -> HashMap<GameId, GameHandle>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut joined = HashMap::new();
    loop {
        let message = match timeout(config.pong_wait, stream.next()).await {
            Err(_) => {
                tracing::info!(conn = %conn.id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::warn!(conn = %conn.id, "read error: {}", e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        if text.len() > config.max_message_size {
            tracing::warn!(conn = %conn.id, "frame of {} bytes exceeds limit", text.len());
            break;
        }
        handle_frame(text.as_str(), conn, hub, &mut joined).await;
    }
    joined
}

async fn handle_frame(text: &str, conn: &ConnHandle, hub: &Hub, joined: &mut HashMap<GameId, GameHandle>) {
    let inbound = match Inbound::parse(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            tracing::warn!(conn = %conn.id, "invalid message: {}", e);
            conn.send(&Envelope::error(Uuid::nil(), &e)).await;
            return;
        }
    };
    let target = inbound.target;
    let request = match ClientRequest::decode(inbound.action, inbound.payload) {
        Ok(request) => request,
        Err(e) => {
            conn.send(&Envelope::error(target, &e)).await;
            return;
        }
    };
    tracing::debug!(conn = %conn.id, game_id = %target, "dispatching {}", inbound.action);

    let result = match request {
        ClientRequest::Join => join(target, conn, hub, joined).await,
        ClientRequest::Leave => match joined.remove(&target) {
            Some(handle) => {
                handle
                    .send(GameCommand::Unregister {
                        conn: conn.id,
                        user: conn.user.id,
                        departure: Departure::Leave,
                    })
                    .await
            }
            None => Err(GameError::NotMember),
        },
        ClientRequest::Game(request) => match joined.get(&target) {
            Some(handle) => {
                handle
                    .send(GameCommand::Request {
                        conn: conn.clone(),
                        request,
                    })
                    .await
            }
            None => Err(GameError::NotMember),
        },
    };

    if let Err(e) = result {
        conn.send(&Envelope::error(target, &e)).await;
    }
}

async fn join(
    target: GameId,
    conn: &ConnHandle,
    hub: &Hub,
    joined: &mut HashMap<GameId, GameHandle>,
) -> Result<(), GameError> {
    let handle = match joined.get(&target) {
        Some(handle) => handle.clone(),
        None => hub.find_session(target).await?,
    };
    if let Err(e) = handle.send(GameCommand::Register(conn.clone())).await {
        joined.remove(&target);
        return Err(e);
    }
    joined.insert(target, handle);
    Ok(())
}

async fn write_pump<W>(mut sink: W, mut rx: mpsc::Receiver<Outbound>, config: ConnectionConfig)
where
    W: Sink<Message> + Unpin,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(Outbound::Frame(mut batch)) = outbound else {
                    break;
                };
                // Coalesce whatever queued up behind the first frame.
                let mut closing = false;
                while let Ok(next) = rx.try_recv() {
                    match next {
                        Outbound::Frame(frame) => {
                            batch.push('\n');
                            batch.push_str(&frame);
                        }
                        Outbound::Close => {
                            closing = true;
                            break;
                        }
                    }
                }
                if !write(&mut sink, Message::Text(batch.into()), config.write_wait).await {
                    return;
                }
                if closing {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !write(&mut sink, Message::Ping(Bytes::new()), config.write_wait).await {
                    return;
                }
            }
        }
    }

    let _ = write(&mut sink, Message::Close(None), config.write_wait).await;
    let _ = sink.close().await;
}

async fn write<W>(sink: &mut W, message: Message, wait: Duration) -> bool
where
    W: Sink<Message> + Unpin,
{
    matches!(timeout(wait, sink.send(message)).await, Ok(Ok(())))
}
