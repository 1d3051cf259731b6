//! One WebSocket client: `Join` handshake, then requests and change events
//! multiplexed over the same socket until either side goes away.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use tabletop::protocol::{ChangeEvent, ChangeKind, ClientMessage, ServerMessage};

use crate::feed::{ChangeFeed, Interests};
use crate::store::Store;

const LOG_TARGET: &str = "tabletop_server::connection";

pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, store: Store, feed: ChangeFeed, heartbeat: Duration) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(target: LOG_TARGET, %peer, error = %err, "websocket handshake failed");
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    // subscribed before Welcome so no write after the handshake is missed
    let mut changes = feed.subscribe();

    let wallet = match read.next().await {
        Some(Ok(msg)) => match msg.to_text().ok().map(|text| serde_json::from_str::<ClientMessage>(text)) {
            Some(Ok(ClientMessage::Join { version, wallet })) => {
                let required = store.min_client_version().await;
                if version < required {
                    info!(target: LOG_TARGET, %peer, version, required, "client too old");
                    let message = format!("Client version {} is too old. Minimum required: {}", version, required);
                    let _ = send(&mut write, &ServerMessage::Error { message }).await;
                    return;
                }
                wallet
            }
            _ => {
                let message = "Invalid handshake: expected Join message".to_string();
                let _ = send(&mut write, &ServerMessage::Error { message }).await;
                return;
            }
        },
        _ => return,
    };

    if let Err(err) = send(&mut write, &ServerMessage::Welcome { wallet: wallet.clone() }).await {
        warn!(target: LOG_TARGET, %peer, error = %err, "failed to send welcome");
        return;
    }
    info!(target: LOG_TARGET, %peer, wallet = wallet.as_deref().unwrap_or("-"), "client joined");

    let mut interests = Interests::default();
    let mut interval = tokio::time::interval(heartbeat);
    interval.tick().await;

    'session: loop {
        tokio::select! {
            incoming = read.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        debug!(target: LOG_TARGET, %peer, error = %err, "read failed");
                        break;
                    }
                };
                let msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(target: LOG_TARGET, %peer, error = %err, "unreadable client frame");
                        continue;
                    }
                };
                if let Some(reply) = dispatch(msg, &store, &feed, &mut interests).await {
                    if send(&mut write, &reply).await.is_err() {
                        break;
                    }
                }
            }
            change = changes.recv() => {
                match change {
                    Ok(event) => {
                        for sub in interests.matching(&event) {
                            let msg = ServerMessage::Change { sub, event: event.clone() };
                            if send(&mut write, &msg).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: LOG_TARGET, %peer, skipped, "client fell behind the change feed, asking it to reload");
                        for (sub, event) in interests.resync_events() {
                            if send(&mut write, &ServerMessage::Change { sub, event }).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = interval.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(target: LOG_TARGET, %peer, subscriptions = interests.len(), "client disconnected");
}

/// Runs one request against the store. Successful writes are published on the
/// feed before they are acknowledged.
pub async fn dispatch(msg: ClientMessage, store: &Store, feed: &ChangeFeed, interests: &mut Interests) -> Option<ServerMessage> {
    let reply = match msg {
        ClientMessage::Join { .. } => {
            debug!(target: LOG_TARGET, "ignoring a second Join");
            return None;
        }
        ClientMessage::Subscribe { sub, table, filter } => {
            interests.add(sub, table, filter);
            return None;
        }
        ClientMessage::Unsubscribe { sub } => {
            interests.remove(sub);
            return None;
        }
        ClientMessage::Select { req, table, filter } => match store.select(table, &filter).await {
            Ok(rows) => ServerMessage::Rows { req, rows },
            Err(err) => failed(req, err),
        },
        ClientMessage::Insert { req, table, row } => match store.insert(table, row).await {
            Ok(row) => {
                feed.publish(ChangeEvent { table, kind: ChangeKind::Insert, row });
                ServerMessage::Ack { req }
            }
            Err(err) => failed(req, err),
        },
        ClientMessage::Update { req, table, id, patch } => match store.update(table, id, patch).await {
            Ok(updated) => {
                if let Some(row) = updated {
                    feed.publish(ChangeEvent { table, kind: ChangeKind::Update, row });
                }
                ServerMessage::Ack { req }
            }
            Err(err) => failed(req, err),
        },
        ClientMessage::Delete { req, table, id } => match store.delete(table, id).await {
            Ok(removed) => {
                if let Some(row) = removed {
                    feed.publish(ChangeEvent { table, kind: ChangeKind::Delete, row });
                }
                ServerMessage::Ack { req }
            }
            Err(err) => failed(req, err),
        },
    };
    Some(reply)
}

fn failed(req: u64, err: impl std::fmt::Display) -> ServerMessage {
    warn!(target: LOG_TARGET, req, error = %err, "request failed");
    ServerMessage::Failed { req, message: err.to_string() }
}

async fn send<S>(write: &mut S, msg: &ServerMessage) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(text) => write.send(Message::Text(text)).await,
        Err(err) => {
            warn!(target: LOG_TARGET, error = %err, "could not encode a server frame");
            Ok(())
        }
    }
}
