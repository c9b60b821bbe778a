//! Connection hub
//!
//! Classifies upgrades as sandbox (`?type=sandbox`) or client, owns the
//! subscribe handshake and its 30 s deadline, replays history to new
//! subscribers, and tracks presence. Outbound frames flow through a
//! per-socket channel drained by a dedicated send task so one slow
//! socket never blocks another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use slipway_protocol::{
    new_id, ClientMessage, HistoryItem, MessageSource, PresenceEntry, SandboxCommand,
    SandboxStatus, ServerMessage, SubscribedState,
};

use crate::clock::now_ms;
use crate::core::{ClientConn, OutFrame, SandboxConn, SessionCore, SessionHandle};
use crate::crypto;
use crate::events;
use crate::queue;
use crate::registry::SessionRegistry;
use crate::sandbox_mgr;
use crate::store::{MessageRow, WsClientRow};

pub const CLOSE_INVALID_TOKEN: u16 = 4001;
pub const CLOSE_SESSION_EXPIRED: u16 = 4002;
pub const CLOSE_AUTH_TIMEOUT: u16 = 4008;

const HISTORY_MAX_MESSAGES: u32 = 100;
const HISTORY_MAX_EVENTS: u32 = 500;

static NEXT_CONN_SEQ: AtomicU64 = AtomicU64::new(1);

/// WebSocket upgrade endpoint.
pub async fn ws_handler(
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(registry): State<Arc<SessionRegistry>>,
) -> Response {
    let Some(handle) = registry.get(&name).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if params.get("type").map(String::as_str) == Some("sandbox") {
        let declared_id = params.get("sandbox_id").cloned().unwrap_or_default();
        let token = bearer_token(&headers).or_else(|| params.get("token").cloned());
        let check = {
            let core = handle.lock().await;
            validate_sandbox_upgrade(&core, &declared_id, token.as_deref())
        };
        match check {
            Err(status) => status.into_response(),
            Ok(()) => {
                ws.on_upgrade(move |socket| handle_sandbox_socket(socket, handle, declared_id))
            }
        }
    } else {
        ws.on_upgrade(move |socket| handle_client_socket(socket, handle))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Sandbox upgrades are validated against the pre-allocated durable
/// record before the upgrade completes. Terminal statuses return 410 so
/// a shut-down sandbox stops retrying.
fn validate_sandbox_upgrade(
    core: &SessionCore,
    declared_id: &str,
    token: Option<&str>,
) -> Result<(), StatusCode> {
    let sandbox = match core.store.sandbox() {
        Ok(Some(s)) => s,
        _ => return Err(StatusCode::UNAUTHORIZED),
    };
    if matches!(sandbox.status, SandboxStatus::Stopped | SandboxStatus::Stale) {
        return Err(StatusCode::GONE);
    }
    let Some(expected_token) = sandbox.auth_token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if token != Some(expected_token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    match sandbox.modal_sandbox_id.as_deref() {
        Some(expected_id) if expected_id == declared_id => Ok(()),
        _ => Err(StatusCode::FORBIDDEN),
    }
}

async fn run_send_task(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<OutFrame>) {
    while let Some(frame) = rx.recv().await {
        let result = match frame {
            OutFrame::Text(json) => ws_tx.send(Message::Text(json.into())).await,
            OutFrame::Pong(data) => ws_tx.send(Message::Pong(data.into())).await,
            OutFrame::Close { code, reason } => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox socket
// ---------------------------------------------------------------------------

async fn handle_sandbox_socket(socket: WebSocket, handle: SessionHandle, sandbox_id: String) {
    let conn_seq = NEXT_CONN_SEQ.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "hub",
        event = "hub.sandbox.connected",
        session = %handle.name,
        sandbox_id = %sandbox_id,
        conn_seq = conn_seq,
        "Sandbox socket connected"
    );

    let (ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<OutFrame>(256);
    tokio::spawn(run_send_task(ws_tx, outbound_rx));

    {
        let mut core = handle.lock().await;
        // At most one sandbox socket: the previous one is closed before
        // the new one is accepted.
        core.close_sandbox_socket(1000, "New sandbox connecting");
        core.sandbox_sock = Some(SandboxConn {
            conn_seq,
            sandbox_id: sandbox_id.clone(),
            outbound: outbound_tx.clone(),
        });

        let now = now_ms();
        if let Err(e) = core
            .store
            .set_sandbox_status(SandboxStatus::Ready)
            .and_then(|_| core.store.touch_activity(now))
        {
            warn!(
                component = "hub",
                event = "hub.sandbox.accept_persist_failed",
                session = %handle.name,
                error = %e,
                "Failed to persist sandbox accept"
            );
        }
        core.broadcast_sandbox_status(SandboxStatus::Ready);
        sandbox_mgr::reschedule_inactivity(&mut core, &handle);
        if let Err(e) = queue::process_next(&mut core, &handle).await {
            warn!(
                component = "hub",
                event = "hub.sandbox.queue_drive_failed",
                session = %handle.name,
                error = %e,
                "Queue drive after sandbox connect failed"
            );
        }
    }

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let value: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            component = "hub",
                            event = "hub.sandbox.parse_failed",
                            session = %handle.name,
                            error = %e,
                            payload_bytes = text.len(),
                            "Unparseable sandbox frame"
                        );
                        continue;
                    }
                };
                let mut core = handle.lock().await;
                if let Err(e) = events::route_sandbox_event(&mut core, &handle, value).await {
                    warn!(
                        component = "hub",
                        event = "hub.sandbox.route_failed",
                        session = %handle.name,
                        error = %e,
                        "Sandbox event routing failed"
                    );
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.try_send(OutFrame::Pong(data.to_vec()));
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    let mut core = handle.lock().await;
    if core.sandbox_sock.as_ref().map(|s| s.conn_seq) == Some(conn_seq) {
        core.sandbox_sock = None;
        info!(
            component = "hub",
            event = "hub.sandbox.disconnected",
            session = %handle.name,
            conn_seq = conn_seq,
            "Sandbox socket disconnected"
        );
    }
}

// ---------------------------------------------------------------------------
// Client socket
// ---------------------------------------------------------------------------

async fn handle_client_socket(socket: WebSocket, handle: SessionHandle) {
    let socket_id = new_id();
    let (ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<OutFrame>(256);
    tokio::spawn(run_send_task(ws_tx, outbound_rx));

    debug!(
        component = "hub",
        event = "hub.client.connected",
        session = %handle.name,
        socket_id = %socket_id,
        "Client socket connected; awaiting subscribe"
    );

    // Phase 1: the socket must authenticate within the deadline.
    let deadline = {
        let core = handle.lock().await;
        tokio::time::Instant::now()
            + Duration::from_millis(core.deps.config.auth_deadline_ms)
    };

    let mut authenticated = false;
    while !authenticated {
        let next = tokio::time::timeout_at(deadline, ws_rx.next()).await;
        let frame = match next {
            Err(_) => {
                info!(
                    component = "hub",
                    event = "hub.client.auth_timeout",
                    session = %handle.name,
                    socket_id = %socket_id,
                    "Client never subscribed; closing"
                );
                let _ = outbound_tx
                    .send(OutFrame::Close {
                        code: CLOSE_AUTH_TIMEOUT,
                        reason: "Authentication timeout".to_string(),
                    })
                    .await;
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(_))) => return,
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            Message::Text(t) => t,
            Message::Ping(data) => {
                let _ = outbound_tx.try_send(OutFrame::Pong(data.to_vec()));
                continue;
            }
            Message::Close(_) => return,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Ping) => {
                send_json(&outbound_tx, &ServerMessage::Pong { timestamp: now_ms() });
            }
            Ok(ClientMessage::Subscribe { token, client_id }) => {
                let mut core = handle.lock().await;
                match subscribe(&mut core, &socket_id, &client_id, &token, &outbound_tx) {
                    Ok(()) => authenticated = true,
                    Err((code, reason)) => {
                        let _ = outbound_tx
                            .send(OutFrame::Close {
                                code,
                                reason: reason.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
            Ok(_) => {
                // After a host suspend the in-memory map is empty while
                // the socket survives; consult the durable mapping
                // before treating the socket as unauthenticated.
                let mut core = handle.lock().await;
                if recover_client(&mut core, &socket_id, &outbound_tx) {
                    authenticated = true;
                    drop(core);
                    handle_client_message(&handle, &socket_id, &outbound_tx, &text).await;
                } else {
                    send_json(
                        &outbound_tx,
                        &ServerMessage::Error {
                            code: "AUTH_REQUIRED".to_string(),
                            message: "Subscribe before sending messages".to_string(),
                        },
                    );
                }
            }
            Err(e) => {
                send_json(
                    &outbound_tx,
                    &ServerMessage::Error {
                        code: "INVALID_MESSAGE".to_string(),
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    // Phase 2: authenticated message loop.
    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => {
                handle_client_message(&handle, &socket_id, &outbound_tx, &text).await;
            }
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.try_send(OutFrame::Pong(data.to_vec()));
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    // Disconnect cleanup.
    let mut core = handle.lock().await;
    core.clients.remove(&socket_id);
    core.presence.remove(&socket_id);
    if let Err(e) = core.store.ws_client_delete(&socket_id) {
        warn!(
            component = "hub",
            event = "hub.client.cleanup_failed",
            session = %handle.name,
            socket_id = %socket_id,
            error = %e,
            "Failed to delete socket mapping"
        );
    }
    let update = ServerMessage::PresenceUpdate {
        participants: core.presence_entries(),
    };
    core.broadcast(&update);
    debug!(
        component = "hub",
        event = "hub.client.disconnected",
        session = %handle.name,
        socket_id = %socket_id,
        "Client socket disconnected"
    );
}

/// Validate the subscribe token, persist the socket mapping, and replay
/// state + history + presence to the new subscriber. Errors carry the
/// close code and reason to use.
fn subscribe(
    core: &mut SessionCore,
    socket_id: &str,
    client_id: &str,
    token: &str,
    outbound: &mpsc::Sender<OutFrame>,
) -> Result<(), (u16, &'static str)> {
    let hash = crypto::sha256_hex(token);
    let participant = match core.store.participant_by_ws_hash(&hash) {
        Ok(Some(p)) => p,
        _ => {
            info!(
                component = "hub",
                event = "hub.client.auth_failed",
                session = %core.name,
                socket_id = %socket_id,
                "Subscribe token did not match any participant"
            );
            return Err((CLOSE_INVALID_TOKEN, "Invalid authentication token"));
        }
    };

    let now = now_ms();
    if let Err(e) = core.store.ws_client_insert(&WsClientRow {
        socket_id: socket_id.to_string(),
        participant_id: participant.user_id.clone(),
        client_id: client_id.to_string(),
        created_at: now,
    }) {
        warn!(
            component = "hub",
            event = "hub.client.mapping_persist_failed",
            session = %core.name,
            error = %e,
            "Failed to persist socket mapping"
        );
        return Err((CLOSE_SESSION_EXPIRED, "Session expired, please reconnect"));
    }

    core.clients.insert(
        socket_id.to_string(),
        ClientConn {
            socket_id: socket_id.to_string(),
            participant_id: participant.user_id.clone(),
            client_id: client_id.to_string(),
            outbound: outbound.clone(),
        },
    );

    let (session_id, state) = match build_subscribed_state(core) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(
                component = "hub",
                event = "hub.client.state_failed",
                session = %core.name,
                error = %e,
                "Failed to assemble subscribe state"
            );
            return Err((CLOSE_SESSION_EXPIRED, "Session expired, please reconnect"));
        }
    };

    send_json(
        outbound,
        &ServerMessage::Subscribed {
            session_id,
            state,
            participant_id: participant.user_id.clone(),
            participant: participant.to_info(),
        },
    );
    send_json(
        outbound,
        &ServerMessage::PresenceSync {
            participants: core.presence_entries(),
        },
    );

    info!(
        component = "hub",
        event = "hub.client.subscribed",
        session = %core.name,
        socket_id = %socket_id,
        participant_id = %participant.user_id,
        "Client subscribed"
    );
    Ok(())
}

/// Rebuild in-memory client info from the durable socket mapping.
fn recover_client(
    core: &mut SessionCore,
    socket_id: &str,
    outbound: &mpsc::Sender<OutFrame>,
) -> bool {
    if core.clients.contains_key(socket_id) {
        return true;
    }
    match core.store.ws_client(socket_id) {
        Ok(Some(row)) => {
            info!(
                component = "hub",
                event = "hub.client.recovered",
                session = %core.name,
                socket_id = %socket_id,
                participant_id = %row.participant_id,
                "Recovered client identity from socket mapping"
            );
            core.clients.insert(
                socket_id.to_string(),
                ClientConn {
                    socket_id: socket_id.to_string(),
                    participant_id: row.participant_id,
                    client_id: row.client_id,
                    outbound: outbound.clone(),
                },
            );
            true
        }
        _ => false,
    }
}

async fn handle_client_message(
    handle: &SessionHandle,
    socket_id: &str,
    outbound: &mpsc::Sender<OutFrame>,
    text: &str,
) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            send_json(
                outbound,
                &ServerMessage::Error {
                    code: "INVALID_MESSAGE".to_string(),
                    message: e.to_string(),
                },
            );
            return;
        }
    };

    match msg {
        ClientMessage::Ping => {
            send_json(outbound, &ServerMessage::Pong { timestamp: now_ms() });
        }
        ClientMessage::Subscribe { .. } => {
            send_json(
                outbound,
                &ServerMessage::Error {
                    code: "INVALID_MESSAGE".to_string(),
                    message: "already subscribed".to_string(),
                },
            );
        }
        ClientMessage::Prompt {
            content,
            model,
            attachments,
        } => {
            let mut core = handle.lock().await;
            let Some(author_id) = core
                .clients
                .get(socket_id)
                .map(|c| c.participant_id.clone())
            else {
                return;
            };
            let result = queue::enqueue(
                &mut core,
                &author_id,
                &content,
                MessageSource::Web,
                model,
                attachments,
                None,
            );
            match result {
                Ok(_) => {
                    if let Err(e) = queue::process_next(&mut core, handle).await {
                        warn!(
                            component = "hub",
                            event = "hub.client.queue_drive_failed",
                            session = %handle.name,
                            error = %e,
                            "Queue drive after prompt failed"
                        );
                    }
                }
                Err(e) => {
                    send_json(
                        outbound,
                        &ServerMessage::Error {
                            code: "INVALID_MESSAGE".to_string(),
                            message: e.to_string(),
                        },
                    );
                }
            }
        }
        ClientMessage::Stop => {
            let core = handle.lock().await;
            core.send_to_sandbox(&SandboxCommand::Stop);
        }
        ClientMessage::Typing => {
            let mut core = handle.lock().await;
            if let Err(e) = sandbox_mgr::warm(&mut core, handle).await {
                warn!(
                    component = "hub",
                    event = "hub.client.warm_failed",
                    session = %handle.name,
                    error = %e,
                    "Warm spawn failed"
                );
            }
        }
        ClientMessage::Presence { status, cursor } => {
            let mut core = handle.lock().await;
            let Some(client) = core.clients.get(socket_id) else {
                return;
            };
            let entry = PresenceEntry {
                participant_id: client.participant_id.clone(),
                client_id: client.client_id.clone(),
                status,
                cursor,
            };
            core.presence.insert(socket_id.to_string(), entry);
            let update = ServerMessage::PresenceUpdate {
                participants: core.presence_entries(),
            };
            core.broadcast(&update);
        }
    }
}

fn send_json(outbound: &mpsc::Sender<OutFrame>, msg: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = outbound.try_send(OutFrame::Text(json));
    }
}

// ---------------------------------------------------------------------------
// History replay
// ---------------------------------------------------------------------------

/// State + interleaved history for the `subscribed` payload.
pub fn build_subscribed_state(core: &SessionCore) -> anyhow::Result<(String, SubscribedState)> {
    let session = core
        .store
        .session()?
        .ok_or_else(|| anyhow::anyhow!("no session"))?;
    let sandbox_status = core
        .store
        .sandbox()?
        .map(|s| s.status)
        .unwrap_or(SandboxStatus::Pending);

    let messages = core.store.recent_messages(HISTORY_MAX_MESSAGES)?;
    let events = core.store.recent_events(HISTORY_MAX_EVENTS)?;
    let truncated = core.store.message_count()? > messages.len() as u64
        || core.store.event_count()? > events.len() as u64;

    let history = interleave_history(messages, events);
    let session_id = session.id.clone();
    Ok((
        session_id,
        SubscribedState {
            session: session.to_view(sandbox_status),
            history,
            history_truncated: truncated,
        },
    ))
}

/// Merge messages and events by creation timestamp. Both inputs arrive
/// oldest-first; messages sort before events at equal timestamps.
pub fn interleave_history(
    messages: Vec<MessageRow>,
    events: Vec<slipway_protocol::EventRecord>,
) -> Vec<HistoryItem> {
    let mut items: Vec<HistoryItem> = messages
        .into_iter()
        .map(|m| HistoryItem::Message(m.to_record()))
        .chain(events.into_iter().map(HistoryItem::Event))
        .collect();
    items.sort_by_key(HistoryItem::created_at);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use slipway_protocol::{EventRecord, EventType, MessageStatus};

    fn message(id: &str, created_at: i64) -> MessageRow {
        MessageRow {
            id: id.into(),
            author_id: "u1".into(),
            content: "hi".into(),
            source: MessageSource::Web,
            model: None,
            attachments: Vec::new(),
            status: MessageStatus::Completed,
            error: None,
            callback_context: None,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    fn event(id: &str, created_at: i64) -> EventRecord {
        EventRecord {
            id: id.into(),
            event_type: EventType::Token,
            data: Value::Null,
            message_id: None,
            created_at,
        }
    }

    #[test]
    fn interleave_orders_by_timestamp() {
        let items = interleave_history(
            vec![message("m1", 100), message("m2", 300)],
            vec![event("e1", 200), event("e2", 400)],
        );
        let ids: Vec<&str> = items
            .iter()
            .map(|i| match i {
                HistoryItem::Message(m) => m.id.as_str(),
                HistoryItem::Event(e) => e.id.as_str(),
            })
            .collect();
        assert_eq!(ids, vec!["m1", "e1", "m2", "e2"]);
    }

    #[test]
    fn interleave_ties_put_message_first() {
        let items = interleave_history(vec![message("m1", 100)], vec![event("e1", 100)]);
        assert!(matches!(items[0], HistoryItem::Message(_)));
        assert!(matches!(items[1], HistoryItem::Event(_)));
    }
}
