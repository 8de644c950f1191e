//! Connection handler
//!
//! Per-connection WebSocket protocol: origin check, per-IP rate limit,
//! handshake, message routing, and close handling (§4.7).

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::BrokerError;
use crate::net::{client_ip, OriginPolicy};
use crate::protocol::{parse_client_message, ClientMessage, ServerMessage};
use crate::queue::{QueueController, QueueNotification};
use crate::rate_limit::ConnectionLimiter;
use crate::registry::{Client, ClientState, StateRegistry};
use crate::session::SessionManager;

/// Shared dependencies a connection handler needs; cheap to clone (all
/// `Arc`s), one instance built once in `main` and cloned per connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<Config>,
    pub registry: Arc<Mutex<StateRegistry>>,
    pub queue: Arc<QueueController>,
    pub sessions: Arc<SessionManager>,
    pub connection_limiter: Arc<ConnectionLimiter>,
    pub origin_policy: Arc<OriginPolicy>,
}

/// Drive one accepted TCP connection through the WebSocket handshake and
/// message loop. Errors here close the socket; they never panic the
/// listener task.
pub async fn handle_connection(
    ctx: ConnectionContext,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), BrokerError> {
    let mut origin_header = None;
    let mut forwarded_for = None;
    let mut session_cookie = None;

    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
         response: tokio_tungstenite::tungstenite::handshake::server::Response| {
            origin_header = req
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            forwarded_for = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            session_cookie = req
                .headers()
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .and_then(find_session_cookie);
            Ok(response)
        },
    )
    .await
    .map_err(|e| BrokerError::Internal(format!("ws handshake failed: {e}")))?;

    let ip = client_ip(forwarded_for.as_deref(), peer);

    let (mut sink, mut stream) = ws_stream.split();

    if let Err(e) = ctx.origin_policy.check(origin_header.as_deref()) {
        let _ = close_with_error(&mut sink, &e).await;
        return Err(e);
    }
    if let Err(e) = ctx.connection_limiter.try_acquire(ip).await {
        let _ = close_with_error(&mut sink, &e).await;
        return Err(e);
    }

    let client_id = Uuid::new_v4().to_string();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let reconnected = match &session_cookie {
        Some(token) => match ctx.sessions.reconnect(&ctx.registry, &client_id, token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Token matches the active session but its holder is still
                // connected (grace not armed) — reject rather than let a
                // second tab or a copied cookie steal the slot (§4.5/§6).
                let _ = close_with_error(&mut sink, &e).await;
                return Err(e);
            }
        },
        None => None,
    };

    let initial_message = if let Some(outcome) = reconnected {
        {
            let mut reg = ctx.registry.lock().await;
            reg.add_client(Client {
                id: client_id.clone(),
                state: ClientState::Active,
                remote_ip: ip,
                user_agent: None,
                invite_token: None,
                pending_session_token: None,
                joined_at: std::time::Instant::now(),
                outbox: outbox_tx.clone(),
            });
        }
        info!(client_id = %client_id, %ip, session_id = %outcome.session_id, "client reconnected to active session");
        ServerMessage::SessionStarted {
            token: outcome.session_token,
            url: format!("{}/session/{}", ctx.config.base_url, outcome.session_id),
        }
    } else {
        {
            let mut reg = ctx.registry.lock().await;
            reg.add_client(Client {
                id: client_id.clone(),
                state: ClientState::Connected,
                remote_ip: ip,
                user_agent: None,
                invite_token: None,
                pending_session_token: None,
                joined_at: std::time::Instant::now(),
                outbox: outbox_tx.clone(),
            });
        }
        info!(client_id = %client_id, %ip, "client connected");
        let reg = ctx.registry.lock().await;
        ServerMessage::Status {
            queue_size: reg.queue_len(),
            session_active: reg.active_session().is_some(),
            platforms: ctx
                .config
                .enabled_platforms
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
            position: None,
        }
    };
    send(&mut sink, &initial_message).await?;

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let outbound = route_message(&ctx, &client_id, ip, &text).await;
                        let mut send_failed = false;
                        for msg in outbound {
                            if send(&mut sink, &msg).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                        if send_failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            // Pushed by the queue controller / session manager from other
            // tasks: queue position shifts, another client's session
            // starting, or this session ending out from under a stale
            // channel (§4.7).
            Some(msg) = outbox_rx.recv() => {
                if send(&mut sink, &msg).await.is_err() {
                    break;
                }
            }
        }
    }

    on_close(&ctx, &client_id).await;
    info!(client_id = %client_id, "client disconnected");
    Ok(())
}

const SESSION_COOKIE: &str = "demo_session";

/// Pull the `demo_session` value out of a raw `Cookie` header.
fn find_session_cookie(header: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

async fn route_message(
    ctx: &ConnectionContext,
    client_id: &str,
    ip: std::net::IpAddr,
    raw: &str,
) -> Vec<ServerMessage> {
    let parsed = match parse_client_message(raw) {
        Ok(m) => m,
        Err(err_msg) => return vec![err_msg],
    };

    match parsed {
        ClientMessage::Heartbeat => vec![ServerMessage::HeartbeatAck],
        ClientMessage::LeaveQueue => {
            ctx.queue.leave_queue(&ctx.registry, client_id).await;
            vec![ServerMessage::QueueUpdate {
                position: 0,
                estimated_wait_minutes: 0,
            }]
        }
        ClientMessage::JoinQueue { invite_token } => {
            match ctx
                .queue
                .join_queue(&ctx.registry, client_id, invite_token.as_deref(), ip)
                .await
            {
                Ok(QueueNotification::Queued {
                    position,
                    estimated_wait_minutes,
                }) => vec![ServerMessage::QueueUpdate {
                    position,
                    estimated_wait_minutes,
                }],
                Ok(QueueNotification::SessionStarted { token, session_id }) => {
                    vec![ServerMessage::SessionStarted {
                        token,
                        url: format!("{}/session/{}", ctx.config.base_url, session_id),
                    }]
                }
                Ok(QueueNotification::SpawnFailed) => {
                    vec![ServerMessage::error(
                        BrokerError::SessionSpawnFailed(String::new()).code(),
                        "session failed to start",
                    )]
                }
                Err(e) => vec![ServerMessage::error(e.code(), e.message())],
            }
        }
    }
}

/// On close: remove from queue if queued; arm grace if the holder; drop
/// any pending token (§4.7 close handling). A client that lost the race to
/// a reconnect on another channel is no longer the active session's holder
/// by the time its own close runs, so it must not re-arm the grace timer.
async fn on_close(ctx: &ConnectionContext, client_id: &str) {
    let (was_active, was_queued, pending_token) = {
        let mut reg = ctx.registry.lock().await;
        let client = reg.remove_client(client_id);
        // Holder identity alone, not `Client.state` — `promote()` commits
        // the active session and the holder's `Active` state atomically
        // under one lock acquisition now, but this stays independent of
        // `ClientState` on purpose: the active-session slot, not the
        // client's own state flag, is the source of truth for who must be
        // grace-armed on close (§4.5).
        let was_active = reg
            .active_session()
            .map(|a| a.client_id == client_id)
            .unwrap_or(false);
        let was_queued = client
            .as_ref()
            .map(|c| c.state == ClientState::Queued)
            .unwrap_or(false);
        let pending_token = client.as_ref().and_then(|c| c.pending_session_token.clone());
        if was_queued {
            reg.dequeue(client_id);
        }
        (was_active, was_queued, pending_token)
    };

    if let Some(token) = pending_token {
        let mut reg = ctx.registry.lock().await;
        reg.remove_pending_token(&token);
    }

    if was_active {
        ctx.sessions.arm_disconnect_grace(&ctx.registry).await;
    }
    let _ = was_queued;
}

async fn send(
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    msg: &ServerMessage,
) -> Result<(), BrokerError> {
    let text = serde_json::to_string(msg)
        .map_err(|e| BrokerError::Internal(format!("serialize failed: {e}")))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| BrokerError::Internal(format!("send failed: {e}")))
}

async fn close_with_error(
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    err: &BrokerError,
) -> Result<(), BrokerError> {
    warn!(code = err.code(), "closing connection");
    let reason = err.close_reason();
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Policy,
            reason: reason.into(),
        })))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_session_cookie_among_several() {
        let header = "other=1; demo_session=abc123; third=x";
        assert_eq!(find_session_cookie(header), Some("abc123".to_string()));
    }

    #[test]
    fn returns_none_without_session_cookie() {
        assert_eq!(find_session_cookie("other=1; third=x"), None);
    }

    #[test]
    fn single_cookie_with_no_separator() {
        assert_eq!(
            find_session_cookie("demo_session=onlyvalue"),
            Some("onlyvalue".to_string())
        );
    }
}
