//! Queue controller
//!
//! join/leave, capacity enforcement, position broadcast, and the
//! promotion loop that hands the queue head to the Session manager
//! whenever the active slot is idle (§4.6).

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::error::BrokerError;
use crate::hooks::{HookRegistry, LifecycleEvent};
use crate::invite::{InviteRejectReason, InviteService};
use crate::protocol::ServerMessage;
use crate::registry::{ClientState, EndReason, StateRegistry};
use crate::session::SessionManager;

/// Outcome of the join_queue call itself, delivered synchronously to the
/// client that made it. Updates to *other* clients (position shifts,
/// another client's session starting) go out through the registry's
/// per-client outbox instead — see `broadcast_positions`.
pub enum QueueNotification {
    Queued { position: usize, estimated_wait_minutes: u64 },
    SessionStarted { token: String, session_id: String },
    SpawnFailed,
}

pub struct QueueController {
    config_max_queue_size: usize,
    average_session_minutes: u64,
    base_url: String,
    invites: Arc<InviteService>,
    sessions: Arc<SessionManager>,
    hooks: Arc<HookRegistry>,
}

impl QueueController {
    pub fn new(
        max_queue_size: usize,
        average_session_minutes: u64,
        base_url: String,
        invites: Arc<InviteService>,
        sessions: Arc<SessionManager>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            config_max_queue_size: max_queue_size,
            average_session_minutes,
            base_url,
            invites,
            sessions,
            hooks,
        }
    }

    fn session_started_message(&self, token: String, session_id: &str) -> ServerMessage {
        ServerMessage::SessionStarted {
            token,
            url: format!("{}/session/{}", self.base_url, session_id),
        }
    }

    /// `joinQueue(client, inviteToken)`.
    pub async fn join_queue(
        &self,
        registry: &Arc<Mutex<StateRegistry>>,
        client_id: &str,
        invite_token: Option<&str>,
        client_ip: std::net::IpAddr,
    ) -> Result<QueueNotification, BrokerError> {
        {
            let reg = registry.lock().await;
            let client = reg.get_client(client_id).ok_or(BrokerError::Internal(
                "client not registered".to_string(),
            ))?;
            if client.state == ClientState::Queued || client.state == ClientState::Active {
                return Err(BrokerError::AlreadyInQueue);
            }
            if reg.queue_len() >= self.config_max_queue_size {
                return Err(BrokerError::QueueFull);
            }
        }

        self.invites
            .validate(invite_token, client_ip)
            .await
            .map_err(reject_reason_to_error)?;

        // `validate` only succeeds when a token was supplied.
        let invite_token = invite_token
            .ok_or(BrokerError::InviteMissing)?
            .to_string();

        {
            let mut reg = registry.lock().await;
            reg.enqueue(client_id);
            if let Some(client) = reg.get_client_mut(client_id) {
                client.state = ClientState::Queued;
                client.invite_token = Some(invite_token.clone());
            }
        }

        self.hooks.dispatch(&LifecycleEvent::QueueJoined {
            client_id: client_id.to_string(),
        });

        self.broadcast_positions(registry).await;

        self.try_promote(registry, client_id, invite_token).await
    }

    /// `leaveQueue(client)`.
    pub async fn leave_queue(&self, registry: &Arc<Mutex<StateRegistry>>, client_id: &str) {
        let removed = {
            let mut reg = registry.lock().await;
            let removed = reg.dequeue(client_id);
            if removed {
                if let Some(client) = reg.get_client_mut(client_id) {
                    client.state = ClientState::Connected;
                }
            }
            removed
        };
        if removed {
            self.hooks.dispatch(&LifecycleEvent::QueueLeft {
                client_id: client_id.to_string(),
            });
            self.broadcast_positions(registry).await;
        }
    }

    /// `broadcast`: for each queued client in order, push a `queue_update`
    /// with its 1-based position and estimated wait. Delivery is via each
    /// client's outbox, not the caller's own response channel, since most
    /// recipients are not the client that triggered this broadcast (§4.6).
    pub async fn broadcast_positions(&self, registry: &Arc<Mutex<StateRegistry>>) {
        let reg = registry.lock().await;
        for (i, id) in reg.queued_ids().enumerate() {
            let position = i + 1;
            reg.notify_client(
                id,
                ServerMessage::QueueUpdate {
                    position,
                    estimated_wait_minutes: position as u64 * self.average_session_minutes,
                },
            );
        }
    }

    /// Promotion loop: runs whenever the queue is non-empty and the slot
    /// is idle. On spawn failure the popped client returns to `connected`
    /// and the loop continues with the next head — the caller is
    /// expected to call this again after handling the notification for
    /// the head that just failed, since only one promotion attempt
    /// happens per invocation.
    async fn try_promote(
        &self,
        registry: &Arc<Mutex<StateRegistry>>,
        joining_client_id: &str,
        invite_token: String,
    ) -> Result<QueueNotification, BrokerError> {
        loop {
            let (head, slot_idle) = {
                let reg = registry.lock().await;
                (reg.queue_head().cloned(), reg.is_slot_idle())
            };

            let Some(head) = head else {
                return Ok(estimated_queue_notification(
                    registry,
                    self.average_session_minutes,
                    joining_client_id,
                )
                .await);
            };
            if !slot_idle {
                return Ok(estimated_queue_notification(
                    registry,
                    self.average_session_minutes,
                    joining_client_id,
                )
                .await);
            }

            {
                let mut reg = registry.lock().await;
                reg.pop_head();
            }

            let token = if head == joining_client_id {
                invite_token.clone()
            } else {
                let reg = registry.lock().await;
                reg.get_client(&head)
                    .and_then(|c| c.invite_token.clone())
                    .unwrap_or_default()
            };

            match self.sessions.promote(registry, head.clone(), token).await {
                Ok(outcome) => {
                    // `promote` already flips the holder's Client.state to
                    // Active under the same lock acquisition as
                    // set_active_session — no separate commit needed here.
                    if head == joining_client_id {
                        return Ok(QueueNotification::SessionStarted {
                            token: outcome.session_token,
                            session_id: outcome.session_id,
                        });
                    }
                    let msg = self.session_started_message(outcome.session_token, &outcome.session_id);
                    registry.lock().await.notify_client(&head, msg);
                    self.broadcast_positions(registry).await;
                    continue;
                }
                Err(_) => {
                    {
                        let mut reg = registry.lock().await;
                        if let Some(client) = reg.get_client_mut(&head) {
                            client.state = ClientState::Connected;
                        }
                    }
                    if head == joining_client_id {
                        return Ok(QueueNotification::SpawnFailed);
                    }
                    registry.lock().await.notify_client(
                        &head,
                        ServerMessage::SessionEnded {
                            reason: "spawn_failed".to_string(),
                        },
                    );
                    info!(client_id = %head, "promotion spawn failed, retrying next head");
                    continue;
                }
            }
        }
    }

    /// Re-entry point for the promotion loop driven by the periodic
    /// timer-sweep task after a teardown frees the slot; no joining
    /// client is involved so the result is just consumed for logging.
    pub async fn run_promotion_sweep(&self, registry: &Arc<Mutex<StateRegistry>>) {
        loop {
            let (head, slot_idle) = {
                let reg = registry.lock().await;
                (reg.queue_head().cloned(), reg.is_slot_idle())
            };
            let (Some(head), true) = (head, slot_idle) else {
                return;
            };

            {
                let mut reg = registry.lock().await;
                reg.pop_head();
            }
            let token = {
                let reg = registry.lock().await;
                reg.get_client(&head)
                    .and_then(|c| c.invite_token.clone())
                    .unwrap_or_default()
            };

            match self.sessions.promote(registry, head.clone(), token).await {
                Ok(outcome) => {
                    // See try_promote: `promote` already committed the
                    // holder's Active state alongside the session itself.
                    let msg = self.session_started_message(outcome.session_token, &outcome.session_id);
                    registry.lock().await.notify_client(&head, msg);
                    self.broadcast_positions(registry).await;
                    return;
                }
                Err(_) => {
                    {
                        let mut reg = registry.lock().await;
                        if let Some(client) = reg.get_client_mut(&head) {
                            client.state = ClientState::Connected;
                        }
                    }
                    registry.lock().await.notify_client(
                        &head,
                        ServerMessage::SessionEnded {
                            reason: "spawn_failed".to_string(),
                        },
                    );
                    continue;
                }
            }
        }
    }

    /// Tear down the active session then re-run the promotion loop.
    pub async fn end_and_promote(&self, registry: &Arc<Mutex<StateRegistry>>, reason: EndReason) {
        self.sessions.end_session(registry, reason).await;
        self.run_promotion_sweep(registry).await;
    }
}

async fn estimated_queue_notification(
    registry: &Arc<Mutex<StateRegistry>>,
    average_session_minutes: u64,
    client_id: &str,
) -> QueueNotification {
    let reg = registry.lock().await;
    let position = reg.queue_position(client_id).unwrap_or(0);
    QueueNotification::Queued {
        position,
        estimated_wait_minutes: position as u64 * average_session_minutes,
    }
}

pub(crate) fn reject_reason_to_error(reason: InviteRejectReason) -> BrokerError {
    match reason {
        InviteRejectReason::Missing => BrokerError::InviteMissing,
        InviteRejectReason::Invalid => BrokerError::InviteInvalid,
        InviteRejectReason::NotFound => BrokerError::InviteNotFound,
        InviteRejectReason::Expired => BrokerError::InviteExpired,
        InviteRejectReason::Used => BrokerError::InviteUsed,
        InviteRejectReason::Revoked => BrokerError::InviteRevoked,
        InviteRejectReason::RateLimited => BrokerError::RateLimitedInvite { retry_after_secs: 60 },
    }
}
