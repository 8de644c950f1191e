//! State registry
//!
//! Pure data plus cheap mutators: the set of connected clients, the FIFO
//! queue, the single active session slot, and the two token indexes.
//! No I/O, no external calls — everything here runs inside the broker's
//! single critical section (§4.4, §5).

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::protocol::ServerMessage;

/// Lifecycle state of one connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Queued,
    Active,
    Disconnecting,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub state: ClientState,
    pub remote_ip: IpAddr,
    pub user_agent: Option<String>,
    pub invite_token: Option<String>,
    pub pending_session_token: Option<String>,
    pub joined_at: Instant,
    /// Delivers server-initiated frames (queue_update, session_started,
    /// session_ended) to this client's connection task, which owns the
    /// actual socket write. A closed/dropped receiver means the
    /// connection is already gone; sends are best-effort.
    pub outbox: mpsc::UnboundedSender<ServerMessage>,
}

/// End-of-life reason recorded on an active session, mirrored to clients
/// in `session_ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    SpawnFailed,
    Timeout,
    Disconnected,
    Explicit,
    ChildExited,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnFailed => "spawn_failed",
            Self::Timeout => "timeout",
            Self::Disconnected => "disconnected",
            Self::Explicit => "explicit",
            Self::ChildExited => "child_exited",
        }
    }
}

#[derive(Debug)]
pub struct ActiveSession {
    pub session_id: String,
    pub session_token: String,
    pub client_id: String,
    pub child_pid: Option<u32>,
    pub started_at: Instant,
    pub hard_expiry_at: Instant,
    pub invite_token: String,
    pub disconnect_grace_deadline: Option<Instant>,
    pub errors: Vec<String>,
}

/// In-memory source of truth. Every mutation here is expected to run
/// behind the broker's single coarse lock; this type performs no locking
/// of its own.
#[derive(Default)]
pub struct StateRegistry {
    clients: HashMap<String, Client>,
    queue: VecDeque<String>,
    active: Option<ActiveSession>,
    active_tokens: HashMap<String, String>,  // token -> session_id
    pending_tokens: HashMap<String, String>, // token -> client_id
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Clients ---

    pub fn add_client(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn remove_client(&mut self, client_id: &str) -> Option<Client> {
        self.clients.remove(client_id)
    }

    pub fn get_client(&self, client_id: &str) -> Option<&Client> {
        self.clients.get(client_id)
    }

    pub fn get_client_mut(&mut self, client_id: &str) -> Option<&mut Client> {
        self.clients.get_mut(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Best-effort delivery of a server-initiated frame to a connected
    /// client. Silently dropped if the client is no longer connected or
    /// its connection task has already exited.
    pub fn notify_client(&self, client_id: &str, msg: ServerMessage) {
        if let Some(client) = self.clients.get(client_id) {
            let _ = client.outbox.send(msg);
        }
    }

    // --- Queue ---

    /// (I1) no duplicates. Returns false if already queued.
    pub fn enqueue(&mut self, client_id: &str) -> bool {
        if self.queue.iter().any(|id| id == client_id) {
            return false;
        }
        self.queue.push_back(client_id.to_string());
        true
    }

    pub fn dequeue(&mut self, client_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|id| id != client_id);
        self.queue.len() != before
    }

    pub fn queue_head(&self) -> Option<&String> {
        self.queue.front()
    }

    pub fn pop_head(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_position(&self, client_id: &str) -> Option<usize> {
        self.queue.iter().position(|id| id == client_id).map(|p| p + 1)
    }

    pub fn queued_ids(&self) -> impl Iterator<Item = &String> {
        self.queue.iter()
    }

    // --- Active session ---

    pub fn active_session(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    pub fn active_session_mut(&mut self) -> Option<&mut ActiveSession> {
        self.active.as_mut()
    }

    pub fn set_active_session(&mut self, session: ActiveSession) {
        self.active = Some(session);
    }

    pub fn clear_active_session(&mut self) -> Option<ActiveSession> {
        self.active.take()
    }

    pub fn is_slot_idle(&self) -> bool {
        self.active.is_none()
    }

    // --- Token indexes ---

    pub fn add_pending_token(&mut self, token: String, client_id: String) {
        self.pending_tokens.insert(token, client_id);
    }

    pub fn remove_pending_token(&mut self, token: &str) -> Option<String> {
        self.pending_tokens.remove(token)
    }

    pub fn pending_token_client(&self, token: &str) -> Option<&String> {
        self.pending_tokens.get(token)
    }

    pub fn promote_token(&mut self, token: &str, session_id: String) {
        self.pending_tokens.remove(token);
        self.active_tokens.insert(token.to_string(), session_id);
    }

    pub fn remove_active_token(&mut self, token: &str) -> Option<String> {
        self.active_tokens.remove(token)
    }

    pub fn active_token_session(&self, token: &str) -> Option<&String> {
        self.active_tokens.get(token)
    }

    /// Clear both token-index entries that reference `session_id`.
    pub fn clear_tokens_for_session(&mut self, session_token: &str) {
        self.active_tokens.remove(session_token);
        self.pending_tokens.remove(session_token);
    }
}
