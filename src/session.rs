//! Session manager
//!
//! The state machine that promotes a queued client into the single active
//! session slot: allocates a session id and secret token, writes the
//! per-session env file, spawns the child, arms the hard-expiry clock,
//! and guarantees teardown on every exit path (§4.5).

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::BrokerError;
use crate::hooks::{HookRegistry, LifecycleEvent};
use crate::protocol::ServerMessage;
use crate::registry::{ActiveSession, EndReason, StateRegistry};

/// Abstraction over a spawned child so tests can substitute a fake
/// process that never exits until explicitly killed.
#[async_trait]
pub trait ChildProcess: Send {
    async fn wait(&mut self) -> std::io::Result<i32>;
    async fn kill(&mut self) -> std::io::Result<()>;
    fn id(&self) -> Option<u32>;
    /// Non-blocking exit check, polled by the periodic sweep (§4.5 —
    /// `active` transitions to `ending` on child exit, not just timeout
    /// or grace expiry). `Ok(true)` means the child has already exited.
    fn has_exited(&mut self) -> std::io::Result<bool>;
}

#[async_trait]
impl ChildProcess for tokio::process::Child {
    async fn wait(&mut self) -> std::io::Result<i32> {
        let status = tokio::process::Child::wait(self).await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        tokio::process::Child::kill(self).await
    }

    fn id(&self) -> Option<u32> {
        tokio::process::Child::id(self)
    }

    fn has_exited(&mut self) -> std::io::Result<bool> {
        Ok(tokio::process::Child::try_wait(self)?.is_some())
    }
}

/// Spawns the backend child process. The container image and invocation
/// form are configuration, not protocol — see DESIGN.md for the assumed
/// command line.
#[async_trait]
pub trait ChildSpawner: Send + Sync {
    async fn spawn(
        &self,
        session_id: &str,
        env_file: &Path,
    ) -> Result<Box<dyn ChildProcess>, BrokerError>;
}

pub struct RealChildSpawner {
    container_image: String,
}

impl RealChildSpawner {
    pub fn new(container_image: String) -> Self {
        Self { container_image }
    }
}

#[async_trait]
impl ChildSpawner for RealChildSpawner {
    async fn spawn(
        &self,
        session_id: &str,
        env_file: &Path,
    ) -> Result<Box<dyn ChildProcess>, BrokerError> {
        let child = Command::new("docker")
            .arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(format!("session-{session_id}"))
            .arg("--env-file")
            .arg(env_file)
            .arg(&self.container_image)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BrokerError::SessionSpawnFailed(e.to_string()))?;
        Ok(Box::new(child))
    }
}

fn now_instant_plus(d: Duration) -> Instant {
    Instant::now() + d
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The outcome of a successful promotion, used by the Connection handler
/// to notify the newly-active client.
pub struct PromoteOutcome {
    pub session_id: String,
    pub session_token: String,
}

/// Coordinates session spawn/teardown. Holds the live child handle table
/// separately from `StateRegistry` since killing a child is I/O and must
/// happen outside the registry's critical section.
pub struct SessionManager {
    config: Arc<Config>,
    hooks: Arc<HookRegistry>,
    spawner: Arc<dyn ChildSpawner>,
    children: Mutex<HashMap<String, Box<dyn ChildProcess>>>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, hooks: Arc<HookRegistry>, spawner: Arc<dyn ChildSpawner>) -> Self {
        Self {
            config,
            hooks,
            spawner,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn env_file_path(&self, session_id: &str) -> PathBuf {
        Path::new(&self.config.session_env_dir).join(session_id)
    }

    /// Write the per-session env file: mode 0600, one `KEY=value` line per
    /// configured credential plus the Claude auth token.
    async fn write_env_file(&self, session_id: &str) -> Result<PathBuf, BrokerError> {
        let path = self.env_file_path(session_id);
        let mut contents = String::new();
        for creds in self.config.platform_credentials.values() {
            for (k, v) in &creds.0 {
                contents.push_str(&format!("{}={}\n", k.to_uppercase(), v));
            }
        }
        if let Some(token) = &self.config.claude_oauth_token {
            contents.push_str(&format!("CLAUDE_OAUTH_TOKEN={token}\n"));
        }
        if let Some(key) = &self.config.anthropic_api_key {
            contents.push_str(&format!("ANTHROPIC_API_KEY={key}\n"));
        }

        fs::write(&path, contents)
            .await
            .map_err(|e| BrokerError::FileError(format!("env file write failed: {e}")))?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| BrokerError::FileError(format!("env file chmod failed: {e}")))?;
        Ok(path)
    }

    async fn delete_env_file(&self, session_id: &str) {
        let path = self.env_file_path(session_id);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id = %session_id, error = %e, "failed to delete env file");
            }
        }
    }

    /// Promote `client_id` into the active slot. Caller must have already
    /// confirmed the slot was idle and popped the client from the queue
    /// before calling; this runs the I/O-heavy `spawning` state and
    /// commits the result into `registry` under a fresh lock acquisition.
    pub async fn promote(
        &self,
        registry: &Arc<Mutex<StateRegistry>>,
        client_id: String,
        invite_token: String,
    ) -> Result<PromoteOutcome, BrokerError> {
        let session_id = Uuid::new_v4().to_string();
        let session_token = generate_token();

        let mut errors = self.hooks.dispatch(&LifecycleEvent::BeforeSessionStart {
            session_id: session_id.clone(),
        });
        if !errors.is_empty() {
            warn!(session_id = %session_id, count = errors.len(), "before-session-start hook errors");
        }

        {
            let mut reg = registry.lock().await;
            reg.add_pending_token(session_token.clone(), client_id.clone());
        }

        let env_path = match self.write_env_file(&session_id).await {
            Ok(p) => p,
            Err(e) => {
                self.fail_spawn(registry, &session_token, &session_id).await;
                return Err(e);
            }
        };

        let child = match self.spawner.spawn(&session_id, &env_path).await {
            Ok(c) => c,
            Err(e) => {
                self.delete_env_file(&session_id).await;
                self.fail_spawn(registry, &session_token, &session_id).await;
                return Err(e);
            }
        };
        let child_pid = child.id();
        self.children.lock().await.insert(session_id.clone(), child);

        {
            let mut reg = registry.lock().await;
            reg.promote_token(&session_token, session_id.clone());
            reg.set_active_session(ActiveSession {
                session_id: session_id.clone(),
                session_token: session_token.clone(),
                client_id: client_id.clone(),
                child_pid,
                started_at: Instant::now(),
                hard_expiry_at: now_instant_plus(self.config.session_timeout),
                invite_token,
                disconnect_grace_deadline: None,
                errors: std::mem::take(&mut errors),
            });
            // Set under the same lock acquisition as `set_active_session` —
            // a client.state flip in a separately-acquired lock would leave
            // a window where the active slot is held but the holder's own
            // Client record still reads Queued/Connected, so a disconnect
            // landing in that window would fail `on_close`'s holder check
            // and never arm the grace timer (§4.5).
            if let Some(client) = reg.get_client_mut(&client_id) {
                client.state = crate::registry::ClientState::Active;
            }
        }

        let after_start_errors = self.hooks.dispatch(&LifecycleEvent::AfterSessionStart {
            session_id: session_id.clone(),
        });
        if !after_start_errors.is_empty() {
            warn!(session_id = %session_id, count = after_start_errors.len(), "after-session-start hook errors");
            let mut reg = registry.lock().await;
            if let Some(active) = reg.active_session_mut() {
                active.errors.extend(after_start_errors);
            }
        }

        info!(session_id = %session_id, client_id = %client_id, "session promoted to active");
        Ok(PromoteOutcome {
            session_id,
            session_token,
        })
    }

    async fn fail_spawn(
        &self,
        registry: &Arc<Mutex<StateRegistry>>,
        session_token: &str,
        session_id: &str,
    ) {
        error!(session_id = %session_id, "session spawn failed");
        let mut reg = registry.lock().await;
        reg.remove_pending_token(session_token);
        drop(reg);
        let errors = self.hooks.dispatch(&LifecycleEvent::AfterSessionEnd {
            session_id: session_id.to_string(),
            reason: EndReason::SpawnFailed.as_str().to_string(),
        });
        if !errors.is_empty() {
            warn!(session_id = %session_id, count = errors.len(), "after-session-end hook errors (spawn failed)");
        }
    }

    /// Tear down the active session for `reason`. Safe to call even if
    /// the child already exited; killing an exited child is a no-op error
    /// we swallow.
    pub async fn end_session(&self, registry: &Arc<Mutex<StateRegistry>>, reason: EndReason) {
        let mut active = {
            let mut reg = registry.lock().await;
            reg.clear_active_session()
        };
        let Some(active) = &mut active else { return };

        let before_end_errors = self.hooks.dispatch(&LifecycleEvent::BeforeSessionEnd {
            session_id: active.session_id.clone(),
            reason: reason.as_str().to_string(),
        });
        active.errors.extend(before_end_errors);

        if let Some(mut child) = self.children.lock().await.remove(&active.session_id) {
            let _ = child.kill().await;
        }
        self.delete_env_file(&active.session_id).await;

        {
            let mut reg = registry.lock().await;
            reg.clear_tokens_for_session(&active.session_token);
            reg.notify_client(
                &active.client_id,
                ServerMessage::SessionEnded {
                    reason: reason.as_str().to_string(),
                },
            );
        }

        let after_end_errors = self.hooks.dispatch(&LifecycleEvent::AfterSessionEnd {
            session_id: active.session_id.clone(),
            reason: reason.as_str().to_string(),
        });
        active.errors.extend(after_end_errors);

        if !active.errors.is_empty() {
            warn!(
                session_id = %active.session_id,
                count = active.errors.len(),
                "session ended with accumulated hook errors"
            );
        }
        info!(session_id = %active.session_id, reason = reason.as_str(), "session ended");
    }

    /// Arm the disconnect-grace timer on the active session (holder's
    /// connection closed). Does not transition to `ending`.
    pub async fn arm_disconnect_grace(&self, registry: &Arc<Mutex<StateRegistry>>) {
        let mut reg = registry.lock().await;
        if let Some(active) = reg.active_session_mut() {
            active.disconnect_grace_deadline =
                Some(now_instant_plus(self.config.disconnect_grace));
        }
    }

    /// Cancel the disconnect-grace timer on reconnect with a matching
    /// session cookie.
    pub async fn cancel_disconnect_grace(&self, registry: &Arc<Mutex<StateRegistry>>) {
        let mut reg = registry.lock().await;
        if let Some(active) = reg.active_session_mut() {
            active.disconnect_grace_deadline = None;
        }
    }

    /// A new channel presents `token` as its session cookie. Reconnect is
    /// only meaningful as a replacement for a holder whose connection has
    /// already closed — i.e. the grace timer is armed (§4.5). If the
    /// token matches the active session but no disconnect is in progress,
    /// the slot is still held by a live connection and the attempt is
    /// rejected rather than silently stealing the holder's seat (two
    /// tabs, a copied cookie, or a racing reconnect must not be able to
    /// do that). Returns:
    /// - `Ok(None)` if no active session exists or the token doesn't match
    ///   the current one (fall through to a normal fresh connection).
    /// - `Err(ReconnectionInProgress)` if the token matches but the holder
    ///   is still connected (grace not armed).
    /// - `Ok(Some(..))` if the token matches and grace is armed: rebinds
    ///   the holder to `client_id` and cancels the timer. Child pid and
    ///   session id are unchanged.
    pub async fn reconnect(
        &self,
        registry: &Arc<Mutex<StateRegistry>>,
        client_id: &str,
        token: &str,
    ) -> Result<Option<PromoteOutcome>, BrokerError> {
        let mut reg = registry.lock().await;
        let Some(active) = reg.active_session_mut() else {
            return Ok(None);
        };
        if active.session_token != token {
            return Ok(None);
        }
        if active.disconnect_grace_deadline.is_none() {
            return Err(BrokerError::ReconnectionInProgress);
        }
        active.client_id = client_id.to_string();
        active.disconnect_grace_deadline = None;
        Ok(Some(PromoteOutcome {
            session_id: active.session_id.clone(),
            session_token: active.session_token.clone(),
        }))
    }

    /// Checked by the periodic timer-sweep task: has the grace window or
    /// hard-expiry elapsed for the current active session, or has its
    /// child already exited on its own (crash, container stop)?
    pub async fn due_end_reason(&self, registry: &Arc<Mutex<StateRegistry>>) -> Option<EndReason> {
        let session_id = {
            let reg = registry.lock().await;
            let active = reg.active_session()?;
            let now = Instant::now();
            if let Some(deadline) = active.disconnect_grace_deadline {
                if now >= deadline {
                    return Some(EndReason::Disconnected);
                }
            }
            if now >= active.hard_expiry_at {
                return Some(EndReason::Timeout);
            }
            active.session_id.clone()
        };

        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&session_id) {
            if matches!(child.has_exited(), Ok(true)) {
                return Some(EndReason::ChildExited);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    struct FakeChild {
        kill_tx: Option<oneshot::Sender<()>>,
        exit_rx: oneshot::Receiver<i32>,
        id: u32,
    }

    #[async_trait]
    impl ChildProcess for FakeChild {
        async fn wait(&mut self) -> std::io::Result<i32> {
            Ok((&mut self.exit_rx).await.unwrap_or(-1))
        }

        async fn kill(&mut self) -> std::io::Result<()> {
            if let Some(tx) = self.kill_tx.take() {
                let _ = tx.send(());
            }
            Ok(())
        }

        fn id(&self) -> Option<u32> {
            Some(self.id)
        }

        fn has_exited(&mut self) -> std::io::Result<bool> {
            match self.exit_rx.try_recv() {
                Ok(_) => Ok(true),
                Err(oneshot::error::TryRecvError::Empty) => Ok(false),
                Err(oneshot::error::TryRecvError::Closed) => Ok(true),
            }
        }
    }

    /// Retains each spawned child's exit sender in `exit_txs` so it is not
    /// dropped (which `oneshot` treats as an immediate "closed" exit) —
    /// tests that don't care about exit detection get a child that stays
    /// running; `trigger_exit` lets a test simulate a crash on demand.
    struct FakeSpawner {
        fail: bool,
        exit_txs: Mutex<HashMap<String, oneshot::Sender<i32>>>,
    }

    impl FakeSpawner {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                exit_txs: Mutex::new(HashMap::new()),
            }
        }

        async fn trigger_exit(&self, session_id: &str) {
            if let Some(tx) = self.exit_txs.lock().await.remove(session_id) {
                let _ = tx.send(0);
            }
        }
    }

    #[async_trait]
    impl ChildSpawner for FakeSpawner {
        async fn spawn(
            &self,
            session_id: &str,
            _env_file: &Path,
        ) -> Result<Box<dyn ChildProcess>, BrokerError> {
            if self.fail {
                return Err(BrokerError::SessionSpawnFailed("ENOENT".into()));
            }
            let (kill_tx, _kill_rx) = oneshot::channel::<()>();
            let (exit_tx, exit_rx) = oneshot::channel::<i32>();
            self.exit_txs
                .lock()
                .await
                .insert(session_id.to_string(), exit_tx);
            Ok(Box::new(FakeChild {
                kill_tx: Some(kill_tx),
                exit_rx,
                id: 4242,
            }))
        }
    }

    fn test_config() -> Arc<Config> {
        std::env::set_var("SESSION_SECRET", "s");
        std::env::set_var("ANTHROPIC_API_KEY", "sk-test");
        std::env::set_var("SESSION_ENV_HOST_PATH", std::env::temp_dir().to_str().unwrap());
        Arc::new(Config::from_env().unwrap())
    }

    #[tokio::test]
    async fn promote_sets_active_session_and_tokens() {
        let config = test_config();
        let hooks = Arc::new(HookRegistry::new());
        let spawner: Arc<dyn ChildSpawner> = Arc::new(FakeSpawner::new(false));
        let manager = SessionManager::new(config, hooks, spawner);
        let registry = Arc::new(Mutex::new(StateRegistry::new()));

        let outcome = manager
            .promote(&registry, "client1".to_string(), "INV1".to_string())
            .await
            .unwrap();

        let reg = registry.lock().await;
        assert!(!reg.is_slot_idle());
        assert_eq!(
            reg.active_token_session(&outcome.session_token),
            Some(&outcome.session_id)
        );
    }

    #[tokio::test]
    async fn promote_failure_returns_slot_to_idle() {
        let config = test_config();
        let hooks = Arc::new(HookRegistry::new());
        let spawner: Arc<dyn ChildSpawner> = Arc::new(FakeSpawner::new(true));
        let manager = SessionManager::new(config, hooks, spawner);
        let registry = Arc::new(Mutex::new(StateRegistry::new()));

        let result = manager
            .promote(&registry, "client1".to_string(), "INV1".to_string())
            .await;
        assert!(result.is_err());

        let reg = registry.lock().await;
        assert!(reg.is_slot_idle());
    }

    #[tokio::test]
    async fn end_session_clears_slot_and_tokens() {
        let config = test_config();
        let hooks = Arc::new(HookRegistry::new());
        let spawner: Arc<dyn ChildSpawner> = Arc::new(FakeSpawner::new(false));
        let manager = SessionManager::new(config, hooks, spawner);
        let registry = Arc::new(Mutex::new(StateRegistry::new()));

        let outcome = manager
            .promote(&registry, "client1".to_string(), "INV1".to_string())
            .await
            .unwrap();
        manager.end_session(&registry, EndReason::Explicit).await;

        let reg = registry.lock().await;
        assert!(reg.is_slot_idle());
        assert!(reg.active_token_session(&outcome.session_token).is_none());
    }

    #[tokio::test]
    async fn disconnect_grace_arms_and_cancels() {
        let config = test_config();
        let hooks = Arc::new(HookRegistry::new());
        let spawner: Arc<dyn ChildSpawner> = Arc::new(FakeSpawner::new(false));
        let manager = SessionManager::new(config, hooks, spawner);
        let registry = Arc::new(Mutex::new(StateRegistry::new()));

        manager
            .promote(&registry, "client1".to_string(), "INV1".to_string())
            .await
            .unwrap();

        manager.arm_disconnect_grace(&registry).await;
        {
            let reg = registry.lock().await;
            assert!(reg.active_session().unwrap().disconnect_grace_deadline.is_some());
        }

        manager.cancel_disconnect_grace(&registry).await;
        let reg = registry.lock().await;
        assert!(reg.active_session().unwrap().disconnect_grace_deadline.is_none());
    }

    #[tokio::test]
    async fn reconnect_with_matching_token_rebinds_holder_and_cancels_grace() {
        let config = test_config();
        let hooks = Arc::new(HookRegistry::new());
        let spawner: Arc<dyn ChildSpawner> = Arc::new(FakeSpawner::new(false));
        let manager = SessionManager::new(config, hooks, spawner);
        let registry = Arc::new(Mutex::new(StateRegistry::new()));

        let outcome = manager
            .promote(&registry, "client1".to_string(), "INV1".to_string())
            .await
            .unwrap();
        manager.arm_disconnect_grace(&registry).await;

        let reconnected = manager
            .reconnect(&registry, "client2", &outcome.session_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reconnected.session_id, outcome.session_id);

        let reg = registry.lock().await;
        let active = reg.active_session().unwrap();
        assert_eq!(active.client_id, "client2");
        assert!(active.disconnect_grace_deadline.is_none());
    }

    #[tokio::test]
    async fn reconnect_with_wrong_token_returns_none() {
        let config = test_config();
        let hooks = Arc::new(HookRegistry::new());
        let spawner: Arc<dyn ChildSpawner> = Arc::new(FakeSpawner::new(false));
        let manager = SessionManager::new(config, hooks, spawner);
        let registry = Arc::new(Mutex::new(StateRegistry::new()));

        manager
            .promote(&registry, "client1".to_string(), "INV1".to_string())
            .await
            .unwrap();

        assert!(manager
            .reconnect(&registry, "client2", "not-the-token")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reconnect_without_grace_armed_is_rejected() {
        let config = test_config();
        let hooks = Arc::new(HookRegistry::new());
        let spawner: Arc<dyn ChildSpawner> = Arc::new(FakeSpawner::new(false));
        let manager = SessionManager::new(config, hooks, spawner);
        let registry = Arc::new(Mutex::new(StateRegistry::new()));

        let outcome = manager
            .promote(&registry, "client1".to_string(), "INV1".to_string())
            .await
            .unwrap();

        // No disconnect has happened — the original holder is still live.
        let result = manager
            .reconnect(&registry, "client2", &outcome.session_token)
            .await;
        assert_eq!(result, Err(BrokerError::ReconnectionInProgress));

        let reg = registry.lock().await;
        assert_eq!(reg.active_session().unwrap().client_id, "client1");
    }

    #[tokio::test]
    async fn due_end_reason_is_none_while_child_is_running() {
        let config = test_config();
        let hooks = Arc::new(HookRegistry::new());
        let spawner = Arc::new(FakeSpawner::new(false));
        let manager = SessionManager::new(config, hooks, spawner.clone() as Arc<dyn ChildSpawner>);
        let registry = Arc::new(Mutex::new(StateRegistry::new()));

        manager
            .promote(&registry, "client1".to_string(), "INV1".to_string())
            .await
            .unwrap();

        assert!(manager.due_end_reason(&registry).await.is_none());
    }

    #[tokio::test]
    async fn due_end_reason_detects_child_exit() {
        let config = test_config();
        let hooks = Arc::new(HookRegistry::new());
        let spawner = Arc::new(FakeSpawner::new(false));
        let manager = SessionManager::new(config, hooks, spawner.clone() as Arc<dyn ChildSpawner>);
        let registry = Arc::new(Mutex::new(StateRegistry::new()));

        let outcome = manager
            .promote(&registry, "client1".to_string(), "INV1".to_string())
            .await
            .unwrap();

        spawner.trigger_exit(&outcome.session_id).await;

        assert_eq!(
            manager.due_end_reason(&registry).await,
            Some(EndReason::ChildExited)
        );
    }
}
