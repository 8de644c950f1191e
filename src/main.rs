//! Session broker — entry point
//!
//! Wires configuration, the store, the queue/session machinery, and both
//! listeners (WebSocket queue protocol, HTTP validator surface) together,
//! then drives the periodic sweep tasks the rest of the crate depends on.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use session_broker::config::Config;
use session_broker::connection::{handle_connection, ConnectionContext};
use session_broker::hooks::HookRegistry;
use session_broker::http::{build_router, AppState};
use session_broker::invite::InviteService;
use session_broker::net::OriginPolicy;
use session_broker::queue::QueueController;
use session_broker::rate_limit::{ConnectionLimiter, InviteLimiter};
use session_broker::registry::StateRegistry;
use session_broker::session::{RealChildSpawner, SessionManager};
use session_broker::store::{RedisStore, Store};

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    let config = Arc::new(Config::from_env().expect("invalid configuration"));
    config.log_startup();

    std::fs::create_dir_all(&config.session_env_dir)
        .expect("failed to create session env directory");

    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&config.store_url)
            .await
            .expect("failed to connect to store"),
    );

    let registry = Arc::new(Mutex::new(StateRegistry::new()));
    let hooks = Arc::new(HookRegistry::new());

    let invite_limiter = Arc::new(InviteLimiter::new(
        store.clone(),
        config.invite_rate_window,
        config.invite_rate_max,
    ));
    let invites = Arc::new(InviteService::new(store.clone(), invite_limiter));

    let connection_limiter = Arc::new(ConnectionLimiter::new(
        config.connection_rate_window,
        config.connection_rate_max,
    ));

    let spawner = Arc::new(RealChildSpawner::new(config.container_image.clone()));
    let sessions = Arc::new(SessionManager::new(config.clone(), hooks.clone(), spawner));

    let queue = Arc::new(QueueController::new(
        config.max_queue_size,
        config.average_session_minutes,
        config.base_url.clone(),
        invites.clone(),
        sessions.clone(),
        hooks.clone(),
    ));

    let origin_policy = Arc::new(OriginPolicy::from_config(&config));

    spawn_sweep_tasks(
        connection_limiter.clone(),
        sessions.clone(),
        queue.clone(),
        registry.clone(),
    );

    let http_state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        invites: invites.clone(),
        store: store.clone(),
    };
    let http_addr: SocketAddr = ([0, 0, 0, 0], config.listen_port + 1).into();
    let http_listener = TcpListener::bind(http_addr)
        .await
        .expect("failed to bind HTTP listener");
    info!(%http_addr, "HTTP validator surface listening");
    tokio::spawn(async move {
        axum::serve(
            http_listener,
            build_router(http_state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("HTTP server crashed");
    });

    let ws_addr: SocketAddr = ([0, 0, 0, 0], config.listen_port).into();
    let ws_listener = TcpListener::bind(ws_addr)
        .await
        .expect("failed to bind WebSocket listener");
    info!(%ws_addr, "WebSocket queue protocol listening");

    let ctx = ConnectionContext {
        config,
        registry,
        queue,
        sessions,
        connection_limiter,
        origin_policy,
    };

    loop {
        let (stream, peer) = match ws_listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(ctx, stream, peer).await {
                error!(error = %e, "connection handler exited with error");
            }
        });
    }
}

/// Periodic sweeps: connection rate-limiter window cleanup, and
/// grace/hard-expiry/child-exit re-entry into the promotion loop (§5 —
/// timers fire independently and re-enter via the same critical section).
fn spawn_sweep_tasks(
    connection_limiter: Arc<ConnectionLimiter>,
    sessions: Arc<SessionManager>,
    queue: Arc<QueueController>,
    registry: Arc<Mutex<StateRegistry>>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            connection_limiter.sweep().await;
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if let Some(reason) = sessions.due_end_reason(&registry).await {
                queue.end_and_promote(&registry, reason).await;
            }
        }
    });
}
