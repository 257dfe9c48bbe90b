//! Core game server implementation.
//!
//! This module contains the `GameServer` facade, which owns one state
//! container, one session registry, one rate limiter and a named set of
//! circuit breakers, and drives their background maintenance.

use crate::{
    circuit_breaker::{BreakerStats, CircuitBreaker},
    config::ServerConfig,
    error::ServerError,
    rate_limit::RateLimiter,
    session::{SessionHandle, SessionRegistry},
    state::{GameState, StateSnapshot, StateUpdate},
    types::{Player, SessionId},
    utils::tick_period,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Summary of the server's moving parts, for health endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state_version: u64,
    pub sessions: usize,
    pub rate_limit_buckets: usize,
    pub breakers: Vec<BreakerStats>,
}

/// The core game server structure.
///
/// `GameServer` ties the concurrency primitives together: every inbound
/// request is admitted by the rate limiter, resolved to a reference-counted
/// session, and reads or mutates the shared [`GameState`]. Calls to external
/// dependencies go through a named [`CircuitBreaker`].
///
/// # Background tasks
///
/// * **Session reaper**: started by [`start`](Self::start), evicts idle
///   unreferenced sessions every `sessions.cleanup_interval`
/// * **Rate limiter cleanup**: owned by the limiter itself, stopped on
///   [`shutdown`](Self::shutdown)
pub struct GameServer {
    /// Server configuration settings
    config: ServerConfig,

    /// Versioned shared state
    state: Arc<GameState>,

    /// Live sessions
    sessions: Arc<SessionRegistry>,

    /// Per-client request budget
    rate_limiter: Arc<RateLimiter>,

    /// Breakers by dependency name, created on first use
    breakers: DashMap<String, Arc<CircuitBreaker>>,

    /// Channel for coordinating server shutdown
    shutdown_sender: broadcast::Sender<()>,

    started: AtomicBool,
}

impl GameServer {
    /// Creates a new game server with the specified configuration.
    ///
    /// The rate limiter's cleanup task is started immediately when called
    /// inside a tokio runtime; the session reaper waits for
    /// [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (shutdown_sender, _) = broadcast::channel(1);
        let state = Arc::new(GameState::new(&config.state));
        let sessions = Arc::new(SessionRegistry::new(config.sessions.clone()));
        let rate_limiter = RateLimiter::new(config.rate_limit.clone());

        Arc::new(Self {
            config,
            state,
            sessions,
            rate_limiter,
            breakers: DashMap::new(),
            shutdown_sender,
            started: AtomicBool::new(false),
        })
    }

    /// Starts the background maintenance tasks.
    ///
    /// Returns once the tasks are spawned. Calling it twice is an error.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::Internal("server already started".to_string()));
        }

        info!("🚀 Starting game server core");
        info!(
            "⏱️ Session timeout {:?}, reaper every {:?}",
            self.config.sessions.timeout, self.config.sessions.cleanup_interval
        );
        info!(
            "🚦 Rate limit {} req/s, burst {}",
            self.config.rate_limit.requests_per_second, self.config.rate_limit.burst
        );

        self.spawn_reaper();
        Ok(())
    }

    /// Spawns the session reaper loop.
    ///
    /// Each tick evicts idle, unreferenced sessions from the registry and then
    /// drops them from the state container. The loop exits on shutdown.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let state = self.state.clone();
        let period = tick_period("Session reaper", self.config.sessions.cleanup_interval);
        let mut shutdown_receiver = self.shutdown_sender.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for session in sessions.reap_idle().await {
                            state.untrack_session(&session.id()).await;
                        }
                    }
                    _ = shutdown_receiver.recv() => break,
                }
            }
            debug!("Session reaper stopped");
        })
    }

    /// Checks the client's request budget.
    pub fn admit(&self, client_key: &str) -> Result<(), ServerError> {
        self.rate_limiter.check(client_key)
    }

    /// Admits a client and resolves its session.
    ///
    /// A live `token` refreshes that session; anything else creates a new one.
    /// When `player_name` is given and the session has no player yet, a player
    /// is created, bound, and added to the world.
    pub async fn connect(
        &self,
        client_key: &str,
        token: Option<&str>,
        player_name: Option<&str>,
    ) -> Result<SessionHandle, ServerError> {
        self.admit(client_key)?;

        let (handle, created) = self.sessions.create_or_refresh(token, None).await;
        if created {
            self.state.track_session(handle.session().clone()).await;
            info!("🔗 Session {} opened for {}", handle.id(), client_key);
        }

        if let Some(name) = player_name {
            if handle.bind_player(Player::new(name)) {
                self.state.add_player(Some(handle.session().as_ref())).await;
                info!("👤 Player '{}' joined on session {}", name, handle.id());
            }
        }

        Ok(handle)
    }

    /// Takes a reference to a live session.
    pub async fn acquire(&self, id: &SessionId) -> Result<SessionHandle, ServerError> {
        self.sessions
            .acquire(id)
            .await
            .ok_or(ServerError::SessionNotFound(*id))
    }

    /// Ends a session immediately, e.g. on logout.
    pub async fn disconnect(&self, id: &SessionId) -> Result<(), ServerError> {
        self.sessions
            .remove(id)
            .await
            .ok_or(ServerError::SessionNotFound(*id))?;
        self.state.untrack_session(id).await;
        info!("👋 Session {} closed", id);
        Ok(())
    }

    pub async fn get_state(&self) -> Arc<StateSnapshot> {
        self.state.get_state().await
    }

    pub async fn update_state(&self, update: StateUpdate) -> Result<u64, ServerError> {
        Ok(self.state.update_state(update).await?)
    }

    /// The breaker guarding `name`, created with the configured settings on
    /// first use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return breaker.clone();
        }
        self.breakers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.circuit_breaker.clone())))
            .clone()
    }

    pub async fn health_report(&self) -> HealthReport {
        let mut breakers: Vec<BreakerStats> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        breakers.sort_by(|a, b| a.name.cmp(&b.name));

        HealthReport {
            state_version: self.state.version(),
            sessions: self.sessions.len().await,
            rate_limit_buckets: self.rate_limiter.bucket_count(),
            breakers,
        }
    }

    /// Initiates server shutdown.
    ///
    /// Stops the reaper and the limiter cleanup, then closes every session.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        info!("🛑 Shutting down server...");
        let _ = self.shutdown_sender.send(());
        self.rate_limiter.close();

        let sessions = self.sessions.sessions().await;
        let closed = self.sessions.close_all().await;
        for session in sessions {
            self.state.untrack_session(&session.id()).await;
        }
        if closed > 0 {
            warn!("Closed {} session(s) still open at shutdown", closed);
        }
        info!("✅ Server cleanup completed");
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Gets the shared state container.
    pub fn get_state_container(&self) -> Arc<GameState> {
        self.state.clone()
    }

    /// Gets the session registry.
    pub fn get_session_registry(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    /// Gets the rate limiter.
    pub fn get_rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    /// Subscribes to the shutdown signal.
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }
}
