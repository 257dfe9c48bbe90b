//! The versioned, multi-lock state container.
//!
//! Lock order for every path that holds more than one lock:
//! `world → turns → time → sessions`. Single-lock paths (`add_player`,
//! `track_session`, `untrack_session`) only ever take one domain lock, so they
//! cannot take part in a cycle, and they never overlap an update because
//! updates hold every domain lock for their whole window.

use super::domain::{TimeState, TurnState, World};
use super::snapshot::{SessionMap, StateImage, StateSnapshot};
use super::update::StateUpdate;
use crate::config::StateConfig;
use crate::error::StateError;
use crate::session::Session;
use crate::types::SessionId;
use crate::utils::panic_message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// The last projection and the change tag it was built at.
#[derive(Debug)]
struct CachedProjection {
    tag: u64,
    snapshot: Arc<StateSnapshot>,
}

/// Write guards over every domain, held for the whole apply/commit window.
struct WriteSet<'a> {
    world: RwLockWriteGuard<'a, World>,
    turns: RwLockWriteGuard<'a, TurnState>,
    time: RwLockWriteGuard<'a, TimeState>,
    sessions: RwLockWriteGuard<'a, SessionMap>,
}

impl WriteSet<'_> {
    fn image(&self, version: u64) -> StateImage {
        StateImage {
            world: self.world.clone(),
            turns: self.turns.clone(),
            time: self.time.clone(),
            sessions: self.sessions.clone(),
            version,
        }
    }

    fn assign(&mut self, image: StateImage) {
        *self.world = image.world;
        *self.turns = image.turns;
        *self.time = image.time;
        *self.sessions = image.sessions;
    }
}

/// Shared game state.
///
/// Each domain sits behind its own lock so unrelated reads run concurrently,
/// while [`update_state`](Self::update_state) still commits all-or-nothing:
/// it holds every domain lock for the apply window and runs the mutations on
/// a copy taken under those locks, so a failed update never touches the live
/// domains.
#[derive(Debug)]
pub struct GameState {
    world: RwLock<World>,
    turns: RwLock<TurnState>,
    time: RwLock<TimeState>,
    sessions: RwLock<SessionMap>,
    /// Committed version. Only written while every domain write lock is held.
    version: AtomicU64,
    /// Bumped by every change that shows up in the projection, including
    /// connection flips on tracked sessions.
    cache_tag: Arc<AtomicU64>,
    /// Never held across an await.
    cache: Mutex<Option<CachedProjection>>,
    update_timeout: Duration,
}

impl Default for GameState {
    fn default() -> Self {
        Self::new(&StateConfig::default())
    }
}

impl GameState {
    pub fn new(config: &StateConfig) -> Self {
        Self {
            world: RwLock::new(World::default()),
            turns: RwLock::new(TurnState::default()),
            time: RwLock::new(TimeState::default()),
            sessions: RwLock::new(SessionMap::new()),
            version: AtomicU64::new(0),
            cache_tag: Arc::new(AtomicU64::new(0)),
            cache: Mutex::new(None),
            update_timeout: config.update_timeout,
        }
    }

    /// Current committed version.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn invalidate_cache(&self) {
        self.cache_tag.fetch_add(1, Ordering::AcqRel);
    }

    fn lock_cache(&self) -> MutexGuard<'_, Option<CachedProjection>> {
        // The slot is replaced whole, so a poisoned guard still holds a
        // consistent value.
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts the session's player into the world.
    ///
    /// Does nothing and returns `false` when there is no session or the
    /// session has no player bound yet.
    pub async fn add_player(&self, session: Option<&Session>) -> bool {
        let Some(player) = session.and_then(Session::player) else {
            debug!("add_player called without a bound player, ignoring");
            return false;
        };

        let mut world = self.world.write().await;
        world.players.insert(player.id, player.clone());
        self.invalidate_cache();
        debug!(player = %player.id, name = %player.name, "Player added to world");
        true
    }

    /// Registers a session in the sessions domain.
    pub async fn track_session(&self, session: Arc<Session>) {
        session.watch_status(self.cache_tag.clone());
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id(), session);
        self.invalidate_cache();
    }

    /// Drops a session from the sessions domain. Returns whether it was present.
    pub async fn untrack_session(&self, id: &SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(id).is_some();
        if removed {
            self.invalidate_cache();
        }
        removed
    }

    /// Returns the current projection.
    ///
    /// When nothing changed since the cached projection was built it is
    /// returned without touching any domain lock, so reads never wait on a
    /// running update. Otherwise every domain is read-locked in order and a
    /// fresh projection is built and cached.
    ///
    /// Session `idle_ms` is measured when the projection is built.
    pub async fn get_state(&self) -> Arc<StateSnapshot> {
        if let Some(cached) = self.cached() {
            return cached;
        }

        let world = self.world.read().await;
        let turns = self.turns.read().await;
        let time = self.time.read().await;
        let sessions = self.sessions.read().await;

        // Loaded before projecting: any change the projection misses bumps
        // the tag again, so this entry is never served for newer data.
        let tag = self.cache_tag.load(Ordering::Acquire);
        let snapshot = Arc::new(StateSnapshot::project(
            &world,
            &turns,
            &time,
            &sessions,
            self.version(),
        ));

        {
            let mut slot = self.lock_cache();
            if slot.as_ref().map_or(true, |cached| cached.tag <= tag) {
                *slot = Some(CachedProjection {
                    tag,
                    snapshot: snapshot.clone(),
                });
            }
        }

        drop(sessions);
        drop(time);
        drop(turns);
        drop(world);
        snapshot
    }

    fn cached(&self) -> Option<Arc<StateSnapshot>> {
        let tag = self.cache_tag.load(Ordering::Acquire);
        let version = self.version();
        self.lock_cache()
            .as_ref()
            .filter(|cached| cached.tag == tag && cached.snapshot.version == version)
            .map(|cached| cached.snapshot.clone())
    }

    /// Deep copy of every domain, taken under read locks.
    pub async fn capture(&self) -> StateImage {
        let world = self.world.read().await;
        let turns = self.turns.read().await;
        let time = self.time.read().await;
        let sessions = self.sessions.read().await;

        StateImage {
            world: world.clone(),
            turns: turns.clone(),
            time: time.clone(),
            sessions: sessions.clone(),
            version: self.version(),
        }
    }

    async fn lock_all(&self) -> WriteSet<'_> {
        let world = self.world.write().await;
        let turns = self.turns.write().await;
        let time = self.time.write().await;
        let sessions = self.sessions.write().await;
        WriteSet {
            world,
            turns,
            time,
            sessions,
        }
    }

    /// Applies `update` atomically and returns the new version.
    ///
    /// Fails with [`StateError::ConcurrentModification`] if another update
    /// committed between reading the version and taking the locks, and with
    /// [`StateError::Timeout`] if the mutations outrun the update deadline.
    /// On any failure every domain is left exactly as it was and the version
    /// does not move. An empty update commits nothing and returns the current
    /// version.
    pub async fn update_state(&self, update: StateUpdate) -> Result<u64, StateError> {
        if update.is_empty() {
            return Ok(self.version());
        }
        let expected = self.version();
        self.apply_at(expected, update).await
    }

    /// Like [`update_state`](Self::update_state), but rebuilds and retries the
    /// update on version conflicts, up to `max_attempts` times.
    pub async fn update_state_with_retry<F>(
        &self,
        mut build: F,
        max_attempts: usize,
    ) -> Result<u64, StateError>
    where
        F: FnMut() -> StateUpdate,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.update_state(build()).await {
                Err(StateError::ConcurrentModification { expected, actual })
                    if attempt < max_attempts =>
                {
                    debug!(attempt, expected, actual, "Version conflict, retrying update");
                    tokio::task::yield_now().await;
                }
                result => return result,
            }
        }
    }

    /// Applies `update` if the committed version is still `expected`.
    pub(crate) async fn apply_at(
        &self,
        expected: u64,
        update: StateUpdate,
    ) -> Result<u64, StateError> {
        let domains = update.domains();
        let mut locked = self.lock_all().await;

        let actual = self.version();
        if actual != expected {
            return Err(StateError::ConcurrentModification { expected, actual });
        }

        // Copied under the write locks, so nothing that lands between reading
        // the version and locking can be lost on commit.
        let working = locked.image(actual);
        let task = tokio::task::spawn_blocking(move || {
            let mut working = working;
            update.apply(&mut working).map(|()| working)
        });

        let outcome = match tokio::time::timeout(self.update_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(StateError::ApplyPanicked(panic_message(join_error))),
            Err(_) => Err(StateError::Timeout(self.update_timeout)),
        };

        match outcome {
            Ok(working) => {
                locked.assign(working);
                let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
                self.invalidate_cache();
                drop(locked);
                debug!(version, ?domains, "State update committed");
                Ok(version)
            }
            Err(error) => {
                // The working copy is discarded; live domains were never written.
                drop(locked);
                warn!(version = expected, ?domains, %error, "State update rolled back");
                Err(error)
            }
        }
    }

    /// Replaces every domain with `image` as one committed write.
    ///
    /// Returns the new version, which is always one past the current version
    /// regardless of the version recorded in `image`.
    pub async fn restore(&self, image: StateImage) -> u64 {
        let mut locked = self.lock_all().await;
        let from = image.version;
        locked.assign(image);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.invalidate_cache();
        drop(locked);
        info!(from, version, "State restored from image");
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Domain;
    use crate::types::{Player, Position};
    use serde_json::json;

    fn fast_state(timeout_ms: u64) -> GameState {
        GameState::new(&StateConfig {
            update_timeout: Duration::from_millis(timeout_ms),
        })
    }

    fn session_with_player(name: &str) -> Session {
        let session = Session::new(SessionId::new(), 8, Duration::from_millis(10));
        session.bind_player(Player::new(name));
        session
    }

    #[tokio::test]
    async fn test_initial_state() {
        let state = GameState::default();
        let snapshot = state.get_state().await;
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.world.players.is_empty());
        assert!(snapshot.sessions.is_empty());
        assert!(!snapshot.turns.in_combat);
    }

    #[tokio::test]
    async fn test_get_state_uses_cache_until_change() {
        let state = GameState::default();
        let first = state.get_state().await;
        let second = state.get_state().await;
        assert!(Arc::ptr_eq(&first, &second));

        state
            .update_state(StateUpdate::new().time(|t| {
                t.current = 100;
                Ok(())
            }))
            .await
            .unwrap();

        let third = state.get_state().await;
        assert!(!Arc::ptr_eq(&second, &third));
        assert_eq!(third.version, 1);
        assert_eq!(third.time.current, 100);
    }

    #[tokio::test]
    async fn test_update_commits_all_domains() {
        let state = GameState::default();
        let version = state
            .update_state(
                StateUpdate::new()
                    .world(|w| {
                        w.properties.insert("weather".into(), json!("fog"));
                        Ok(())
                    })
                    .turns(|t| {
                        t.start_combat(vec!["aria".into(), "orc".into()]);
                        Ok(())
                    })
                    .time(|t| {
                        t.scale = 4.0;
                        Ok(())
                    }),
            )
            .await
            .unwrap();

        assert_eq!(version, 1);
        let snapshot = state.get_state().await;
        assert_eq!(snapshot.world.properties["weather"], json!("fog"));
        assert_eq!(snapshot.turns.current(), Some("aria"));
        assert_eq!(snapshot.time.scale, 4.0);
    }

    #[tokio::test]
    async fn test_rejected_update_rolls_back() {
        let state = GameState::default();
        let before = state.get_state().await.to_json().unwrap();

        let err = state
            .update_state(
                StateUpdate::new()
                    .world(|w| {
                        w.properties.insert("gold".into(), json!(1_000_000));
                        Ok(())
                    })
                    .turns(|_| Err(StateError::rejected(Domain::Turns, "not your turn"))),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StateError::Rejected { domain: Domain::Turns, .. }));
        assert_eq!(state.version(), 0);
        let after = state.get_state().await.to_json().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_panicking_update_rolls_back() {
        let state = GameState::default();
        let err = state
            .update_state(StateUpdate::new().world(|w| {
                w.properties.insert("half".into(), json!(true));
                panic!("rule engine exploded");
            }))
            .await
            .unwrap_err();

        assert_eq!(err, StateError::ApplyPanicked("rule engine exploded".to_string()));
        assert_eq!(state.version(), 0);
        assert!(state.get_state().await.world.properties.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_update_times_out() {
        let state = fast_state(50);
        let err = state
            .update_state(StateUpdate::new().time(|t| {
                std::thread::sleep(Duration::from_millis(250));
                t.current = 999;
                Ok(())
            }))
            .await
            .unwrap_err();

        assert_eq!(err, StateError::Timeout(Duration::from_millis(50)));
        assert!(err.is_retryable());
        assert_eq!(state.version(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(state.get_state().await.time.current, 0);
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict() {
        let state = GameState::default();
        let stale = state.version();

        state
            .update_state(StateUpdate::new().time(|t| {
                t.current = 1;
                Ok(())
            }))
            .await
            .unwrap();

        let err = state
            .apply_at(
                stale,
                StateUpdate::new().time(|t| {
                    t.current = 2;
                    Ok(())
                }),
            )
            .await
            .unwrap_err();

        assert_eq!(err, StateError::ConcurrentModification { expected: 0, actual: 1 });
        assert_eq!(state.get_state().await.time.current, 1);
    }

    #[tokio::test]
    async fn test_player_joining_before_commit_survives() {
        let state = GameState::default();
        let expected = state.version();

        let session = session_with_player("dara");
        assert!(state.add_player(Some(&session)).await);

        let version = state
            .apply_at(
                expected,
                StateUpdate::new().time(|t| {
                    t.current = 10;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert_eq!(version, 1);
        let snapshot = state.get_state().await;
        assert_eq!(snapshot.world.players.len(), 1);
        assert_eq!(snapshot.time.current, 10);
    }

    #[tokio::test]
    async fn test_failed_update_keeps_concurrent_join() {
        let state = GameState::default();
        let expected = state.version();

        let session = session_with_player("eli");
        state.add_player(Some(&session)).await;

        let err = state
            .apply_at(
                expected,
                StateUpdate::new().world(|w| {
                    w.players.clear();
                    Err(StateError::rejected(Domain::World, "no"))
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StateError::Rejected { .. }));
        assert_eq!(state.get_state().await.world.players.len(), 1);
    }

    #[tokio::test]
    async fn test_reaped_session_stays_reaped_after_commit() {
        let state = GameState::default();
        let session = Arc::new(session_with_player("fen"));
        let id = session.id();
        state.track_session(session).await;

        let expected = state.version();
        assert!(state.untrack_session(&id).await);

        state
            .apply_at(
                expected,
                StateUpdate::new().turns(|t| {
                    t.round = 2;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert!(state.get_state().await.sessions.is_empty());

        // A failing update must not bring it back either.
        let expected = state.version();
        state
            .apply_at(expected, StateUpdate::new().turns(|_| Err(StateError::rejected(Domain::Turns, "no"))))
            .await
            .unwrap_err();
        assert!(state.get_state().await.sessions.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cached_read_does_not_wait_for_slow_update() {
        let state = Arc::new(GameState::default());
        let warm = state.get_state().await;

        let writer = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .update_state(StateUpdate::new().time(|t| {
                        std::thread::sleep(Duration::from_millis(400));
                        t.current = 1;
                        Ok(())
                    }))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = std::time::Instant::now();
        let read = state.get_state().await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(Arc::ptr_eq(&warm, &read));
        assert_eq!(read.version, 0);

        assert_eq!(writer.await.unwrap().unwrap(), 1);
        assert_eq!(state.get_state().await.time.current, 1);
    }

    #[tokio::test]
    async fn test_connection_change_refreshes_projection() {
        let state = GameState::default();
        let session = Arc::new(session_with_player("gale"));
        state.track_session(session.clone()).await;

        let before = state.get_state().await;
        assert!(!before.sessions[0].connected);

        session.set_connected(true);
        let after = state.get_state().await;
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.sessions[0].connected);
        assert_eq!(after.version, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_joins_and_reaps_alongside_updates() {
        let state = Arc::new(GameState::default());
        let mut updaters = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            updaters.push(tokio::spawn(async move {
                for _ in 0..10 {
                    state
                        .update_state_with_retry(
                            || {
                                StateUpdate::new().world(|w| {
                                    let count = w.properties.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
                                    w.properties.insert("count".into(), json!(count + 1));
                                    Ok(())
                                })
                            },
                            10_000,
                        )
                        .await
                        .unwrap();
                }
            }));
        }

        let mut joiners = Vec::new();
        for i in 0..24 {
            let state = state.clone();
            joiners.push(tokio::spawn(async move {
                let session = Arc::new(session_with_player(&format!("p{i}")));
                let id = session.id();
                state.track_session(session.clone()).await;
                tokio::task::yield_now().await;
                state.add_player(Some(session.as_ref())).await;
                tokio::task::yield_now().await;
                if i % 2 == 0 {
                    assert!(state.untrack_session(&id).await);
                }
                (i, id, session.player().unwrap().id)
            }));
        }

        let mut joined = Vec::new();
        for joiner in joiners {
            joined.push(joiner.await.unwrap());
        }
        for updater in updaters {
            updater.await.unwrap();
        }

        let snapshot = state.get_state().await;
        assert_eq!(snapshot.version, 80);
        assert_eq!(snapshot.world.properties["count"], json!(80));
        assert_eq!(snapshot.world.players.len(), 24);
        assert_eq!(snapshot.sessions.len(), 12);
        for (i, session_id, player_id) in joined {
            assert!(snapshot.world.player(&player_id).is_some());
            let tracked = snapshot.sessions.iter().any(|info| info.id == session_id);
            assert_eq!(tracked, i % 2 == 1, "session {i}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_updates_have_gapless_versions() {
        let state = Arc::new(GameState::default());
        let mut tasks = Vec::new();

        for _ in 0..16 {
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                state
                    .update_state_with_retry(
                        || {
                            StateUpdate::new().world(|w| {
                                let count = w.properties.get("count").and_then(|v| v.as_u64()).unwrap_or(0);
                                w.properties.insert("count".into(), json!(count + 1));
                                Ok(())
                            })
                        },
                        1_000,
                    )
                    .await
            }));
        }

        let mut versions = Vec::new();
        for task in tasks {
            versions.push(task.await.unwrap().unwrap());
        }
        versions.sort_unstable();

        assert_eq!(versions, (1..=16).collect::<Vec<u64>>());
        let snapshot = state.get_state().await;
        assert_eq!(snapshot.version, 16);
        assert_eq!(snapshot.world.properties["count"], json!(16));
    }

    #[tokio::test]
    async fn test_repeated_failing_update_is_deterministic() {
        let state = GameState::default();
        state
            .update_state(StateUpdate::new().turns(|t| {
                t.round = 7;
                Ok(())
            }))
            .await
            .unwrap();

        let failing = || {
            StateUpdate::new()
                .turns(|t| {
                    t.round += 1;
                    Ok(())
                })
                .time(|_| Err(StateError::rejected(Domain::Time, "clock frozen")))
        };

        assert!(state.update_state(failing()).await.is_err());
        let first = state.get_state().await.to_json().unwrap();
        assert!(state.update_state(failing()).await.is_err());
        let second = state.get_state().await.to_json().unwrap();

        assert_eq!(first, second);
        assert_eq!(first["turns"]["round"], json!(7));
        assert_eq!(first["version"], json!(1));
    }

    #[tokio::test]
    async fn test_add_player_guards() {
        let state = GameState::default();
        assert!(!state.add_player(None).await);

        let anonymous = Session::new(SessionId::new(), 8, Duration::from_millis(10));
        assert!(!state.add_player(Some(&anonymous)).await);

        let _cached = state.get_state().await;
        let session = session_with_player("aria");
        assert!(state.add_player(Some(&session)).await);

        let snapshot = state.get_state().await;
        let player = session.player().unwrap();
        assert_eq!(snapshot.world.player(&player.id).map(|p| p.name.as_str()), Some("aria"));
        assert_eq!(snapshot.version, 0);
    }

    #[tokio::test]
    async fn test_session_tracking_reflects_in_projection() {
        let state = GameState::default();
        let session = Arc::new(session_with_player("bram"));
        let id = session.id();

        state.track_session(session).await;
        let snapshot = state.get_state().await;
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].player_name.as_deref(), Some("bram"));

        assert!(state.untrack_session(&id).await);
        assert!(!state.untrack_session(&id).await);
        assert!(state.get_state().await.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_capture_and_restore() {
        let state = GameState::default();
        let session = session_with_player("cole");
        state.add_player(Some(&session)).await;
        let image = state.capture().await;

        state
            .update_state(StateUpdate::new().world(|w| {
                for player in w.players.values_mut() {
                    player.position = Position::new(5, 5);
                }
                Ok(())
            }))
            .await
            .unwrap();

        let version = state.restore(image).await;
        assert_eq!(version, 2);

        let snapshot = state.get_state().await;
        let player = snapshot.world.players.values().next().unwrap();
        assert_eq!(player.position, Position::new(0, 0));
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn test_json_update_round_trip_through_container() {
        let state = GameState::default();
        let update = StateUpdate::from_json(&json!({"world": {"properties": {"season": "winter"}}})).unwrap();
        state.update_state(update).await.unwrap();

        let json = state.get_state().await.to_json().unwrap();
        assert_eq!(json["world"]["properties"]["season"], json!("winter"));
        assert_eq!(json["version"], json!(1));
    }

    #[tokio::test]
    async fn test_empty_update_is_a_no_op() {
        let state = GameState::default();
        assert_eq!(state.update_state(StateUpdate::new()).await.unwrap(), 0);
        assert_eq!(state.version(), 0);
    }
}
