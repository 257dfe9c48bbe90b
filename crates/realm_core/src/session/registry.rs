//! Session registry and idle reaping.

use super::client::{Session, SessionHandle};
use crate::config::SessionConfig;
use crate::types::{Player, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Owns every live session, keyed by id.
///
/// Lookups that hand a session to a handler bump its reference count while
/// holding the registry read lock; the reaper removes sessions only under the
/// write lock after re-checking that the count is zero. Releases never touch
/// the registry lock at all.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Looks up a live session and takes a reference to it.
    pub async fn acquire(&self, id: &SessionId) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id)?;
        session.retain();
        Some(SessionHandle::adopt(session.clone()))
    }

    /// Resolves `token` to a live session, or registers a new one.
    ///
    /// The returned flag is `true` when a session was created. A new session
    /// starts with its reference already held by the returned handle. If
    /// `player` is given and the session has none yet, it is bound.
    pub async fn create_or_refresh(
        &self,
        token: Option<&str>,
        player: Option<Player>,
    ) -> (SessionHandle, bool) {
        if let Some(id) = token.and_then(SessionId::parse) {
            if let Some(handle) = self.acquire(&id).await {
                if let Some(player) = player {
                    handle.bind_player(player);
                }
                return (handle, false);
            }
            debug!(session = %id, "Unknown session token, issuing a new session");
        }

        let session = Arc::new(Session::new(
            SessionId::new(),
            self.config.outbound_queue_capacity,
            self.config.send_timeout,
        ));
        if let Some(player) = player {
            session.bind_player(player);
        }
        session.retain();
        let handle = SessionHandle::adopt(session.clone());

        self.sessions.write().await.insert(session.id(), session);
        debug!(session = %handle.id(), "Session created");
        (handle, true)
    }

    /// Session lookup without taking a reference. For inspection only.
    pub async fn peek(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// All sessions currently registered.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// One reaper sweep.
    ///
    /// Sessions idle past the timeout are evicted unless a handler still holds
    /// them; those are skipped and looked at again on the next sweep. Evicted
    /// sessions are closed after the registry lock is released.
    pub async fn reap_idle(&self) -> Vec<Arc<Session>> {
        let timeout = self.config.timeout;

        let candidates: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            let now = Instant::now();
            sessions
                .values()
                .filter(|s| s.idle_for(now) > timeout)
                .filter(|s| {
                    let busy = s.ref_count() > 0;
                    if busy {
                        debug!(session = %s.id(), refs = s.ref_count(), "Idle session still in use, skipping");
                    }
                    !busy
                })
                .map(|s| s.id())
                .collect()
        };

        if candidates.is_empty() {
            return Vec::new();
        }

        let evicted: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let now = Instant::now();
            candidates
                .into_iter()
                .filter_map(|id| {
                    let still_evictable = sessions
                        .get(&id)
                        .is_some_and(|s| s.ref_count() == 0 && s.idle_for(now) > timeout);
                    if still_evictable {
                        sessions.remove(&id)
                    } else {
                        None
                    }
                })
                .collect()
        };

        futures::future::join_all(evicted.iter().map(|s| s.close())).await;

        if !evicted.is_empty() {
            info!("🧹 Evicted {} idle session(s)", evicted.len());
        }
        evicted
    }

    /// Removes and closes one session regardless of outstanding references,
    /// e.g. on explicit logout. Holders keep a closed, evicted session.
    pub async fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(id)?;
        session.close().await;
        debug!(session = %id, refs = session.ref_count(), "Session removed");
        Some(session)
    }

    /// Removes and closes every session regardless of use. Shutdown only.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        futures::future::join_all(drained.iter().map(|s| s.close())).await;
        drained.len()
    }
}
