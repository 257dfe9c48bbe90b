//! Point-in-time copies of the state container.

use super::domain::{TimeState, TurnState, World};
use crate::session::Session;
use crate::types::{PlayerId, SessionId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Sessions known to the state container.
pub type SessionMap = HashMap<SessionId, Arc<Session>>;

/// Deep copy of every domain plus the version it was taken at.
///
/// Taken under the write locks as the pre-image of an update, then mutated as
/// its working copy. Sessions are shared, so copying the map
/// copies `Arc`s rather than the sessions themselves.
#[derive(Debug, Clone, Default)]
pub struct StateImage {
    pub world: World,
    pub turns: TurnState,
    pub time: TimeState,
    pub sessions: SessionMap,
    pub version: u64,
}

/// Serializable view of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub player_id: Option<PlayerId>,
    pub player_name: Option<String>,
    pub connected: bool,
    pub created_at: u64,
    pub idle_ms: u64,
}

impl SessionInfo {
    pub fn from_session(session: &Session, now: Instant) -> Self {
        Self {
            id: session.id(),
            player_id: session.player().map(|p| p.id),
            player_name: session.player().map(|p| p.name.clone()),
            connected: session.is_connected(),
            created_at: session.created_at_unix_ms(),
            idle_ms: session.idle_for(now).as_millis() as u64,
        }
    }
}

/// Read-only projection returned by [`GameState::get_state`](super::GameState::get_state).
///
/// This is what the RPC layer answers state queries with and what persistence
/// serializes.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub world: World,
    pub time: TimeState,
    pub turns: TurnState,
    pub sessions: Vec<SessionInfo>,
    pub version: u64,
}

impl StateSnapshot {
    pub(crate) fn project(
        world: &World,
        turns: &TurnState,
        time: &TimeState,
        sessions: &SessionMap,
        version: u64,
    ) -> Self {
        let now = Instant::now();
        let mut infos: Vec<SessionInfo> = sessions
            .values()
            .map(|s| SessionInfo::from_session(s, now))
            .collect();
        infos.sort_by_key(|info| info.id);

        Self {
            world: world.clone(),
            time: time.clone(),
            turns: turns.clone(),
            sessions: infos,
            version,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
