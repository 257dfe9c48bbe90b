//! Update descriptions for [`GameState::update_state`](super::GameState::update_state).
//!
//! An update carries at most one mutation per domain. Mutations are plain
//! closures so rule code outside the core can be injected without the core
//! knowing anything about it.

use super::domain::{Domain, TimeState, TurnState, World};
use super::snapshot::{SessionMap, StateImage};
use crate::error::StateError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// A boxed mutation of one domain.
pub type Mutation<T> = Box<dyn FnOnce(&mut T) -> Result<(), StateError> + Send + 'static>;

/// A set of per-domain mutations applied atomically.
///
/// # Examples
///
/// ```rust
/// use realm_core::state::StateUpdate;
///
/// let update = StateUpdate::new()
///     .turns(|turns| {
///         turns.start_combat(vec!["aria".into(), "goblin".into()]);
///         Ok(())
///     })
///     .time(|time| {
///         time.current += 6;
///         Ok(())
///     });
/// assert!(!update.is_empty());
/// ```
#[derive(Default)]
pub struct StateUpdate {
    world: Option<Mutation<World>>,
    turns: Option<Mutation<TurnState>>,
    time: Option<Mutation<TimeState>>,
    sessions: Option<Mutation<SessionMap>>,
}

impl fmt::Debug for StateUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateUpdate")
            .field("domains", &self.domains())
            .finish()
    }
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn world<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut World) -> Result<(), StateError> + Send + 'static,
    {
        self.world = Some(Box::new(f));
        self
    }

    pub fn turns<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut TurnState) -> Result<(), StateError> + Send + 'static,
    {
        self.turns = Some(Box::new(f));
        self
    }

    pub fn time<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut TimeState) -> Result<(), StateError> + Send + 'static,
    {
        self.time = Some(Box::new(f));
        self
    }

    pub fn sessions<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut SessionMap) -> Result<(), StateError> + Send + 'static,
    {
        self.sessions = Some(Box::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.domains().is_empty()
    }

    /// Domains this update touches, in lock order.
    pub fn domains(&self) -> Vec<Domain> {
        [
            (Domain::World, self.world.is_some()),
            (Domain::Turns, self.turns.is_some()),
            (Domain::Time, self.time.is_some()),
            (Domain::Sessions, self.sessions.is_some()),
        ]
        .into_iter()
        .filter_map(|(domain, present)| present.then_some(domain))
        .collect()
    }

    /// Builds an update from a JSON object of per-domain merge patches.
    ///
    /// Accepted keys are `world`, `turns` and `time`; each value is applied to
    /// the domain's serialized form with JSON merge-patch rules (objects merge
    /// recursively, `null` removes a field, anything else replaces). Sessions
    /// hold live connections and cannot be patched this way.
    pub fn from_json(value: &Value) -> Result<Self, StateError> {
        let Value::Object(domains) = value else {
            return Err(StateError::InvalidUpdate("update must be a JSON object".to_string()));
        };

        let mut update = StateUpdate::new();
        for (key, patch) in domains {
            let patch = patch.clone();
            update = match key.as_str() {
                "world" => update.world(move |world| patch_domain(Domain::World, world, &patch)),
                "turns" => update.turns(move |turns| patch_domain(Domain::Turns, turns, &patch)),
                "time" => update.time(move |time| {
                    patch_domain(Domain::Time, time, &patch)?;
                    time.sort_events();
                    Ok(())
                }),
                "sessions" => {
                    return Err(StateError::InvalidUpdate(
                        "sessions cannot be patched from JSON".to_string(),
                    ))
                }
                other => return Err(StateError::InvalidUpdate(format!("unknown domain '{other}'"))),
            };
        }
        Ok(update)
    }

    /// Runs every mutation against `working`, stopping at the first error.
    pub(crate) fn apply(self, working: &mut StateImage) -> Result<(), StateError> {
        if let Some(f) = self.world {
            f(&mut working.world)?;
        }
        if let Some(f) = self.turns {
            f(&mut working.turns)?;
        }
        if let Some(f) = self.time {
            f(&mut working.time)?;
        }
        if let Some(f) = self.sessions {
            f(&mut working.sessions)?;
        }
        Ok(())
    }
}

fn patch_domain<T>(domain: Domain, state: &mut T, patch: &Value) -> Result<(), StateError>
where
    T: Serialize + DeserializeOwned,
{
    let mut current =
        serde_json::to_value(&*state).map_err(|e| StateError::rejected(domain, e.to_string()))?;
    merge_patch(&mut current, patch);
    *state = serde_json::from_value(current).map_err(|e| StateError::rejected(domain, e.to_string()))?;
    Ok(())
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
