//! Sub-aggregates owned by [`GameState`](super::GameState).
//!
//! These are plain data. Game rules that mutate them are injected through
//! [`StateUpdate`](super::StateUpdate); the helpers here only keep the
//! structural invariants (sorted event queue, valid turn index) intact.

use crate::types::{Player, PlayerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The independently locked regions of the state container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    World,
    Turns,
    Time,
    Sessions,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Domain::World => "world",
            Domain::Turns => "turns",
            Domain::Time => "time",
            Domain::Sessions => "sessions",
        };
        f.write_str(name)
    }
}

/// The shared world aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct World {
    #[serde(default)]
    pub players: HashMap<PlayerId, Player>,
    /// Free-form world properties (map, weather, quest flags...).
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl World {
    pub fn player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn player_mut(&mut self, id: &PlayerId) -> Option<&mut Player> {
        self.players.get_mut(id)
    }
}

/// An action a combatant postponed until later in the round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedAction {
    pub actor: String,
    pub action: String,
    /// Round in which the action fires.
    pub trigger_round: u32,
}

/// Combat and initiative tracking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    #[serde(default)]
    pub round: u32,
    /// Participants in initiative order.
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub current_index: usize,
    #[serde(default)]
    pub in_combat: bool,
    /// Allied groups keyed by group name.
    #[serde(default)]
    pub allies: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub delayed_actions: Vec<DelayedAction>,
}

impl TurnState {
    /// Starts combat with the given initiative order.
    pub fn start_combat(&mut self, participants: Vec<String>) {
        self.participants = participants;
        self.current_index = 0;
        self.round = 1;
        self.in_combat = !self.participants.is_empty();
    }

    /// Participant whose turn it is, if any.
    pub fn current(&self) -> Option<&str> {
        if !self.in_combat {
            return None;
        }
        self.participants.get(self.current_index).map(String::as_str)
    }

    /// Moves to the next participant, starting a new round after the last one.
    /// Returns the delayed actions that became due.
    pub fn advance(&mut self) -> Vec<DelayedAction> {
        if !self.in_combat || self.participants.is_empty() {
            return Vec::new();
        }
        self.current_index += 1;
        if self.current_index < self.participants.len() {
            return Vec::new();
        }

        self.current_index = 0;
        self.round += 1;
        let round = self.round;
        let (due, pending): (Vec<_>, Vec<_>) = self
            .delayed_actions
            .drain(..)
            .partition(|a| a.trigger_round <= round);
        self.delayed_actions = pending;
        due
    }

    pub fn end_combat(&mut self) {
        *self = TurnState::default();
    }
}

/// A future event on the simulated clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    /// Simulated time (seconds) at which the event fires.
    pub at: u64,
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Simulated clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeState {
    /// Simulated seconds since the world began.
    #[serde(default)]
    pub current: u64,
    /// Simulated seconds per wall-clock second.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Wall-clock unix millis of the last tick.
    #[serde(default)]
    pub last_tick_ms: u64,
    /// Future events, ascending by `at`.
    #[serde(default)]
    pub events: Vec<ScheduledEvent>,
}

fn default_scale() -> f64 {
    1.0
}

impl Default for TimeState {
    fn default() -> Self {
        Self {
            current: 0,
            scale: default_scale(),
            last_tick_ms: 0,
            events: Vec::new(),
        }
    }
}

impl TimeState {
    /// Inserts an event keeping the queue sorted; equal times keep insertion order.
    pub fn schedule(&mut self, event: ScheduledEvent) {
        let idx = self.events.partition_point(|e| e.at <= event.at);
        self.events.insert(idx, event);
    }

    /// Restores queue order after the event list was replaced wholesale.
    /// Stable, so events due at the same time keep their relative order.
    pub fn sort_events(&mut self) {
        self.events.sort_by_key(|e| e.at);
    }

    /// Advances the clock by `wall_ms` of real time and pops every event that
    /// is now due.
    pub fn tick(&mut self, wall_ms: u64, now_ms: u64) -> Vec<ScheduledEvent> {
        let simulated = (wall_ms as f64 / 1000.0 * self.scale).floor() as u64;
        self.current = self.current.saturating_add(simulated);
        self.last_tick_ms = now_ms;

        // `events` is public, so a caller may have pushed out of order.
        if self.events.windows(2).any(|w| w[0].at > w[1].at) {
            self.sort_events();
        }
        let due = self.events.partition_point(|e| e.at <= self.current);
        self.events.drain(..due).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(at: u64, name: &str) -> ScheduledEvent {
        ScheduledEvent {
            at,
            name: name.to_string(),
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_schedule_keeps_order() {
        let mut time = TimeState::default();
        time.schedule(event(30, "c"));
        time.schedule(event(10, "a"));
        time.schedule(event(20, "b"));
        time.schedule(event(10, "a2"));

        let names: Vec<_> = time.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "a2", "b", "c"]);
    }

    #[test]
    fn test_tick_pops_due_events() {
        let mut time = TimeState {
            scale: 10.0,
            ..Default::default()
        };
        time.schedule(event(5, "dawn"));
        time.schedule(event(50, "dusk"));

        let due = time.tick(1_000, 42);
        assert_eq!(time.current, 10);
        assert_eq!(time.last_tick_ms, 42);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "dawn");
        assert_eq!(time.events.len(), 1);
    }

    #[test]
    fn test_tick_handles_unsorted_queue() {
        let mut time = TimeState::default();
        time.events = vec![event(50, "late"), event(10, "early"), event(10, "early2")];

        let due = time.tick(20_000, 0);
        assert_eq!(time.current, 20);
        let names: Vec<_> = due.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["early", "early2"]);
        assert_eq!(time.events, vec![event(50, "late")]);
    }

    #[test]
    fn test_turn_rotation_and_delayed_actions() {
        let mut turns = TurnState::default();
        turns.start_combat(vec!["aria".into(), "goblin".into()]);
        turns.delayed_actions.push(DelayedAction {
            actor: "aria".into(),
            action: "ready_bow".into(),
            trigger_round: 2,
        });

        assert_eq!(turns.current(), Some("aria"));
        assert!(turns.advance().is_empty());
        assert_eq!(turns.current(), Some("goblin"));

        let due = turns.advance();
        assert_eq!(turns.round, 2);
        assert_eq!(turns.current(), Some("aria"));
        assert_eq!(due.len(), 1);
        assert!(turns.delayed_actions.is_empty());

        turns.end_combat();
        assert_eq!(turns.current(), None);
    }

    #[test]
    fn test_domain_display() {
        assert_eq!(Domain::World.to_string(), "world");
        assert_eq!(Domain::Sessions.to_string(), "sessions");
    }
}
