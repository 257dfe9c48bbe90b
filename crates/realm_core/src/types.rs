//! Identifier and player types shared across the core.
//!
//! Both identifiers wrap a UUID v4 so they can be handed to clients as opaque
//! tokens and parsed back on the next request.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a player.
///
/// # Examples
///
/// ```rust
/// use realm_core::PlayerId;
///
/// let player_id = PlayerId::new();
/// println!("Player ID: {}", player_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Creates a new random player ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for a client session.
///
/// The string form doubles as the session token returned to clients; it is
/// immutable for the lifetime of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a session token, returning `None` for anything that is not a UUID.
    pub fn parse(token: &str) -> Option<Self> {
        Uuid::parse_str(token.trim()).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 2D grid position inside the world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Player data as the core sees it.
///
/// Combat and progression rules live outside the core; these fields exist so
/// the world projection has something meaningful to serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub level: u32,
    pub hit_points: i32,
    pub max_hit_points: i32,
    pub position: Position,
}

impl Player {
    /// Creates a level 1 player at the origin.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PlayerId::new(),
            name: name.into(),
            level: 1,
            hit_points: 10,
            max_hit_points: 10,
            position: Position::default(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.hit_points > 0
    }
}
