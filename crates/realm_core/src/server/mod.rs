//! Server facade.

pub mod core;

pub use self::core::{GameServer, HealthReport};
