//! Shared game state.
//!
//! [`GameState`] owns the world, turn, time and session domains behind
//! independent locks, a monotonic version counter, and a single-slot cache of
//! the last projection. All mutation goes through [`StateUpdate`]s, which
//! commit atomically or not at all.

pub mod container;
pub mod domain;
pub mod snapshot;
pub mod update;

pub use container::GameState;
pub use domain::{DelayedAction, Domain, ScheduledEvent, TimeState, TurnState, World};
pub use snapshot::{SessionInfo, SessionMap, StateImage, StateSnapshot};
pub use update::{Mutation, StateUpdate};
