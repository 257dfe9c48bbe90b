//! # Realm Core - Concurrency and Resilience Foundation
//!
//! The shared-state and request-admission core of a multiplayer game server.
//! It provides the pieces every request handler leans on, and nothing that
//! speaks a wire protocol:
//!
//! * **Versioned state container** - world, turn, time and session domains
//!   behind independent locks, committed all-or-nothing with rollback
//! * **Session lifecycle** - reference-counted sessions with a background
//!   reaper that never evicts a session a handler still holds
//! * **Rate limiting** - per-client token buckets with idle cleanup
//! * **Circuit breakers** - fast-fail isolation of flaky dependencies
//!
//! ## Architecture Overview
//!
//! [`GameServer`] owns one of each component (plus a named set of breakers)
//! and runs their background tasks. A typical request:
//!
//! 1. [`GameServer::admit`] spends a token from the client's bucket
//! 2. [`GameServer::acquire`] pins the session for the length of the request
//! 3. The handler reads [`GameServer::get_state`] or commits a [`StateUpdate`]
//! 4. Dropping the [`SessionHandle`] releases the session
//!
//! ```rust,no_run
//! use realm_core::{create_server, StateUpdate};
//!
//! # async fn demo() -> Result<(), realm_core::ServerError> {
//! let server = create_server();
//! server.start()?;
//!
//! let session = server.connect("203.0.113.7", None, Some("aria")).await?;
//! let update = StateUpdate::new().time(|time| {
//!     time.current += 1;
//!     Ok(())
//! });
//! let version = server.update_state(update).await?;
//! println!("session {} now sees version {}", session.id(), version);
//! # Ok(())
//! # }
//! ```
//!
//! ## Lock ordering
//!
//! Every path that holds more than one state lock acquires them in the order
//! `world → turns → time → sessions`. The version counter and the cached
//! projection sit outside those locks, so cached reads never wait on an
//! update. Session reference counts are atomics and never touch the state
//! locks.
//!
//! ## Error Handling
//!
//! Each component reports through its own enum ([`StateError`],
//! [`BreakerError`]); [`ServerError`] wraps them at the facade. No public
//! operation panics across its boundary: panics inside injected mutations or
//! protected calls are caught and returned as errors.

// Re-export core types and functions for easy access
pub use circuit_breaker::{BreakerState, BreakerStats, CircuitBreaker};
pub use config::ServerConfig;
pub use error::{BreakerError, ServerError, StateError};
pub use rate_limit::RateLimiter;
pub use server::{GameServer, HealthReport};
pub use session::{Session, SessionHandle, SessionRegistry, Transport};
pub use state::{GameState, StateSnapshot, StateUpdate};
pub use types::{Player, PlayerId, Position, SessionId};
pub use utils::{create_server, create_server_with_config};

// Public module declarations
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod state;
pub mod types;
pub mod utils;
