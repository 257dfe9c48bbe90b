//! Session lifecycle management.
//!
//! Sessions are created on first contact, handed to request handlers as
//! reference-counted [`SessionHandle`]s, and reaped by a background sweep once
//! they have been idle past the timeout *and* no handler holds them.

pub mod client;
pub mod registry;

pub use client::{OutboundMessage, Session, SessionHandle, SessionStatus, Transport};
pub use registry::SessionRegistry;
