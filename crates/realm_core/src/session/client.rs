//! A single client session and its reference-counted handle.
//!
//! Everything a request handler touches on a session is either atomic or
//! behind a short async lock, so handing the same session to many handlers
//! at once never contends with the registry or with state updates.

use crate::types::{Player, SessionId};
use crate::utils::current_timestamp;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, trace};

/// Raw bytes queued for delivery to the client.
pub type OutboundMessage = Vec<u8>;

/// Live connection owned by the transport layer.
///
/// The core only ever needs to close it when a session is evicted.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Closes the underlying connection. Must be safe to call more than once.
    async fn close(&self);

    /// Remote address, when the transport knows it.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Observable lifecycle of a session.
///
/// `PendingEviction` is never stored; it is derived from idleness and the
/// reference count whenever someone asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unauthenticated,
    Active,
    PendingEviction,
    Evicted,
}

/// Server-side state for one client.
pub struct Session {
    id: SessionId,
    player: OnceLock<Player>,
    created_at: Instant,
    created_at_unix_ms: u64,
    /// Milliseconds after `created_at` of the last activity.
    last_active_ms: AtomicU64,
    connected: AtomicBool,
    evicted: AtomicBool,
    ref_count: AtomicUsize,
    outbound_tx: RwLock<Option<mpsc::Sender<OutboundMessage>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    send_timeout: Duration,
    /// Change counter of the state container tracking this session, bumped
    /// whenever the connection flag flips.
    status_epoch: OnceLock<Arc<AtomicU64>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("player", &self.player.get().map(|p| p.id))
            .field("connected", &self.is_connected())
            .field("ref_count", &self.ref_count())
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

impl Session {
    /// Creates a session with an empty outbound queue of `queue_capacity`
    /// messages and a reference count of zero.
    pub fn new(id: SessionId, queue_capacity: usize, send_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            id,
            player: OnceLock::new(),
            created_at: Instant::now(),
            created_at_unix_ms: current_timestamp(),
            last_active_ms: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            ref_count: AtomicUsize::new(0),
            outbound_tx: RwLock::new(Some(tx)),
            outbound_rx: Mutex::new(Some(rx)),
            transport: Mutex::new(None),
            send_timeout,
            status_epoch: OnceLock::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn player(&self) -> Option<&Player> {
        self.player.get()
    }

    /// Binds the player to this session. A session carries at most one player;
    /// returns `false` if one was already bound.
    pub fn bind_player(&self, player: Player) -> bool {
        self.player.set(player).is_ok()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn created_at_unix_ms(&self) -> u64 {
        self.created_at_unix_ms
    }

    pub fn last_active(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_active_ms.load(Ordering::Acquire))
    }

    /// Marks the session as active now.
    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_active_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the last activity, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::AcqRel);
        if was != connected {
            if let Some(epoch) = self.status_epoch.get() {
                epoch.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Links the session to a container's change counter. Only the first
    /// container to track the session is notified.
    pub(crate) fn watch_status(&self, epoch: Arc<AtomicU64>) {
        let _ = self.status_epoch.set(epoch);
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Number of handlers currently holding this session.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn status(&self, timeout: Duration) -> SessionStatus {
        if self.is_evicted() {
            SessionStatus::Evicted
        } else if self.idle_for(Instant::now()) > timeout {
            SessionStatus::PendingEviction
        } else if self.player.get().is_none() {
            SessionStatus::Unauthenticated
        } else {
            SessionStatus::Active
        }
    }

    pub(crate) fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    pub(crate) fn release(&self) {
        // Never wraps below zero, even on a stray release.
        let _ = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Attaches the live connection, replacing (and closing) any previous one.
    pub async fn attach_transport(&self, transport: Box<dyn Transport>) {
        let previous = self.transport.lock().await.replace(transport);
        self.set_connected(true);
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    /// Takes the receiving end of the outbound queue for the transport writer.
    /// Only the first caller gets it.
    pub async fn take_outbound(&self) -> Option<mpsc::Receiver<OutboundMessage>> {
        self.outbound_rx.lock().await.take()
    }

    /// Queues a message for the client without blocking the caller for long.
    ///
    /// When the queue is full the call waits at most the configured send
    /// timeout, then drops the message and returns `false`.
    pub async fn send_non_blocking(&self, message: OutboundMessage) -> bool {
        let Some(tx) = self.outbound_tx.read().await.clone() else {
            return false;
        };

        match tx.send_timeout(message, self.send_timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                debug!(session = %self.id, "Outbound queue full, dropping message");
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Closes the transport and drops the outbound queue. Terminal.
    pub(crate) async fn close(&self) {
        self.evicted.store(true, Ordering::Release);
        self.set_connected(false);

        let transport = self.transport.lock().await.take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.outbound_tx.write().await.take();
        self.outbound_rx.lock().await.take();
        trace!(session = %self.id, "Session closed");
    }
}

/// A counted reference to a session held by one handler.
///
/// Dropping the handle releases the reference, so early returns and `?` on
/// error paths can never leak a count and pin a session forever.
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    /// Wraps a session whose count has already been incremented for this handle.
    pub(crate) fn adopt(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Explicit release; equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Clone for SessionHandle {
    fn clone(&self) -> Self {
        self.session.retain();
        Self {
            session: self.session.clone(),
        }
    }
}

impl Deref for SessionHandle {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.session.release();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionHandle").field(&self.session).finish()
    }
}
