//! The client capability contract consumed by the hub.
//!
//! A client is an opaque handle to a connected endpoint. The hub only ever
//! calls the capabilities defined here; transport details (sockets, framing,
//! keep-alive) stay on the other side of this trait.

use async_trait::async_trait;
use relaycast_protocol::Envelope;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Unique identifier for a client handle.
///
/// Every handle gets a fresh id at creation, so identity is per handle:
/// two handles for the same logical endpoint compare unequal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

/// Atomic counter backing [`ClientId::generate`].
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ClientId {
    /// Generate the next client id.
    #[must_use]
    pub fn generate() -> Self {
        Self(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client_{}", self.0)
    }
}

/// Client errors as seen by the hub.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection was closed.
    #[error("Connection closed")]
    Closed,

    /// Failed to deliver a message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to tear down the connection.
    #[error("Close failed: {0}")]
    CloseFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected endpoint, polymorphic over the payload type `T`.
///
/// The hub calls `send` during broadcast fan-out and `close` when it tears
/// a client down (on unregister or after a failed send). Errors from
/// `close` are best-effort cleanup and are not handled further.
#[async_trait]
pub trait Client<T>: Send + Sync {
    /// The handle's identity.
    fn id(&self) -> ClientId;

    /// Deliver a message to the endpoint.
    async fn send(&self, message: Envelope<T>) -> Result<(), ClientError>;

    /// Tear down the connection.
    async fn close(&self) -> Result<(), ClientError>;

    /// Whether this handle and `other` are the same handle.
    fn identity_eq(&self, other: &dyn Client<T>) -> bool {
        self.id() == other.id()
    }
}
