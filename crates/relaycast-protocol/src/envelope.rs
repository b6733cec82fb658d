//! Message envelope types for relaycast.
//!
//! An envelope pairs a message kind with an opaque content payload. The
//! payload type is a free parameter so the relay never depends on the shape
//! of what clients exchange.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The semantic role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Inbound state change from a client.
    Update,
    /// Outbound relay of another client's update.
    Sync,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Update => write!(f, "update"),
            MessageKind::Sync => write!(f, "sync"),
        }
    }
}

/// A message envelope, generic over the content payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// The opaque payload. Never parsed or mutated by the relay.
    pub content: T,
}

impl<T> Envelope<T> {
    /// Create an update envelope.
    #[must_use]
    pub fn update(content: T) -> Self {
        Self {
            kind: MessageKind::Update,
            content,
        }
    }

    /// Create a sync envelope.
    #[must_use]
    pub fn sync(content: T) -> Self {
        Self {
            kind: MessageKind::Sync,
            content,
        }
    }

    /// Check whether this envelope is an update.
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.kind == MessageKind::Update
    }

    /// Derive the outbound form of this envelope: same content, `sync` kind.
    #[must_use]
    pub fn into_sync(self) -> Self {
        Self {
            kind: MessageKind::Sync,
            content: self.content,
        }
    }
}
