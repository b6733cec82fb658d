//! # relaycast-protocol
//!
//! Wire message types for the relaycast broadcast relay.
//!
//! Clients exchange JSON text frames shaped as `{"type": ..., "content": ...}`.
//! An inbound `update` is relayed to every other client as a `sync` carrying
//! the same content; the hub never inspects the content itself.
//!
//! ## Example
//!
//! ```rust
//! use relaycast_protocol::{codec, Envelope, MessageKind};
//!
//! let env: Envelope<String> = codec::decode(r#"{"type":"update","content":"hi"}"#).unwrap();
//! assert_eq!(env.kind, MessageKind::Update);
//!
//! let out = codec::encode(&env.into_sync()).unwrap();
//! assert_eq!(out, r#"{"type":"sync","content":"hi"}"#);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError, MAX_MESSAGE_SIZE};
pub use envelope::{Envelope, MessageKind};
