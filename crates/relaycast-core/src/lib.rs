//! # relaycast-core
//!
//! The broadcast relay hub: tracks a dynamic set of connected clients and
//! fans out each client's updates to all others as syncs.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐ register/unregister ┌─────────────┐
//! │ Connection │────────broadcast───▶│  HubHandle  │
//! └────────────┘                     └──────┬──────┘
//!                                           │ mpsc (serialized)
//!                                           ▼
//!                                    ┌─────────────┐
//!                                    │  Hub::run   │──▶ client.send(sync)
//!                                    └─────────────┘
//! ```
//!
//! A single control loop owns the client set. Connection handlers never
//! touch the set directly; they submit commands through a [`HubHandle`] and
//! the loop applies them one at a time, in arrival order. That total order
//! is what makes a broadcast observe a consistent membership snapshot, and
//! it confines per-recipient send failures to the one client that failed.

pub mod client;
pub mod hub;

pub use client::{Client, ClientError, ClientId};
pub use hub::{Hub, HubError, HubHandle, DEFAULT_QUEUE_CAPACITY};
