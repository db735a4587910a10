//! `fieldos-middleware` – the message substrate.
//!
//! Moves envelopes between service processes without caring about their
//! meaning.  One broker runs per machine; every process links exactly one
//! [`MessagingClient`].
//!
//! # Modules
//!
//! - [`topics`] – topic validation, the wildcard matcher trie and the
//!   [`TopicRegistry`] of per-pattern delivery rules.
//! - [`codec`] – JSON wire frames with transparent gzip compression.
//! - [`bus`] – in-process broker core: sessions, routing, retained store.
//! - [`ws_server`] – the broker's WebSocket front end.
//! - [`transport`] – how a client reaches a broker (in-memory or WebSocket).
//! - [`queue`] – bounded priority-aware outbound queue.
//! - [`rate_limit`] – per-topic-class token buckets.
//! - [`backoff`] – exponential backoff with additive jitter.
//! - [`client`] – the reliable publish/subscribe client.
//! - [`supervisor`] – broker process lifecycle and config generation.

pub mod backoff;
pub mod bus;
pub mod client;
pub mod codec;
pub mod queue;
pub mod rate_limit;
pub mod supervisor;
pub mod topics;
pub mod transport;
pub mod ws_server;

pub use backoff::Backoff;
pub use bus::MessageBus;
pub use client::{ClientConfig, ClientStats, HeartbeatConfig, MessagingClient, Subscription};
pub use supervisor::{BrokerConfig, BrokerFlavor, BrokerStatus, BrokerSupervisor};
pub use topics::{TopicDefinition, TopicRegistry};
pub use transport::{MemoryTransport, Transport, WsTransport};
pub use ws_server::BrokerServer;
