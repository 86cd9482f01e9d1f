//! Blackboard store adapter.
//!
//! The blackboard is the only cross-process shared state in a Gavel
//! instance: artefacts, claims, bids, version threads, grant queues, and
//! the pub/sub channels all live here. Production deployments run Redis
//! ([`RedisBlackboard`]); tests and single-process experiments use the
//! in-memory implementation ([`MemoryBlackboard`]).
//!
//! # Main types
//!
//! - [`Blackboard`] — The store trait every component programs against.
//! - [`RedisBlackboard`] — Production implementation over Redis.
//! - [`MemoryBlackboard`] — Complete in-process implementation.
//! - [`KeySpace`] — Instance-prefixed key and channel naming.
//! - [`Subscription`] — Cancellable pub/sub event stream.

/// The store trait and subscription handle.
pub mod client;
/// Axum `/healthz` router backed by a store ping.
pub mod health;
/// Instance-prefixed key and channel naming.
pub mod keys;
/// In-process implementation for tests and local runs.
pub mod memory;
/// Redis implementation.
pub mod redis;

pub use client::{Blackboard, Subscription};
pub use health::health_router;
pub use keys::KeySpace;
pub use memory::MemoryBlackboard;
pub use redis::RedisBlackboard;
