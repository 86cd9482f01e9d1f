//! Agent worker engine.
//!
//! Runs inside each agent container. A claim watcher observes new claims
//! and grant notifications, submits sealed bids, and enqueues granted
//! work; a work executor assembles context, drives the agent tool
//! subprocess, and posts result artefacts back to the blackboard. The two
//! share a capacity-1 work queue.
//!
//! # Main types
//!
//! - [`AgentEngine`] — Wires watcher, executor, and settings together.
//! - [`AgentSettings`] — Identity, commands, and workspace for one agent.
//! - [`assemble_context`] — BFS provenance traversal for tool input.

/// Bid decisions: bid scripts with static fallback.
pub mod bidding;
/// BFS context assembly.
pub mod context;
/// Engine wiring and settings.
pub mod engine;
/// Tool subprocess execution and result artefacts.
pub mod executor;
/// Claim watching and bid submission.
pub mod watcher;

pub use context::assemble_context;
pub use engine::{AgentEngine, AgentSettings};
pub use executor::{WorkExecutor, WorkItem};
pub use watcher::ClaimWatcher;
