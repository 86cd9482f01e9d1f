//! Orchestration engine for a Gavel instance.
//!
//! Watches the blackboard for new artefacts, creates claims, runs a
//! sealed-bid auction per claim, and grants work through a three-phase
//! pipeline (review → parallel → exclusive). Review rejections feed back
//! to the original producer through pre-assigned claims; controller wins
//! launch ephemeral worker containers under per-role concurrency caps.
//!
//! # Main types
//!
//! - [`Orchestrator`] — The per-instance engine; call [`Orchestrator::run`].
//! - [`WorkerManager`] — Container lifecycle and grant queue.
//! - [`ContainerRuntime`] — Seam to the container daemon; Docker in
//!   production, a fake in tests.
//! - [`PhaseTracker`] — In-memory phase and pending-assignment maps.

/// Sealed-bid consensus and winner selection.
pub mod consensus;
/// Engine event loop, granting, and transitions.
pub mod engine;
/// Review-rejection feedback loop.
pub mod feedback;
/// In-memory phase tracking.
pub mod phase;
/// Startup recovery.
pub mod recovery;
/// Container runtime seam and Docker implementation.
pub mod runtime;
/// Worker containers, concurrency caps, and the grant queue.
pub mod workers;

pub use engine::Orchestrator;
pub use phase::{PendingAssignment, PhaseTracker, TrackedClaim};
pub use runtime::{ContainerRuntime, ContainerSpec, DockerRuntime};
pub use workers::{WorkerManager, INSTANCE_LABEL};
