//! Core types shared across the Gavel workspace.
//!
//! Gavel coordinates a pool of containerized agents that collaboratively
//! produce a directed, versioned graph of artefacts. This crate holds the
//! vocabulary every other crate speaks: artefacts, claims, bids, phase
//! state, pub/sub envelopes, the instance configuration schema, and the
//! unified error type.
//!
//! # Main types
//!
//! - [`GavelError`] — Unified error enum for all Gavel subsystems.
//! - [`GavelResult`] — Convenience alias for `Result<T, GavelError>`.
//! - [`Artefact`] — Immutable unit of produced content with provenance.
//! - [`Claim`] — The orchestrator's record-of-decision for an artefact.
//! - [`BidType`] — An agent's sealed vote on a claim.
//! - [`PhaseState`] — Persisted per-claim phase tracking, used by recovery.
//! - [`InstanceConfig`] — Parsed and validated instance configuration.

/// Artefacts, structural types, and the review-approval payload rule.
pub mod artefact;
/// Sealed-bid vocabulary.
pub mod bid;
/// Claims, statuses, phases, and persisted phase state.
pub mod claim;
/// Instance configuration schema, loading, and validation.
pub mod config;
/// Unified error type.
pub mod error;
/// Typed pub/sub event envelopes.
pub mod event;

pub use artefact::{is_approval_payload, Artefact, StructuralType};
pub use bid::BidType;
pub use claim::{Claim, ClaimStatus, GrantPause, Phase, PhaseState};
pub use config::{AgentConfig, AgentMode, InstanceConfig, OrchestratorConfig, WorkerConfig};
pub use error::{GavelError, GavelResult};
pub use event::{GrantNotification, GrantType, WorkflowEvent};
