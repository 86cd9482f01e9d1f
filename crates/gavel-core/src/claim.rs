use crate::bid::BidType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Execution phase of a claim. Phases run review → parallel → exclusive;
/// each is optional depending on the bids received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Review,
    Parallel,
    Exclusive,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Review => "review",
            Self::Parallel => "parallel",
            Self::Exclusive => "exclusive",
        };
        write!(f, "{s}")
    }
}

/// Status of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    PendingReview,
    PendingParallel,
    PendingExclusive,
    /// Pre-assigned feedback claim; the granted agent skips bidding.
    PendingAssignment,
    Complete,
    Terminated,
}

impl ClaimStatus {
    /// Statuses that recovery rehydrates on startup.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Self::PendingReview
                | Self::PendingParallel
                | Self::PendingExclusive
                | Self::PendingAssignment
        )
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PendingReview => "pending_review",
            Self::PendingParallel => "pending_parallel",
            Self::PendingExclusive => "pending_exclusive",
            Self::PendingAssignment => "pending_assignment",
            Self::Complete => "complete",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Per-claim phase tracking, persisted on the claim for crash recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: Phase,
    pub granted_agents: BTreeSet<String>,
    /// Role → artefact id received for that role. First write wins.
    #[serde(default)]
    pub received: BTreeMap<String, Uuid>,
    /// The full bid map the grant decision was made from.
    pub bids: BTreeMap<String, BidType>,
    /// Phase start time, epoch milliseconds.
    pub started_at_ms: i64,
    /// Whether the granted agents still owe an artefact. Recovery re-issues
    /// grants only when this is set.
    #[serde(default)]
    pub artefact_expected: bool,
}

impl PhaseState {
    /// Start tracking a freshly granted phase.
    pub fn new(
        phase: Phase,
        granted_agents: BTreeSet<String>,
        bids: BTreeMap<String, BidType>,
    ) -> Self {
        Self {
            phase,
            granted_agents,
            received: BTreeMap::new(),
            bids,
            started_at_ms: Utc::now().timestamp_millis(),
            artefact_expected: true,
        }
    }

    /// Record an artefact received for a role. Returns false when the role
    /// already delivered (duplicate writes are no-ops).
    pub fn record_received(&mut self, role: &str, artefact_id: Uuid) -> bool {
        if self.received.contains_key(role) {
            return false;
        }
        self.received.insert(role.to_string(), artefact_id);
        true
    }

    /// Phase completion: every granted agent's role has delivered.
    pub fn is_complete(&self) -> bool {
        self.received.len() >= self.granted_agents.len()
    }
}

/// Grant-queue pause metadata, set while a claim waits for a worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantPause {
    /// Pause time, epoch milliseconds. Queue order is FIFO on this value.
    pub paused_at_ms: i64,
    /// The exclusive winner the claim is queued for.
    pub agent: String,
}

/// The orchestrator's record-of-decision for doing work on an artefact.
///
/// Exactly one claim exists per artefact. Statuses advance through phases;
/// claims terminate or complete but are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: Uuid,
    pub artefact_id: Uuid,
    pub status: ClaimStatus,
    #[serde(default)]
    pub granted_review_agents: BTreeSet<String>,
    #[serde(default)]
    pub granted_parallel_agents: BTreeSet<String>,
    #[serde(default)]
    pub granted_exclusive_agent: Option<String>,
    /// Artefact ids injected into context assembly (feedback loop only).
    #[serde(default)]
    pub additional_context_ids: Vec<Uuid>,
    #[serde(default)]
    pub termination_reason: Option<String>,
    #[serde(default)]
    pub phase_state: Option<PhaseState>,
    #[serde(default)]
    pub grant_queue: Option<GrantPause>,
    /// Container image digest of the winning agent's worker (audit).
    #[serde(default)]
    pub granted_agent_image_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Claim {
    /// Create the initial claim for an artefact: `pending_review`, no
    /// grants.
    pub fn for_artefact(artefact_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            artefact_id,
            status: ClaimStatus::PendingReview,
            granted_review_agents: BTreeSet::new(),
            granted_parallel_agents: BTreeSet::new(),
            granted_exclusive_agent: None,
            additional_context_ids: Vec::new(),
            termination_reason: None,
            phase_state: None,
            grant_queue: None,
            granted_agent_image_id: None,
            created_at: Utc::now(),
        }
    }

    /// Create a pre-assigned feedback claim for a rejected artefact.
    pub fn for_feedback(
        target_artefact_id: Uuid,
        producer_agent: impl Into<String>,
        feedback_review_ids: Vec<Uuid>,
    ) -> Self {
        let mut claim = Self::for_artefact(target_artefact_id);
        claim.status = ClaimStatus::PendingAssignment;
        claim.granted_exclusive_agent = Some(producer_agent.into());
        claim.additional_context_ids = feedback_review_ids;
        claim
    }

    /// The phase this claim grants to the given agent, if any.
    pub fn grant_for(&self, agent: &str) -> Option<Phase> {
        if self.granted_review_agents.contains(agent) {
            Some(Phase::Review)
        } else if self.granted_parallel_agents.contains(agent) {
            Some(Phase::Parallel)
        } else if self.granted_exclusive_agent.as_deref() == Some(agent) {
            Some(Phase::Exclusive)
        } else {
            None
        }
    }
}
