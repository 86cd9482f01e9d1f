use crate::claim::Phase;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Work kind carried by a grant notification. Mirrors the bid vocabulary
/// on the wire (`claim` = parallel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantType {
    Review,
    Claim,
    Exclusive,
}

impl From<Phase> for GrantType {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Review => Self::Review,
            Phase::Parallel => Self::Claim,
            Phase::Exclusive => Self::Exclusive,
        }
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Review => "review",
            Self::Claim => "claim",
            Self::Exclusive => "exclusive",
        };
        write!(f, "{s}")
    }
}

/// Grant notification published on an agent's private channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantNotification {
    /// Always `"grant"`. Kept explicit so the channel can carry other
    /// event types later without breaking consumers.
    pub event_type: String,
    pub claim_id: Uuid,
    pub claim_type: GrantType,
}

impl GrantNotification {
    /// Build a grant envelope for a claim.
    pub fn new(claim_id: Uuid, claim_type: GrantType) -> Self {
        Self {
            event_type: "grant".to_string(),
            claim_id,
            claim_type,
        }
    }

    /// Whether this envelope is a grant (the only kind currently sent).
    pub fn is_grant(&self) -> bool {
        self.event_type == "grant"
    }
}

/// Observability envelope published on the workflow channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Event discriminator (`claim_granted`, `review_rejected`, ...).
    pub event: String,
    pub data: serde_json::Value,
}

impl WorkflowEvent {
    /// Build an envelope with an arbitrary discriminator.
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// A phase was granted to the listed agents.
    pub fn claim_granted(claim_id: Uuid, phase: Phase, agents: &[String]) -> Self {
        Self::new(
            "claim_granted",
            serde_json::json!({
                "claim_id": claim_id,
                "phase": phase.to_string(),
                "agents": agents,
            }),
        )
    }

    /// Every review artefact for the claim was an approval.
    pub fn review_approved(claim_id: Uuid, artefact_id: Uuid) -> Self {
        Self::new(
            "review_approved",
            serde_json::json!({ "claim_id": claim_id, "artefact_id": artefact_id }),
        )
    }

    /// At least one review artefact carried feedback.
    pub fn review_rejected(claim_id: Uuid, artefact_id: Uuid, review_ids: &[Uuid]) -> Self {
        Self::new(
            "review_rejected",
            serde_json::json!({
                "claim_id": claim_id,
                "artefact_id": artefact_id,
                "review_ids": review_ids,
            }),
        )
    }

    /// The claim finished its final phase.
    pub fn claim_completed(claim_id: Uuid) -> Self {
        Self::new("claim_completed", serde_json::json!({ "claim_id": claim_id }))
    }

    /// The claim was terminated with a reason.
    pub fn claim_terminated(claim_id: Uuid, reason: &str) -> Self {
        Self::new(
            "claim_terminated",
            serde_json::json!({ "claim_id": claim_id, "reason": reason }),
        )
    }
}
