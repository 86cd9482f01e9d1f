//! Review-rejection feedback loop.
//!
//! When a review phase produces feedback, the original producer is
//! reassigned directly (no bidding) through a `pending_assignment` claim
//! carrying the feedback reviews as additional context. The rework
//! artefact's version is the single source of truth for how many rounds a
//! thread has been through; the iteration cap reads it as
//! `target.version - 1`.

use crate::engine::{post_failure, terminate_claim};
use crate::phase::{PendingAssignment, PhaseTracker};
use gavel_blackboard::{Blackboard, KeySpace};
use gavel_core::{Artefact, Claim, GavelResult, InstanceConfig};
use tracing::{info, warn};
use uuid::Uuid;

/// Handle a rejected review phase for a claim.
///
/// Creates the pre-assigned feedback claim (or the capping Failure
/// artefact), tracks it, and terminates the original claim. Exactly one
/// rework per rejection: the caller invokes this once per completed
/// review phase.
pub(crate) async fn handle_review_rejection(
    blackboard: &dyn Blackboard,
    keys: &KeySpace,
    config: &InstanceConfig,
    tracker: &mut PhaseTracker,
    original_claim_id: Uuid,
    target: &Artefact,
    feedback_reviews: &[Artefact],
) -> GavelResult<()> {
    let review_ids: Vec<Uuid> = feedback_reviews.iter().map(|r| r.id).collect();
    let iteration_count = target.version.saturating_sub(1);
    let cap = config.orchestrator.max_review_iterations as u64;

    if cap > 0 && iteration_count >= cap {
        warn!(
            claim_id = %original_claim_id,
            artefact_id = %target.id,
            iterations = iteration_count,
            cap = cap,
            "review iteration cap reached"
        );
        post_failure(
            blackboard,
            "MaxIterationsExceeded",
            serde_json::json!({
                "reason": "review iteration cap reached",
                "target_artefact_id": target.id,
                "logical_id": target.logical_id,
                "iterations": iteration_count,
                "max_review_iterations": cap,
            }),
            vec![target.id],
        )
        .await?;
        terminate_claim(
            blackboard,
            keys,
            original_claim_id,
            &format!(
                "review iteration cap ({cap}) reached for artefact {}; no further rework",
                target.id
            ),
        )
        .await?;
        return Ok(());
    }

    let Some(role) = config.role_of(&target.produced_by_role) else {
        warn!(
            claim_id = %original_claim_id,
            role = %target.produced_by_role,
            "no agent configured for producing role; cannot reassign"
        );
        post_failure(
            blackboard,
            "MissingAgentConfiguration",
            serde_json::json!({
                "reason": "no agent configured for the producing role",
                "target_artefact_id": target.id,
                "produced_by_role": target.produced_by_role,
            }),
            vec![target.id],
        )
        .await?;
        terminate_claim(
            blackboard,
            keys,
            original_claim_id,
            &format!(
                "no agent configured for role '{}'; rework impossible",
                target.produced_by_role
            ),
        )
        .await?;
        return Ok(());
    };
    let role = role.to_string();

    let feedback_claim = Claim::for_feedback(target.id, role.clone(), review_ids.clone());
    blackboard.create_assignment_claim(&feedback_claim).await?;
    tracker.track_assignment(
        feedback_claim.id,
        PendingAssignment {
            target_artefact_id: target.id,
            agent: role.clone(),
            role: role.clone(),
        },
    );

    info!(
        claim_id = %feedback_claim.id,
        original_claim_id = %original_claim_id,
        artefact_id = %target.id,
        agent = %role,
        reviews = ?review_ids,
        "feedback claim created"
    );

    let review_list = review_ids
        .iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    terminate_claim(
        blackboard,
        keys,
        original_claim_id,
        &format!(
            "review rejected by artefact(s) [{review_list}]; rework reassigned via claim {}",
            feedback_claim.id
        ),
    )
    .await
}
