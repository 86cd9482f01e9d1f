//! Crash recovery: rebuild in-memory state from the durable store.
//!
//! Runs before the engine subscribes to events. Each open claim is
//! recovered independently; a claim that cannot be recovered is terminated
//! with a precise reason and the rest continue. Recovery re-issues grants
//! only when the persisted phase state says an artefact is still expected.

use crate::engine::{terminate_claim, EngineCore};
use crate::phase::PendingAssignment;
use gavel_core::{Claim, ClaimStatus, GavelResult, GrantType, Phase, PhaseState};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const OPEN_STATUSES: [ClaimStatus; 4] = [
    ClaimStatus::PendingReview,
    ClaimStatus::PendingParallel,
    ClaimStatus::PendingExclusive,
    ClaimStatus::PendingAssignment,
];

/// Full startup recovery: orphan reaping, claim rehydration, grant-queue
/// inspection.
pub(crate) async fn run(core: &Arc<EngineCore>) -> GavelResult<()> {
    match core.workers.reap_orphans().await {
        Ok(0) => {}
        Ok(reaped) => info!(reaped = reaped, "orphan workers removed"),
        Err(e) => warn!(error = %e, "orphan reaping failed"),
    }

    let open = core.blackboard.claims_by_status(&OPEN_STATUSES).await?;
    info!(open = open.len(), "recovering open claims");

    for claim in open {
        if let Err(reason) = recover_claim(core, &claim).await {
            warn!(claim_id = %claim.id, reason = %reason, "claim not recoverable");
            if let Err(e) =
                terminate_claim(core.blackboard.as_ref(), &core.keys, claim.id, &reason).await
            {
                error!(claim_id = %claim.id, error = %e, "failed to terminate unrecoverable claim");
            }
        }
    }

    // Queues drain through the slot-available callback as workers exit;
    // recovery only reports their sizes.
    for role in core.config.controller_roles() {
        match core.workers.queue_len(&role).await {
            Ok(len) => info!(role = %role, queued = len, "grant queue rehydrated"),
            Err(e) => warn!(role = %role, error = %e, "failed to read grant queue"),
        }
    }
    Ok(())
}

/// Rebuild one claim's in-memory state. `Err` carries the termination
/// reason.
async fn recover_claim(core: &Arc<EngineCore>, claim: &Claim) -> Result<(), String> {
    if claim.status == ClaimStatus::PendingAssignment {
        let agent = claim
            .granted_exclusive_agent
            .as_ref()
            .ok_or_else(|| {
                "Recovery failed: pending_assignment claim has no granted agent".to_string()
            })?;
        let role = core.config.role_of(agent).ok_or_else(|| {
            format!("Recovery failed: granted agent '{agent}' no longer configured")
        })?;
        core.tracker.lock().await.track_assignment(
            claim.id,
            PendingAssignment {
                target_artefact_id: claim.artefact_id,
                agent: agent.clone(),
                role: role.to_string(),
            },
        );
        debug!(claim_id = %claim.id, agent = %agent, "pending assignment re-registered");
        return Ok(());
    }

    let state = claim
        .phase_state
        .clone()
        .ok_or_else(|| "Recovery failed: no persisted phase state".to_string())?;

    for agent in &state.granted_agents {
        if core.config.role_of(agent).is_none() {
            return Err(format!(
                "Recovery failed: granted agent '{agent}' no longer configured"
            ));
        }
    }

    core.tracker
        .lock()
        .await
        .insert_phase(claim.id, claim.artefact_id, state.clone());
    debug!(claim_id = %claim.id, phase = %state.phase, "phase state rebuilt");

    if state.artefact_expected && !state.is_complete() {
        reissue_grants(core, claim, &state)
            .await
            .map_err(|e| format!("Recovery failed: {e}"))?;
    }
    Ok(())
}

/// Re-publish notifications (or re-launch the worker) for agents that
/// still owe an artefact.
async fn reissue_grants(
    core: &Arc<EngineCore>,
    claim: &Claim,
    state: &PhaseState,
) -> GavelResult<()> {
    let outstanding: Vec<String> = state
        .granted_agents
        .iter()
        .filter(|agent| {
            core.config
                .role_of(agent)
                .map(|role| !state.received.contains_key(role))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if outstanding.is_empty() {
        return Ok(());
    }

    match state.phase {
        Phase::Review => {
            core.notify_grants(claim.id, GrantType::Review, outstanding.iter())
                .await;
        }
        Phase::Parallel => {
            core.notify_grants(claim.id, GrantType::Claim, outstanding.iter())
                .await;
        }
        Phase::Exclusive => {
            let winner = &outstanding[0];
            let agent = core.config.agent_for_role(winner).cloned().ok_or_else(|| {
                gavel_core::GavelError::Orchestrator(format!(
                    "exclusive winner '{winner}' is not configured"
                ))
            })?;
            if agent.is_controller() {
                let worker = agent.worker.clone().ok_or_else(|| {
                    gavel_core::GavelError::Orchestrator(format!(
                        "controller '{winner}' has no worker config"
                    ))
                })?;
                if core.workers.try_reserve(winner, worker.max_concurrent).await {
                    if let Err(e) = core.workers.launch(claim.id, winner, &agent, &worker).await {
                        core.workers.release(winner).await;
                        return Err(e);
                    }
                } else {
                    let mut claim = claim.clone();
                    core.workers.queue_claim(&mut claim, winner, winner).await?;
                }
            } else {
                core.notify_grants(claim.id, GrantType::Exclusive, std::iter::once(winner))
                    .await;
            }
        }
    }

    info!(
        claim_id = %claim.id,
        phase = %state.phase,
        agents = ?outstanding,
        "grants re-issued after recovery"
    );
    Ok(())
}
