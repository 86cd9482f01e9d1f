//! The orchestrator engine.
//!
//! One engine runs per instance. It consumes artefact events serially,
//! creates claims, runs sealed-bid consensus per claim in spawned tasks,
//! applies grants, and advances the phase state machine. The blackboard is
//! the only synchronization point with agents; the in-memory tracker is
//! owned here and shared only with the worker-slot callback, which runs on
//! the same loop.

use crate::consensus::{
    self, coerce_bids, collect_bids, determine_initial_phase, exclusive_bidders,
    select_exclusive_winner,
};
use crate::phase::PhaseTracker;
use crate::runtime::ContainerRuntime;
use crate::workers::WorkerManager;
use crate::{feedback, recovery};
use gavel_blackboard::{Blackboard, KeySpace, Subscription};
use gavel_core::{
    is_approval_payload, Artefact, BidType, Claim, ClaimStatus, GavelError, GavelResult,
    GrantNotification, GrantType, InstanceConfig, Phase, PhaseState, WorkflowEvent,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Role recorded on artefacts the orchestrator itself produces (failures).
pub(crate) const ORCHESTRATOR_ROLE: &str = "orchestrator";

/// Create a Failure artefact, register its thread, and return it.
pub(crate) async fn post_failure(
    blackboard: &dyn Blackboard,
    failure_type: &str,
    diagnostics: serde_json::Value,
    sources: Vec<Uuid>,
) -> GavelResult<Artefact> {
    let artefact = Artefact::failure(
        failure_type,
        diagnostics.to_string(),
        sources,
        ORCHESTRATOR_ROLE,
    );
    blackboard.create_artefact(&artefact).await?;
    blackboard
        .add_version_to_thread(artefact.logical_id, artefact.id, artefact.version)
        .await?;
    Ok(artefact)
}

/// Terminate a claim with a reason. Idempotent: already-settled claims are
/// left alone.
pub(crate) async fn terminate_claim(
    blackboard: &dyn Blackboard,
    keys: &KeySpace,
    claim_id: Uuid,
    reason: &str,
) -> GavelResult<()> {
    let mut claim = blackboard.get_claim(claim_id).await?;
    if !claim.status.is_open() {
        debug!(claim_id = %claim_id, status = %claim.status, "claim already settled; not terminating");
        return Ok(());
    }
    claim.status = ClaimStatus::Terminated;
    claim.termination_reason = Some(reason.to_string());
    if let Some(state) = claim.phase_state.as_mut() {
        state.artefact_expected = false;
    }
    blackboard.update_claim(&claim).await?;
    info!(claim_id = %claim_id, reason = %reason, "claim terminated");
    publish_workflow(
        blackboard,
        keys,
        &WorkflowEvent::claim_terminated(claim_id, reason),
    )
    .await
}

/// Publish a workflow observability event. Failures are logged, never
/// propagated: observability must not stall coordination.
pub(crate) async fn publish_workflow(
    blackboard: &dyn Blackboard,
    keys: &KeySpace,
    event: &WorkflowEvent,
) -> GavelResult<()> {
    let payload = serde_json::to_string(event)?;
    if let Err(e) = blackboard
        .publish_raw(&keys.workflow_events(), &payload)
        .await
    {
        warn!(event = %event.event, error = %e, "failed to publish workflow event");
    }
    Ok(())
}

pub(crate) struct EngineCore {
    pub(crate) blackboard: Arc<dyn Blackboard>,
    pub(crate) config: InstanceConfig,
    pub(crate) keys: KeySpace,
    pub(crate) tracker: Mutex<PhaseTracker>,
    pub(crate) workers: Arc<WorkerManager>,
    pub(crate) shutdown: CancellationToken,
}

/// The per-instance orchestrator.
pub struct Orchestrator {
    core: Arc<EngineCore>,
    slot_rx: mpsc::UnboundedReceiver<String>,
}

impl Orchestrator {
    /// Build an orchestrator over the given store and container runtime.
    pub fn new(
        blackboard: Arc<dyn Blackboard>,
        runtime: Arc<dyn ContainerRuntime>,
        config: InstanceConfig,
        instance: impl Into<String>,
        store_url: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let keys = KeySpace::new(instance);
        let (workers, slot_rx) = WorkerManager::new(
            runtime,
            Arc::clone(&blackboard),
            keys.clone(),
            store_url,
            shutdown.clone(),
        );
        let core = Arc::new(EngineCore {
            blackboard,
            config,
            keys,
            tracker: Mutex::new(PhaseTracker::new()),
            workers,
            shutdown,
        });
        Self { core, slot_rx }
    }

    /// Run until shutdown: recovery first, then the serial event loop.
    pub async fn run(&mut self) -> GavelResult<()> {
        recovery::run(&self.core).await?;

        let Subscription {
            mut messages,
            mut errors,
        } = self
            .core
            .blackboard
            .subscribe(&self.core.keys.artefact_events())
            .await?;
        info!(instance = %self.core.keys.instance(), "orchestrator running");

        loop {
            tokio::select! {
                _ = self.core.shutdown.cancelled() => {
                    info!("orchestrator shutting down");
                    return Ok(());
                }
                Some(role) = self.slot_rx.recv() => {
                    if let Err(e) = self.core.handle_slot_available(&role).await {
                        error!(role = %role, error = %e, "slot resume failed");
                    }
                }
                Some(err) = errors.recv() => {
                    warn!(error = %err, "transient subscription error");
                }
                msg = messages.recv() => match msg {
                    Some(payload) => self.core.dispatch_event(&payload).await,
                    None => {
                        return Err(GavelError::Orchestrator(
                            "artefact event stream closed".to_string(),
                        ));
                    }
                },
            }
        }
    }

    /// Drive one raw artefact event. Exposed for tests that bypass the
    /// pub/sub loop.
    pub async fn handle_event(&self, payload: &str) {
        self.core.dispatch_event(payload).await;
    }
}

impl EngineCore {
    async fn dispatch_event(self: &Arc<Self>, payload: &str) {
        let artefact: Artefact = match serde_json::from_str(payload) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "malformed artefact event; skipping");
                return;
            }
        };
        if let Err(e) = self.handle_artefact(&artefact).await {
            error!(artefact_id = %artefact.id, error = %e, "artefact handling failed");
        }
    }

    /// The serial per-event pipeline: feed phase tracking first (any
    /// artefact may complete a tracked phase), then the claim-creation
    /// path for artefacts that spawn claims.
    pub(crate) async fn handle_artefact(self: &Arc<Self>, artefact: &Artefact) -> GavelResult<()> {
        self.feed_tracking(artefact).await?;

        if !artefact.structural_type.spawns_claim() {
            info!(
                artefact_id = %artefact.id,
                structural_type = %artefact.structural_type,
                "artefact does not spawn a claim; skipping"
            );
            return Ok(());
        }

        if let Some(existing) = self.blackboard.get_claim_by_artefact(artefact.id).await? {
            info!(
                artefact_id = %artefact.id,
                claim_id = %existing.id,
                "claim already exists for artefact; skipping duplicate"
            );
            return Ok(());
        }

        let claim = Claim::for_artefact(artefact.id);
        if let Err(e) = self.blackboard.create_claim(&claim).await {
            // Lost a creation race; the uniqueness index is authoritative.
            info!(artefact_id = %artefact.id, error = %e, "duplicate claim creation; skipping");
            return Ok(());
        }
        info!(claim_id = %claim.id, artefact_id = %artefact.id, "claim created");

        let core = Arc::clone(self);
        let claim_id = claim.id;
        tokio::spawn(async move {
            core.run_consensus(claim_id).await;
        });
        Ok(())
    }

    /// Dedicated per-claim task: block on full consensus, then grant.
    async fn run_consensus(self: &Arc<Self>, claim_id: Uuid) {
        let agents = self.config.agent_names();
        let bids = match collect_bids(
            self.blackboard.as_ref(),
            claim_id,
            &agents,
            &self.shutdown,
        )
        .await
        {
            Ok(Some(bids)) => bids,
            Ok(None) => {
                debug!(claim_id = %claim_id, "consensus wait cancelled by shutdown");
                return;
            }
            Err(e) => {
                error!(claim_id = %claim_id, error = %e, "consensus wait failed");
                return;
            }
        };

        match determine_initial_phase(&bids) {
            Some(phase) => {
                if let Err(e) = self
                    .grant_phase(claim_id, phase, &bids, ClaimStatus::PendingReview)
                    .await
                {
                    error!(claim_id = %claim_id, phase = %phase, error = %e, "grant failed");
                }
            }
            None => {
                info!(claim_id = %claim_id, "no agent expressed interest; claim dormant");
            }
        }
    }

    /// Apply a grant for `phase`, guarded against double transitions: the
    /// claim is re-read and the write is skipped when its status no longer
    /// matches the status the decision was made under.
    pub(crate) async fn grant_phase(
        self: &Arc<Self>,
        claim_id: Uuid,
        phase: Phase,
        bids: &BTreeMap<String, BidType>,
        basis: ClaimStatus,
    ) -> GavelResult<()> {
        let mut claim = self.blackboard.get_claim(claim_id).await?;
        if claim.status != basis {
            warn!(
                claim_id = %claim_id,
                expected = %basis,
                actual = %claim.status,
                "claim advanced elsewhere; skipping double transition"
            );
            return Ok(());
        }

        match phase {
            Phase::Review => {
                let winners = consensus::review_winners(bids);
                claim.status = ClaimStatus::PendingReview;
                claim.granted_review_agents = winners.clone();
                let state = PhaseState::new(Phase::Review, winners.clone(), bids.clone());
                claim.phase_state = Some(state.clone());
                self.blackboard.update_claim(&claim).await?;
                self.tracker
                    .lock()
                    .await
                    .insert_phase(claim_id, claim.artefact_id, state);
                self.notify_grants(claim_id, GrantType::Review, winners.iter()).await;
                self.announce_grant(claim_id, Phase::Review, &winners.into_iter().collect::<Vec<_>>())
                    .await?;
            }
            Phase::Parallel => {
                let winners = consensus::parallel_winners(bids);
                claim.status = ClaimStatus::PendingParallel;
                claim.granted_parallel_agents = winners.clone();
                let state = PhaseState::new(Phase::Parallel, winners.clone(), bids.clone());
                claim.phase_state = Some(state.clone());
                self.blackboard.update_claim(&claim).await?;
                self.tracker
                    .lock()
                    .await
                    .insert_phase(claim_id, claim.artefact_id, state);
                self.notify_grants(claim_id, GrantType::Claim, winners.iter()).await;
                self.announce_grant(
                    claim_id,
                    Phase::Parallel,
                    &winners.into_iter().collect::<Vec<_>>(),
                )
                .await?;
            }
            Phase::Exclusive => {
                let bidders = exclusive_bidders(bids);
                let winner = select_exclusive_winner(&bidders);
                self.grant_exclusive(claim, winner, bids).await?;
            }
        }
        Ok(())
    }

    /// Exclusive grant: traditional agents get a notification; controller
    /// agents get a worker container, or a queue slot when their role is
    /// at its cap.
    async fn grant_exclusive(
        self: &Arc<Self>,
        mut claim: Claim,
        winner: String,
        bids: &BTreeMap<String, BidType>,
    ) -> GavelResult<()> {
        let claim_id = claim.id;
        let agent = self.config.agent_for_role(&winner).ok_or_else(|| {
            GavelError::Orchestrator(format!("exclusive winner '{winner}' is not configured"))
        })?;

        if !agent.is_controller() {
            claim.status = ClaimStatus::PendingExclusive;
            claim.granted_exclusive_agent = Some(winner.clone());
            let state = PhaseState::new(
                Phase::Exclusive,
                std::iter::once(winner.clone()).collect(),
                bids.clone(),
            );
            claim.phase_state = Some(state.clone());
            self.blackboard.update_claim(&claim).await?;
            self.tracker
                .lock()
                .await
                .insert_phase(claim_id, claim.artefact_id, state);
            self.notify_grants(claim_id, GrantType::Exclusive, std::iter::once(&winner))
                .await;
            self.announce_grant(claim_id, Phase::Exclusive, &[winner]).await?;
            return Ok(());
        }

        let worker = agent.worker.clone().ok_or_else(|| {
            GavelError::Orchestrator(format!("controller '{winner}' has no worker config"))
        })?;

        if !self.workers.try_reserve(&winner, worker.max_concurrent).await {
            return self.workers.queue_claim(&mut claim, &winner, &winner).await;
        }

        claim.status = ClaimStatus::PendingExclusive;
        claim.granted_exclusive_agent = Some(winner.clone());
        claim.granted_agent_image_id = self.workers.image_digest(&worker.image).await;
        let state = PhaseState::new(
            Phase::Exclusive,
            std::iter::once(winner.clone()).collect(),
            bids.clone(),
        );
        claim.phase_state = Some(state.clone());
        self.blackboard.update_claim(&claim).await?;
        self.tracker
            .lock()
            .await
            .insert_phase(claim_id, claim.artefact_id, state);
        self.announce_grant(claim_id, Phase::Exclusive, std::slice::from_ref(&winner))
            .await?;

        let agent = agent.clone();
        if let Err(e) = self.workers.launch(claim_id, &winner, &agent, &worker).await {
            self.workers.release(&winner).await;
            self.tracker.lock().await.remove_phase(claim_id);
            error!(claim_id = %claim_id, role = %winner, error = %e, "worker launch failed");
            post_failure(
                self.blackboard.as_ref(),
                "WorkerError",
                serde_json::json!({
                    "reason": "worker launch failed",
                    "claim_id": claim_id,
                    "role": winner,
                    "error": e.to_string(),
                }),
                vec![],
            )
            .await?;
            terminate_claim(
                self.blackboard.as_ref(),
                &self.keys,
                claim_id,
                &format!("worker launch failed for role '{winner}': {e}"),
            )
            .await?;
        }
        Ok(())
    }

    pub(crate) async fn notify_grants<'a>(
        &self,
        claim_id: Uuid,
        claim_type: GrantType,
        agents: impl Iterator<Item = &'a String>,
    ) {
        for agent in agents {
            let notification = GrantNotification::new(claim_id, claim_type);
            let payload = match serde_json::to_string(&notification) {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "failed to encode grant notification");
                    continue;
                }
            };
            if let Err(e) = self
                .blackboard
                .publish_raw(&self.keys.agent_events(agent), &payload)
                .await
            {
                warn!(claim_id = %claim_id, agent = %agent, error = %e, "grant notification failed");
            } else {
                info!(claim_id = %claim_id, agent = %agent, claim_type = %claim_type, "grant notified");
            }
        }
    }

    async fn announce_grant(
        &self,
        claim_id: Uuid,
        phase: Phase,
        agents: &[String],
    ) -> GavelResult<()> {
        publish_workflow(
            self.blackboard.as_ref(),
            &self.keys,
            &WorkflowEvent::claim_granted(claim_id, phase, agents),
        )
        .await
    }

    /// Feed an artefact to pending-assignment tracking and phase tracking.
    async fn feed_tracking(self: &Arc<Self>, artefact: &Artefact) -> GavelResult<()> {
        let assignment_hits = {
            let tracker = self.tracker.lock().await;
            tracker.matching_assignments(artefact)
        };
        for claim_id in assignment_hits {
            if let Err(e) = self.complete_assignment(claim_id, artefact).await {
                error!(claim_id = %claim_id, error = %e, "assignment completion failed");
            }
        }

        let touched = {
            let mut tracker = self.tracker.lock().await;
            tracker.record_artefact(artefact, &self.config)
        };
        for (claim_id, complete) in touched {
            if let Err(e) = self.mirror_phase_state(claim_id).await {
                warn!(claim_id = %claim_id, error = %e, "failed to mirror phase state");
            }
            if complete {
                if let Err(e) = self.handle_phase_complete(claim_id).await {
                    error!(claim_id = %claim_id, error = %e, "phase transition failed");
                }
            }
        }
        Ok(())
    }

    /// Copy the tracked in-memory phase state onto the stored claim.
    async fn mirror_phase_state(&self, claim_id: Uuid) -> GavelResult<()> {
        let state = {
            let tracker = self.tracker.lock().await;
            tracker.phase(claim_id).map(|t| t.state.clone())
        };
        let Some(state) = state else { return Ok(()) };
        let mut claim = self.blackboard.get_claim(claim_id).await?;
        claim.phase_state = Some(state);
        self.blackboard.update_claim(&claim).await
    }

    /// A rework artefact arrived for a tracked feedback claim.
    async fn complete_assignment(&self, claim_id: Uuid, artefact: &Artefact) -> GavelResult<()> {
        let mut claim = self.blackboard.get_claim(claim_id).await?;
        if claim.status != ClaimStatus::PendingAssignment {
            warn!(
                claim_id = %claim_id,
                status = %claim.status,
                "feedback claim no longer pending assignment; skipping"
            );
            self.tracker.lock().await.untrack_assignment(claim_id);
            return Ok(());
        }
        claim.status = ClaimStatus::Complete;
        self.blackboard.update_claim(&claim).await?;
        self.tracker.lock().await.untrack_assignment(claim_id);
        info!(
            claim_id = %claim_id,
            artefact_id = %artefact.id,
            version = artefact.version,
            "rework received; feedback claim complete"
        );
        publish_workflow(
            self.blackboard.as_ref(),
            &self.keys,
            &WorkflowEvent::claim_completed(claim_id),
        )
        .await
    }

    /// A tracked phase has every artefact it was waiting for.
    async fn handle_phase_complete(self: &Arc<Self>, claim_id: Uuid) -> GavelResult<()> {
        let tracked = {
            let tracker = self.tracker.lock().await;
            tracker.phase(claim_id).cloned()
        };
        let Some(tracked) = tracked else { return Ok(()) };
        let state = tracked.state;

        match state.phase {
            Phase::Review => {
                let mut reviews = Vec::new();
                for artefact_id in state.received.values() {
                    match self.blackboard.get_artefact(*artefact_id).await {
                        Ok(a) => reviews.push(a),
                        Err(e) => {
                            warn!(artefact_id = %artefact_id, error = %e, "review artefact missing");
                        }
                    }
                }
                let feedback: Vec<Artefact> = reviews
                    .iter()
                    .filter(|a| !is_approval_payload(&a.payload))
                    .cloned()
                    .collect();

                self.tracker.lock().await.remove_phase(claim_id);

                if feedback.is_empty() {
                    info!(claim_id = %claim_id, "review approved");
                    publish_workflow(
                        self.blackboard.as_ref(),
                        &self.keys,
                        &WorkflowEvent::review_approved(claim_id, tracked.artefact_id),
                    )
                    .await?;
                    self.advance_after(claim_id, &state, ClaimStatus::PendingReview)
                        .await?;
                } else {
                    let review_ids: Vec<Uuid> = feedback.iter().map(|a| a.id).collect();
                    info!(claim_id = %claim_id, reviews = ?review_ids, "review rejected");
                    publish_workflow(
                        self.blackboard.as_ref(),
                        &self.keys,
                        &WorkflowEvent::review_rejected(claim_id, tracked.artefact_id, &review_ids),
                    )
                    .await?;
                    let target = self.blackboard.get_artefact(tracked.artefact_id).await?;
                    let mut tracker = self.tracker.lock().await;
                    feedback::handle_review_rejection(
                        self.blackboard.as_ref(),
                        &self.keys,
                        &self.config,
                        &mut tracker,
                        claim_id,
                        &target,
                        &feedback,
                    )
                    .await?;
                }
            }
            Phase::Parallel => {
                self.tracker.lock().await.remove_phase(claim_id);
                self.advance_after(claim_id, &state, ClaimStatus::PendingParallel)
                    .await?;
            }
            Phase::Exclusive => {
                self.tracker.lock().await.remove_phase(claim_id);
                let mut claim = self.blackboard.get_claim(claim_id).await?;
                if claim.status != ClaimStatus::PendingExclusive {
                    warn!(
                        claim_id = %claim_id,
                        status = %claim.status,
                        "claim advanced elsewhere; skipping completion"
                    );
                    return Ok(());
                }
                claim.phase_state = Some(PhaseState {
                    artefact_expected: false,
                    ..state
                });
                claim.status = ClaimStatus::Complete;
                self.blackboard.update_claim(&claim).await?;
                info!(claim_id = %claim_id, "claim complete");
                publish_workflow(
                    self.blackboard.as_ref(),
                    &self.keys,
                    &WorkflowEvent::claim_completed(claim_id),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Advance past a completed phase: parallel if anyone bid `claim`,
    /// else exclusive if anyone bid `exclusive`, else dormant.
    async fn advance_after(
        self: &Arc<Self>,
        claim_id: Uuid,
        state: &PhaseState,
        basis: ClaimStatus,
    ) -> GavelResult<()> {
        let has_parallel = state.bids.values().any(|b| *b == BidType::Claim);
        let has_exclusive = state.bids.values().any(|b| *b == BidType::Exclusive);

        if state.phase == Phase::Review && has_parallel {
            self.grant_phase(claim_id, Phase::Parallel, &state.bids, basis)
                .await
        } else if has_exclusive {
            self.grant_phase(claim_id, Phase::Exclusive, &state.bids, basis)
                .await
        } else {
            info!(claim_id = %claim_id, after = %state.phase, "no further bids; claim dormant");
            Ok(())
        }
    }

    /// A worker slot freed up: resume the oldest queued claim for the role
    /// as if it had just won the exclusive grant.
    pub(crate) async fn handle_slot_available(self: &Arc<Self>, role: &str) -> GavelResult<()> {
        let Some(claim_id) = self.workers.pop_queued(role).await? else {
            return Ok(());
        };
        let mut claim = self.blackboard.get_claim(claim_id).await?;
        claim.grant_queue = None;
        self.blackboard.update_claim(&claim).await?;
        info!(claim_id = %claim_id, role = %role, "resuming queued claim");

        let raw = self.blackboard.all_bids(claim_id).await?;
        let bids = coerce_bids(claim_id, raw, &self.config.agent_names());
        self.grant_phase(claim_id, Phase::Exclusive, &bids, claim.status)
            .await
    }
}
