//! Claim watching and sealed-bid submission.
//!
//! Dual subscription: every new claim arrives on `claim_events`, grant
//! notifications arrive on the agent's private channel. Pre-assigned
//! claims for this agent bypass bidding and go straight to the work
//! queue; everything else gets exactly one bid on first observation
//! (writes are once-only at the store).

use crate::bidding::decide_bid;
use crate::engine::AgentSettings;
use crate::executor::WorkItem;
use gavel_blackboard::{Blackboard, KeySpace, Subscription};
use gavel_core::{BidType, Claim, ClaimStatus, GavelError, GavelResult, GrantNotification, GrantType};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watches claims and feeds granted work to the executor.
pub struct ClaimWatcher {
    blackboard: Arc<dyn Blackboard>,
    keys: KeySpace,
    settings: AgentSettings,
    shutdown: CancellationToken,
}

impl ClaimWatcher {
    /// Build a watcher for one agent identity.
    pub fn new(
        blackboard: Arc<dyn Blackboard>,
        settings: AgentSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let keys = KeySpace::new(settings.instance.clone());
        Self {
            blackboard,
            keys,
            settings,
            shutdown,
        }
    }

    /// Watch until shutdown, pushing granted work onto `work_tx`.
    ///
    /// The queue has capacity 1; a send blocks briefly while the executor
    /// is busy, which is the intended backpressure.
    pub async fn run(&self, work_tx: mpsc::Sender<WorkItem>) -> GavelResult<()> {
        let Subscription {
            messages: mut claim_rx,
            errors: mut claim_err,
        } = self.blackboard.subscribe(&self.keys.claim_events()).await?;
        let Subscription {
            messages: mut grant_rx,
            errors: mut grant_err,
        } = self
            .blackboard
            .subscribe(&self.keys.agent_events(&self.settings.agent_name))
            .await?;

        info!(agent = %self.settings.agent_name, "claim watcher running");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                Some(payload) = claim_rx.recv() => self.on_claim_event(&payload, &work_tx).await,
                Some(payload) = grant_rx.recv() => self.on_grant(&payload, &work_tx).await,
                Some(err) = claim_err.recv() => warn!(error = %err, "claim subscription error"),
                Some(err) = grant_err.recv() => warn!(error = %err, "grant subscription error"),
                else => {
                    return Err(GavelError::Agent("claim event streams closed".to_string()));
                }
            }
        }
    }

    async fn on_claim_event(&self, payload: &str, work_tx: &mpsc::Sender<WorkItem>) {
        let claim: Claim = match serde_json::from_str(payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "malformed claim event; skipping");
                return;
            }
        };

        if claim.status == ClaimStatus::PendingAssignment {
            if claim.granted_exclusive_agent.as_deref() == Some(self.settings.agent_name.as_str()) {
                info!(claim_id = %claim.id, "pre-assigned claim; enqueueing without bid");
                let _ = work_tx
                    .send(WorkItem {
                        claim,
                        claim_type: GrantType::Exclusive,
                    })
                    .await;
            }
            // Pre-assigned claims for other agents get no bid at all.
            return;
        }

        let bid = self.bid_for(&claim).await;
        match self
            .blackboard
            .set_bid(claim.id, &self.settings.agent_name, bid)
            .await
        {
            Ok(true) => info!(claim_id = %claim.id, bid = %bid, "bid written"),
            Ok(false) => debug!(claim_id = %claim.id, "bid already written; no-op"),
            Err(e) => warn!(claim_id = %claim.id, error = %e, "bid write failed"),
        }
    }

    async fn bid_for(&self, claim: &Claim) -> BidType {
        match self.blackboard.get_artefact(claim.artefact_id).await {
            Ok(target) => match serde_json::to_string(&target) {
                Ok(json) => {
                    decide_bid(
                        &json,
                        self.settings.bid_script.as_deref(),
                        self.settings.bidding_strategy,
                    )
                    .await
                }
                Err(e) => {
                    warn!(claim_id = %claim.id, error = %e, "target encode failed; static bid");
                    self.settings.bidding_strategy.unwrap_or(BidType::Ignore)
                }
            },
            Err(e) => {
                warn!(claim_id = %claim.id, error = %e, "target fetch failed; static bid");
                self.settings.bidding_strategy.unwrap_or(BidType::Ignore)
            }
        }
    }

    async fn on_grant(&self, payload: &str, work_tx: &mpsc::Sender<WorkItem>) {
        let notification: GrantNotification = match serde_json::from_str(payload) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "malformed agent event; skipping");
                return;
            }
        };
        if !notification.is_grant() {
            debug!(event_type = %notification.event_type, "ignoring non-grant agent event");
            return;
        }

        let claim = match self.blackboard.get_claim(notification.claim_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(claim_id = %notification.claim_id, error = %e, "granted claim fetch failed");
                return;
            }
        };

        // The claim is authoritative: verify it actually grants us.
        match claim.grant_for(&self.settings.agent_name) {
            Some(phase) => {
                let claim_type = GrantType::from(phase);
                if claim_type != notification.claim_type {
                    warn!(
                        claim_id = %claim.id,
                        notified = %notification.claim_type,
                        actual = %claim_type,
                        "grant notification disagrees with claim; trusting claim"
                    );
                }
                info!(claim_id = %claim.id, claim_type = %claim_type, "grant verified; enqueueing");
                let _ = work_tx.send(WorkItem { claim, claim_type }).await;
            }
            None => {
                warn!(
                    claim_id = %claim.id,
                    agent = %self.settings.agent_name,
                    "grant notification but claim does not grant this agent; skipping"
                );
            }
        }
    }
}
