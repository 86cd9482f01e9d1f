//! Worker manager: ephemeral containers for controller agents.
//!
//! Controller agents exist solely as bidders; when one wins an exclusive
//! grant the manager launches a worker container for the claim. Per-role
//! concurrency is capped; claims over the cap pause into a persistent
//! grant queue ordered by pause timestamp. One monitor task runs per
//! active worker and reports freed slots back to the engine over a
//! channel.

use crate::engine::{post_failure, terminate_claim};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use gavel_blackboard::{Blackboard, KeySpace};
use gavel_core::{AgentConfig, Claim, GavelError, GavelResult, GrantPause, WorkerConfig};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Label identifying this instance's worker containers, for orphan
/// reaping.
pub const INSTANCE_LABEL: &str = "gavel.instance";

const LOG_TAIL_LINES: usize = 100;
const REMOVE_GRACE: Duration = Duration::from_secs(2);

struct ActiveWorker {
    claim_id: Uuid,
    role: String,
}

#[derive(Default)]
struct WorkerState {
    active: HashMap<String, ActiveWorker>,
    by_role: HashMap<String, usize>,
}

/// Launches and monitors worker containers, enforcing per-role caps.
pub struct WorkerManager {
    runtime: Arc<dyn ContainerRuntime>,
    blackboard: Arc<dyn Blackboard>,
    keys: KeySpace,
    store_url: String,
    shutdown: CancellationToken,
    state: RwLock<WorkerState>,
    slot_tx: mpsc::UnboundedSender<String>,
}

impl WorkerManager {
    /// Build the manager and the slot-available channel the engine drains.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        blackboard: Arc<dyn Blackboard>,
        keys: KeySpace,
        store_url: impl Into<String>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (slot_tx, slot_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            runtime,
            blackboard,
            keys,
            store_url: store_url.into(),
            shutdown,
            state: RwLock::new(WorkerState::default()),
            slot_tx,
        });
        (manager, slot_rx)
    }

    /// Whether the role is at its concurrency cap.
    pub async fn at_capacity(&self, role: &str, max_concurrent: usize) -> bool {
        let state = self.state.read().await;
        state.by_role.get(role).copied().unwrap_or(0) >= max_concurrent
    }

    /// Atomically reserve a worker slot for the role. Returns false when
    /// the role is at its cap; the caller then queues the claim instead.
    pub async fn try_reserve(&self, role: &str, max_concurrent: usize) -> bool {
        let mut state = self.state.write().await;
        let count = state.by_role.entry(role.to_string()).or_insert(0);
        if *count >= max_concurrent {
            return false;
        }
        *count += 1;
        true
    }

    /// Give back a reservation after a failed launch.
    pub async fn release(&self, role: &str) {
        let mut state = self.state.write().await;
        if let Some(count) = state.by_role.get_mut(role) {
            *count = count.saturating_sub(1);
        }
    }

    /// Number of active workers for a role.
    pub async fn active_for_role(&self, role: &str) -> usize {
        self.state.read().await.by_role.get(role).copied().unwrap_or(0)
    }

    /// Best-effort image digest for the audit field on the claim.
    pub async fn image_digest(&self, image: &str) -> Option<String> {
        match self.runtime.image_id(image).await {
            Ok(digest) => Some(digest),
            Err(e) => {
                debug!(image = %image, error = %e, "image digest unavailable");
                None
            }
        }
    }

    /// Launch a worker container for a granted claim and spawn its
    /// monitor. The caller has already reserved the role's slot via
    /// [`WorkerManager::try_reserve`] and persisted the claim's grant.
    pub async fn launch(
        self: &Arc<Self>,
        claim_id: Uuid,
        role: &str,
        agent: &AgentConfig,
        worker: &WorkerConfig,
    ) -> GavelResult<String> {
        let spec = self.worker_spec(claim_id, role, agent, worker);
        let container_id = self.runtime.create(&spec).await?;
        self.runtime.start(&container_id).await?;

        {
            let mut state = self.state.write().await;
            state.active.insert(
                container_id.clone(),
                ActiveWorker {
                    claim_id,
                    role: role.to_string(),
                },
            );
        }

        info!(
            claim_id = %claim_id,
            role = %role,
            container_id = %container_id,
            image = %worker.image,
            "worker launched"
        );

        let manager = Arc::clone(self);
        let container = container_id.clone();
        tokio::spawn(async move {
            manager.monitor(container).await;
        });

        Ok(container_id)
    }

    fn worker_spec(
        &self,
        claim_id: Uuid,
        role: &str,
        agent: &AgentConfig,
        worker: &WorkerConfig,
    ) -> ContainerSpec {
        let mut env = vec![
            format!("INSTANCE_NAME={}", self.keys.instance()),
            format!("AGENT_NAME={role}"),
            format!("REDIS_URL={}", self.store_url),
            format!(
                "AGENT_COMMAND={}",
                serde_json::Value::from(worker.command.clone())
            ),
        ];
        if let Some(strategy) = agent.bidding_strategy {
            env.push(format!("BIDDING_STRATEGY={strategy}"));
        }
        if let Some(script) = &agent.bid_script {
            env.push(format!(
                "AGENT_BID_SCRIPT={}",
                serde_json::Value::from(script.clone())
            ));
        }
        ContainerSpec {
            image: worker.image.clone(),
            env,
            cmd: vec!["--execute-claim".to_string(), claim_id.to_string()],
            labels: HashMap::from([(
                INSTANCE_LABEL.to_string(),
                self.keys.instance().to_string(),
            )]),
        }
    }

    /// Pause a claim whose role is at its cap: persist the pause metadata
    /// and enqueue the claim id FIFO by pause timestamp.
    pub async fn queue_claim(&self, claim: &mut Claim, role: &str, agent: &str) -> GavelResult<()> {
        let paused_at_ms = Utc::now().timestamp_millis();
        claim.grant_queue = Some(GrantPause {
            paused_at_ms,
            agent: agent.to_string(),
        });
        self.blackboard.update_claim(claim).await?;
        self.blackboard
            .zadd(
                &self.keys.grant_queue(role),
                paused_at_ms as f64 / 1000.0,
                &claim.id.to_string(),
            )
            .await?;
        info!(claim_id = %claim.id, role = %role, "claim queued; role at capacity");
        Ok(())
    }

    /// Pop the oldest queued claim for a role (lowest score; ties break by
    /// member order). Returns `None` when the queue is empty.
    pub async fn pop_queued(&self, role: &str) -> GavelResult<Option<Uuid>> {
        let key = self.keys.grant_queue(role);
        let entries = self.blackboard.zrange_withscores(&key).await?;
        let Some((member, _)) = entries.into_iter().next() else {
            return Ok(None);
        };
        self.blackboard.zrem(&key, &member).await?;
        let claim_id = member
            .parse::<Uuid>()
            .map_err(|e| GavelError::Store(format!("corrupt grant-queue member '{member}': {e}")))?;
        Ok(Some(claim_id))
    }

    /// Size of a role's grant queue.
    pub async fn queue_len(&self, role: &str) -> GavelResult<usize> {
        Ok(self
            .blackboard
            .zrange_withscores(&self.keys.grant_queue(role))
            .await?
            .len())
    }

    /// Remove containers labeled with this instance that no monitor owns.
    pub async fn reap_orphans(&self) -> GavelResult<usize> {
        let labeled = self
            .runtime
            .list_labeled(INSTANCE_LABEL, self.keys.instance())
            .await?;
        let state = self.state.read().await;
        let orphans: Vec<String> = labeled
            .into_iter()
            .filter(|id| !state.active.contains_key(id))
            .collect();
        drop(state);

        let mut reaped = 0;
        for id in orphans {
            match self.runtime.remove(&id).await {
                Ok(()) => {
                    info!(container_id = %id, "orphan worker removed");
                    reaped += 1;
                }
                Err(e) => warn!(container_id = %id, error = %e, "failed to remove orphan"),
            }
        }
        Ok(reaped)
    }

    /// One monitor runs per active worker: wait for exit, surface
    /// failures, clean up, free the slot.
    async fn monitor(self: Arc<Self>, container_id: String) {
        let (claim_id, role) = {
            let state = self.state.read().await;
            match state.active.get(&container_id) {
                Some(w) => (w.claim_id, w.role.clone()),
                None => return,
            }
        };

        match self.runtime.wait(&container_id).await {
            Ok(0) => {
                info!(claim_id = %claim_id, container_id = %container_id, "worker_completed");
            }
            Ok(code) => {
                let logs = self
                    .runtime
                    .tail_logs(&container_id, LOG_TAIL_LINES)
                    .await
                    .unwrap_or_else(|e| format!("<logs unavailable: {e}>"));
                self.worker_failed(
                    claim_id,
                    "WorkerFailure",
                    serde_json::json!({
                        "reason": "worker exited with non-zero status",
                        "exit_code": code,
                        "container_id": container_id,
                        "logs": logs,
                    }),
                    format!("worker for claim {claim_id} exited with code {code}"),
                )
                .await;
            }
            Err(e) => {
                if self.shutdown.is_cancelled() {
                    // Shutdown tears down in-flight waits; not a worker fault.
                    debug!(container_id = %container_id, error = %e, "wait cancelled by shutdown");
                } else {
                    self.worker_failed(
                        claim_id,
                        "WorkerError",
                        serde_json::json!({
                            "reason": "container wait failed",
                            "container_id": container_id,
                            "error": e.to_string(),
                        }),
                        format!("container wait failed for claim {claim_id}: {e}"),
                    )
                    .await;
                }
            }
        }

        // Grace period so external observers can see the exit state.
        tokio::time::sleep(REMOVE_GRACE).await;
        if let Err(e) = self.runtime.remove(&container_id).await {
            warn!(container_id = %container_id, error = %e, "failed to remove worker container");
        }

        {
            let mut state = self.state.write().await;
            state.active.remove(&container_id);
            if let Some(count) = state.by_role.get_mut(&role) {
                *count = count.saturating_sub(1);
            }
        }

        // The engine pops the role's grant queue when it sees this.
        let _ = self.slot_tx.send(role);
    }

    async fn worker_failed(
        &self,
        claim_id: Uuid,
        failure_type: &str,
        diagnostics: serde_json::Value,
        reason: String,
    ) {
        error!(claim_id = %claim_id, failure_type = %failure_type, "worker failed");
        if let Err(e) =
            post_failure(self.blackboard.as_ref(), failure_type, diagnostics, vec![]).await
        {
            error!(claim_id = %claim_id, error = %e, "failed to post failure artefact");
        }
        if let Err(e) =
            terminate_claim(self.blackboard.as_ref(), &self.keys, claim_id, &reason).await
        {
            error!(claim_id = %claim_id, error = %e, "failed to terminate claim");
        }
    }
}
