//! Recovery tests: in-memory state rebuilt from the store on startup.
//!
//! Pre-seeds the blackboard with open claims the way a crashed
//! orchestrator would have left them, starts a fresh engine, and checks
//! rehydration, grant re-issue, and per-claim termination of
//! unrecoverable state.

use gavel_blackboard::{Blackboard, KeySpace, MemoryBlackboard};
use gavel_core::{
    Artefact, BidType, Claim, ClaimStatus, GavelResult, InstanceConfig, Phase, PhaseState,
    StructuralType,
};
use gavel_orchestrator::{ContainerRuntime, ContainerSpec, Orchestrator};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INSTANCE: &str = "recovery";

/// Minimal runtime fake: records created containers, never exits them.
#[derive(Default)]
struct IdleRuntime {
    created: Mutex<Vec<ContainerSpec>>,
    counter: AtomicUsize,
}

#[async_trait::async_trait]
impl ContainerRuntime for IdleRuntime {
    async fn list_labeled(&self, _label: &str, _value: &str) -> GavelResult<Vec<String>> {
        Ok(vec![])
    }

    async fn create(&self, spec: &ContainerSpec) -> GavelResult<String> {
        self.created.lock().unwrap().push(spec.clone());
        Ok(format!("ctr-{}", self.counter.fetch_add(1, Ordering::SeqCst)))
    }

    async fn start(&self, _id: &str) -> GavelResult<()> {
        Ok(())
    }

    async fn wait(&self, _id: &str) -> GavelResult<i64> {
        // Workers in these tests never exit on their own.
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn tail_logs(&self, _id: &str, _lines: usize) -> GavelResult<String> {
        Ok(String::new())
    }

    async fn remove(&self, _id: &str) -> GavelResult<()> {
        Ok(())
    }

    async fn image_id(&self, _image: &str) -> GavelResult<String> {
        Ok("sha256:fakedigest".to_string())
    }
}

async fn wait_for<F, Fut, T>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..250 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn two_agent_config() -> InstanceConfig {
    InstanceConfig::from_toml_str(
        r#"
        version = "1.0"

        [agents.Coder]
        image = "gavel/coder"
        command = ["tool"]
        bidding_strategy = "exclusive"

        [agents.Reviewer]
        image = "gavel/reviewer"
        command = ["tool"]
        bidding_strategy = "review"
        "#,
    )
    .unwrap()
}

fn spawn_orchestrator(
    bb: &Arc<MemoryBlackboard>,
    runtime: &Arc<IdleRuntime>,
    config: InstanceConfig,
) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let blackboard: Arc<dyn Blackboard> = bb.clone();
    let container_runtime: Arc<dyn ContainerRuntime> = runtime.clone();
    let mut orchestrator = Orchestrator::new(
        blackboard,
        container_runtime,
        config,
        INSTANCE,
        "redis://fake:6379",
        shutdown.clone(),
    );
    tokio::spawn(async move {
        let _ = orchestrator.run().await;
    });
    shutdown
}

async fn seed_target(bb: &MemoryBlackboard) -> Artefact {
    let target = Artefact::new_thread(
        StructuralType::Standard,
        "GoalDefined",
        "{}",
        vec![],
        "external",
    );
    bb.create_artefact(&target).await.unwrap();
    bb.add_version_to_thread(target.logical_id, target.id, target.version)
        .await
        .unwrap();
    target
}

fn exclusive_state(agent: &str) -> PhaseState {
    PhaseState::new(
        Phase::Exclusive,
        BTreeSet::from([agent.to_string()]),
        BTreeMap::from([
            (agent.to_string(), BidType::Exclusive),
            ("Reviewer".to_string(), BidType::Ignore),
        ]),
    )
}

#[tokio::test]
async fn test_pending_exclusive_grant_is_reissued() {
    let bb = Arc::new(MemoryBlackboard::new(INSTANCE));
    let runtime = Arc::new(IdleRuntime::default());
    let keys = KeySpace::new(INSTANCE);

    let target = seed_target(&bb).await;
    let mut claim = Claim::for_artefact(target.id);
    claim.status = ClaimStatus::PendingExclusive;
    claim.granted_exclusive_agent = Some("Coder".to_string());
    claim.phase_state = Some(exclusive_state("Coder"));
    bb.create_claim(&claim).await.unwrap();

    // Subscribe before startup so the re-issued grant is captured.
    let mut coder_channel = bb.subscribe(&keys.agent_events("Coder")).await.unwrap();

    let shutdown = spawn_orchestrator(&bb, &runtime, two_agent_config());

    let payload = wait_for("re-issued grant", || {
        let received = coder_channel.messages.try_recv().ok();
        async move { received }
    })
    .await;
    let event: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(event["event_type"], "grant");
    assert_eq!(event["claim_type"], "exclusive");

    // The rebuilt phase state still completes when the artefact arrives.
    let result = Artefact::new_thread(
        StructuralType::Standard,
        "CodeCommit",
        "body",
        vec![target.id],
        "Coder",
    );
    bb.create_artefact(&result).await.unwrap();
    bb.add_version_to_thread(result.logical_id, result.id, result.version)
        .await
        .unwrap();

    wait_for("claim completion", || {
        let bb = bb.clone();
        let id = claim.id;
        async move {
            let c = bb.get_claim(id).await.unwrap();
            (c.status == ClaimStatus::Complete).then_some(())
        }
    })
    .await;

    shutdown.cancel();
}

#[tokio::test]
async fn test_claim_without_phase_state_is_terminated() {
    let bb = Arc::new(MemoryBlackboard::new(INSTANCE));
    let runtime = Arc::new(IdleRuntime::default());

    let target = seed_target(&bb).await;
    let mut claim = Claim::for_artefact(target.id);
    claim.status = ClaimStatus::PendingExclusive;
    claim.granted_exclusive_agent = Some("Coder".to_string());
    // No phase_state persisted: unrecoverable.
    bb.create_claim(&claim).await.unwrap();

    let shutdown = spawn_orchestrator(&bb, &runtime, two_agent_config());

    let terminated = wait_for("termination", || {
        let bb = bb.clone();
        let id = claim.id;
        async move {
            let c = bb.get_claim(id).await.unwrap();
            (c.status == ClaimStatus::Terminated).then_some(c)
        }
    })
    .await;
    assert!(terminated
        .termination_reason
        .unwrap()
        .contains("no persisted phase state"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_claim_granted_to_unknown_agent_is_terminated() {
    let bb = Arc::new(MemoryBlackboard::new(INSTANCE));
    let runtime = Arc::new(IdleRuntime::default());

    let target = seed_target(&bb).await;
    let mut claim = Claim::for_artefact(target.id);
    claim.status = ClaimStatus::PendingExclusive;
    claim.granted_exclusive_agent = Some("Departed".to_string());
    claim.phase_state = Some(exclusive_state("Departed"));
    bb.create_claim(&claim).await.unwrap();

    let shutdown = spawn_orchestrator(&bb, &runtime, two_agent_config());

    let terminated = wait_for("termination", || {
        let bb = bb.clone();
        let id = claim.id;
        async move {
            let c = bb.get_claim(id).await.unwrap();
            (c.status == ClaimStatus::Terminated).then_some(c)
        }
    })
    .await;
    assert!(terminated
        .termination_reason
        .unwrap()
        .contains("'Departed' no longer configured"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_pending_assignment_is_retracked() {
    let bb = Arc::new(MemoryBlackboard::new(INSTANCE));
    let runtime = Arc::new(IdleRuntime::default());

    let target = seed_target(&bb).await;
    let review_id = uuid::Uuid::new_v4();
    let feedback = Claim::for_feedback(target.id, "Coder", vec![review_id]);
    bb.create_assignment_claim(&feedback).await.unwrap();

    let shutdown = spawn_orchestrator(&bb, &runtime, two_agent_config());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The rework artefact completes the re-tracked feedback claim.
    let rework = Artefact::next_version(&target, "v2", vec![target.id, review_id], "Coder");
    bb.create_artefact(&rework).await.unwrap();
    bb.add_version_to_thread(rework.logical_id, rework.id, rework.version)
        .await
        .unwrap();

    wait_for("feedback completion", || {
        let bb = bb.clone();
        let id = feedback.id;
        async move {
            let c = bb.get_claim(id).await.unwrap();
            (c.status == ClaimStatus::Complete).then_some(())
        }
    })
    .await;

    shutdown.cancel();
}

#[tokio::test]
async fn test_controller_worker_is_relaunched() {
    let bb = Arc::new(MemoryBlackboard::new(INSTANCE));
    let runtime = Arc::new(IdleRuntime::default());

    let config = InstanceConfig::from_toml_str(
        r#"
        version = "1.0"

        [agents.Builder]
        image = "gavel/builder"
        command = ["tool"]
        bidding_strategy = "exclusive"
        mode = "controller"

        [agents.Builder.worker]
        image = "gavel/builder-worker"
        command = ["builder-tool"]
        "#,
    )
    .unwrap();

    let target = seed_target(&bb).await;
    let mut claim = Claim::for_artefact(target.id);
    claim.status = ClaimStatus::PendingExclusive;
    claim.granted_exclusive_agent = Some("Builder".to_string());
    claim.phase_state = Some(PhaseState::new(
        Phase::Exclusive,
        BTreeSet::from(["Builder".to_string()]),
        BTreeMap::from([("Builder".to_string(), BidType::Exclusive)]),
    ));
    bb.create_claim(&claim).await.unwrap();

    let shutdown = spawn_orchestrator(&bb, &runtime, config);

    wait_for("worker relaunch", || async {
        let created = runtime.created.lock().unwrap();
        created
            .iter()
            .any(|spec| {
                spec.cmd == vec!["--execute-claim".to_string(), claim.id.to_string()]
            })
            .then_some(())
    })
    .await;

    shutdown.cancel();
}

#[tokio::test]
async fn test_completed_phase_state_is_not_reissued() {
    let bb = Arc::new(MemoryBlackboard::new(INSTANCE));
    let runtime = Arc::new(IdleRuntime::default());
    let keys = KeySpace::new(INSTANCE);

    let target = seed_target(&bb).await;
    let result_id = uuid::Uuid::new_v4();
    let mut state = exclusive_state("Coder");
    state.record_received("Coder", result_id);

    let mut claim = Claim::for_artefact(target.id);
    claim.status = ClaimStatus::PendingExclusive;
    claim.granted_exclusive_agent = Some("Coder".to_string());
    claim.phase_state = Some(state);
    bb.create_claim(&claim).await.unwrap();

    let mut coder_channel = bb.subscribe(&keys.agent_events("Coder")).await.unwrap();
    let shutdown = spawn_orchestrator(&bb, &runtime, two_agent_config());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Nothing owed, nothing re-notified.
    assert!(coder_channel.messages.try_recv().is_err());

    shutdown.cancel();
}
