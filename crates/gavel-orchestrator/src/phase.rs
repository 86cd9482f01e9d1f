//! In-memory per-claim phase tracking.
//!
//! The tracker owns two maps: claim id → tracked phase, and feedback-claim
//! id → pending assignment. Both are mutated only from the engine's event
//! path and the worker-slot callback, which share one lock. Every
//! transition mirrors the phase state onto the stored claim so recovery
//! can rebuild this map after a crash.

use gavel_core::{Artefact, InstanceConfig, PhaseState};
use std::collections::HashMap;
use uuid::Uuid;

/// A claim whose current phase is being tracked.
#[derive(Debug, Clone)]
pub struct TrackedClaim {
    /// The artefact the claim is about.
    pub artefact_id: Uuid,
    pub state: PhaseState,
}

/// A feedback claim awaiting its rework artefact.
#[derive(Debug, Clone)]
pub struct PendingAssignment {
    /// The rejected artefact the producer was reassigned to.
    pub target_artefact_id: Uuid,
    /// The pre-assigned exclusive agent.
    pub agent: String,
    /// The agent's role; the rework artefact must carry it.
    pub role: String,
}

/// Single-owner map of live phase state and pending assignments.
#[derive(Default)]
pub struct PhaseTracker {
    phase_states: HashMap<Uuid, TrackedClaim>,
    pending_assignments: HashMap<Uuid, PendingAssignment>,
}

impl PhaseTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a claim's current phase.
    pub fn insert_phase(&mut self, claim_id: Uuid, artefact_id: Uuid, state: PhaseState) {
        self.phase_states
            .insert(claim_id, TrackedClaim { artefact_id, state });
    }

    /// Stop tracking a claim's phase (transition decided or terminated).
    pub fn remove_phase(&mut self, claim_id: Uuid) -> Option<TrackedClaim> {
        self.phase_states.remove(&claim_id)
    }

    /// The tracked phase for a claim, if any.
    pub fn phase(&self, claim_id: Uuid) -> Option<&TrackedClaim> {
        self.phase_states.get(&claim_id)
    }

    /// Number of claims with a live phase.
    pub fn tracked_claims(&self) -> usize {
        self.phase_states.len()
    }

    /// Start tracking a feedback claim awaiting its rework.
    pub fn track_assignment(&mut self, claim_id: Uuid, assignment: PendingAssignment) {
        self.pending_assignments.insert(claim_id, assignment);
    }

    /// Stop tracking a feedback claim.
    pub fn untrack_assignment(&mut self, claim_id: Uuid) -> Option<PendingAssignment> {
        self.pending_assignments.remove(&claim_id)
    }

    /// The tracked assignment for a feedback claim, if any.
    pub fn assignment(&self, claim_id: Uuid) -> Option<&PendingAssignment> {
        self.pending_assignments.get(&claim_id)
    }

    /// Record an artefact against every tracked phase it satisfies.
    ///
    /// An artefact satisfies a phase when it is derived from the claim's
    /// target (its sources contain the claim's artefact id) and its
    /// producing role maps to a granted agent. First write per role wins.
    /// Returns `(claim_id, phase_complete)` for every claim that recorded
    /// the artefact, so the caller can mirror each mutation to the store.
    pub fn record_artefact(
        &mut self,
        artefact: &Artefact,
        config: &InstanceConfig,
    ) -> Vec<(Uuid, bool)> {
        let mut touched = Vec::new();
        for (claim_id, tracked) in &mut self.phase_states {
            if tracked.state.is_complete() {
                continue;
            }
            if !artefact.source_artefacts.contains(&tracked.artefact_id) {
                continue;
            }
            let Some(role) = tracked
                .state
                .granted_agents
                .iter()
                .filter_map(|agent| config.role_of(agent))
                .find(|role| *role == artefact.produced_by_role)
                .map(str::to_string)
            else {
                continue;
            };
            if tracked.state.record_received(&role, artefact.id) {
                touched.push((*claim_id, tracked.state.is_complete()));
            }
        }
        touched.sort();
        touched
    }

    /// Feedback claims completed by this artefact: it is sourced from the
    /// tracked target and produced by the assigned agent's role.
    pub fn matching_assignments(&self, artefact: &Artefact) -> Vec<Uuid> {
        let mut matches: Vec<Uuid> = self
            .pending_assignments
            .iter()
            .filter(|(_, pa)| {
                artefact.source_artefacts.contains(&pa.target_artefact_id)
                    && artefact.produced_by_role == pa.role
            })
            .map(|(claim_id, _)| *claim_id)
            .collect();
        matches.sort();
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_core::{BidType, Phase, StructuralType};
    use std::collections::{BTreeMap, BTreeSet};

    fn config_with(roles: &[&str]) -> InstanceConfig {
        let agents = roles
            .iter()
            .map(|r| {
                (
                    (*r).to_string(),
                    serde_json::from_value(serde_json::json!({
                        "image": "img",
                        "command": ["tool"],
                        "bidding_strategy": "ignore",
                    }))
                    .unwrap(),
                )
            })
            .collect();
        InstanceConfig {
            version: "1.0".to_string(),
            orchestrator: Default::default(),
            agents,
        }
    }

    fn derived_artefact(source: Uuid, role: &str) -> Artefact {
        Artefact::new_thread(StructuralType::Standard, "Out", "{}", vec![source], role)
    }

    fn phase_state(phase: Phase, agents: &[&str]) -> PhaseState {
        PhaseState::new(
            phase,
            agents.iter().map(|a| (*a).to_string()).collect::<BTreeSet<_>>(),
            BTreeMap::from([("coder".to_string(), BidType::Exclusive)]),
        )
    }

    #[test]
    fn test_record_artefact_completes_single_agent_phase() {
        let config = config_with(&["coder"]);
        let mut tracker = PhaseTracker::new();
        let claim_id = Uuid::new_v4();
        let target = Uuid::new_v4();
        tracker.insert_phase(claim_id, target, phase_state(Phase::Exclusive, &["coder"]));

        let unrelated = derived_artefact(Uuid::new_v4(), "coder");
        assert!(tracker.record_artefact(&unrelated, &config).is_empty());

        let wrong_role = derived_artefact(target, "stranger");
        assert!(tracker.record_artefact(&wrong_role, &config).is_empty());

        let hit = derived_artefact(target, "coder");
        assert_eq!(tracker.record_artefact(&hit, &config), vec![(claim_id, true)]);
    }

    #[test]
    fn test_record_artefact_partial_phase_stays_open() {
        let config = config_with(&["rev-a", "rev-b"]);
        let mut tracker = PhaseTracker::new();
        let claim_id = Uuid::new_v4();
        let target = Uuid::new_v4();
        tracker.insert_phase(claim_id, target, phase_state(Phase::Review, &["rev-a", "rev-b"]));

        let first = derived_artefact(target, "rev-a");
        assert_eq!(
            tracker.record_artefact(&first, &config),
            vec![(claim_id, false)]
        );

        // Duplicate delivery from the same role is a no-op.
        let dup = derived_artefact(target, "rev-a");
        assert!(tracker.record_artefact(&dup, &config).is_empty());
        assert_eq!(
            tracker.phase(claim_id).unwrap().state.received["rev-a"],
            first.id
        );

        let second = derived_artefact(target, "rev-b");
        assert_eq!(
            tracker.record_artefact(&second, &config),
            vec![(claim_id, true)]
        );
    }

    #[test]
    fn test_matching_assignments() {
        let mut tracker = PhaseTracker::new();
        let claim_id = Uuid::new_v4();
        let target = Uuid::new_v4();
        tracker.track_assignment(
            claim_id,
            PendingAssignment {
                target_artefact_id: target,
                agent: "coder".to_string(),
                role: "coder".to_string(),
            },
        );

        let rework = derived_artefact(target, "coder");
        assert_eq!(tracker.matching_assignments(&rework), vec![claim_id]);

        let other_role = derived_artefact(target, "reviewer");
        assert!(tracker.matching_assignments(&other_role).is_empty());

        tracker.untrack_assignment(claim_id);
        assert!(tracker.matching_assignments(&rework).is_empty());
    }
}
