//! Context assembly: bounded BFS over the provenance graph.
//!
//! For a target artefact and its claim, walks provenance edges backwards,
//! swaps in the latest version of each logical thread, de-duplicates by
//! logical id, keeps only structural types a tool should see, and emits
//! oldest-first. The depth cap defends against malformed cycles; cycles do
//! not exist by construction but the defense is required.

use gavel_blackboard::Blackboard;
use gavel_core::{Artefact, Claim, StructuralType};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_DEPTH: usize = 10;

/// Build the ordered ancestor chain fed to the agent tool.
///
/// Fetch failures are logged and skipped; a partial chain is better than
/// no execution.
pub async fn assemble_context(
    blackboard: &dyn Blackboard,
    target: &Artefact,
    claim: &Claim,
) -> Vec<Artefact> {
    let mut frontier: Vec<Uuid> = target.source_artefacts.clone();
    frontier.extend(claim.additional_context_ids.iter().copied());

    let mut seen_logical: HashSet<Uuid> = HashSet::new();
    let mut discovered: Vec<Artefact> = Vec::new();

    for depth in 0..MAX_DEPTH {
        if frontier.is_empty() {
            break;
        }
        let mut next = Vec::new();
        for id in frontier {
            let artefact = match blackboard.get_artefact(id).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(artefact_id = %id, depth = depth, error = %e, "context fetch failed; skipping");
                    continue;
                }
            };
            let artefact = resolve_latest(blackboard, artefact).await;
            if !seen_logical.insert(artefact.logical_id) {
                continue;
            }
            next.extend(artefact.source_artefacts.iter().copied());
            discovered.push(artefact);
        }
        frontier = next;
    }

    discovered.retain(|a| {
        matches!(
            a.structural_type,
            StructuralType::Standard | StructuralType::Answer | StructuralType::Review
        )
    });
    // BFS discovers newest first; tools read oldest first.
    discovered.reverse();
    discovered
}

/// Swap the discovered artefact for the thread's latest version when one
/// is strictly newer.
async fn resolve_latest(blackboard: &dyn Blackboard, artefact: Artefact) -> Artefact {
    match blackboard.latest_version(artefact.logical_id).await {
        Ok(Some((latest_id, latest_version))) if latest_version > artefact.version => {
            match blackboard.get_artefact(latest_id).await {
                Ok(latest) => {
                    debug!(
                        logical_id = %artefact.logical_id,
                        from = artefact.version,
                        to = latest_version,
                        "swapped in latest thread version"
                    );
                    latest
                }
                Err(e) => {
                    warn!(artefact_id = %latest_id, error = %e, "latest version fetch failed; keeping discovered");
                    artefact
                }
            }
        }
        Ok(_) => artefact,
        Err(e) => {
            warn!(logical_id = %artefact.logical_id, error = %e, "thread lookup failed; keeping discovered");
            artefact
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_blackboard::MemoryBlackboard;

    async fn put(
        bb: &MemoryBlackboard,
        structural_type: StructuralType,
        sources: Vec<Uuid>,
    ) -> Artefact {
        let a = Artefact::new_thread(structural_type, "T", "{}", sources, "someone");
        bb.create_artefact(&a).await.unwrap();
        bb.add_version_to_thread(a.logical_id, a.id, a.version)
            .await
            .unwrap();
        a
    }

    #[tokio::test]
    async fn test_chain_is_oldest_first() {
        let bb = MemoryBlackboard::new("test");
        let root = put(&bb, StructuralType::Standard, vec![]).await;
        let mid = put(&bb, StructuralType::Standard, vec![root.id]).await;
        let target = put(&bb, StructuralType::Standard, vec![mid.id]).await;
        let claim = Claim::for_artefact(target.id);

        let chain = assemble_context(&bb, &target, &claim).await;
        let ids: Vec<Uuid> = chain.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![root.id, mid.id]);
    }

    #[tokio::test]
    async fn test_filters_structural_types() {
        let bb = MemoryBlackboard::new("test");
        let keep_standard = put(&bb, StructuralType::Standard, vec![]).await;
        let keep_answer = put(&bb, StructuralType::Answer, vec![]).await;
        let keep_review = put(&bb, StructuralType::Review, vec![]).await;
        let drop_failure = put(&bb, StructuralType::Failure, vec![]).await;
        let drop_question = put(&bb, StructuralType::Question, vec![]).await;
        let drop_terminal = put(&bb, StructuralType::Terminal, vec![]).await;

        let target = put(
            &bb,
            StructuralType::Standard,
            vec![
                keep_standard.id,
                keep_answer.id,
                keep_review.id,
                drop_failure.id,
                drop_question.id,
                drop_terminal.id,
            ],
        )
        .await;
        let claim = Claim::for_artefact(target.id);

        let chain = assemble_context(&bb, &target, &claim).await;
        assert_eq!(chain.len(), 3);
        assert!(chain.iter().all(|a| matches!(
            a.structural_type,
            StructuralType::Standard | StructuralType::Answer | StructuralType::Review
        )));
    }

    #[tokio::test]
    async fn test_dedupes_by_logical_id() {
        let bb = MemoryBlackboard::new("test");
        let shared = put(&bb, StructuralType::Standard, vec![]).await;
        let left = put(&bb, StructuralType::Standard, vec![shared.id]).await;
        let right = put(&bb, StructuralType::Standard, vec![shared.id]).await;
        let target = put(&bb, StructuralType::Standard, vec![left.id, right.id]).await;
        let claim = Claim::for_artefact(target.id);

        let chain = assemble_context(&bb, &target, &claim).await;
        let shared_count = chain.iter().filter(|a| a.id == shared.id).count();
        assert_eq!(shared_count, 1);
        assert_eq!(chain.len(), 3);
    }

    #[tokio::test]
    async fn test_swaps_in_latest_version() {
        let bb = MemoryBlackboard::new("test");
        let v1 = put(&bb, StructuralType::Standard, vec![]).await;
        let v2 = Artefact::next_version(&v1, "newer", vec![v1.id], "someone");
        bb.create_artefact(&v2).await.unwrap();
        bb.add_version_to_thread(v2.logical_id, v2.id, v2.version)
            .await
            .unwrap();

        // Target references v1, but the thread has moved on to v2.
        let target = put(&bb, StructuralType::Standard, vec![v1.id]).await;
        let claim = Claim::for_artefact(target.id);

        let chain = assemble_context(&bb, &target, &claim).await;
        assert!(chain.iter().any(|a| a.id == v2.id));
        assert!(!chain.iter().any(|a| a.id == v1.id));
    }

    #[tokio::test]
    async fn test_additional_context_ids_are_included() {
        let bb = MemoryBlackboard::new("test");
        let target = put(&bb, StructuralType::Standard, vec![]).await;
        let review = put(&bb, StructuralType::Review, vec![target.id]).await;

        let mut claim = Claim::for_artefact(target.id);
        claim.additional_context_ids = vec![review.id];

        let chain = assemble_context(&bb, &target, &claim).await;
        assert!(chain.iter().any(|a| a.id == review.id));
    }

    #[tokio::test]
    async fn test_cycle_is_bounded_by_depth_cap() {
        let bb = MemoryBlackboard::new("test");
        // Hand-build two artefacts that reference each other.
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let mut a = Artefact::new_thread(StructuralType::Standard, "T", "{}", vec![id_b], "x");
        a.id = id_a;
        a.logical_id = id_a;
        let mut b = Artefact::new_thread(StructuralType::Standard, "T", "{}", vec![id_a], "x");
        b.id = id_b;
        b.logical_id = id_b;
        bb.create_artefact(&a).await.unwrap();
        bb.create_artefact(&b).await.unwrap();

        let target = put(&bb, StructuralType::Standard, vec![id_a]).await;
        let claim = Claim::for_artefact(target.id);

        // Terminates despite the cycle; dedup keeps each thread once.
        let chain = assemble_context(&bb, &target, &claim).await;
        assert_eq!(chain.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_source_is_skipped() {
        let bb = MemoryBlackboard::new("test");
        let present = put(&bb, StructuralType::Standard, vec![]).await;
        let target = put(
            &bb,
            StructuralType::Standard,
            vec![Uuid::new_v4(), present.id],
        )
        .await;
        let claim = Claim::for_artefact(target.id);

        let chain = assemble_context(&bb, &target, &claim).await;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, present.id);
    }
}
