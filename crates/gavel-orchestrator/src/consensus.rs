//! Sealed-bid consensus and deterministic winner selection.
//!
//! Consensus is reached when every registered agent has written a bid for
//! a claim. There is no timeout: dormancy requires explicit `ignore` bids,
//! so a missing agent stalls the claim (by design) and is surfaced through
//! the periodic "still waiting" log.

use gavel_blackboard::Blackboard;
use gavel_core::{BidType, GavelResult, Phase};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const WAITING_LOG_EVERY: u32 = 50; // 50 × 100 ms = 5 s

/// Block until every registered agent has a bid for the claim, polling the
/// bid map at 100 ms intervals. Returns `None` when shut down mid-wait.
///
/// Unknown bid values are coerced to `ignore` with a warning; a malformed
/// bid never blocks consensus.
pub async fn collect_bids(
    blackboard: &dyn Blackboard,
    claim_id: Uuid,
    agents: &[String],
    shutdown: &CancellationToken,
) -> GavelResult<Option<BTreeMap<String, BidType>>> {
    let mut polls: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            return Ok(None);
        }

        let raw = blackboard.all_bids(claim_id).await?;
        let missing: Vec<&String> = agents.iter().filter(|a| !raw.contains_key(*a)).collect();
        if missing.is_empty() {
            return Ok(Some(coerce_bids(claim_id, raw, agents)));
        }

        polls += 1;
        if polls % WAITING_LOG_EVERY == 0 {
            info!(
                claim_id = %claim_id,
                missing = ?missing,
                "still waiting for bids"
            );
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

/// Turn a raw wire bid map into a typed one, restricted to registered
/// agents. Unknown values coerce to `ignore` with a warning; bids written
/// under unregistered names are dropped so winner selection can never
/// grant an agent the configuration does not know.
pub fn coerce_bids(
    claim_id: Uuid,
    raw: BTreeMap<String, String>,
    agents: &[String],
) -> BTreeMap<String, BidType> {
    let mut bids = BTreeMap::new();
    for (agent, value) in raw {
        if !agents.contains(&agent) {
            warn!(claim_id = %claim_id, agent = %agent, "dropping bid from unregistered agent");
            continue;
        }
        let bid = match BidType::parse(&value) {
            Some(bid) => bid,
            None => {
                warn!(
                    claim_id = %claim_id,
                    agent = %agent,
                    value = %value,
                    "malformed bid coerced to ignore"
                );
                BidType::Ignore
            }
        };
        bids.insert(agent, bid);
    }
    bids
}

/// Pick the first phase with interest: review, then parallel, then
/// exclusive. `None` means the claim is dormant.
pub fn determine_initial_phase(bids: &BTreeMap<String, BidType>) -> Option<Phase> {
    if bids.values().any(|b| *b == BidType::Review) {
        Some(Phase::Review)
    } else if bids.values().any(|b| *b == BidType::Claim) {
        Some(Phase::Parallel)
    } else if bids.values().any(|b| *b == BidType::Exclusive) {
        Some(Phase::Exclusive)
    } else {
        None
    }
}

/// All agents that bid `review`.
pub fn review_winners(bids: &BTreeMap<String, BidType>) -> BTreeSet<String> {
    winners_of(bids, BidType::Review)
}

/// All agents that bid `claim`.
pub fn parallel_winners(bids: &BTreeMap<String, BidType>) -> BTreeSet<String> {
    winners_of(bids, BidType::Claim)
}

/// All agents that bid `exclusive`.
pub fn exclusive_bidders(bids: &BTreeMap<String, BidType>) -> BTreeSet<String> {
    winners_of(bids, BidType::Exclusive)
}

fn winners_of(bids: &BTreeMap<String, BidType>, wanted: BidType) -> BTreeSet<String> {
    bids.iter()
        .filter(|(_, b)| **b == wanted)
        .map(|(agent, _)| agent.clone())
        .collect()
}

/// The lexicographically-smallest exclusive bidder. This determinism is
/// the tie-break contract: no timestamps, no randomness.
///
/// # Panics
///
/// Panics on an empty bidder set. Callers only reach this after
/// [`determine_initial_phase`] (or its per-transition equivalent) saw an
/// exclusive bid, so an empty set is a programming error.
#[allow(clippy::panic)]
pub fn select_exclusive_winner(bidders: &BTreeSet<String>) -> String {
    match bidders.iter().next() {
        Some(agent) => agent.clone(),
        None => panic!("select_exclusive_winner called with no bidders"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_blackboard::MemoryBlackboard;

    fn bids(entries: &[(&str, BidType)]) -> BTreeMap<String, BidType> {
        entries
            .iter()
            .map(|(a, b)| ((*a).to_string(), *b))
            .collect()
    }

    #[test]
    fn test_review_takes_precedence() {
        let map = bids(&[
            ("a", BidType::Exclusive),
            ("b", BidType::Review),
            ("c", BidType::Claim),
        ]);
        assert_eq!(determine_initial_phase(&map), Some(Phase::Review));
    }

    #[test]
    fn test_parallel_before_exclusive() {
        let map = bids(&[("a", BidType::Exclusive), ("c", BidType::Claim)]);
        assert_eq!(determine_initial_phase(&map), Some(Phase::Parallel));
    }

    #[test]
    fn test_exclusive_only() {
        let map = bids(&[("a", BidType::Exclusive), ("b", BidType::Ignore)]);
        assert_eq!(determine_initial_phase(&map), Some(Phase::Exclusive));
    }

    #[test]
    fn test_all_ignore_is_dormant() {
        let map = bids(&[("a", BidType::Ignore), ("b", BidType::Ignore)]);
        assert_eq!(determine_initial_phase(&map), None);
    }

    #[test]
    fn test_winner_sets() {
        let map = bids(&[
            ("rev1", BidType::Review),
            ("rev2", BidType::Review),
            ("par", BidType::Claim),
            ("exc", BidType::Exclusive),
        ]);
        assert_eq!(review_winners(&map).len(), 2);
        assert!(parallel_winners(&map).contains("par"));
        assert_eq!(exclusive_bidders(&map).len(), 1);
    }

    #[test]
    fn test_exclusive_winner_is_alphabetical() {
        let bidders: BTreeSet<String> =
            ["zeta", "alpha", "mid"].iter().map(|s| s.to_string()).collect();
        assert_eq!(select_exclusive_winner(&bidders), "alpha");
    }

    #[test]
    #[should_panic(expected = "no bidders")]
    fn test_exclusive_winner_panics_on_empty() {
        select_exclusive_winner(&BTreeSet::new());
    }

    #[tokio::test]
    async fn test_collect_bids_waits_for_all_agents() {
        let bb = MemoryBlackboard::new("test");
        let claim_id = Uuid::new_v4();
        let agents = vec!["alpha".to_string(), "zeta".to_string()];
        bb.set_bid(claim_id, "alpha", BidType::Exclusive).await.unwrap();

        let shutdown = CancellationToken::new();
        let wait = collect_bids(&bb, claim_id, &agents, &shutdown);
        let write = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            bb.set_bid(claim_id, "zeta", BidType::Ignore).await.unwrap();
        };
        let (result, ()) = tokio::join!(wait, write);
        let bids = result.unwrap().unwrap();
        assert_eq!(bids["alpha"], BidType::Exclusive);
        assert_eq!(bids["zeta"], BidType::Ignore);
    }

    #[tokio::test]
    async fn test_collect_bids_coerces_malformed() {
        let bb = MemoryBlackboard::new("test");
        let claim_id = Uuid::new_v4();
        bb.inject_raw_bid(claim_id, "odd", "grab-it-all");

        let shutdown = CancellationToken::new();
        let bids = collect_bids(&bb, claim_id, &["odd".to_string()], &shutdown)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bids["odd"], BidType::Ignore);
    }

    #[tokio::test]
    async fn test_collect_bids_observes_shutdown() {
        let bb = MemoryBlackboard::new("test");
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result = collect_bids(&bb, Uuid::new_v4(), &["ghost".to_string()], &shutdown)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
