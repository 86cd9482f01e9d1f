//! In-process [`Blackboard`] implementation.
//!
//! Backs integration tests and single-process experiments. Behavior
//! matches [`RedisBlackboard`](crate::RedisBlackboard): same uniqueness
//! constraints, same publication order, same sorted-set tie-breaking.

use crate::client::{Blackboard, Subscription};
use crate::keys::KeySpace;
use async_trait::async_trait;
use gavel_core::{Artefact, BidType, Claim, ClaimStatus, GavelError, GavelResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

struct Channel {
    messages: mpsc::UnboundedSender<String>,
    // Held so the subscriber's error half stays open; never written to.
    _errors: mpsc::UnboundedSender<GavelError>,
}

#[derive(Default)]
struct Inner {
    artefacts: HashMap<Uuid, Artefact>,
    claims: HashMap<Uuid, Claim>,
    claim_by_artefact: HashMap<Uuid, Uuid>,
    bids: HashMap<Uuid, BTreeMap<String, String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    subscribers: HashMap<String, Vec<Channel>>,
}

impl Inner {
    fn publish(&mut self, channel: &str, payload: &str) {
        if let Some(subs) = self.subscribers.get_mut(channel) {
            subs.retain(|c| c.messages.send(payload.to_string()).is_ok());
        }
    }
}

/// Complete in-memory blackboard.
pub struct MemoryBlackboard {
    keys: KeySpace,
    inner: Mutex<Inner>,
}

impl MemoryBlackboard {
    /// An empty blackboard for the given instance.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            keys: KeySpace::new(instance),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The instance's key space.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Write a raw bid value, bypassing the typed API. Lets tests model a
    /// buggy agent writing junk onto the wire.
    pub fn inject_raw_bid(&self, claim_id: Uuid, agent: &str, value: &str) {
        self.lock()
            .bids
            .entry(claim_id)
            .or_default()
            .insert(agent.to_string(), value.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a writer panicked mid-mutation; tests want
        // the panic surfaced, and production code never panics here.
        #[allow(clippy::unwrap_used)]
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl Blackboard for MemoryBlackboard {
    async fn create_artefact(&self, artefact: &Artefact) -> GavelResult<()> {
        let payload = serde_json::to_string(artefact)?;
        let mut inner = self.lock();
        if inner.artefacts.contains_key(&artefact.id) {
            return Err(GavelError::Store(format!(
                "artefact {} already exists",
                artefact.id
            )));
        }
        inner.artefacts.insert(artefact.id, artefact.clone());
        let channel = self.keys.artefact_events();
        inner.publish(&channel, &payload);
        Ok(())
    }

    async fn get_artefact(&self, id: Uuid) -> GavelResult<Artefact> {
        self.lock()
            .artefacts
            .get(&id)
            .cloned()
            .ok_or_else(|| GavelError::not_found("artefact", id.to_string()))
    }

    async fn add_version_to_thread(
        &self,
        logical_id: Uuid,
        artefact_id: Uuid,
        version: u64,
    ) -> GavelResult<()> {
        self.zadd(
            &self.keys.thread(logical_id),
            version as f64,
            &artefact_id.to_string(),
        )
        .await
    }

    async fn latest_version(&self, logical_id: Uuid) -> GavelResult<Option<(Uuid, u64)>> {
        let entries = self.zrange_withscores(&self.keys.thread(logical_id)).await?;
        let Some((member, score)) = entries.into_iter().next_back() else {
            return Ok(None);
        };
        let id = member
            .parse::<Uuid>()
            .map_err(|e| GavelError::Store(format!("corrupt thread member '{member}': {e}")))?;
        Ok(Some((id, score as u64)))
    }

    async fn create_claim(&self, claim: &Claim) -> GavelResult<()> {
        let payload = serde_json::to_string(claim)?;
        let mut inner = self.lock();
        if let Some(existing) = inner.claim_by_artefact.get(&claim.artefact_id) {
            return Err(GavelError::Store(format!(
                "claim {existing} already exists for artefact {}",
                claim.artefact_id
            )));
        }
        inner.claim_by_artefact.insert(claim.artefact_id, claim.id);
        inner.claims.insert(claim.id, claim.clone());
        let channel = self.keys.claim_events();
        inner.publish(&channel, &payload);
        Ok(())
    }

    async fn create_assignment_claim(&self, claim: &Claim) -> GavelResult<()> {
        let payload = serde_json::to_string(claim)?;
        let mut inner = self.lock();
        inner.claim_by_artefact.insert(claim.artefact_id, claim.id);
        inner.claims.insert(claim.id, claim.clone());
        let channel = self.keys.claim_events();
        inner.publish(&channel, &payload);
        Ok(())
    }

    async fn get_claim(&self, id: Uuid) -> GavelResult<Claim> {
        self.lock()
            .claims
            .get(&id)
            .cloned()
            .ok_or_else(|| GavelError::not_found("claim", id.to_string()))
    }

    async fn get_claim_by_artefact(&self, artefact_id: Uuid) -> GavelResult<Option<Claim>> {
        let inner = self.lock();
        Ok(inner
            .claim_by_artefact
            .get(&artefact_id)
            .and_then(|id| inner.claims.get(id))
            .cloned())
    }

    async fn update_claim(&self, claim: &Claim) -> GavelResult<()> {
        self.lock().claims.insert(claim.id, claim.clone());
        Ok(())
    }

    async fn claims_by_status(&self, statuses: &[ClaimStatus]) -> GavelResult<Vec<Claim>> {
        let inner = self.lock();
        let mut claims: Vec<Claim> = inner
            .claims
            .values()
            .filter(|c| statuses.contains(&c.status))
            .cloned()
            .collect();
        claims.sort_by_key(|c| c.created_at);
        Ok(claims)
    }

    async fn set_bid(&self, claim_id: Uuid, agent: &str, bid: BidType) -> GavelResult<bool> {
        let mut inner = self.lock();
        let bids = inner.bids.entry(claim_id).or_default();
        if bids.contains_key(agent) {
            return Ok(false);
        }
        bids.insert(agent.to_string(), bid.as_str().to_string());
        Ok(true)
    }

    async fn all_bids(&self, claim_id: Uuid) -> GavelResult<BTreeMap<String, String>> {
        Ok(self.lock().bids.get(&claim_id).cloned().unwrap_or_default())
    }

    async fn publish_raw(&self, channel: &str, payload: &str) -> GavelResult<()> {
        self.lock().publish(channel, payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> GavelResult<Subscription> {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        self.lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(Channel {
                messages: msg_tx,
                _errors: err_tx,
            });
        Ok(Subscription::new(msg_rx, err_rx))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> GavelResult<()> {
        self.lock()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_withscores(&self, key: &str) -> GavelResult<Vec<(String, f64)>> {
        let inner = self.lock();
        let mut entries: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(entries)
    }

    async fn zrem(&self, key: &str, member: &str) -> GavelResult<()> {
        if let Some(set) = self.lock().zsets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn ping(&self) -> GavelResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_core::StructuralType;

    fn artefact() -> Artefact {
        Artefact::new_thread(StructuralType::Standard, "GoalDefined", "{}", vec![], "cli")
    }

    #[tokio::test]
    async fn test_create_artefact_rejects_duplicate_id() {
        let bb = MemoryBlackboard::new("test");
        let a = artefact();
        bb.create_artefact(&a).await.unwrap();
        let err = bb.create_artefact(&a).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_get_missing_artefact_is_not_found() {
        let bb = MemoryBlackboard::new("test");
        let err = bb.get_artefact(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_one_claim_per_artefact() {
        let bb = MemoryBlackboard::new("test");
        let a = artefact();
        bb.create_artefact(&a).await.unwrap();
        bb.create_claim(&Claim::for_artefact(a.id)).await.unwrap();
        let err = bb.create_claim(&Claim::for_artefact(a.id)).await.unwrap_err();
        assert!(err.to_string().contains("already exists for artefact"));
        assert!(bb.get_claim_by_artefact(a.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bids_are_write_once() {
        let bb = MemoryBlackboard::new("test");
        let claim_id = Uuid::new_v4();
        assert!(bb.set_bid(claim_id, "coder", BidType::Exclusive).await.unwrap());
        assert!(!bb.set_bid(claim_id, "coder", BidType::Ignore).await.unwrap());
        let bids = bb.all_bids(claim_id).await.unwrap();
        assert_eq!(bids["coder"], "exclusive");
    }

    #[tokio::test]
    async fn test_thread_latest_version() {
        let bb = MemoryBlackboard::new("test");
        let logical = Uuid::new_v4();
        let (v1, v2) = (Uuid::new_v4(), Uuid::new_v4());
        bb.add_version_to_thread(logical, v1, 1).await.unwrap();
        bb.add_version_to_thread(logical, v2, 2).await.unwrap();
        assert_eq!(bb.latest_version(logical).await.unwrap(), Some((v2, 2)));
        assert_eq!(bb.latest_version(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zrange_orders_by_score_then_member() {
        let bb = MemoryBlackboard::new("test");
        bb.zadd("q", 2.0, "bbb").await.unwrap();
        bb.zadd("q", 1.0, "zzz").await.unwrap();
        bb.zadd("q", 2.0, "aaa").await.unwrap();
        let entries = bb.zrange_withscores("q").await.unwrap();
        let members: Vec<&str> = entries.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["zzz", "aaa", "bbb"]);

        bb.zrem("q", "zzz").await.unwrap();
        let entries = bb.zrange_withscores("q").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_in_order() {
        let bb = MemoryBlackboard::new("test");
        let mut sub = bb.subscribe("chan").await.unwrap();
        bb.publish_raw("chan", "one").await.unwrap();
        bb.publish_raw("chan", "two").await.unwrap();
        assert_eq!(sub.recv().await.as_deref(), Some("one"));
        assert_eq!(sub.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_create_artefact_publishes_event() {
        let bb = MemoryBlackboard::new("test");
        let mut sub = bb.subscribe(&bb.keys().artefact_events()).await.unwrap();
        let a = artefact();
        bb.create_artefact(&a).await.unwrap();
        let payload = sub.recv().await.unwrap();
        let event: Artefact = serde_json::from_str(&payload).unwrap();
        assert_eq!(event.id, a.id);
    }

    #[tokio::test]
    async fn test_claims_by_status_filters() {
        let bb = MemoryBlackboard::new("test");
        let a1 = artefact();
        let a2 = artefact();
        bb.create_artefact(&a1).await.unwrap();
        bb.create_artefact(&a2).await.unwrap();

        let open = Claim::for_artefact(a1.id);
        let mut done = Claim::for_artefact(a2.id);
        bb.create_claim(&open).await.unwrap();
        done.status = ClaimStatus::Complete;
        bb.create_claim(&done).await.unwrap();

        let pending = bb
            .claims_by_status(&[ClaimStatus::PendingReview])
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, open.id);
    }
}
