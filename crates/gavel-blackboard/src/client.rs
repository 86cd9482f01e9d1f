use async_trait::async_trait;
use gavel_core::{Artefact, BidType, Claim, ClaimStatus, GavelError, GavelResult};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A cancellable pub/sub event stream.
///
/// Messages and errors arrive on parallel channels; dropping the
/// subscription cancels the underlying listener.
pub struct Subscription {
    /// Raw event payloads in publication order.
    pub messages: mpsc::UnboundedReceiver<String>,
    /// Transient listener errors. Consumers log these and continue.
    pub errors: mpsc::UnboundedReceiver<GavelError>,
}

impl Subscription {
    /// Build a subscription from its two channel halves.
    pub fn new(
        messages: mpsc::UnboundedReceiver<String>,
        errors: mpsc::UnboundedReceiver<GavelError>,
    ) -> Self {
        Self { messages, errors }
    }

    /// Receive the next event payload. `None` means the stream closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.messages.recv().await
    }
}

/// The durable store every Gavel component programs against.
///
/// All mutations are idempotent or guarded by uniqueness constraints
/// (artefact id, claim id, claim-per-artefact index, write-once bids).
/// Missing keys surface [`GavelError::NotFound`]; callers distinguish
/// idempotently.
#[async_trait]
pub trait Blackboard: Send + Sync {
    /// Atomically store a new artefact and publish it on
    /// `artefact_events`. Fails if the id exists.
    async fn create_artefact(&self, artefact: &Artefact) -> GavelResult<()>;

    async fn get_artefact(&self, id: Uuid) -> GavelResult<Artefact>;

    /// Register an artefact version in its logical thread.
    async fn add_version_to_thread(
        &self,
        logical_id: Uuid,
        artefact_id: Uuid,
        version: u64,
    ) -> GavelResult<()>;

    /// Latest (artefact id, version) in a thread, or `None` for an
    /// untracked thread.
    async fn latest_version(&self, logical_id: Uuid) -> GavelResult<Option<(Uuid, u64)>>;

    /// Atomically store a new claim and publish it on `claim_events`.
    /// Fails if a claim already exists for the same artefact id.
    async fn create_claim(&self, claim: &Claim) -> GavelResult<()>;

    /// Store and publish a pre-assigned feedback claim.
    ///
    /// Feedback claims deliberately target an artefact that already has a
    /// claim (the one the review rejected), so this skips the
    /// one-claim-per-artefact guard and repoints the secondary index at
    /// the newest claim.
    async fn create_assignment_claim(&self, claim: &Claim) -> GavelResult<()>;

    async fn get_claim(&self, id: Uuid) -> GavelResult<Claim>;

    async fn get_claim_by_artefact(&self, artefact_id: Uuid) -> GavelResult<Option<Claim>>;

    async fn update_claim(&self, claim: &Claim) -> GavelResult<()>;

    async fn claims_by_status(&self, statuses: &[ClaimStatus]) -> GavelResult<Vec<Claim>>;

    /// Write-once bid per (claim, agent). Returns whether the bid was
    /// written (false = an earlier bid stands; the write is a no-op).
    async fn set_bid(&self, claim_id: Uuid, agent: &str, bid: BidType) -> GavelResult<bool>;

    /// The raw bid map for a claim. Values are wire strings; the
    /// orchestrator coerces unknown values to `ignore`.
    async fn all_bids(&self, claim_id: Uuid) -> GavelResult<BTreeMap<String, String>>;

    /// Publish a raw payload on a channel.
    async fn publish_raw(&self, channel: &str, payload: &str) -> GavelResult<()>;

    /// Subscribe to a channel. The stream is lazy and cancelled by drop.
    async fn subscribe(&self, channel: &str) -> GavelResult<Subscription>;

    /// Add a member to a sorted set (grant queues).
    async fn zadd(&self, key: &str, score: f64, member: &str) -> GavelResult<()>;

    /// All members of a sorted set with scores, ascending by score, ties
    /// by member lexicographic order.
    async fn zrange_withscores(&self, key: &str) -> GavelResult<Vec<(String, f64)>>;

    async fn zrem(&self, key: &str, member: &str) -> GavelResult<()>;

    /// Liveness check.
    async fn ping(&self) -> GavelResult<()>;
}
