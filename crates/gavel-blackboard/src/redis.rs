//! Redis implementation of the [`Blackboard`] trait.
//!
//! Commands go through a [`ConnectionManager`] (auto-reconnecting
//! multiplexed connection); each subscription gets a dedicated pub/sub
//! connection whose forwarding task ends when the subscriber drops.
//!
//! Uniqueness constraints map onto Redis primitives: `SET NX` for
//! artefact/claim bodies and the claim-per-artefact index, `HSETNX` for
//! write-once bids, sorted sets for version threads and grant queues.

use crate::client::{Blackboard, Subscription};
use crate::keys::KeySpace;
use async_trait::async_trait;
use futures_util::StreamExt;
use gavel_core::{Artefact, BidType, Claim, ClaimStatus, GavelError, GavelResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

fn store_err(e: redis::RedisError) -> GavelError {
    GavelError::Store(e.to_string())
}

/// Production blackboard over Redis.
pub struct RedisBlackboard {
    client: Client,
    manager: ConnectionManager,
    keys: KeySpace,
}

impl RedisBlackboard {
    /// Connect to Redis and wrap it for the given instance.
    pub async fn connect(url: &str, instance: impl Into<String>) -> GavelResult<Self> {
        let client = Client::open(url).map_err(store_err)?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(store_err)?;
        Ok(Self {
            client,
            manager,
            keys: KeySpace::new(instance),
        })
    }

    /// The instance's key space.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// `SET key payload NX`; returns whether the key was written.
    async fn set_nx(&self, key: &str, payload: &str) -> GavelResult<bool> {
        let mut conn = self.conn();
        let written: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(written.is_some())
    }

    async fn get_string(&self, key: &str) -> GavelResult<Option<String>> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(store_err)
    }
}

#[async_trait]
impl Blackboard for RedisBlackboard {
    async fn create_artefact(&self, artefact: &Artefact) -> GavelResult<()> {
        let payload = serde_json::to_string(artefact)?;
        if !self.set_nx(&self.keys.artefact(artefact.id), &payload).await? {
            return Err(GavelError::Store(format!(
                "artefact {} already exists",
                artefact.id
            )));
        }
        self.publish_raw(&self.keys.artefact_events(), &payload).await
    }

    async fn get_artefact(&self, id: Uuid) -> GavelResult<Artefact> {
        match self.get_string(&self.keys.artefact(id)).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(GavelError::not_found("artefact", id.to_string())),
        }
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
        let mut conn = self.conn();
        let top: Vec<(String, f64)> = conn
            .zrevrange_withscores(self.keys.thread(logical_id), 0, 0)
            .await
            .map_err(store_err)?;
        let Some((member, score)) = top.into_iter().next() else {
            return Ok(None);
        };
        let id = member
            .parse::<Uuid>()
            .map_err(|e| GavelError::Store(format!("corrupt thread member '{member}': {e}")))?;
        Ok(Some((id, score as u64)))
    }

    async fn create_claim(&self, claim: &Claim) -> GavelResult<()> {
        let payload = serde_json::to_string(claim)?;
        // The secondary index is the uniqueness gate: first writer wins.
        let index_key = self.keys.claim_by_artefact(claim.artefact_id);
        if !self.set_nx(&index_key, &claim.id.to_string()).await? {
            let existing = self.get_string(&index_key).await?.unwrap_or_default();
            return Err(GavelError::Store(format!(
                "claim {existing} already exists for artefact {}",
                claim.artefact_id
            )));
        }
        let mut conn = self.conn();
        let _: () = conn
            .set(self.keys.claim(claim.id), &payload)
            .await
            .map_err(store_err)?;
        let _: i64 = conn
            .sadd(self.keys.claims_index(), claim.id.to_string())
            .await
            .map_err(store_err)?;
        self.publish_raw(&self.keys.claim_events(), &payload).await
    }

    async fn create_assignment_claim(&self, claim: &Claim) -> GavelResult<()> {
        let payload = serde_json::to_string(claim)?;
        let mut conn = self.conn();
        let _: () = conn
            .set(
                self.keys.claim_by_artefact(claim.artefact_id),
                claim.id.to_string(),
            )
            .await
            .map_err(store_err)?;
        let _: () = conn
            .set(self.keys.claim(claim.id), &payload)
            .await
            .map_err(store_err)?;
        let _: i64 = conn
            .sadd(self.keys.claims_index(), claim.id.to_string())
            .await
            .map_err(store_err)?;
        self.publish_raw(&self.keys.claim_events(), &payload).await
    }

    async fn get_claim(&self, id: Uuid) -> GavelResult<Claim> {
        match self.get_string(&self.keys.claim(id)).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(GavelError::not_found("claim", id.to_string())),
        }
    }

    async fn get_claim_by_artefact(&self, artefact_id: Uuid) -> GavelResult<Option<Claim>> {
        let Some(claim_id) = self
            .get_string(&self.keys.claim_by_artefact(artefact_id))
            .await?
        else {
            return Ok(None);
        };
        let claim_id = claim_id
            .parse::<Uuid>()
            .map_err(|e| GavelError::Store(format!("corrupt claim index '{claim_id}': {e}")))?;
        match self.get_claim(claim_id).await {
            Ok(claim) => Ok(Some(claim)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_claim(&self, claim: &Claim) -> GavelResult<()> {
        let payload = serde_json::to_string(claim)?;
        let mut conn = self.conn();
        let _: () = conn
            .set(self.keys.claim(claim.id), payload)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn claims_by_status(&self, statuses: &[ClaimStatus]) -> GavelResult<Vec<Claim>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers(self.keys.claims_index())
            .await
            .map_err(store_err)?;
        let mut claims = Vec::new();
        for raw in ids {
            let Ok(id) = raw.parse::<Uuid>() else {
                warn!(member = %raw, "skipping corrupt claims-index member");
                continue;
            };
            match self.get_claim(id).await {
                Ok(claim) if statuses.contains(&claim.status) => claims.push(claim),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(claim_id = %id, "claims-index member has no body; skipping");
                }
                Err(e) => return Err(e),
            }
        }
        claims.sort_by_key(|c| c.created_at);
        Ok(claims)
    }

    async fn set_bid(&self, claim_id: Uuid, agent: &str, bid: BidType) -> GavelResult<bool> {
        let mut conn = self.conn();
        conn.hset_nx(self.keys.bids(claim_id), agent, bid.as_str())
            .await
            .map_err(store_err)
    }

    async fn all_bids(&self, claim_id: Uuid) -> GavelResult<BTreeMap<String, String>> {
        let mut conn = self.conn();
        conn.hgetall(self.keys.bids(claim_id))
            .await
            .map_err(store_err)
    }

    async fn publish_raw(&self, channel: &str, payload: &str) -> GavelResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.publish(channel, payload).await.map_err(store_err)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> GavelResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(store_err)?;
        pubsub.subscribe(channel).await.map_err(store_err)?;

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if msg_tx.send(payload).is_err() {
                            // Subscriber dropped; tear down the connection.
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = err_tx.send(GavelError::Store(format!(
                            "bad payload on {channel}: {e}"
                        )));
                    }
                }
            }
            debug!(channel = %channel, "pub/sub forwarder stopped");
        });

        Ok(Subscription::new(msg_rx, err_rx))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> GavelResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.zadd(key, member, score).await.map_err(store_err)?;
        Ok(())
    }

    async fn zrange_withscores(&self, key: &str) -> GavelResult<Vec<(String, f64)>> {
        let mut conn = self.conn();
        conn.zrange_withscores(key, 0, -1).await.map_err(store_err)
    }

    async fn zrem(&self, key: &str, member: &str) -> GavelResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.zrem(key, member).await.map_err(store_err)?;
        Ok(())
    }

    async fn ping(&self) -> GavelResult<()> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(GavelError::Store(format!("unexpected PING reply: {pong}")))
        }
    }
}
