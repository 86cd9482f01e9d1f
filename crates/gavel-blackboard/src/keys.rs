use uuid::Uuid;

/// Instance-prefixed key and channel naming.
///
/// Every persistent key and pub/sub channel is namespaced by instance so
/// multiple Gavel instances can share one store.
#[derive(Debug, Clone)]
pub struct KeySpace {
    instance: String,
}

impl KeySpace {
    /// Build the key space for an instance.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// The instance name this key space is scoped to.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Key holding one artefact body.
    pub fn artefact(&self, id: Uuid) -> String {
        format!("{}:artefact:{id}", self.instance)
    }

    /// Sorted set of (artefact id, version) for one logical thread.
    pub fn thread(&self, logical_id: Uuid) -> String {
        format!("{}:thread:{logical_id}", self.instance)
    }

    /// Key holding one claim body.
    pub fn claim(&self, id: Uuid) -> String {
        format!("{}:claim:{id}", self.instance)
    }

    /// Secondary index: artefact id → the id of its claim.
    pub fn claim_by_artefact(&self, artefact_id: Uuid) -> String {
        format!("{}:claim_by_artefact:{artefact_id}", self.instance)
    }

    /// Set of all claim ids, used to enumerate claims by status.
    pub fn claims_index(&self) -> String {
        format!("{}:claims", self.instance)
    }

    /// Hash of agent name → bid value for one claim.
    pub fn bids(&self, claim_id: Uuid) -> String {
        format!("{}:bids:{claim_id}", self.instance)
    }

    /// Channel carrying every newly-created artefact.
    pub fn artefact_events(&self) -> String {
        format!("{}:artefact_events", self.instance)
    }

    /// Channel carrying every newly-created claim.
    pub fn claim_events(&self) -> String {
        format!("{}:claim_events", self.instance)
    }

    /// Channel carrying workflow observability envelopes.
    pub fn workflow_events(&self) -> String {
        format!("{}:workflow_events", self.instance)
    }

    /// An agent's private channel for grant notifications.
    pub fn agent_events(&self, agent: &str) -> String {
        format!("{}:agent:{agent}:events", self.instance)
    }

    /// Sorted set of claim ids paused for a role's worker slot.
    pub fn grant_queue(&self, role: &str) -> String {
        format!("{}:grant_queue:{role}", self.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming_contract() {
        let keys = KeySpace::new("prod");
        let id = Uuid::nil();
        assert_eq!(
            keys.artefact(id),
            "prod:artefact:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(keys.artefact_events(), "prod:artefact_events");
        assert_eq!(keys.claim_events(), "prod:claim_events");
        assert_eq!(keys.workflow_events(), "prod:workflow_events");
        assert_eq!(keys.agent_events("coder"), "prod:agent:coder:events");
        assert_eq!(keys.grant_queue("builder"), "prod:grant_queue:builder");
    }
}
