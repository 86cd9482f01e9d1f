use serde::{Deserialize, Serialize};

/// An agent's sealed vote on a claim.
///
/// Bids are write-once per (claim, agent). `Claim` is the parallel-phase
/// vote; the naming follows the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BidType {
    Review,
    Claim,
    Exclusive,
    Ignore,
}

impl BidType {
    /// Wire representation of this bid.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Claim => "claim",
            Self::Exclusive => "exclusive",
            Self::Ignore => "ignore",
        }
    }

    /// Strict parse of a wire value. Returns `None` for unknown values;
    /// the caller decides whether to coerce (the orchestrator coerces to
    /// `Ignore` with a warning so consensus never blocks on a malformed
    /// bid).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "review" => Some(Self::Review),
            "claim" => Some(Self::Claim),
            "exclusive" => Some(Self::Exclusive),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

impl std::fmt::Display for BidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
