use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structural type of an artefact.
///
/// The structural type drives coordination: Terminal and Failure artefacts
/// never spawn claims, and context assembly only feeds Standard, Answer,
/// and Review artefacts to tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StructuralType {
    Standard,
    Review,
    Question,
    Answer,
    Failure,
    Terminal,
}

impl StructuralType {
    /// Whether artefacts of this type spawn claims.
    pub fn spawns_claim(self) -> bool {
        !matches!(self, Self::Terminal | Self::Failure)
    }
}

impl std::fmt::Display for StructuralType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Standard => "Standard",
            Self::Review => "Review",
            Self::Question => "Question",
            Self::Answer => "Answer",
            Self::Failure => "Failure",
            Self::Terminal => "Terminal",
        };
        write!(f, "{s}")
    }
}

/// An immutable unit of produced content with provenance.
///
/// Artefacts never change after publication. A new version of a logical
/// thread is a new artefact with the same `logical_id` and
/// `version = previous_max + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artefact {
    pub id: Uuid,
    /// Thread identifier; artefacts sharing it form a version chain.
    pub logical_id: Uuid,
    /// Monotonically increasing within a logical thread; 1 for new threads.
    pub version: u64,
    pub structural_type: StructuralType,
    /// User-defined domain tag, opaque to the coordination core.
    #[serde(rename = "type")]
    pub artefact_type: String,
    pub payload: String,
    /// Provenance edges, ordered. Acyclic by construction.
    #[serde(default)]
    pub source_artefacts: Vec<Uuid>,
    pub produced_by_role: String,
    pub created_at: DateTime<Utc>,
}

impl Artefact {
    /// Create a version-1 artefact opening a fresh logical thread.
    ///
    /// The new thread's `logical_id` equals the artefact's own id.
    pub fn new_thread(
        structural_type: StructuralType,
        artefact_type: impl Into<String>,
        payload: impl Into<String>,
        source_artefacts: Vec<Uuid>,
        produced_by_role: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            logical_id: id,
            version: 1,
            structural_type,
            artefact_type: artefact_type.into(),
            payload: payload.into(),
            source_artefacts,
            produced_by_role: produced_by_role.into(),
            created_at: Utc::now(),
        }
    }

    /// Create the next version of an existing thread.
    ///
    /// Keeps the predecessor's `logical_id` and domain type, bumps the
    /// version, and records the given provenance.
    pub fn next_version(
        predecessor: &Artefact,
        payload: impl Into<String>,
        source_artefacts: Vec<Uuid>,
        produced_by_role: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            logical_id: predecessor.logical_id,
            version: predecessor.version + 1,
            structural_type: predecessor.structural_type,
            artefact_type: predecessor.artefact_type.clone(),
            payload: payload.into(),
            source_artefacts,
            produced_by_role: produced_by_role.into(),
            created_at: Utc::now(),
        }
    }

    /// Create a Failure artefact of the given failure kind.
    ///
    /// Failure artefacts open their own thread and never spawn claims.
    pub fn failure(
        failure_type: impl Into<String>,
        payload: impl Into<String>,
        source_artefacts: Vec<Uuid>,
        produced_by_role: impl Into<String>,
    ) -> Self {
        Self::new_thread(
            StructuralType::Failure,
            failure_type,
            payload,
            source_artefacts,
            produced_by_role,
        )
    }
}

/// Whether a Review artefact payload counts as an approval.
///
/// A payload is an approval iff it parses as JSON and equals `{}` or `[]`
/// (whitespace-tolerant). Any other JSON value, invalid JSON, or plain
/// text is feedback. This is the sole arbiter of review outcome.
pub fn is_approval_payload(payload: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(map)) => map.is_empty(),
        Ok(serde_json::Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}
