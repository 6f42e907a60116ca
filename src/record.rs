//! Core data model: `Record`, `Query`, `RetrievalResult`, and the outcome
//! types returned by the public operations.

use serde::{Deserialize, Serialize};

/// Reserved sentinel agent id marking a promoted, shared record.
///
/// Treated as a reserved value of the ordinary `AgentId` type, not as a
/// distinct enum variant or a real tier-0 agent.
pub const COLLECTIVE_AGENT: &str = "COLLECTIVE";

/// Opaque stable record identifier, unique process-wide.
pub type RecordId = String;

/// Tag of the producing agent, from a closed external enumeration of 40
/// names plus the [`COLLECTIVE_AGENT`] sentinel. The core does not enforce
/// the enumeration; that is a collaborator-side concern.
pub type AgentId = String;

/// An experience tuple — the unit of storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub agent_id: AgentId,
    pub tier: u8,
    pub fingerprint: String,
    pub input: String,
    pub output: String,
    pub strategy: String,
    /// Dense embedding of length `D`, or empty if unavailable.
    pub embedding: Vec<f32>,
    pub fitness: f64,
    pub created_at: u64,
    pub last_access_at: u64,
    pub usage_count: u64,
    pub generation: u64,
}

impl Record {
    /// Whether this record participates in the hash/graph indices.
    /// `embedding` is always either empty or exactly length `D`.
    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }

    /// Whether this record is a promoted collective (mirror) record.
    pub fn is_collective(&self) -> bool {
        self.agent_id == COLLECTIVE_AGENT
    }
}

/// A retrieval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub agent_id: AgentId,
    pub tier: u8,
    pub fingerprint: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub k: usize,
    pub min_fitness: f64,
    pub max_age_ns: Option<u64>,
    pub include_tier: bool,
    pub include_collective: bool,
}

impl Query {
    /// Construct the smallest valid query: scope only, `k = 1`.
    pub fn new(agent_id: impl Into<AgentId>, tier: u8) -> Self {
        Self {
            agent_id: agent_id.into(),
            tier,
            fingerprint: None,
            embedding: None,
            k: 1,
            min_fitness: 0.0,
            max_age_ns: None,
            include_tier: false,
            include_collective: false,
        }
    }
}

/// Which stage of the retrieval cascade produced a [`RetrievalResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalPath {
    Exact,
    Hash,
    Graph,
    Empty,
}

/// Retrieval output. Named `RetrievalResult` to avoid colliding with
/// [`crate::error::Result`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub records: Vec<Record>,
    pub path: RetrievalPath,
    pub candidates_examined: usize,
    pub latency_ns: u64,
    /// Set when the operation was cancelled via the caller's deadline;
    /// distinguishes "no match" from "cancelled" without using an error
    /// kind.
    pub cancelled: bool,
}

impl RetrievalResult {
    pub fn empty(path: RetrievalPath, latency_ns: u64) -> Self {
        Self {
            records: Vec::new(),
            path,
            candidates_examined: 0,
            latency_ns,
            cancelled: false,
        }
    }

    pub fn cancelled(latency_ns: u64) -> Self {
        Self {
            records: Vec::new(),
            path: RetrievalPath::Empty,
            candidates_examined: 0,
            latency_ns,
            cancelled: true,
        }
    }
}

/// An outcome report driving [`crate::reflect::ReflectLoop::reflect`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub reward: f64,
}

/// Result of [`crate::Mnemonic::store`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOutcome {
    Ok,
    /// Informational, not an error: a fingerprint collision replaced an
    /// existing record. Carries the superseded record's id.
    Superseded(RecordId),
}

/// Result of [`crate::Mnemonic::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveOutcome {
    Ok,
    NotFound,
}

/// Result of [`crate::Mnemonic::reflect`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReflectOutcome {
    Ok { new_fitness: f64 },
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_embedding_means_no_vector() {
        let r = Record {
            id: "a".into(),
            agent_id: "APEX".into(),
            tier: 1,
            fingerprint: "fp".into(),
            input: String::new(),
            output: String::new(),
            strategy: String::new(),
            embedding: Vec::new(),
            fitness: 0.5,
            created_at: 0,
            last_access_at: 0,
            usage_count: 0,
            generation: 0,
        };
        assert!(!r.has_embedding());
    }

    #[test]
    fn collective_sentinel_detected() {
        let mut r = Record {
            id: "a".into(),
            agent_id: "APEX".into(),
            tier: 1,
            fingerprint: "fp".into(),
            input: String::new(),
            output: String::new(),
            strategy: String::new(),
            embedding: Vec::new(),
            fitness: 0.5,
            created_at: 0,
            last_access_at: 0,
            usage_count: 0,
            generation: 0,
        };
        assert!(!r.is_collective());
        r.agent_id = COLLECTIVE_AGENT.to_string();
        assert!(r.is_collective());
    }
}
