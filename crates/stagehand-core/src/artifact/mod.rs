//! Artifact storage.
//!
//! Artifacts are write-once byte payloads keyed by the name of the job that
//! produced them. A store lives for a single run.

mod local;
mod memory;

pub use local::LocalArtifactStore;
pub use memory::MemoryArtifactStore;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ArtifactError;

/// Handle to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Job that produced the artifact.
    pub producer: String,
    /// Size in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of the payload.
    pub checksum: String,
    /// When the artifact was stored.
    pub created_at: DateTime<Utc>,
}

impl ArtifactRef {
    pub fn for_payload(producer: &str, payload: &[u8]) -> Self {
        Self {
            producer: producer.to_string(),
            size: payload.len() as u64,
            checksum: hex::encode(Sha256::digest(payload)),
            created_at: Utc::now(),
        }
    }
}

/// Trait for artifact storage backends.
///
/// Implementations guard their contents with a single lock; `put` and `get`
/// are called concurrently by the jobs of a stage.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the artifact of `producer`. Fails if one is already stored.
    async fn put(&self, producer: &str, payload: Bytes) -> Result<ArtifactRef, ArtifactError>;

    /// Retrieve the artifact of `producer`.
    async fn get(&self, producer: &str) -> Result<Bytes, ArtifactError>;

    /// Whether `producer` has stored an artifact.
    async fn contains(&self, producer: &str) -> bool;

    /// References to every stored artifact, ordered by producer.
    async fn list(&self) -> Vec<ArtifactRef>;

    /// Drop every artifact. Called when a run ends.
    async fn clear(&self) -> Result<(), ArtifactError>;
}
