//! In-memory artifact store.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use super::{ArtifactRef, ArtifactStore};
use crate::error::ArtifactError;

/// Keeps artifacts in a map behind one mutex.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<HashMap<String, (ArtifactRef, Bytes)>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.lock().is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, producer: &str, payload: Bytes) -> Result<ArtifactRef, ArtifactError> {
        let mut artifacts = self.artifacts.lock();
        if artifacts.contains_key(producer) {
            return Err(ArtifactError::Duplicate(producer.to_string()));
        }
        let reference = ArtifactRef::for_payload(producer, &payload);
        debug!(job = %producer, size = reference.size, "Stored artifact");
        artifacts.insert(producer.to_string(), (reference.clone(), payload));
        Ok(reference)
    }

    async fn get(&self, producer: &str) -> Result<Bytes, ArtifactError> {
        self.artifacts
            .lock()
            .get(producer)
            .map(|(_, payload)| payload.clone())
            .ok_or_else(|| ArtifactError::NotFound(producer.to_string()))
    }

    async fn contains(&self, producer: &str) -> bool {
        self.artifacts.lock().contains_key(producer)
    }

    async fn list(&self) -> Vec<ArtifactRef> {
        let mut refs: Vec<ArtifactRef> = self
            .artifacts
            .lock()
            .values()
            .map(|(reference, _)| reference.clone())
            .collect();
        refs.sort_by(|a, b| a.producer.cmp(&b.producer));
        refs
    }

    async fn clear(&self) -> Result<(), ArtifactError> {
        self.artifacts.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryArtifactStore::new();
        let reference = store
            .put("build", Bytes::from_static(b"binary"))
            .await
            .unwrap();

        assert_eq!(reference.size, 6);
        assert_eq!(store.get("build").await.unwrap(), Bytes::from_static(b"binary"));
        assert!(store.contains("build").await);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryArtifactStore::new();
        let err = store.get("build").await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound(job) if job == "build"));
    }

    #[tokio::test]
    async fn test_write_once() {
        let store = MemoryArtifactStore::new();
        store.put("build", Bytes::from_static(b"v1")).await.unwrap();

        let err = store
            .put("build", Bytes::from_static(b"v2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Duplicate(_)));
        assert_eq!(store.get("build").await.unwrap(), Bytes::from_static(b"v1"));
    }

    #[tokio::test]
    async fn test_concurrent_puts_for_one_producer() {
        let store = Arc::new(MemoryArtifactStore::new());
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.put("race", Bytes::from(vec![i])).await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_list_and_clear() {
        let store = MemoryArtifactStore::new();
        store.put("b", Bytes::from_static(b"2")).await.unwrap();
        store.put("a", Bytes::from_static(b"1")).await.unwrap();

        let producers: Vec<String> = store.list().await.into_iter().map(|r| r.producer).collect();
        assert_eq!(producers, vec!["a", "b"]);

        store.clear().await.unwrap();
        assert!(store.is_empty());
    }
}
