//! Artifact store backed by a scoped directory on the host.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ArtifactRef, ArtifactStore};
use crate::error::ArtifactError;

/// Writes each artifact to `<root>/<n>-<job>.artifact`.
///
/// The index and the files are guarded by one async mutex, held across the
/// file I/O so a put and a get for the same producer never interleave.
#[derive(Debug)]
pub struct LocalArtifactStore {
    root: PathBuf,
    index: Mutex<HashMap<String, (ArtifactRef, PathBuf)>>,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(seq: usize, producer: &str) -> String {
        let safe: String = producer
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{:04}-{}.artifact", seq, safe)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, producer: &str, payload: Bytes) -> Result<ArtifactRef, ArtifactError> {
        let mut index = self.index.lock().await;
        if index.contains_key(producer) {
            return Err(ArtifactError::Duplicate(producer.to_string()));
        }

        let io_err = |source| ArtifactError::Io {
            job: producer.to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.root).await.map_err(io_err)?;
        let path = self.root.join(Self::file_name(index.len(), producer));
        tokio::fs::write(&path, &payload).await.map_err(io_err)?;

        let reference = ArtifactRef::for_payload(producer, &payload);
        debug!(job = %producer, path = %path.display(), size = reference.size, "Stored artifact");
        index.insert(producer.to_string(), (reference.clone(), path));
        Ok(reference)
    }

    async fn get(&self, producer: &str) -> Result<Bytes, ArtifactError> {
        let index = self.index.lock().await;
        let (_, path) = index
            .get(producer)
            .ok_or_else(|| ArtifactError::NotFound(producer.to_string()))?;

        let data = tokio::fs::read(path).await.map_err(|source| ArtifactError::Io {
            job: producer.to_string(),
            source,
        })?;
        Ok(Bytes::from(data))
    }

    async fn contains(&self, producer: &str) -> bool {
        self.index.lock().await.contains_key(producer)
    }

    async fn list(&self) -> Vec<ArtifactRef> {
        let mut refs: Vec<ArtifactRef> = self
            .index
            .lock()
            .await
            .values()
            .map(|(reference, _)| reference.clone())
            .collect();
        refs.sort_by(|a, b| a.producer.cmp(&b.producer));
        refs
    }

    async fn clear(&self) -> Result<(), ArtifactError> {
        let mut index = self.index.lock().await;
        index.clear();
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                warn!(path = %self.root.display(), error = %source, "Failed to remove artifact directory");
                Err(ArtifactError::Io {
                    job: String::new(),
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names_are_sanitised() {
        assert_eq!(
            LocalArtifactStore::file_name(3, "build/linux amd64"),
            "0003-build_linux_amd64.artifact"
        );
    }

    #[tokio::test]
    async fn test_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path().join("artifacts"));

        store
            .put("compile", Bytes::from_static(b"\x7fELF"))
            .await
            .unwrap();

        assert_eq!(
            store.get("compile").await.unwrap(),
            Bytes::from_static(b"\x7fELF")
        );
        assert!(store.root().join("0000-compile.artifact").exists());
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());

        assert!(matches!(
            store.get("compile").await,
            Err(ArtifactError::NotFound(_))
        ));

        store.put("compile", Bytes::from_static(b"a")).await.unwrap();
        assert!(matches!(
            store.put("compile", Bytes::from_static(b"b")).await,
            Err(ArtifactError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("artifacts");
        let store = LocalArtifactStore::new(&root);

        store.put("compile", Bytes::from_static(b"a")).await.unwrap();
        assert!(root.exists());

        store.clear().await.unwrap();
        assert!(!root.exists());
        assert!(!store.contains("compile").await);

        // Clearing twice is fine.
        store.clear().await.unwrap();
    }
}
