/**
 * FILE CHUNK STORE - Chunks de snapshot sur disque local
 *
 * FONCTIONNEMENT :
 * - Un fichier JSON par chunk : `<root>/<namespace>/<name>.json`
 * - Écriture dans un `.tmp` puis rename, un chunk n'est jamais lu à moitié écrit
 * - create refuse d'écraser un chunk existant (même sémantique qu'un store d'objets)
 */

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::{ChunkStore, SnapshotChunk, StoreError};

pub struct FileChunkStore {
    root: PathBuf,
}

impl FileChunkStore {
    /// Ouvre (et crée si besoin) le dossier racine. Échec = store injoignable.
    pub async fn open<P: Into<PathBuf>>(root: P) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", root.display(), e)))?;
        debug!("chunk store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn chunk_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.namespace_dir(namespace).join(format!("{}.json", name))
    }
}

#[async_trait]
impl ChunkStore for FileChunkStore {
    async fn list(&self, namespace: &str) -> Result<Vec<SnapshotChunk>, StoreError> {
        let dir = self.namespace_dir(namespace);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read(&path).await?;
            match serde_json::from_slice::<SnapshotChunk>(&raw) {
                Ok(chunk) => chunks.push(chunk),
                // un fichier illisible compte comme un chunk manquant
                Err(e) => warn!("skip unreadable chunk {}: {}", path.display(), e),
            }
        }
        Ok(chunks)
    }

    async fn create(&self, chunk: &SnapshotChunk) -> Result<(), StoreError> {
        let dir = self.namespace_dir(&chunk.namespace);
        fs::create_dir_all(&dir).await?;

        let path = self.chunk_path(&chunk.namespace, &chunk.name);
        if fs::try_exists(&path).await? {
            return Err(StoreError::AlreadyExists(chunk.name.clone()));
        }

        let tmp = dir.join(format!("{}.json.tmp", chunk.name));
        let body = serde_json::to_vec(chunk)?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.chunk_path(namespace, name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::open(dir.path()).await.unwrap();

        assert!(store.list("fleet").await.unwrap().is_empty());

        let a = SnapshotChunk::new("fleet", 1, 0, 2, b"abc".to_vec());
        let b = SnapshotChunk::new("fleet", 1, 1, 2, vec![0, 255, 7]);
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        let mut listed = store.list("fleet").await.unwrap();
        listed.sort_by_key(|c| c.index);
        assert_eq!(listed, vec![a.clone(), b]);

        assert!(matches!(store.create(&a).await, Err(StoreError::AlreadyExists(_))));

        store.delete("fleet", "1-0").await.unwrap();
        assert_eq!(store.list("fleet").await.unwrap().len(), 1);
        assert!(matches!(store.delete("fleet", "1-0").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::open(dir.path()).await.unwrap();
        store.create(&SnapshotChunk::new("one", 0, 0, 1, vec![1])).await.unwrap();
        assert!(store.list("two").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stray_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChunkStore::open(dir.path()).await.unwrap();
        std::fs::create_dir_all(dir.path().join("fleet")).unwrap();
        std::fs::write(dir.path().join("fleet/notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join("fleet/9-0.json"), "{broken").unwrap();
        assert!(store.list("fleet").await.unwrap().is_empty());
    }
}
