//! Optional persistence mirror.
//!
//! The engine itself is purely in-memory; a deployment may attach a
//! durable store that mirrors index mutations and offers its own search.
//! Only the contract lives here. Mirrored paths are exchanged in canonical
//! primary-key form, so `get(add(x)) = x` modulo that normalization.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::record::FileEntry;

/// Statistics reported by a persistence implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistenceStatistics {
    pub entry_count: u64,
    pub bytes_on_disk: u64,
    pub last_optimized_at: Option<u64>,
}

/// Contract for a durable mirror of the in-memory index.
///
/// All operations are asynchronous; implementations are free to batch or
/// journal internally as long as the round-trip invariant holds.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn add(&self, entry: FileEntry) -> Result<()>;

    async fn add_batch(&self, entries: Vec<FileEntry>) -> Result<()>;

    /// Drains a stream of entries into the store; returns how many were
    /// written.
    async fn add_from_stream(&self, entries: mpsc::Receiver<FileEntry>) -> Result<usize>;

    async fn remove(&self, full_path: &str) -> Result<bool>;

    async fn update(&self, entry: FileEntry) -> Result<bool>;

    async fn get(&self, full_path: &str) -> Result<Option<FileEntry>>;

    async fn exists(&self, full_path: &str) -> Result<bool>;

    /// Full-text search over the mirrored entries.
    async fn search(&self, text: &str, max_results: usize) -> Result<Vec<FileEntry>>;

    async fn clear(&self) -> Result<()>;

    async fn optimize(&self) -> Result<()>;

    async fn statistics(&self) -> Result<PersistenceStatistics>;

    async fn begin_transaction(&self) -> Result<()>;
}

/// A mutation forwarded from the engine to the mirror task.
#[derive(Debug)]
pub enum MirrorOp {
    Add(Vec<FileEntry>),
    Remove(String),
    Clear,
}

/// Spawns the mirror pump on the given runtime. The engine feeds it
/// through the returned sender; store failures are logged and never stall
/// indexing.
pub(crate) fn spawn_mirror(
    handle: &tokio::runtime::Handle,
    gateway: std::sync::Arc<dyn PersistenceGateway>,
) -> mpsc::Sender<MirrorOp> {
    let (tx, mut rx) = mpsc::channel::<MirrorOp>(256);
    handle.spawn(async move {
        if let Err(error) = gateway.initialize().await {
            log::warn!("persistence initialize failed: {error}");
        }
        while let Some(op) = rx.recv().await {
            let result = match op {
                MirrorOp::Add(entries) => gateway.add_batch(entries).await,
                MirrorOp::Remove(path) => gateway.remove(&path).await.map(|_| ()),
                MirrorOp::Clear => gateway.clear().await,
            };
            if let Err(error) = result {
                log::warn!("persistence mirror write failed: {error}");
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::normalize_key;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// In-memory reference implementation of the contract.
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<HashMap<String, FileEntry>>,
    }

    #[async_trait]
    impl PersistenceGateway for MemoryStore {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn add(&self, entry: FileEntry) -> Result<()> {
            let key = normalize_key(&entry.full_path);
            self.rows.lock().await.insert(key, entry);
            Ok(())
        }

        async fn add_batch(&self, entries: Vec<FileEntry>) -> Result<()> {
            let mut rows = self.rows.lock().await;
            for entry in entries {
                rows.insert(normalize_key(&entry.full_path), entry);
            }
            Ok(())
        }

        async fn add_from_stream(&self, mut entries: mpsc::Receiver<FileEntry>) -> Result<usize> {
            let mut written = 0usize;
            while let Some(entry) = entries.recv().await {
                self.add(entry).await?;
                written += 1;
            }
            Ok(written)
        }

        async fn remove(&self, full_path: &str) -> Result<bool> {
            Ok(self
                .rows
                .lock()
                .await
                .remove(&normalize_key(full_path))
                .is_some())
        }

        async fn update(&self, entry: FileEntry) -> Result<bool> {
            let key = normalize_key(&entry.full_path);
            Ok(self.rows.lock().await.insert(key, entry).is_some())
        }

        async fn get(&self, full_path: &str) -> Result<Option<FileEntry>> {
            Ok(self
                .rows
                .lock()
                .await
                .get(&normalize_key(full_path))
                .cloned())
        }

        async fn exists(&self, full_path: &str) -> Result<bool> {
            Ok(self
                .rows
                .lock()
                .await
                .contains_key(&normalize_key(full_path)))
        }

        async fn search(&self, text: &str, max_results: usize) -> Result<Vec<FileEntry>> {
            let needle = text.to_lowercase();
            Ok(self
                .rows
                .lock()
                .await
                .values()
                .filter(|entry| entry.full_path.to_lowercase().contains(&needle))
                .take(max_results)
                .cloned()
                .collect())
        }

        async fn clear(&self) -> Result<()> {
            self.rows.lock().await.clear();
            Ok(())
        }

        async fn optimize(&self) -> Result<()> {
            Ok(())
        }

        async fn statistics(&self) -> Result<PersistenceStatistics> {
            Ok(PersistenceStatistics {
                entry_count: self.rows.lock().await.len() as u64,
                bytes_on_disk: 0,
                last_optimized_at: None,
            })
        }

        async fn begin_transaction(&self) -> Result<()> {
            Ok(())
        }
    }

    fn entry(path: &str) -> FileEntry {
        FileEntry {
            full_path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            directory_path: String::new(),
            extension: String::new(),
            size: 1,
            created_time: std::time::UNIX_EPOCH,
            modified_time: std::time::UNIX_EPOCH,
            accessed_time: std::time::UNIX_EPOCH,
            attributes: crate::record::FileAttributes::empty(),
            volume_tag: '/',
            file_ref: 0,
        }
    }

    #[tokio::test]
    async fn round_trip_modulo_normalization() {
        let store = MemoryStore::default();
        store.add(entry("C:/Docs/Note.txt")).await.unwrap();

        // Lookups in any casing/separator form resolve to the same row.
        let fetched = store.get("c:\\docs\\note.txt").await.unwrap().unwrap();
        assert_eq!(fetched.full_path, "C:/Docs/Note.txt");
        assert!(store.exists("C:/DOCS/NOTE.TXT").await.unwrap());
    }

    #[tokio::test]
    async fn stream_ingestion() {
        let store = MemoryStore::default();
        let (tx, rx) = mpsc::channel(8);
        let feeder = tokio::spawn(async move {
            for i in 0..5 {
                tx.send(entry(&format!("/a/f{i}.txt"))).await.unwrap();
            }
        });
        let written = store.add_from_stream(rx).await.unwrap();
        feeder.await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(store.statistics().await.unwrap().entry_count, 5);
    }

    #[tokio::test]
    async fn mirror_pump_applies_operations() {
        let store = Arc::new(MemoryStore::default());
        let tx = spawn_mirror(&tokio::runtime::Handle::current(), store.clone());

        tx.send(MirrorOp::Add(vec![entry("/a/x.txt"), entry("/a/y.txt")]))
            .await
            .unwrap();
        tx.send(MirrorOp::Remove("/a/x.txt".to_string()))
            .await
            .unwrap();
        drop(tx);

        // Wait for the pump to drain.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if store.statistics().await.unwrap().entry_count == 1 {
                break;
            }
        }
        assert!(!store.exists("/a/x.txt").await.unwrap());
        assert!(store.exists("/a/y.txt").await.unwrap());
    }
}
