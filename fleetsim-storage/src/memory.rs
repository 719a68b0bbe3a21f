use async_trait::async_trait;
use fleetsim_error::{storage::StorageError, StorageResult};
use fleetsim_models::ObjectStore;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ordered in-memory object store with an optional JSON snapshot file.
///
/// Writes only touch memory and mark the store dirty; [`MemoryStore::flush`]
/// persists the snapshot, either on demand or from the background flusher.
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    snapshot: Option<PathBuf>,
    dirty: AtomicBool,
}

impl MemoryStore {
    /// A store that lives only as long as the process.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            snapshot: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Opens a snapshot-backed store; a missing file starts empty.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = BTreeMap::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                let records: BTreeMap<String, Value> = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Snapshot(format!("{}: {e}", path.display())))?;
                for (key, value) in records {
                    let raw = serde_json::to_vec(&value).map_err(|e| StorageError::Codec {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
                    entries.insert(key, raw);
                }
                info!(path = %path.display(), records = entries.len(), "Loaded store snapshot");
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No store snapshot yet, starting empty");
            }
            Err(e) => return Err(StorageError::Snapshot(format!("{}: {e}", path.display()))),
        }
        Ok(Self {
            entries: RwLock::new(entries),
            snapshot: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Writes the snapshot if anything changed since the last flush.
    pub async fn flush(&self) -> StorageResult<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let records = {
            let entries = self.entries.read().await;
            let mut records = BTreeMap::new();
            for (key, raw) in entries.iter() {
                let value: Value =
                    serde_json::from_slice(raw).map_err(|e| StorageError::Codec {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
                records.insert(key.clone(), value);
            }
            records
        };
        let bytes = serde_json::to_vec_pretty(&records)
            .map_err(|e| StorageError::Snapshot(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Snapshot(e.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        let written = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = written {
            self.dirty.store(true, Ordering::Release);
            return Err(StorageError::Snapshot(format!("{}: {e}", path.display())));
        }
        debug!(path = %path.display(), records = records.len(), "Flushed store snapshot");
        Ok(())
    }

    /// Periodically flushes until `cancel` fires, then flushes once more.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.flush().await {
                            warn!(error = %e, "Store snapshot flush failed");
                        }
                    }
                }
            }
            if let Err(e) = store.flush().await {
                warn!(error = %e, "Final store snapshot flush failed");
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.entries.write().await.remove(key).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }
}
