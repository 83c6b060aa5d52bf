//! Registry of open cache entities, one per path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bosfs_store::{ObjectMetadata, StorageAdapter};
use tracing::{debug, warn};

use crate::cache::{CacheConfig, CacheEntity};
use crate::config::MountOptions;
use crate::error::Result;
use crate::file_manager::FileManager;

/// Process-wide map from remote path to its open entity.
///
/// The registry mutex guards only map lookups and edits; entity I/O runs
/// under each entity's own lock. At most one entity exists per path, and it
/// leaves the map exactly when its last reference is closed.
pub struct DataCache {
    adapter: StorageAdapter,
    opts: Arc<MountOptions>,
    config: Arc<CacheConfig>,
    file_manager: Arc<FileManager>,
    registry: Mutex<HashMap<String, Arc<CacheEntity>>>,
}

impl DataCache {
    pub fn new(
        adapter: StorageAdapter,
        opts: Arc<MountOptions>,
        file_manager: Arc<FileManager>,
    ) -> Self {
        let config = Arc::new(CacheConfig::new(&opts));
        Self {
            adapter,
            opts,
            config,
            file_manager,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Shared cache layout, for mount-time checks.
    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    /// The open entity for `path` without opening anything new.
    pub fn get_cache(&self, path: &str) -> Option<Arc<CacheEntity>> {
        self.registry.lock().unwrap().get(path).cloned()
    }

    /// Open (or re-open) the entity for `path`.
    ///
    /// With `create` false this only attaches to an already-registered
    /// entity (`Ok(None)` otherwise). Each successful call adds one
    /// reference that a later `close_cache` must drop. `force_tmpfile`
    /// bypasses the persistent cache for this entity.
    pub async fn open_cache(
        &self,
        path: &str,
        meta: Option<&ObjectMetadata>,
        size: Option<u64>,
        mtime: Option<i64>,
        force_tmpfile: bool,
        create: bool,
    ) -> Result<Option<Arc<CacheEntity>>> {
        let (entity, created) = {
            let mut registry = self.registry.lock().unwrap();
            match registry.get(path) {
                Some(entity) => (entity.clone(), false),
                None if create => {
                    let cache_path = if force_tmpfile {
                        None
                    } else {
                        self.config.cache_file_path(path, true)?
                    };
                    let entity = Arc::new(CacheEntity::new(
                        path,
                        cache_path,
                        self.adapter.clone(),
                        self.opts.clone(),
                        self.config.clone(),
                        self.file_manager.clone(),
                    ));
                    registry.insert(path.to_string(), entity.clone());
                    (entity, true)
                }
                None => return Ok(None),
            }
        };

        if let Err(err) = entity.open_file(meta, size, mtime).await {
            if created && !entity.is_open() {
                let mut registry = self.registry.lock().unwrap();
                if let Some(current) = registry.get(path) {
                    if Arc::ptr_eq(current, &entity) && !entity.is_open() {
                        registry.remove(path);
                    }
                }
            }
            return Err(err);
        }
        Ok(Some(entity))
    }

    /// Attach to the entity for `path` only if one is already open.
    pub async fn exist_open(&self, path: &str) -> Option<Arc<CacheEntity>> {
        self.open_cache(path, None, None, None, false, false)
            .await
            .ok()
            .flatten()
    }

    /// Drop one reference; unregister and thereby destroy the entity when
    /// it was the last one. Close errors (a failed tmpfile flush) keep the
    /// entity registered so a retry can still reach its dirty data.
    pub async fn close_cache(&self, entity: &Arc<CacheEntity>) -> Result<()> {
        debug!(path = %entity.path(), "closing");
        let result = entity.close_file().await;
        let mut registry = self.registry.lock().unwrap();
        let key = match registry.get(entity.path()) {
            Some(current) if Arc::ptr_eq(current, entity) => Some(entity.path().to_string()),
            // Tolerate callers whose entity key was renamed under them.
            _ => registry
                .iter()
                .find(|(_, candidate)| Arc::ptr_eq(candidate, entity))
                .map(|(key, _)| key.clone()),
        };
        if let Some(key) = key {
            if !entity.is_open() {
                registry.remove(&key);
            }
        }
        result.map(|_| ())
    }

    /// Remove the persisted cache bytes and range index of `path`. Missing
    /// files are only worth a log line.
    pub fn delete_cache_file(&self, path: &str) {
        for target in [
            self.config.cache_file_path(path, false),
            self.config.stat_file_path(path, false),
        ] {
            let Ok(Some(file)) = target else { continue };
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(file = %file.display(), "no cached data to delete");
                }
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "deleting cached data failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosfs_store::MemBackend;
    use std::path::Path;

    fn setup(cache_dir: Option<&Path>) -> (MemBackend, Arc<DataCache>) {
        let backend = MemBackend::new();
        let adapter = StorageAdapter::new(Arc::new(backend.clone()), 1024, 2);
        let opts = Arc::new(MountOptions {
            bucket: "b".to_string(),
            cache_dir: cache_dir.map(Path::to_path_buf),
            tmp_dir: std::env::temp_dir(),
            multipart_size: 1024,
            multipart_parallel: 2,
            multipart_threshold: 1024 * 1024,
            ..Default::default()
        });
        let file_manager = Arc::new(FileManager::new(adapter.clone(), opts.clone()));
        (
            backend,
            Arc::new(DataCache::new(adapter, opts, file_manager)),
        )
    }

    #[tokio::test]
    async fn one_entity_per_path() {
        let tmp = tempfile::tempdir().unwrap();
        let (_backend, cache) = setup(Some(tmp.path()));

        let first = cache
            .open_cache("/f", None, Some(0), None, false, true)
            .await
            .unwrap()
            .unwrap();
        let second = cache
            .open_cache("/f", None, Some(0), None, false, true)
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache.close_cache(&second).await.unwrap();
        assert!(cache.get_cache("/f").is_some());
        cache.close_cache(&first).await.unwrap();
        assert!(cache.get_cache("/f").is_none());
    }

    #[tokio::test]
    async fn exist_open_does_not_create() {
        let tmp = tempfile::tempdir().unwrap();
        let (_backend, cache) = setup(Some(tmp.path()));
        assert!(cache.exist_open("/absent").await.is_none());

        let ent = cache
            .open_cache("/f", None, Some(0), None, false, true)
            .await
            .unwrap()
            .unwrap();
        let again = cache.exist_open("/f").await.unwrap();
        cache.close_cache(&again).await.unwrap();
        assert!(cache.get_cache("/f").is_some());
        cache.close_cache(&ent).await.unwrap();
        assert!(cache.get_cache("/f").is_none());
    }

    #[tokio::test]
    async fn tmpfile_close_flushes_to_the_store() {
        let (backend, cache) = setup(None);
        let ent = cache
            .open_cache("/t.txt", None, Some(0), None, false, true)
            .await
            .unwrap()
            .unwrap();
        ent.write(b"payload", 0).await.unwrap();
        cache.close_cache(&ent).await.unwrap();
        assert_eq!(backend.object("t.txt").unwrap(), b"payload");
    }

    #[tokio::test]
    async fn delete_cache_file_removes_persisted_state() {
        let tmp = tempfile::tempdir().unwrap();
        let (_backend, cache) = setup(Some(tmp.path()));
        let ent = cache
            .open_cache("/d/f", None, Some(0), None, false, true)
            .await
            .unwrap()
            .unwrap();
        ent.write(b"x", 0).await.unwrap();
        ent.flush(false).await.unwrap();
        cache.close_cache(&ent).await.unwrap();

        let cache_file = cache
            .config()
            .cache_file_path("/d/f", false)
            .unwrap()
            .unwrap();
        let stat_file = cache
            .config()
            .stat_file_path("/d/f", false)
            .unwrap()
            .unwrap();
        assert!(cache_file.exists());
        assert!(stat_file.exists());

        cache.delete_cache_file("/d/f");
        assert!(!cache_file.exists());
        assert!(!stat_file.exists());

        // Deleting again only logs.
        cache.delete_cache_file("/d/f");
    }
}
