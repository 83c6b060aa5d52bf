//! Path-based filesystem core: composes the attribute cache, the data cache
//! and the storage adapter into the POSIX operations the FUSE layer serves.

mod ops;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bosfs_store::{ObjectMetadata, StorageAdapter, META_GID, META_MODE, META_MTIME, META_UID};
use tracing::{debug, warn};

use crate::access::{self, RequestContext, X_OK};
use crate::cache::{CacheEntity, DataCache};
use crate::config::MountOptions;
use crate::error::{FsError, Result};
use crate::file_manager::{FileEntry, FileManager};
use crate::mime;
use crate::stat::{FileStat, ST_MINBLOCKS};

pub use ops::{DirEntry, StatFs};

/// Handle the FUSE layer keeps per open file.
pub type FileHandle = Arc<CacheEntity>;

/// The mount engine.
pub struct FsCore {
    opts: Arc<MountOptions>,
    adapter: StorageAdapter,
    file_manager: Arc<FileManager>,
    data_cache: Arc<DataCache>,
    /// Mountpoint mtime; `utimens` on `/` only updates this.
    mount_time: AtomicI64,
}

impl FsCore {
    pub fn new(adapter: StorageAdapter, opts: Arc<MountOptions>) -> Self {
        let file_manager = Arc::new(FileManager::new(adapter.clone(), opts.clone()));
        let data_cache = Arc::new(DataCache::new(
            adapter.clone(),
            opts.clone(),
            file_manager.clone(),
        ));
        Self {
            mount_time: AtomicI64::new(opts.mount_time),
            opts,
            adapter,
            file_manager,
            data_cache,
        }
    }

    pub fn options(&self) -> &Arc<MountOptions> {
        &self.opts
    }

    pub fn adapter(&self) -> &StorageAdapter {
        &self.adapter
    }

    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    pub fn data_cache(&self) -> &Arc<DataCache> {
        &self.data_cache
    }

    /// Map a kernel path onto the mounted prefix: `/x` becomes
    /// `/<bucket_prefix>x`, with any trailing slash trimmed.
    pub fn real_path(&self, path: &str) -> String {
        let rest = path.strip_prefix('/').unwrap_or(path);
        let mut real = format!("/{}{}", self.opts.bucket_prefix, rest);
        if real.len() > 1 && real.ends_with('/') {
            real.pop();
        }
        real
    }

    /// The object key of a real path (no leading slash).
    fn object_key(path: &str) -> &str {
        path.trim_start_matches('/')
    }

    /// `/`-rooted path of an object key, trailing slash trimmed.
    fn key_to_path(key: &str) -> String {
        format!("/{}", key.trim_end_matches('/'))
    }

    /// Default attributes carrying the mount identity.
    fn default_stat(&self) -> FileStat {
        let mount_time = self.mount_time.load(Ordering::Relaxed);
        FileStat {
            mode: self.opts.mount_mode,
            uid: self.opts.default_uid(),
            gid: self.opts.default_gid(),
            mtime: mount_time,
            ctime: mount_time,
            ..Default::default()
        }
    }

    pub(crate) fn set_mount_time(&self, secs: i64) {
        self.mount_time.store(secs, Ordering::Relaxed);
    }

    /// Attributes of a real path, from cache or a remote probe.
    pub(crate) async fn attr_of(&self, path: &str) -> Result<FileStat> {
        Ok(self.attr_and_meta(path).await?.0)
    }

    /// Attributes plus the raw metadata of a real path.
    pub(crate) async fn attr_and_meta(&self, path: &str) -> Result<(FileStat, ObjectMetadata)> {
        if path == "/" || path == "." {
            let mut st = self.default_stat();
            st.blocks = ST_MINBLOCKS;
            return Ok((st, ObjectMetadata::new()));
        }
        let entry = self.file_manager.get(path).await?;
        Ok((entry.stat(&self.opts), entry.meta()))
    }

    /// Check `mask` access to a real path, returning its attributes.
    pub(crate) async fn check_object_access(
        &self,
        ctx: &RequestContext,
        path: &str,
        mask: u32,
    ) -> Result<FileStat> {
        let st = self.attr_of(path).await?;
        access::check_access(ctx, &self.opts, &st, mask)?;
        Ok(st)
    }

    /// Walk every ancestor of a real path, requiring search permission.
    pub(crate) async fn check_path_accessible(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<()> {
        let mut parent = path;
        while let Some(pos) = parent.rfind('/') {
            if pos == 0 {
                break;
            }
            parent = &parent[..pos];
            self.check_object_access(ctx, parent, X_OK).await?;
        }
        Ok(())
    }

    /// Ancestor search plus `mask` on the immediate parent.
    pub(crate) async fn check_parent_access(
        &self,
        ctx: &RequestContext,
        path: &str,
        mask: u32,
    ) -> Result<()> {
        if mask & X_OK != 0 {
            self.check_path_accessible(ctx, path).await?;
        }
        let mask = mask & !X_OK;
        if mask != 0 {
            let parent = match path.rfind('/') {
                Some(0) | None => "/",
                Some(pos) => &path[..pos],
            };
            self.check_object_access(ctx, parent, mask).await?;
        }
        Ok(())
    }

    /// Owner check for chmod-like operations.
    pub(crate) async fn check_object_owner(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<FileStat> {
        let st = self.attr_of(path).await?;
        access::check_owner(ctx, &self.opts, &st)?;
        Ok(st)
    }

    /// Fresh upload metadata for a new object.
    pub fn create_meta(
        &self,
        object_name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> ObjectMetadata {
        let mut meta = ObjectMetadata::new();
        if mode & libc::S_IFMT == libc::S_IFLNK {
            meta.set_content_type("application/octet-stream");
        } else if mode & libc::S_IFMT == libc::S_IFDIR {
            meta.set_content_type("application/x-directory");
        } else {
            meta.set_content_type(mime::guess(object_name));
        }
        meta.set_user_meta(META_UID, uid);
        meta.set_user_meta(META_GID, gid);
        meta.set_user_meta(META_MODE, mode);
        meta.set_user_meta(META_MTIME, now_s());
        if let Some(class) = &self.opts.storage_class {
            meta.set_storage_class(class.clone());
        }
        meta
    }

    /// PUT a fresh (possibly empty) object for a real path. Directories get
    /// a trailing-slash key.
    pub async fn create_object(
        &self,
        path: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        data: &[u8],
    ) -> Result<()> {
        debug!(path, mode = format_args!("{mode:04o}"), "creating object");
        let mut key = Self::object_key(path).to_string();
        let meta = self.create_meta(&key, mode, uid, gid);
        if mode & libc::S_IFMT == libc::S_IFDIR {
            key.push('/');
        }
        self.adapter
            .put_object(&key, bytes::Bytes::copy_from_slice(data), &meta)
            .await?;
        Ok(())
    }

    /// Copy-in-place metadata update. A not-found answer is retried for a
    /// few seconds because the object may still be in flight from an
    /// unflushed create.
    pub(crate) async fn change_object_meta(
        &self,
        object_key: &str,
        meta: &ObjectMetadata,
    ) -> Result<()> {
        match self
            .adapter
            .copy_object(object_key, object_key, Some(meta), None)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                for _ in 0..5 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    if self
                        .adapter
                        .copy_object(object_key, object_key, Some(meta), None)
                        .await
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
                Err(FsError::NotFound(object_key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Rename one object by server-side copy plus delete. Large or
    /// unknown-size objects take the ranged parallel copy.
    pub(crate) async fn rename_object(
        &self,
        src_key: &str,
        dst_key: &str,
        size_hint: Option<u64>,
    ) -> Result<()> {
        debug!(src_key, dst_key, "renaming object");
        let storage_class = self.opts.storage_class.as_deref();
        let result = match size_hint {
            Some(size) if size < self.opts.multipart_threshold => {
                self.adapter
                    .copy_object(src_key, dst_key, None, storage_class)
                    .await
            }
            _ => self.adapter.parallel_copy(src_key, dst_key, storage_class).await,
        };
        self.file_manager.del(&Self::key_to_path(src_key));
        self.file_manager.del(&Self::key_to_path(dst_key));
        result?;
        self.adapter.delete_object(src_key).await?;
        Ok(())
    }

    /// Rename a whole directory subtree: copy every key under the source
    /// prefix, then delete the originals; copied keys are rolled back when
    /// any copy fails.
    pub(crate) async fn rename_directory(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let src_prefix = format!("{}/", src_key.trim_end_matches('/'));
        let dst_prefix = format!("{}/", dst_key.trim_end_matches('/'));
        let keys = self.adapter.list_all_keys(&src_prefix).await?;

        let mut copied = Vec::new();
        let storage_class = self.opts.storage_class.as_deref();
        let mut failed = false;
        for key in &keys {
            let dst = format!("{dst_prefix}{}", &key[src_prefix.len()..]);
            match self.adapter.copy_object(key, &dst, None, storage_class).await {
                Ok(()) | Err(bosfs_store::StoreError::NotFound(_)) => {}
                Err(err) => {
                    warn!(key, error = %err, "directory rename copy failed");
                    failed = true;
                    break;
                }
            }
            self.file_manager.del(&Self::key_to_path(&dst));
            copied.push(dst);
        }

        if !failed {
            // Carry the directory object itself (tolerating its absence).
            match self.rename_object(&src_prefix, &dst_prefix, Some(0)).await {
                Ok(()) | Err(FsError::NotFound(_)) => {}
                Err(_) => failed = true,
            }
        }
        if failed {
            for dst in &copied {
                let _ = self.adapter.delete_object(dst).await;
                self.file_manager.del(&Self::key_to_path(dst));
            }
            return Err(FsError::Storage(bosfs_store::StoreError::Service {
                operation: "rename_directory",
                message: format!("failed moving {src_prefix} to {dst_prefix}"),
            }));
        }
        for key in &keys {
            self.adapter.delete_object(key).await?;
            self.file_manager.del(&Self::key_to_path(key));
        }
        Ok(())
    }

    /// Open the cache entity for an existing object, ready for local reads.
    pub(crate) async fn local_entity(&self, path: &str) -> Result<Arc<CacheEntity>> {
        let (st, meta) = self.attr_and_meta(path).await?;
        let mtime = if st.is_reg() && !st.is_symlink() {
            Some(st.mtime)
        } else {
            None
        };
        let force_tmpfile = !st.is_reg();
        self.data_cache
            .open_cache(path, Some(&meta), Some(st.size), mtime, force_tmpfile, true)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Register a freshly-created object's metadata in the attribute cache.
    pub(crate) fn remember_entry(&self, path: &str, meta: ObjectMetadata, is_dir_obj: bool) {
        let entry = Arc::new(FileEntry::new(path));
        entry.set_meta(meta);
        entry.set_is_dir_obj(is_dir_obj);
        self.file_manager.set(path, entry);
    }
}

pub(crate) fn now_s() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
