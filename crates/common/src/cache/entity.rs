//! One open object: its local scratch file, range index and dirty state.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bosfs_store::{
    ObjectMetadata, StorageAdapter, META_GID, META_MODE, META_MTIME, META_UID, META_XATTR,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheConfig, StatCacheFile};
use crate::config::MountOptions;
use crate::error::{FsError, Result};
use crate::file_manager::FileManager;
use crate::page_list::PageList;

/// Attributes of the local cache file behind an open entity.
#[derive(Debug, Clone, Copy)]
pub struct LocalStats {
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub atime: i64,
    pub mtime: i64,
}

#[derive(Default)]
struct EntityState {
    file: Option<File>,
    cache_path: Option<PathBuf>,
    mirror_path: Option<PathBuf>,
    tmp_path: Option<PathBuf>,
    is_tmpfile: bool,
    ref_count: u32,
    pages: PageList,
    modified: bool,
    origin_meta: ObjectMetadata,
    origin_meta_size: u64,
}

/// One per open path: owns the local file, serves reads and writes against
/// it, faults missing ranges in from the remote and uploads dirty content on
/// flush.
///
/// All state sits behind one async mutex that is held across remote
/// transfers, so operations on the same open file are serialised while
/// different files proceed in parallel.
pub struct CacheEntity {
    path: String,
    adapter: StorageAdapter,
    opts: Arc<MountOptions>,
    config: Arc<CacheConfig>,
    file_manager: Arc<FileManager>,
    open_flag: AtomicBool,
    state: Mutex<EntityState>,
}

impl CacheEntity {
    pub(crate) fn new(
        path: impl Into<String>,
        cache_path: Option<PathBuf>,
        adapter: StorageAdapter,
        opts: Arc<MountOptions>,
        config: Arc<CacheConfig>,
        file_manager: Arc<FileManager>,
    ) -> Self {
        Self {
            path: path.into(),
            adapter,
            opts,
            config,
            file_manager,
            open_flag: AtomicBool::new(false),
            state: Mutex::new(EntityState {
                cache_path,
                ..Default::default()
            }),
        }
    }

    /// Remote path this entity caches.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn object_key(&self) -> &str {
        self.path.trim_start_matches('/')
    }

    /// Whether the local file is currently open. Racy by nature; the
    /// registry re-checks after taking its own lock.
    pub fn is_open(&self) -> bool {
        self.open_flag.load(Ordering::SeqCst)
    }

    /// Open the local file, or bump the reference count when already open.
    ///
    /// With a persistent cache the canonical cache file and its range index
    /// are restored when both are intact, then the file is swapped for a
    /// hard-linked mirror; otherwise (or in tmpfile mode) a fresh scratch
    /// file is created and the index initialised to `size` unloaded bytes.
    pub async fn open_file(
        &self,
        meta: Option<&ObjectMetadata>,
        size: Option<u64>,
        mtime: Option<i64>,
    ) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.file.is_some() {
            st.ref_count += 1;
            debug!(path = %self.path, ref_count = st.ref_count, "reopened");
            return Ok(());
        }

        let mut need_save_index = false;
        let mut want_truncate = false;

        if let Some(cache_path) = st.cache_path.clone() {
            let mut restored = false;
            if let Ok(file) = OpenOptions::new().read(true).write(true).open(&cache_path) {
                if let Ok(mut index) = StatCacheFile::open(&self.config, &self.path) {
                    if st.pages.load_from(index.file_mut()).is_ok() {
                        restored = true;
                        let on_disk = file.metadata()?.len();
                        match size {
                            None => {
                                if on_disk != st.pages.size() {
                                    st.pages.resize(on_disk, false);
                                    need_save_index = true;
                                }
                            }
                            Some(wanted) => {
                                if wanted != st.pages.size() {
                                    st.pages.resize(wanted, false);
                                    need_save_index = true;
                                }
                                if wanted != on_disk {
                                    want_truncate = true;
                                }
                            }
                        }
                        st.file = Some(file);
                    }
                }
            }
            if !restored {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o600)
                    .open(&cache_path)?;
                need_save_index = true;
                match size {
                    None => st.pages.init(0, false),
                    Some(wanted) => {
                        st.pages.init(wanted, false);
                        want_truncate = true;
                    }
                }
                st.file = Some(file);
            }

            // Swap the active fd to a hard-linked mirror so concurrent
            // rewrites of the canonical cache file by other entities do not
            // move this entity's data under it.
            let (mirror_file, mirror_path) = self.open_mirror(&cache_path)?;
            st.file = Some(mirror_file);
            st.mirror_path = Some(mirror_path);
        } else {
            let tmp_path = self
                .config
                .tmp_dir()
                .join(format!("bosfs.tmp.{}", Uuid::new_v4()));
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?;
            info!(tmp = %tmp_path.display(), path = %self.path, "using tmp file");
            match size {
                None => st.pages.init(0, false),
                Some(wanted) => {
                    st.pages.init(wanted, false);
                    want_truncate = true;
                }
            }
            st.file = Some(file);
            st.tmp_path = Some(tmp_path);
            st.is_tmpfile = true;
        }

        if want_truncate {
            let file = st.file.as_ref().expect("opened above");
            file.set_len(st.pages.size())?;
            file.sync_all()?;
        }
        if need_save_index && st.cache_path.is_some() {
            match StatCacheFile::open(&self.config, &self.path) {
                Ok(mut index) => {
                    if let Err(err) = st.pages.save_to(index.file_mut()) {
                        warn!(path = %self.path, error = %err, "saving range index failed");
                    }
                }
                Err(err) => {
                    warn!(path = %self.path, error = %err, "opening range index failed");
                }
            }
        }

        st.ref_count = 1;
        st.modified = false;
        st.origin_meta = meta.cloned().unwrap_or_default();
        st.origin_meta_size = st.origin_meta.content_length();
        if let Some(class) = &self.opts.storage_class {
            st.origin_meta.set_storage_class(class.clone());
        }
        if let Some(t) = mtime {
            self.set_mtime_locked(&mut st, t)?;
        }
        self.open_flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Drop one reference; on the last one flush tmpfiles, persist the
    /// range index and close the local file. Returns whether the entity is
    /// still open afterwards.
    pub async fn close_file(&self) -> Result<bool> {
        let mut st = self.state.lock().await;
        if st.file.is_none() {
            warn!(path = %self.path, "close of a file that is not open");
            return Ok(false);
        }
        if st.ref_count == 0 {
            warn!(path = %self.path, "close without a matching open");
            return Ok(true);
        }
        st.ref_count -= 1;
        if st.ref_count > 0 {
            return Ok(true);
        }
        debug!(path = %self.path, "last reference closed");

        if st.is_tmpfile {
            // The scratch file disappears on close, so dirty bytes must be
            // uploaded now; failure keeps the entity open for a retry.
            self.flush_locked(&mut st, false).await?;
            if let Some(tmp_path) = st.tmp_path.take() {
                std::fs::remove_file(&tmp_path)?;
            }
        }
        if st.cache_path.is_some() {
            match StatCacheFile::open(&self.config, &self.path) {
                Ok(mut index) => {
                    if let Err(err) = st.pages.save_to(index.file_mut()) {
                        warn!(path = %self.path, error = %err, "saving range index failed");
                    }
                }
                Err(err) => {
                    warn!(path = %self.path, error = %err, "opening range index failed");
                }
            }
        }
        st.file = None;
        self.open_flag.store(false, Ordering::SeqCst);
        if let Some(mirror) = st.mirror_path.take() {
            if let Err(err) = std::fs::remove_file(&mirror) {
                warn!(mirror = %mirror.display(), error = %err, "removing mirror failed");
                return Err(err.into());
            }
        }
        Ok(false)
    }

    /// Read into `buf` at `offset`, faulting missing ranges in first.
    ///
    /// When the window has unloaded bytes but the disk is too full, clean
    /// buffered pages are discarded (index reset, file re-truncated) to make
    /// room before loading. Loads prefetch up to one multipart window
    /// clamped to EOF.
    pub async fn read(&self, buf: &mut [u8], offset: u64, force_reload: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len() as u64;
        let mut st = self.state.lock().await;
        if st.file.is_none() {
            return Err(FsError::NotOpen);
        }
        if force_reload {
            st.pages.set_loaded(offset, len, false);
        }

        if st.pages.total_unloaded(offset, len) > 0 {
            if !self.is_safe_disk_space(&st, len) && !st.modified {
                let size = st.pages.size();
                st.pages.init(size, false);
                let file = st.file.as_ref().expect("checked above");
                if file.set_len(0).is_err() || file.set_len(size).is_err() {
                    return Err(FsError::NoSpace);
                }
            }

            let mut load_size = len;
            let total = st.pages.size();
            if offset + len < total {
                let prefetch =
                    len.max(self.opts.multipart_size * self.opts.multipart_parallel as u64);
                load_size = if offset + prefetch < total {
                    prefetch
                } else {
                    total - offset
                };
            }
            self.load_locked(&mut st, offset, load_size).await?;
        }

        let n = st
            .file
            .as_ref()
            .expect("checked above")
            .read_at(buf, offset)?;
        Ok(n)
    }

    /// Write `buf` at `offset`.
    ///
    /// Writing past EOF grows the file with an unloaded gap; the prefix
    /// `[0, offset)` is faulted in first so a later flush uploads real
    /// bytes, with the disk-space guard applied to gap plus payload.
    pub async fn write(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut st = self.state.lock().await;
        if st.file.is_none() {
            return Err(FsError::NotOpen);
        }
        let current = st.pages.size();
        if current < offset {
            st.file.as_ref().expect("checked above").set_len(offset)?;
            st.pages.set_loaded(current, offset - current, false);
        }

        let needed = st.pages.total_unloaded(0, offset) + buf.len() as u64;
        if !self.is_safe_disk_space(&st, needed) {
            warn!(path = %self.path, needed, "not enough disk space for write");
            return Err(FsError::NoSpace);
        }
        if offset > 0 {
            self.load_locked(&mut st, 0, offset).await?;
        }

        let file = st.file.as_ref().expect("checked above");
        file.write_all_at(buf, offset)?;
        st.modified = true;
        st.pages.set_loaded(offset, buf.len() as u64, true);
        Ok(buf.len())
    }

    /// Truncate the local file and the range index. The change stays local
    /// until the next flush.
    pub async fn truncate(&self, size: u64) -> Result<()> {
        let mut st = self.state.lock().await;
        let Some(file) = st.file.as_ref() else {
            return Err(FsError::NotOpen);
        };
        file.set_len(size)?;
        st.pages.resize(size, false);
        Ok(())
    }

    /// Fault the window into the local file. Bytes below the original
    /// object size are range-downloaded; bytes past it (holes after a
    /// truncate-grow) are zero-filled locally.
    pub async fn load(&self, offset: u64, len: u64) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.file.is_none() {
            return Err(FsError::NotOpen);
        }
        self.load_locked(&mut st, offset, len).await
    }

    /// Upload dirty content. No-op when clean and not forced; still-unloaded
    /// pages are faulted in first so the upload body is complete.
    pub async fn flush(&self, force: bool) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.file.is_none() {
            return Err(FsError::NotOpen);
        }
        self.flush_locked(&mut st, force).await
    }

    /// Open the entity if needed and load every byte. Returns the size.
    pub async fn open_and_load_all(&self, meta: Option<&ObjectMetadata>) -> Result<u64> {
        if !self.is_open() {
            self.open_file(meta, None, None).await?;
        }
        let mut st = self.state.lock().await;
        let size = st.pages.size();
        self.load_locked(&mut st, 0, size).await?;
        st.modified = false;
        Ok(size)
    }

    /// Logical size from the range index.
    pub async fn size(&self) -> Result<u64> {
        let st = self.state.lock().await;
        if st.file.is_none() {
            return Err(FsError::NotOpen);
        }
        Ok(st.pages.size())
    }

    /// Whether unflushed writes exist.
    pub async fn is_modified(&self) -> bool {
        self.state.lock().await.modified
    }

    /// Mark the entity dirty (used right after create).
    pub async fn set_modified(&self, modified: bool) {
        self.state.lock().await.modified = modified;
    }

    /// Attributes of the local cache file.
    pub async fn local_stats(&self) -> Result<LocalStats> {
        let st = self.state.lock().await;
        let Some(file) = st.file.as_ref() else {
            return Err(FsError::NotOpen);
        };
        let meta = file.metadata()?;
        Ok(LocalStats {
            size: meta.len(),
            blocks: meta.blocks(),
            blksize: meta.blksize() as u32,
            atime: meta.atime(),
            mtime: meta.mtime(),
        })
    }

    /// A snapshot of the metadata that will accompany the next upload.
    pub async fn meta(&self) -> ObjectMetadata {
        self.state.lock().await.origin_meta.clone()
    }

    /// Set the mtime on the local file and in the upload metadata.
    pub async fn set_mtime(&self, mtime: i64) -> Result<()> {
        let mut st = self.state.lock().await;
        self.set_mtime_locked(&mut st, mtime)
    }

    /// Refresh the upload metadata's mtime from the local file.
    pub async fn update_mtime(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        let Some(file) = st.file.as_ref() else {
            return Err(FsError::NotOpen);
        };
        let mtime = file.metadata()?.mtime();
        st.origin_meta.set_user_meta(META_MTIME, mtime);
        Ok(())
    }

    pub async fn set_mode(&self, mode: u32) {
        let mut st = self.state.lock().await;
        st.origin_meta.set_user_meta(META_MODE, mode);
    }

    pub async fn set_uid(&self, uid: u32) {
        let mut st = self.state.lock().await;
        st.origin_meta.set_user_meta(META_UID, uid);
    }

    pub async fn set_gid(&self, gid: u32) {
        let mut st = self.state.lock().await;
        st.origin_meta.set_user_meta(META_GID, gid);
    }

    pub async fn set_xattr(&self, raw: &str) {
        let mut st = self.state.lock().await;
        st.origin_meta.set_user_meta(META_XATTR, raw);
    }

    pub async fn set_content_type(&self, content_type: &str) {
        let mut st = self.state.lock().await;
        st.origin_meta.set_content_type(content_type);
    }

    fn set_mtime_locked(&self, st: &mut EntityState, mtime: i64) -> Result<()> {
        if let Some(file) = st.file.as_ref() {
            let tv = [libc::timeval {
                tv_sec: mtime,
                tv_usec: 0,
            }; 2];
            if unsafe { libc::futimes(file.as_raw_fd(), tv.as_ptr()) } != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        st.origin_meta.set_user_meta(META_MTIME, mtime);
        Ok(())
    }

    async fn load_locked(&self, st: &mut EntityState, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let ranges = st.pages.unloaded_ranges(offset, len);
        if ranges.is_empty() {
            return Ok(());
        }
        debug!(path = %self.path, offset, len, ranges = ranges.len(), "loading");
        for (range_off, range_len) in ranges {
            let origin = st.origin_meta_size;
            let fetch_len = if origin > range_off {
                range_len.min(origin - range_off)
            } else {
                0
            };
            let fill_len = range_len - fetch_len;

            let file = st.file.as_ref().expect("load requires an open file");
            if fetch_len > 0 {
                self.adapter
                    .parallel_download(self.object_key(), file, range_off, fetch_len)
                    .await?;
            }
            if fill_len > 0 {
                zero_fill(file, range_off + fetch_len, fill_len)?;
            }
            st.pages.set_loaded(range_off, range_len, true);
        }
        Ok(())
    }

    async fn flush_locked(&self, st: &mut EntityState, force: bool) -> Result<()> {
        if !st.modified && !force {
            return Ok(());
        }
        let size = st.pages.size();
        let unloaded = st.pages.total_unloaded(0, size);
        if unloaded > 0 {
            if !self.is_safe_disk_space(st, unloaded) {
                warn!(path = %self.path, unloaded, "not enough disk space to flush");
                return Err(FsError::NoSpace);
            }
            self.load_locked(st, 0, size).await?;
        }

        let file = st.file.as_ref().expect("flush requires an open file");
        let key = self.object_key().to_string();
        if size < self.opts.multipart_threshold {
            self.adapter
                .upload_file(&key, file, size, &st.origin_meta)
                .await?;
        } else {
            self.adapter
                .upload_super_file(&key, file, size, &st.origin_meta)
                .await?;
        }
        st.modified = false;
        self.file_manager.del(&self.path);
        Ok(())
    }

    fn open_mirror(&self, cache_path: &Path) -> Result<(File, PathBuf)> {
        let dir = self
            .config
            .mirror_dir(true)?
            .ok_or_else(|| FsError::Invalid("mirror requires a cache directory".to_string()))?;
        let mirror_path = dir.join(Uuid::new_v4().to_string());
        std::fs::hard_link(cache_path, &mirror_path)?;
        let file = OpenOptions::new().read(true).write(true).open(&mirror_path)?;
        Ok((file, mirror_path))
    }

    /// Admit an operation that materialises `needed` new bytes only when
    /// the backing filesystem keeps the reserved headroom afterwards.
    fn is_safe_disk_space(&self, st: &EntityState, needed: u64) -> bool {
        let dir = self.config.backing_dir(st.is_tmpfile);
        match free_disk_bytes(dir) {
            Some(free) => needed.saturating_add(self.config.reserved_bytes()) <= free,
            None => false,
        }
    }
}

fn free_disk_bytes(dir: &Path) -> Option<u64> {
    let c_path = CString::new(dir.as_os_str().as_bytes()).ok()?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) } != 0 {
        warn!(dir = %dir.display(), "statvfs failed");
        return None;
    }
    Some(vfs.f_bavail as u64 * vfs.f_bsize as u64)
}

fn zero_fill(file: &File, offset: u64, len: u64) -> Result<()> {
    let zeros = [0u8; 32 * 1024];
    let mut written = 0u64;
    while written < len {
        let n = (len - written).min(zeros.len() as u64) as usize;
        file.write_all_at(&zeros[..n], offset + written)?;
        written += n as u64;
    }
    Ok(())
}
