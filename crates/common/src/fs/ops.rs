//! The POSIX operations, one method per FUSE callback.
//!
//! Every operation follows the same shape: map the kernel path through the
//! bucket prefix, check ancestor search permission and the operation's own
//! access, run the core work, and finish every successful mutation by
//! dropping the affected attribute-cache entries so the next lookup re-reads
//! authoritative state.

use std::sync::Arc;

use bosfs_store::{ListRequest, META_MODE, META_XATTR};
use tracing::{debug, warn};

use crate::access::{RequestContext, R_OK, W_OK, X_OK};
use crate::error::{FsError, Result};
use crate::file_manager::FileEntry;
use crate::stat::FileStat;
use crate::xattr;

use super::{FileHandle, FsCore};

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

/// Synthetic filesystem geometry reported by `statfs`.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub namemax: u32,
}

impl FsCore {
    /// `access(2)`.
    pub async fn access(&self, ctx: &RequestContext, path: &str, mask: u32) -> Result<()> {
        let real = self.real_path(path);
        self.check_object_access(ctx, &real, mask).await?;
        Ok(())
    }

    /// `stat(2)`. While an entity is open for the path, its local file and
    /// pending metadata override the cached answer, so unflushed writes and
    /// attribute changes are already visible.
    pub async fn getattr(&self, ctx: &RequestContext, path: &str) -> Result<FileStat> {
        let real = self.real_path(path);
        self.check_path_accessible(ctx, &real).await?;
        match self.attr_and_meta(&real).await {
            Ok((mut st, _)) => {
                if st.is_reg() {
                    if let Some(ent) = self.data_cache().exist_open(&real).await {
                        self.apply_open_entity(&mut st, &ent).await;
                        let _ = self.data_cache().close_cache(&ent).await;
                    }
                }
                Ok(st)
            }
            Err(err) if err.is_not_found() => {
                // Created but never flushed: the open entity is the only
                // authority for this path.
                let Some(ent) = self.data_cache().exist_open(&real).await else {
                    return Err(err);
                };
                let entry = FileEntry::new(real.clone());
                entry.set_meta(ent.meta().await);
                let mut st = entry.stat(self.options());
                self.apply_open_entity(&mut st, &ent).await;
                let _ = self.data_cache().close_cache(&ent).await;
                Ok(st)
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_open_entity(&self, st: &mut FileStat, ent: &FileHandle) {
        if let Ok(local) = ent.local_stats().await {
            st.size = local.size;
            st.blocks = local.blocks;
            st.blksize = local.blksize;
            st.atime = local.atime;
            st.mtime = local.mtime;
        }
        let meta = ent.meta().await;
        if let Some(mode) = meta.user_meta_int(META_MODE) {
            st.mode = mode as u32;
            if st.mode & libc::S_IFMT == 0 {
                st.mode |= libc::S_IFREG;
            }
        }
    }

    /// `open(2)`.
    pub async fn open(&self, ctx: &RequestContext, path: &str, flags: i32) -> Result<FileHandle> {
        let real = self.real_path(path);
        debug!(path = %real, flags, "open");
        self.check_parent_access(ctx, &real, X_OK).await?;
        let mask = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => W_OK,
            libc::O_RDWR => R_OK | W_OK,
            _ => R_OK,
        };
        self.check_object_access(ctx, &real, mask).await?;
        let (st, meta) = self.attr_and_meta(&real).await?;

        let need_truncate = flags & libc::O_TRUNC != 0 && st.size != 0;
        let mtime = if st.is_reg() && !st.is_symlink() {
            Some(st.mtime)
        } else {
            None
        };
        let ent = match self
            .data_cache()
            .open_cache(&real, Some(&meta), Some(st.size), mtime, false, true)
            .await
        {
            Ok(Some(ent)) => ent,
            Ok(None) => return Err(FsError::NotFound(real)),
            Err(err) => {
                self.file_manager().del(&real);
                return Err(err);
            }
        };
        if need_truncate {
            if let Err(err) = ent.truncate(0).await {
                warn!(path = %real, error = %err, "open-truncate failed");
                let _ = self.data_cache().close_cache(&ent).await;
                return Err(err);
            }
        }
        Ok(ent)
    }

    /// `creat(2)`: write the attribute skeleton into the caches and hand
    /// out a dirty entity; the object reaches the store on flush.
    pub async fn create(&self, ctx: &RequestContext, path: &str, mode: u32) -> Result<FileHandle> {
        let real = self.real_path(path);
        debug!(path = %real, mode = format_args!("{mode:04o}"), "create");
        self.check_parent_access(ctx, &real, W_OK | X_OK).await?;

        let key = real.trim_start_matches('/');
        let meta = self.create_meta(key, mode, ctx.uid, ctx.gid);
        let ent = self
            .data_cache()
            .open_cache(&real, Some(&meta), Some(0), None, false, true)
            .await?
            .ok_or_else(|| FsError::NotFound(real.clone()))?;
        ent.set_modified(true).await;
        self.remember_entry(&real, meta, false);
        Ok(ent)
    }

    /// `read(2)` against an open handle.
    pub async fn read(&self, handle: &FileHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        if handle.size().await? == 0 {
            return Ok(0);
        }
        handle.read(buf, offset, false).await
    }

    /// `write(2)` against an open handle.
    pub async fn write(&self, handle: &FileHandle, buf: &[u8], offset: u64) -> Result<usize> {
        handle.write(buf, offset).await
    }

    /// `flush`, called at `close(2)`: stamp the local mtime into the upload
    /// metadata, then upload if dirty.
    pub async fn flush(&self, handle: &FileHandle) -> Result<()> {
        handle.update_mtime().await?;
        handle.flush(false).await
    }

    /// `fsync(2)`.
    pub async fn fsync(&self, handle: &FileHandle, datasync: bool) -> Result<()> {
        if !datasync {
            handle.update_mtime().await?;
        }
        handle.flush(false).await
    }

    /// `release`: drop the handle's reference.
    pub async fn release(&self, handle: &FileHandle) -> Result<()> {
        self.data_cache().close_cache(handle).await
    }

    /// `truncate(2)` on a path: materialise the target length remotely.
    pub async fn truncate(&self, ctx: &RequestContext, path: &str, size: u64) -> Result<()> {
        let real = self.real_path(path);
        debug!(path = %real, size, "truncate");
        self.check_path_accessible(ctx, &real).await?;
        self.check_object_access(ctx, &real, W_OK).await?;
        let (st, meta) = self.attr_and_meta(&real).await?;
        let ent = self
            .data_cache()
            .open_cache(&real, Some(&meta), Some(st.size), Some(st.mtime), false, true)
            .await?
            .ok_or_else(|| FsError::NotFound(real.clone()))?;
        let result = async {
            ent.truncate(size).await?;
            ent.load(0, size).await?;
            ent.flush(true).await
        }
        .await;
        let _ = self.data_cache().close_cache(&ent).await;
        result?;
        self.file_manager().del(&real);
        Ok(())
    }

    /// `unlink(2)`.
    pub async fn unlink(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let real = self.real_path(path);
        self.check_parent_access(ctx, &real, W_OK | X_OK).await?;
        self.attr_of(&real).await?;
        let result = self
            .adapter()
            .delete_object(real.trim_start_matches('/'))
            .await;
        self.file_manager().del(&real);
        result?;
        self.data_cache().delete_cache_file(&real);
        Ok(())
    }

    /// `mknod(2)`: plain objects for regular and special files.
    pub async fn mknod(&self, ctx: &RequestContext, path: &str, mode: u32) -> Result<()> {
        let real = self.real_path(path);
        self.check_parent_access(ctx, &real, W_OK | X_OK).await?;
        self.ensure_absent(&real).await?;
        self.create_object(&real, mode, ctx.uid, ctx.gid, &[]).await?;
        self.file_manager().del(&real);
        Ok(())
    }

    /// `mkdir(2)`: a zero-length directory object.
    pub async fn mkdir(&self, ctx: &RequestContext, path: &str, mode: u32) -> Result<()> {
        let real = self.real_path(path);
        self.check_parent_access(ctx, &real, W_OK | X_OK).await?;
        self.ensure_absent(&real).await?;
        self.create_object(&real, mode | libc::S_IFDIR, ctx.uid, ctx.gid, &[])
            .await?;
        self.file_manager().del(&real);
        Ok(())
    }

    /// `rmdir(2)`: only an empty directory may go.
    pub async fn rmdir(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let real = self.real_path(path);
        let key = real.trim_start_matches('/').to_string();
        if key.is_empty() {
            return Err(FsError::NotPermitted("cannot remove mountpoint".to_string()));
        }
        self.check_parent_access(ctx, &real, W_OK | X_OK).await?;

        let listing = self
            .adapter()
            .list_objects(&ListRequest {
                prefix: format!("{key}/"),
                delimiter: Some("/".to_string()),
                max_keys: 2,
                marker: None,
            })
            .await?;
        let occupied = !listing.common_prefixes.is_empty()
            || listing.objects.iter().any(|o| o.key != format!("{key}/"));
        if occupied {
            return Err(FsError::NotEmpty(real));
        }

        let entry = self.file_manager().get(&real).await;
        let delete_key = match &entry {
            Ok(entry) if entry.is_dir_obj() => format!("{key}/"),
            _ => key,
        };
        let result = self.adapter().delete_object(&delete_key).await;
        self.file_manager().del(&real);
        result?;
        Ok(())
    }

    /// `symlink(2)`: the target path is the object body.
    pub async fn symlink(&self, ctx: &RequestContext, target: &str, path: &str) -> Result<()> {
        let real = self.real_path(path);
        debug!(link = %real, target, "symlink");
        self.check_parent_access(ctx, &real, W_OK | X_OK).await?;
        self.ensure_absent(&real).await?;
        let mode = libc::S_IFLNK | 0o777;
        self.create_object(&real, mode, ctx.uid, ctx.gid, target.as_bytes())
            .await?;
        self.file_manager().del(&real);
        Ok(())
    }

    /// `readlink(2)`: read the object body through the cache.
    pub async fn readlink(&self, ctx: &RequestContext, path: &str) -> Result<Vec<u8>> {
        let real = self.real_path(path);
        self.check_path_accessible(ctx, &real).await?;
        let ent = self.local_entity(&real).await?;
        let result = async {
            let size = ent.size().await?;
            let mut buf = vec![0u8; size as usize];
            let n = ent.read(&mut buf, 0, false).await?;
            buf.truncate(n);
            Ok(buf)
        }
        .await;
        let _ = self.data_cache().close_cache(&ent).await;
        result
    }

    /// `link(2)` has no object-storage representation.
    pub async fn hard_link(&self, _from: &str, _to: &str) -> Result<()> {
        Err(FsError::NotPermitted("hard links are not supported".to_string()))
    }

    /// `rename(2)` as server-side copy plus delete. Rename flags
    /// (`RENAME_NOREPLACE`, `RENAME_EXCHANGE`) are not supported.
    pub async fn rename(
        &self,
        ctx: &RequestContext,
        from: &str,
        to: &str,
        flags: u32,
    ) -> Result<()> {
        if flags != 0 {
            return Err(FsError::Invalid(format!("unsupported rename flags {flags:#x}")));
        }
        let real_from = self.real_path(from);
        let real_to = self.real_path(to);
        debug!(from = %real_from, to = %real_to, "rename");
        self.check_parent_access(ctx, &real_to, W_OK | X_OK).await?;
        self.check_parent_access(ctx, &real_from, W_OK | X_OK).await?;

        let st = self.attr_of(&real_from).await?;
        let from_key = real_from.trim_start_matches('/');
        let to_key = real_to.trim_start_matches('/');
        if st.is_dir() {
            self.rename_directory(from_key, to_key).await
        } else {
            self.rename_object(from_key, to_key, Some(st.size)).await
        }
    }

    /// `opendir(3)`.
    pub async fn opendir(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let real = self.real_path(path);
        self.check_path_accessible(ctx, &real).await?;
        self.check_object_access(ctx, &real, R_OK).await?;
        Ok(())
    }

    /// `readdir(3)`: delimited listing pages of 1000, preferring cached
    /// attributes and batching the rest into one multi-HEAD per page.
    pub async fn read_dir(&self, _ctx: &RequestContext, path: &str) -> Result<Vec<DirEntry>> {
        let real = self.real_path(path);
        let key = real.trim_start_matches('/');
        let prefix = if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        };

        let mut entries = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let chunk = self
                .adapter()
                .list_objects(&ListRequest {
                    prefix: prefix.clone(),
                    delimiter: Some("/".to_string()),
                    max_keys: 1000,
                    marker: marker.clone(),
                })
                .await?;

            for child_prefix in &chunk.common_prefixes {
                let dir_path = format!("/{}", child_prefix.trim_end_matches('/'));
                let entry = Arc::new(FileEntry::new(dir_path.clone()));
                entry.set_is_prefix(true);
                let stat = entry.stat(self.options());
                self.file_manager().set(&dir_path, entry);
                entries.push(DirEntry {
                    name: basename(child_prefix, &prefix),
                    stat,
                });
            }

            let mut page: Vec<(String, Option<FileStat>)> = Vec::new();
            let mut missing: Vec<(usize, String)> = Vec::new();
            for obj in &chunk.objects {
                if obj.key == prefix {
                    continue;
                }
                let obj_path = format!("/{}", obj.key.trim_end_matches('/'));
                let name = basename(&obj.key, &prefix);
                match self.file_manager().try_get(&obj_path) {
                    Some(entry) => page.push((name, Some(entry.stat(self.options())))),
                    None => {
                        missing.push((page.len(), obj.key.clone()));
                        page.push((name, None));
                    }
                }
            }
            if !missing.is_empty() {
                let keys = missing.iter().map(|(_, key)| key.clone()).collect();
                let results = self.adapter().head_many(keys).await;
                for ((slot, key), (_, outcome)) in missing.iter().zip(results) {
                    page[*slot].1 = Some(self.stat_from_head(key, outcome));
                }
            }
            entries.extend(page.into_iter().map(|(name, stat)| DirEntry {
                name,
                stat: stat.unwrap_or_else(|| self.fallback_file_stat()),
            }));

            if !chunk.truncated || chunk.next_marker.is_none() {
                break;
            }
            marker = chunk.next_marker;
        }
        Ok(entries)
    }

    fn fallback_file_stat(&self) -> FileStat {
        let mut st = FileStat {
            mode: self.options().mount_mode,
            uid: self.options().default_uid(),
            gid: self.options().default_gid(),
            mtime: self.options().mount_time,
            ctime: self.options().mount_time,
            ..Default::default()
        };
        st.mode &= !libc::S_IFMT;
        st.mode |= libc::S_IFREG;
        st
    }

    fn stat_from_head(
        &self,
        key: &str,
        outcome: bosfs_store::Result<Option<bosfs_store::ObjectMetadata>>,
    ) -> FileStat {
        match outcome {
            Ok(Some(meta)) => {
                let obj_path = format!("/{}", key.trim_end_matches('/'));
                let entry = Arc::new(FileEntry::new(obj_path.clone()));
                entry.set_meta(meta);
                entry.set_is_dir_obj(key.ends_with('/'));
                let st = entry.stat(self.options());
                self.file_manager().set(&obj_path, entry);
                st
            }
            Ok(None) => self.fallback_file_stat(),
            Err(err) => {
                warn!(key, error = %err, "stat in listing failed, serving defaults");
                self.fallback_file_stat()
            }
        }
    }

    /// `statfs(2)`: fixed synthetic geometry, the store has no meaningful
    /// capacity to report.
    pub fn statfs(&self) -> StatFs {
        StatFs {
            bsize: 0x0100_0000,
            blocks: 0x0100_0000,
            bfree: 0x0100_0000,
            bavail: 0x0100_0000,
            namemax: 255,
        }
    }

    /// `chmod(2)` via copy-in-place; falls back to the open entity when the
    /// object has not reached the store yet.
    pub async fn chmod(&self, ctx: &RequestContext, path: &str, mode: u32) -> Result<()> {
        let real = self.real_path(path);
        if real == "/" {
            debug!("chmod on mountpoint ignored");
            return Ok(());
        }
        self.check_path_accessible(ctx, &real).await?;
        self.check_object_owner(ctx, &real).await?;
        let (st, mut meta) = self.attr_and_meta(&real).await?;
        let mut key = real.trim_start_matches('/').to_string();
        if st.is_dir() {
            key.push('/');
        }
        meta.set_user_meta(META_MODE, mode);
        let result = self.change_object_meta(&key, &meta).await;
        self.file_manager().del(&real);
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                let Some(ent) = self.data_cache().exist_open(&real).await else {
                    return Err(err);
                };
                ent.set_mode(mode).await;
                let _ = self.data_cache().close_cache(&ent).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// `chown(2)`: root only; prefers the open entity so the change rides
    /// the next flush.
    pub async fn chown(&self, ctx: &RequestContext, path: &str, uid: u32, gid: u32) -> Result<()> {
        let real = self.real_path(path);
        if real == "/" {
            debug!("chown on mountpoint ignored");
            return Ok(());
        }
        self.check_path_accessible(ctx, &real).await?;
        if ctx.uid != 0 {
            return Err(FsError::NotPermitted("chown requires root".to_string()));
        }
        let (st, mut meta) = self.attr_and_meta(&real).await?;
        if let Some(ent) = self.data_cache().exist_open(&real).await {
            ent.set_uid(uid).await;
            ent.set_gid(gid).await;
            let _ = self.data_cache().close_cache(&ent).await;
            self.file_manager().del(&real);
            return Ok(());
        }
        let mut key = real.trim_start_matches('/').to_string();
        if st.is_dir() {
            key.push('/');
        }
        meta.set_user_meta(bosfs_store::META_UID, uid);
        meta.set_user_meta(bosfs_store::META_GID, gid);
        let result = self.change_object_meta(&key, &meta).await;
        self.file_manager().del(&real);
        result
    }

    /// `utimensat(2)` (mtime only; the store keeps no atime).
    pub async fn utimens(&self, ctx: &RequestContext, path: &str, mtime: i64) -> Result<()> {
        let real = self.real_path(path);
        if real == "/" {
            self.set_mount_time(mtime);
            return Ok(());
        }
        self.check_path_accessible(ctx, &real).await?;
        self.check_object_access(ctx, &real, W_OK).await?;
        self.check_object_owner(ctx, &real).await?;
        let (st, mut meta) = self.attr_and_meta(&real).await?;
        if let Some(ent) = self.data_cache().exist_open(&real).await {
            if let Some(mode) = meta.user_meta_int(META_MODE) {
                ent.set_mode(mode as u32).await;
            }
            let result = ent.set_mtime(mtime).await;
            let _ = self.data_cache().close_cache(&ent).await;
            self.file_manager().del(&real);
            return result;
        }
        let mut key = real.trim_start_matches('/').to_string();
        if st.is_dir() {
            key.push('/');
        }
        meta.set_user_meta(bosfs_store::META_MTIME, mtime);
        let result = self.change_object_meta(&key, &meta).await;
        self.file_manager().del(&real);
        result
    }

    /// `setxattr(2)`.
    pub async fn setxattr(
        &self,
        ctx: &RequestContext,
        path: &str,
        name: &str,
        value: &[u8],
        create_only: bool,
        replace_only: bool,
    ) -> Result<()> {
        let real = self.real_path(path);
        if real == "/" {
            debug!(name, "setxattr on mountpoint ignored");
            return Ok(());
        }
        self.check_path_accessible(ctx, &real).await?;
        self.check_object_owner(ctx, &real).await?;
        let (st, mut meta) = self.attr_and_meta(&real).await?;
        let current = meta.user_meta(META_XATTR).unwrap_or("");
        let updated = xattr::set(current, name, value, create_only, replace_only)?;
        if let Some(ent) = self.data_cache().exist_open(&real).await {
            ent.set_xattr(&updated).await;
            let _ = self.data_cache().close_cache(&ent).await;
            self.file_manager().del(&real);
            return Ok(());
        }
        meta.set_user_meta(META_XATTR, updated);
        let mut key = real.trim_start_matches('/').to_string();
        if st.is_dir() {
            key.push('/');
        }
        let result = self.change_object_meta(&key, &meta).await;
        self.file_manager().del(&real);
        result
    }

    /// `getxattr(2)`: the raw decoded bytes.
    pub async fn getxattr(&self, ctx: &RequestContext, path: &str, name: &str) -> Result<Vec<u8>> {
        let real = self.real_path(path);
        self.check_path_accessible(ctx, &real).await?;
        let (_, meta) = self.attr_and_meta(&real).await?;
        let raw = meta.user_meta(META_XATTR).unwrap_or("");
        xattr::get(raw, name).ok_or_else(|| FsError::NoAttr(name.to_string()))
    }

    /// `listxattr(2)`: attribute names in stored order.
    pub async fn listxattr(&self, ctx: &RequestContext, path: &str) -> Result<Vec<String>> {
        let real = self.real_path(path);
        self.check_path_accessible(ctx, &real).await?;
        match self.attr_and_meta(&real).await {
            Ok((_, meta)) => Ok(xattr::names(meta.user_meta(META_XATTR).unwrap_or(""))),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// `removexattr(2)`.
    pub async fn removexattr(&self, ctx: &RequestContext, path: &str, name: &str) -> Result<()> {
        let real = self.real_path(path);
        if real == "/" {
            debug!(name, "removexattr on mountpoint ignored");
            return Ok(());
        }
        self.check_path_accessible(ctx, &real).await?;
        self.check_object_owner(ctx, &real).await?;
        let (st, mut meta) = self.attr_and_meta(&real).await?;
        let current = meta.user_meta(META_XATTR).unwrap_or("");
        let updated = xattr::remove(current, name)?;
        if let Some(ent) = self.data_cache().exist_open(&real).await {
            ent.set_xattr(&updated).await;
            let _ = self.data_cache().close_cache(&ent).await;
            self.file_manager().del(&real);
            return Ok(());
        }
        meta.set_user_meta(META_XATTR, updated);
        let mut key = real.trim_start_matches('/').to_string();
        if st.is_dir() {
            key.push('/');
        }
        let result = self.change_object_meta(&key, &meta).await;
        self.file_manager().del(&real);
        result
    }

    /// `EEXIST` unless the path is currently absent.
    async fn ensure_absent(&self, real: &str) -> Result<()> {
        match self.attr_of(real).await {
            Err(err) if err.is_not_found() => Ok(()),
            Ok(_) => Err(FsError::Exists(real.to_string())),
            Err(err) => Err(err),
        }
    }
}

fn basename(key: &str, prefix: &str) -> String {
    key[prefix.len()..].trim_end_matches('/').to_string()
}
