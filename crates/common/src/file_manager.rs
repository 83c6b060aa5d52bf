//! Attribute cache keyed by absolute path.
//!
//! Each entry memoises one object's metadata together with how it was found
//! (regular object, directory object, or bare common prefix) and synthesises
//! `stat` answers from it. Entries expire after a configurable age and the
//! table is bounded by an approximate-LFU policy: every entry keeps a 64-bit
//! bitmap of which of the last 64 seconds saw a hit, and eviction drops the
//! coldest entries first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bosfs_store::{ListRequest, ObjectMetadata, StorageAdapter, META_GID, META_MODE, META_MTIME, META_UID};
use tracing::debug;

use crate::config::MountOptions;
use crate::error::{FsError, Result};
use crate::stat::{FileStat, ST_MINBLOCKS};

/// Content type marking directory objects.
pub const DIRECTORY_CONTENT_TYPE: &str = "application/x-directory";

fn now_s() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Default, Clone)]
struct EntryState {
    meta: ObjectMetadata,
    is_dir_obj: bool,
    is_prefix: bool,
    load_time_s: i64,
    hit_time_s: i64,
    hit_bits: u64,
}

/// One cached path.
#[derive(Debug)]
pub struct FileEntry {
    path: String,
    state: Mutex<EntryState>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>) -> Self {
        let now = now_s();
        let entry = Self {
            path: path.into(),
            state: Mutex::new(EntryState {
                load_time_s: now,
                ..Default::default()
            }),
        };
        entry.hit(now);
        entry
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn meta(&self) -> ObjectMetadata {
        self.state.lock().unwrap().meta.clone()
    }

    pub fn set_meta(&self, meta: ObjectMetadata) {
        self.state.lock().unwrap().meta = meta;
    }

    pub fn is_dir_obj(&self) -> bool {
        self.state.lock().unwrap().is_dir_obj
    }

    pub fn set_is_dir_obj(&self, value: bool) {
        self.state.lock().unwrap().is_dir_obj = value;
    }

    pub fn is_prefix(&self) -> bool {
        self.state.lock().unwrap().is_prefix
    }

    pub fn set_is_prefix(&self, value: bool) {
        self.state.lock().unwrap().is_prefix = value;
    }

    pub fn load_time_s(&self) -> i64 {
        self.state.lock().unwrap().load_time_s
    }

    fn set_load_time_s(&self, now: i64) {
        self.state.lock().unwrap().load_time_s = now;
    }

    pub fn hit_time_s(&self) -> i64 {
        self.state.lock().unwrap().hit_time_s
    }

    /// Record a hit at second `now`. Bits older than 64 seconds are masked
    /// out before the new second's bit is set.
    pub fn hit(&self, now: i64) {
        let mut state = self.state.lock().unwrap();
        let n = (now % 64) as u32;
        if now - state.hit_time_s >= 64 {
            state.hit_bits = 0;
        } else {
            let h = (state.hit_time_s % 64) as u32;
            let h_bit = 1u64 << h;
            let h_mask = h_bit | (h_bit - 1);
            let n_mask = !0u64 ^ ((1u64 << n) - 1);
            state.hit_bits &= if h > n {
                h_mask & n_mask
            } else {
                h_mask | n_mask
            };
        }
        state.hit_bits |= 1u64 << n;
        state.hit_time_s = now;
    }

    /// Hits within the last 64 seconds.
    pub fn hit_count(&self) -> u32 {
        self.state.lock().unwrap().hit_bits.count_ones()
    }

    /// Synthesise the `stat` answer for this entry.
    pub fn stat(&self, opts: &MountOptions) -> FileStat {
        let state = self.state.lock().unwrap();
        let mut st = FileStat {
            mode: opts.mount_mode,
            uid: opts.default_uid(),
            gid: opts.default_gid(),
            mtime: opts.mount_time,
            ctime: opts.mount_time,
            ..Default::default()
        };
        if self.path == "/" || state.is_prefix {
            st.blocks = ST_MINBLOCKS;
            return st;
        }
        let meta = &state.meta;
        st.size = meta.content_length();
        st.blocks = FileStat::blocks_for(st.size);

        st.mtime = meta
            .user_meta_int(META_MTIME)
            .or_else(|| meta.user_meta_int("mtime"))
            .unwrap_or_else(|| meta.last_modified());
        st.ctime = st.mtime;
        st.atime = st.mtime;

        if let Some(uid) = meta
            .user_meta_int(META_UID)
            .or_else(|| meta.user_meta_int("uid"))
        {
            st.uid = uid as u32;
        }
        if let Some(gid) = meta
            .user_meta_int(META_GID)
            .or_else(|| meta.user_meta_int("gid"))
        {
            st.gid = gid as u32;
        }

        let mut is_dir = state.is_dir_obj && meta.content_length() == 0;
        if !is_dir {
            if let Some(content_type) = meta.content_type() {
                let bare = content_type.split(';').next().unwrap_or("");
                is_dir = bare == DIRECTORY_CONTENT_TYPE;
            }
        }

        match meta
            .user_meta_int(META_MODE)
            .or_else(|| meta.user_meta_int("mode"))
        {
            Some(mode) => {
                st.mode = mode as u32;
                if st.mode & libc::S_IFMT == 0 {
                    st.mode |= if is_dir { libc::S_IFDIR } else { libc::S_IFREG };
                }
            }
            None => {
                if !is_dir {
                    st.mode &= !(libc::S_IFMT | 0o111);
                    st.mode |= libc::S_IFREG;
                }
            }
        }
        st
    }
}

/// Process-wide attribute cache.
pub struct FileManager {
    adapter: StorageAdapter,
    opts: Arc<MountOptions>,
    table: RwLock<HashMap<String, Arc<FileEntry>>>,
}

impl FileManager {
    pub fn new(adapter: StorageAdapter, opts: Arc<MountOptions>) -> Self {
        Self {
            adapter,
            opts,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Cached entry or a fresh remote probe.
    ///
    /// The probe sends the bare-key and slash-key HEADs in parallel and only
    /// pays a list call when both miss, to tell a virtual prefix apart from
    /// a missing path.
    pub async fn get(&self, path: &str) -> Result<Arc<FileEntry>> {
        if let Some(entry) = self.try_get(path) {
            return Ok(entry);
        }
        let entry = Arc::new(FileEntry::new(path));
        self.load_remote(&entry).await?;

        let size = {
            let mut table = self.table.write().unwrap();
            table.entry(path.to_string()).or_insert_with(|| entry.clone());
            table.len()
        };
        if size > self.opts.meta_capacity {
            self.gc();
        }
        // A racing insert wins; serve whatever the table now holds.
        Ok(self.try_get(path).unwrap_or(entry))
    }

    /// Cached entry without any remote traffic. Expired entries nobody else
    /// references are evicted on probe.
    pub fn try_get(&self, path: &str) -> Option<Arc<FileEntry>> {
        let now = now_s();
        let expired = {
            let table = self.table.read().unwrap();
            let entry = table.get(path)?;
            if self.expired(entry, now) && Arc::strong_count(entry) <= 1 {
                true
            } else {
                entry.hit(now);
                return Some(entry.clone());
            }
        };
        if expired {
            let mut table = self.table.write().unwrap();
            if let Some(entry) = table.get(path) {
                if self.expired(entry, now) && Arc::strong_count(entry) <= 1 {
                    table.remove(path);
                }
            }
        }
        None
    }

    /// Upsert an entry built by the caller (readdir, create).
    pub fn set(&self, path: &str, entry: Arc<FileEntry>) {
        let size = {
            let mut table = self.table.write().unwrap();
            table.insert(path.to_string(), entry);
            table.len()
        };
        if size > self.opts.meta_capacity {
            self.gc();
        }
    }

    /// Drop a path unconditionally. Called after every remote mutation.
    pub fn del(&self, path: &str) {
        self.table.write().unwrap().remove(path);
    }

    /// Evict expired entries, then the coldest entries beyond capacity.
    pub fn gc(&self) {
        let now = now_s();
        let mut expired = Vec::new();
        let mut live = Vec::new();
        {
            let table = self.table.read().unwrap();
            for entry in table.values() {
                if self.expired(entry, now) {
                    expired.push(entry.clone());
                } else {
                    live.push(entry.clone());
                }
            }
        }
        if live.len() > self.opts.meta_capacity {
            live.sort_by(|a, b| {
                b.hit_count()
                    .cmp(&a.hit_count())
                    .then(a.hit_time_s().cmp(&b.hit_time_s()))
            });
            expired.extend(live.drain(self.opts.meta_capacity..));
        }
        if expired.is_empty() {
            return;
        }
        debug!(count = expired.len(), "attribute cache eviction");
        let mut table = self.table.write().unwrap();
        for victim in expired {
            if let Some(entry) = table.get(victim.path()) {
                // Table plus our eviction clone; anything beyond is in use.
                if Arc::strong_count(entry) > 2 {
                    continue;
                }
                if Arc::ptr_eq(entry, &victim) {
                    table.remove(victim.path());
                }
            }
        }
    }

    fn expired(&self, entry: &Arc<FileEntry>, now: i64) -> bool {
        self.opts.meta_expires_s >= 0 && entry.load_time_s() + self.opts.meta_expires_s < now
    }

    /// Probe the remote store for `entry.path` and fill in the entry.
    async fn load_remote(&self, entry: &Arc<FileEntry>) -> Result<()> {
        let key = entry.path().trim_start_matches('/').to_string();
        let dir_key = format!("{key}/");
        let (bare, slashed) = tokio::join!(
            self.adapter.head_object(&key),
            self.adapter.head_object(&dir_key)
        );
        if let Some(meta) = bare? {
            entry.set_meta(meta);
            entry.set_is_dir_obj(false);
            entry.set_is_prefix(false);
            entry.set_load_time_s(now_s());
            return Ok(());
        }
        if let Some(meta) = slashed? {
            entry.set_meta(meta);
            entry.set_is_dir_obj(true);
            entry.set_is_prefix(false);
            entry.set_load_time_s(now_s());
            return Ok(());
        }
        let probe = self
            .adapter
            .list_objects(&ListRequest {
                prefix: dir_key,
                delimiter: Some("/".to_string()),
                max_keys: 2,
                marker: None,
            })
            .await?;
        if probe.objects.is_empty() && probe.common_prefixes.is_empty() {
            return Err(FsError::NotFound(entry.path().to_string()));
        }
        entry.set_is_prefix(true);
        entry.set_load_time_s(now_s());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosfs_store::MemBackend;

    fn setup(expires_s: i64, capacity: usize) -> (MemBackend, FileManager) {
        let backend = MemBackend::new();
        let adapter = StorageAdapter::new(Arc::new(backend.clone()), 1024, 2);
        let opts = Arc::new(MountOptions {
            bucket: "b".to_string(),
            meta_expires_s: expires_s,
            meta_capacity: capacity,
            mount_mode: libc::S_IFDIR | 0o750,
            mount_uid: 1000,
            mount_gid: 1000,
            ..Default::default()
        });
        (backend.clone(), FileManager::new(adapter, opts))
    }

    fn file_meta(len: u64) -> ObjectMetadata {
        let mut meta = ObjectMetadata::new();
        meta.set_content_type("text/plain");
        meta.set_content_length(len);
        meta
    }

    #[tokio::test]
    async fn get_distinguishes_file_dir_and_prefix() {
        let (backend, manager) = setup(-1, 100);
        backend.seed("f", "hello", file_meta(5));
        let mut dir_meta = ObjectMetadata::new();
        dir_meta.set_content_type(DIRECTORY_CONTENT_TYPE);
        backend.seed("d/", "", dir_meta);
        backend.seed("p/child", "x", file_meta(1));

        let f = manager.get("/f").await.unwrap();
        assert!(!f.is_dir_obj() && !f.is_prefix());

        let d = manager.get("/d").await.unwrap();
        assert!(d.is_dir_obj());

        let p = manager.get("/p").await.unwrap();
        assert!(p.is_prefix());

        assert!(matches!(
            manager.get("/missing").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn try_get_never_touches_the_remote() {
        let (backend, manager) = setup(-1, 100);
        backend.seed("f", "hello", file_meta(5));
        assert!(manager.try_get("/f").is_none());

        manager.get("/f").await.unwrap();
        let heads_after_get = backend.stats().heads.load(std::sync::atomic::Ordering::Relaxed);
        assert!(manager.try_get("/f").is_some());
        assert_eq!(
            backend.stats().heads.load(std::sync::atomic::Ordering::Relaxed),
            heads_after_get
        );
    }

    #[tokio::test]
    async fn del_forces_a_fresh_probe() {
        let (backend, manager) = setup(-1, 100);
        backend.seed("f", "hello", file_meta(5));
        manager.get("/f").await.unwrap();
        manager.del("/f");
        assert!(manager.try_get("/f").is_none());
    }

    #[tokio::test]
    async fn gc_prefers_hot_entries() {
        let (backend, manager) = setup(-1, 2);
        for name in ["a", "b", "c"] {
            backend.seed(name, "x", file_meta(1));
        }
        let hot = manager.get("/a").await.unwrap();
        let now = now_s();
        for i in 0..20 {
            hot.hit(now - 20 + i);
        }
        drop(hot);
        manager.get("/b").await.unwrap();
        manager.get("/c").await.unwrap();
        manager.gc();

        assert!(manager.try_get("/a").is_some());
        let survivors = ["/a", "/b", "/c"]
            .iter()
            .filter(|p| manager.try_get(p).is_some())
            .count();
        assert!(survivors <= 2);
    }

    #[test]
    fn hit_bitmap_counts_recent_seconds() {
        let entry = FileEntry::new("/x");
        // Far enough ahead of the construction hit to reset the window.
        let base = now_s() + 1_000;
        entry.hit(base);
        entry.hit(base + 1);
        entry.hit(base + 2);
        // Same second twice only sets one bit.
        entry.hit(base + 2);
        assert_eq!(entry.hit_count(), 3);

        // A hit more than 64 seconds later resets the window.
        entry.hit(base + 100);
        assert_eq!(entry.hit_count(), 1);
    }

    #[test]
    fn stat_uses_posix_user_meta() {
        let entry = FileEntry::new("/f");
        let mut meta = file_meta(5000);
        meta.set_user_meta(META_MODE, 0o640);
        meta.set_user_meta(META_UID, 1234);
        meta.set_user_meta(META_GID, 4321);
        meta.set_user_meta(META_MTIME, 1_700_000_000i64);
        entry.set_meta(meta);

        let opts = MountOptions {
            mount_mode: libc::S_IFDIR | 0o750,
            ..Default::default()
        };
        let st = entry.stat(&opts);
        assert_eq!(st.mode, libc::S_IFREG | 0o640);
        assert_eq!(st.uid, 1234);
        assert_eq!(st.gid, 4321);
        assert_eq!(st.mtime, 1_700_000_000);
        assert_eq!(st.size, 5000);
        assert_eq!(st.blocks, FileStat::blocks_for(5000));
    }

    #[test]
    fn stat_of_prefix_entries_uses_mount_defaults() {
        let opts = MountOptions {
            mount_mode: libc::S_IFDIR | 0o750,
            ..Default::default()
        };
        let entry = FileEntry::new("/somedir");
        entry.set_is_prefix(true);
        let st = entry.stat(&opts);
        assert!(st.is_dir());
        assert_eq!(st.size, 0);
        assert_eq!(st.blocks, ST_MINBLOCKS);
    }

    #[test]
    fn stat_marks_directory_objects() {
        let opts = MountOptions {
            mount_mode: libc::S_IFDIR | 0o750,
            ..Default::default()
        };
        let entry = FileEntry::new("/d");
        let mut meta = ObjectMetadata::new();
        meta.set_content_type(DIRECTORY_CONTENT_TYPE);
        entry.set_meta(meta);
        entry.set_is_dir_obj(true);
        assert!(entry.stat(&opts).is_dir());
    }
}
