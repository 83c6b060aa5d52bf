//! Shared setup for the mount-engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use ::common::{FsCore, MountOptions, RequestContext};
use bosfs_store::{
    MemBackend, ObjectMetadata, StorageAdapter, META_GID, META_MODE, META_MTIME, META_UID,
};
use tempfile::TempDir;

/// A mounted core over an in-memory store plus its scratch space.
pub struct TestFs {
    pub core: Arc<FsCore>,
    pub backend: MemBackend,
    pub dir: TempDir,
}

/// Small transfer geometry so multipart behaviour is testable with a few
/// bytes: parts of 16, four in flight, single-PUT below 64.
pub fn test_options(dir: &TempDir) -> MountOptions {
    let cache_dir = dir.path().join("cache");
    let tmp_dir = dir.path().join("tmp");
    std::fs::create_dir_all(&cache_dir).unwrap();
    std::fs::create_dir_all(&tmp_dir).unwrap();
    MountOptions {
        bucket: "test-bucket".to_string(),
        cache_dir: Some(cache_dir),
        tmp_dir,
        multipart_size: 16,
        multipart_parallel: 4,
        multipart_threshold: 64,
        mount_mode: libc::S_IFDIR | 0o755,
        mount_uid: 1000,
        mount_gid: 1000,
        mount_time: 1_600_000_000,
        ..Default::default()
    }
}

pub fn build(opts: MountOptions, dir: TempDir) -> TestFs {
    let backend = MemBackend::new();
    let adapter = StorageAdapter::new(
        Arc::new(backend.clone()),
        opts.multipart_size,
        opts.multipart_parallel,
    );
    let core = Arc::new(FsCore::new(adapter, Arc::new(opts)));
    TestFs { core, backend, dir }
}

pub fn setup() -> TestFs {
    let dir = TempDir::new().unwrap();
    let opts = test_options(&dir);
    build(opts, dir)
}

/// Root bypasses permission checks; most tests want the operation itself.
pub fn root() -> RequestContext {
    RequestContext { uid: 0, gid: 0 }
}

pub fn user(uid: u32, gid: u32) -> RequestContext {
    RequestContext { uid, gid }
}

/// Object metadata the way the mount itself would have written it.
pub fn file_meta(mode: u32, mtime: i64) -> ObjectMetadata {
    let mut meta = ObjectMetadata::new();
    meta.set_content_type("text/plain");
    meta.set_user_meta(META_MODE, libc::S_IFREG | mode);
    meta.set_user_meta(META_UID, 1000);
    meta.set_user_meta(META_GID, 1000);
    meta.set_user_meta(META_MTIME, mtime);
    meta
}

pub fn dir_meta() -> ObjectMetadata {
    let mut meta = ObjectMetadata::new();
    meta.set_content_type("application/x-directory");
    meta.set_user_meta(META_MODE, libc::S_IFDIR | 0o755);
    meta.set_user_meta(META_UID, 1000);
    meta.set_user_meta(META_GID, 1000);
    meta
}
