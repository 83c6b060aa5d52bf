//! Mount options and their validation.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{FsError, Result};

/// Default soft capacity of the attribute cache.
pub const DEFAULT_META_CAPACITY: usize = 100_000;
/// Default multipart part size.
pub const DEFAULT_MULTIPART_SIZE: u64 = 10 * 1024 * 1024;
/// Default single-PUT cutoff.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
/// Default concurrent parts per transfer.
pub const DEFAULT_MULTIPART_PARALLEL: usize = 10;

/// Everything the mount needs to know, assembled by the CLI and frozen
/// before the filesystem starts serving.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Bucket name (without any key prefix).
    pub bucket: String,
    /// Key prefix inside the bucket; empty or `"sub/dir/"` with a trailing
    /// slash after validation.
    pub bucket_prefix: String,
    pub endpoint: String,
    pub ak: String,
    pub sk: String,
    pub sts_token: Option<String>,
    /// `STANDARD` or `STANDARD_IA` when set; applied to every upload.
    pub storage_class: Option<String>,

    /// Persistent cache root; `None` forces tmp files for every open.
    pub cache_dir: Option<PathBuf>,
    /// Scratch directory for tmp files.
    pub tmp_dir: PathBuf,
    /// Attribute expiry in seconds; negative means never expire.
    pub meta_expires_s: i64,
    /// Attribute cache soft capacity.
    pub meta_capacity: usize,

    pub multipart_size: u64,
    pub multipart_threshold: u64,
    pub multipart_parallel: usize,

    /// Effective uid/gid/mode/time of the mount itself.
    pub mount_uid: u32,
    pub mount_gid: u32,
    pub mount_mode: u32,
    pub mount_time: i64,
    pub mount_umask: u32,
    pub allow_other: bool,

    /// Overrides presented to clients instead of stored attributes.
    pub bosfs_uid: Option<u32>,
    pub bosfs_gid: Option<u32>,
    pub bosfs_mask: Option<u32>,

    pub remove_cache: bool,
    pub create_bucket: bool,
    /// Create the directory object for a missing mount prefix.
    pub create_prefix: bool,

    /// Remote client timeout in seconds.
    pub client_timeout_s: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            bucket_prefix: String::new(),
            endpoint: String::new(),
            ak: String::new(),
            sk: String::new(),
            sts_token: None,
            storage_class: None,
            cache_dir: None,
            tmp_dir: PathBuf::from("/tmp"),
            meta_expires_s: -1,
            meta_capacity: DEFAULT_META_CAPACITY,
            multipart_size: DEFAULT_MULTIPART_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            multipart_parallel: DEFAULT_MULTIPART_PARALLEL,
            mount_uid: 0,
            mount_gid: 0,
            mount_mode: 0,
            mount_time: 0,
            mount_umask: 0o022,
            allow_other: false,
            bosfs_uid: None,
            bosfs_gid: None,
            bosfs_mask: None,
            remove_cache: false,
            create_bucket: false,
            create_prefix: false,
            client_timeout_s: 1200,
        }
    }
}

impl MountOptions {
    /// Validate and normalise the options in place.
    ///
    /// Fixes the prefix's trailing slash, records the mounting process's
    /// uid/gid/time and computes the mount mode. Must run before anything
    /// else reads the options.
    pub fn finalize(&mut self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(FsError::Invalid("missing bucket argument".to_string()));
        }
        if self
            .bucket
            .contains(['/', ':', '\\', ';', '!', '@', '#', '$', '%', '^', '&', '*', '?'])
        {
            return Err(FsError::Invalid(format!(
                "bucket name {} contains an illegal character",
                self.bucket
            )));
        }
        if !self.bucket_prefix.is_empty() && !self.bucket_prefix.ends_with('/') {
            self.bucket_prefix.push('/');
        }
        if let Some(class) = &self.storage_class {
            if class != "STANDARD" && class != "STANDARD_IA" {
                return Err(FsError::Invalid(format!("invalid storage class: {class}")));
            }
        }
        if self.multipart_size == 0 || self.multipart_parallel == 0 {
            return Err(FsError::Invalid(
                "multipart size and parallelism must be positive".to_string(),
            ));
        }

        self.mount_uid = unsafe { libc::geteuid() };
        self.mount_gid = unsafe { libc::getegid() };
        self.mount_mode = libc::S_IFDIR
            | if self.allow_other {
                !self.mount_umask & 0o777
            } else {
                libc::S_IRWXU
            };
        self.mount_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(())
    }

    /// The default reserved free-disk bytes for cache loads.
    pub fn reserved_disk_space(&self) -> u64 {
        self.multipart_size * self.multipart_parallel as u64
    }

    /// uid presented to clients, after any override.
    pub fn default_uid(&self) -> u32 {
        self.bosfs_uid.unwrap_or(self.mount_uid)
    }

    /// gid presented to clients, after any override.
    pub fn default_gid(&self) -> u32 {
        self.bosfs_gid.unwrap_or(self.mount_gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_normalises_prefix_and_mode() {
        let mut opts = MountOptions {
            bucket: "data".to_string(),
            bucket_prefix: "sub/dir".to_string(),
            ..Default::default()
        };
        opts.finalize().unwrap();
        assert_eq!(opts.bucket_prefix, "sub/dir/");
        assert_eq!(opts.mount_mode & libc::S_IFMT, libc::S_IFDIR);
        assert_eq!(opts.mount_mode & 0o777, 0o700);
    }

    #[test]
    fn finalize_rejects_bad_input() {
        let mut opts = MountOptions::default();
        assert!(opts.finalize().is_err());

        opts.bucket = "bad/name".to_string();
        assert!(opts.finalize().is_err());

        opts.bucket = "ok".to_string();
        opts.storage_class = Some("GLACIER".to_string());
        assert!(opts.finalize().is_err());
    }

    #[test]
    fn allow_other_applies_umask() {
        let mut opts = MountOptions {
            bucket: "b".to_string(),
            allow_other: true,
            mount_umask: 0o022,
            ..Default::default()
        };
        opts.finalize().unwrap();
        assert_eq!(opts.mount_mode & 0o777, 0o755);
    }
}
