//! Disk-backed data cache: per-object cache entities, their registry, and
//! the persisted range index.

mod data_cache;
mod entity;
mod stat_file;

pub use data_cache::DataCache;
pub use entity::{CacheEntity, LocalStats};
pub use stat_file::StatCacheFile;

use std::path::{Path, PathBuf};

use crate::config::MountOptions;
use crate::error::Result;

/// On-disk layout and reservation policy shared between the registry and
/// its entities.
#[derive(Debug)]
pub struct CacheConfig {
    bucket: String,
    cache_dir: Option<PathBuf>,
    tmp_dir: PathBuf,
    reserved_bytes: u64,
}

impl CacheConfig {
    pub fn new(opts: &MountOptions) -> Self {
        Self {
            bucket: opts.bucket.clone(),
            cache_dir: opts.cache_dir.clone(),
            tmp_dir: opts.tmp_dir.clone(),
            reserved_bytes: opts.reserved_disk_space(),
        }
    }

    /// Whether a persistent cache directory is configured.
    pub fn has_cache_dir(&self) -> bool {
        self.cache_dir.is_some()
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Free bytes that must stay available on the cache filesystem beyond
    /// any load being admitted.
    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    /// The directory whose filesystem backs local data for an entity.
    pub fn backing_dir(&self, is_tmpfile: bool) -> &Path {
        if is_tmpfile {
            &self.tmp_dir
        } else {
            self.cache_dir.as_deref().unwrap_or(&self.tmp_dir)
        }
    }

    /// Canonical cache file path for `path` (`<cache_dir>/<bucket><path>`),
    /// or `None` without a cache directory. Creates parent directories on
    /// request.
    pub fn cache_file_path(&self, path: &str, create_dirs: bool) -> Result<Option<PathBuf>> {
        let Some(cache_dir) = &self.cache_dir else {
            return Ok(None);
        };
        let full = join_rooted(&cache_dir.join(&self.bucket), path);
        if create_dirs {
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Some(full))
    }

    /// The mirror directory (`<cache_dir>/<bucket>.mirror`).
    pub fn mirror_dir(&self, create: bool) -> Result<Option<PathBuf>> {
        let Some(cache_dir) = &self.cache_dir else {
            return Ok(None);
        };
        let dir = cache_dir.join(format!("{}.mirror", self.bucket));
        if create {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Some(dir))
    }

    /// Range-index file path for `path` (`<cache_dir>/.<bucket>.stat<path>`).
    pub fn stat_file_path(&self, path: &str, create_dirs: bool) -> Result<Option<PathBuf>> {
        let Some(cache_dir) = &self.cache_dir else {
            return Ok(None);
        };
        let full = join_rooted(&cache_dir.join(format!(".{}.stat", self.bucket)), path);
        if create_dirs {
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Some(full))
    }

    /// Remove every cached byte and range index. Used by the
    /// `remove_cache` mount option.
    pub fn wipe(&self) -> Result<()> {
        for dir in [
            self.cache_file_path("", false)?,
            self.stat_file_path("", false)?,
            self.mirror_dir(false)?,
        ]
        .into_iter()
        .flatten()
        {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Append an absolute mount path under a root directory.
fn join_rooted(root: &Path, path: &str) -> PathBuf {
    let mut full = root.as_os_str().to_owned();
    full.push(path);
    PathBuf::from(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cache_dir: Option<&Path>) -> CacheConfig {
        let opts = MountOptions {
            bucket: "data".to_string(),
            cache_dir: cache_dir.map(Path::to_path_buf),
            ..Default::default()
        };
        CacheConfig::new(&opts)
    }

    #[test]
    fn layout_paths_follow_the_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(Some(tmp.path()));
        let cache = config.cache_file_path("/a/b.txt", false).unwrap().unwrap();
        assert_eq!(cache, tmp.path().join("data").join("a/b.txt"));
        let stat = config.stat_file_path("/a/b.txt", false).unwrap().unwrap();
        assert_eq!(stat, tmp.path().join(".data.stat").join("a/b.txt"));
        let mirror = config.mirror_dir(false).unwrap().unwrap();
        assert_eq!(mirror, tmp.path().join("data.mirror"));
    }

    #[test]
    fn no_cache_dir_disables_layout() {
        let config = config(None);
        assert!(config.cache_file_path("/x", false).unwrap().is_none());
        assert!(config.stat_file_path("/x", false).unwrap().is_none());
        assert!(!config.has_cache_dir());
    }

    #[test]
    fn create_dirs_builds_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(Some(tmp.path()));
        let file = config
            .cache_file_path("/deep/nested/file", true)
            .unwrap()
            .unwrap();
        assert!(file.parent().unwrap().is_dir());
    }
}
