//! The on-disk range index, held under an exclusive advisory lock.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use tracing::debug;

use crate::cache::CacheConfig;
use crate::error::{FsError, Result};

/// One remote path's stat cache file, locked for the lifetime of this value.
///
/// The lock is a whole-file `flock` in exclusive mode, so two entities (in
/// this or another process) can never serialise or parse the same index
/// concurrently. Dropping the value unlocks and closes.
pub struct StatCacheFile {
    path: PathBuf,
    file: Option<File>,
}

impl StatCacheFile {
    /// Open and lock the stat file for `remote_path`, creating the file and
    /// its parent directories as needed.
    pub fn open(config: &CacheConfig, remote_path: &str) -> Result<Self> {
        let Some(path) = config.stat_file_path(remote_path, true)? else {
            return Err(FsError::Invalid(
                "no cache directory configured".to_string(),
            ));
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)?;
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        file.seek(SeekFrom::Start(0))?;
        debug!(remote_path, stat_file = %path.display(), "range index locked");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// The locked file, positioned wherever the last operation left it.
    pub fn file_mut(&mut self) -> &mut File {
        self.file.as_mut().expect("stat cache file is open")
    }

    /// Unlock and close early.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } != 0 {
                debug!(stat_file = %self.path.display(), "unlock failed");
            }
        }
    }
}

impl Drop for StatCacheFile {
    fn drop(&mut self) {
        self.release();
    }
}
