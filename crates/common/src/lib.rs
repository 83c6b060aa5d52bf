//! Core engine of bosfs: the page-range index, the disk-backed data cache,
//! the attribute cache, and the path-based filesystem facade the FUSE
//! daemon drives.

pub mod access;
pub mod cache;
pub mod config;
pub mod error;
pub mod file_manager;
pub mod fs;
pub mod mime;
pub mod page_list;
pub mod stat;
pub mod xattr;

pub use access::RequestContext;
pub use config::MountOptions;
pub use error::{FsError, Result};
pub use fs::{DirEntry, FileHandle, FsCore, StatFs};
pub use stat::FileStat;
