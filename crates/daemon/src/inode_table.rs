//! Inode ↔ path mapping.
//!
//! The kernel talks in inodes, the core in paths. Inode 1 is the mount
//! root; everything else is allocated on first lookup and retired when the
//! kernel forgets the entry or the path is removed.

use std::collections::HashMap;

/// Bidirectional inode/path table.
pub struct InodeTable {
    by_path: HashMap<String, u64>,
    by_inode: HashMap<u64, String>,
    next: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            by_path: HashMap::new(),
            by_inode: HashMap::new(),
            next: 2,
        };
        table.by_path.insert("/".to_string(), 1);
        table.by_inode.insert(1, "/".to_string());
        table
    }

    /// The inode for `path`, allocating one if needed.
    pub fn assign(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_path.insert(path.to_string(), ino);
        self.by_inode.insert(ino, path.to_string());
        ino
    }

    /// The path behind an inode.
    pub fn path_of(&self, ino: u64) -> Option<&str> {
        self.by_inode.get(&ino).map(String::as_str)
    }

    /// The kernel path of `name` inside the directory `parent`.
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let dir = self.path_of(parent)?;
        Some(if dir == "/" {
            format!("/{name}")
        } else {
            format!("{dir}/{name}")
        })
    }

    /// Drop the mapping for a removed path.
    pub fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.by_path.remove(path) {
            self.by_inode.remove(&ino);
        }
    }

    /// Move a mapping for a renamed path, keeping its inode stable.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(ino) = self.by_path.remove(from) {
            self.by_path.insert(to.to_string(), ino);
            self.by_inode.insert(ino, to.to_string());
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_inode_one() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(1), Some("/"));
    }

    #[test]
    fn assign_is_stable_per_path() {
        let mut table = InodeTable::new();
        let a = table.assign("/a");
        assert_eq!(table.assign("/a"), a);
        assert_ne!(table.assign("/b"), a);
        assert_eq!(table.path_of(a), Some("/a"));
    }

    #[test]
    fn child_paths_join_under_root_and_dirs() {
        let mut table = InodeTable::new();
        assert_eq!(table.child_path(1, "f").unwrap(), "/f");
        let d = table.assign("/d");
        assert_eq!(table.child_path(d, "f").unwrap(), "/d/f");
    }

    #[test]
    fn rename_keeps_the_inode() {
        let mut table = InodeTable::new();
        let ino = table.assign("/old");
        table.rename("/old", "/new");
        assert_eq!(table.path_of(ino), Some("/new"));
        assert_eq!(table.assign("/new"), ino);
    }

    #[test]
    fn forget_removes_both_directions() {
        let mut table = InodeTable::new();
        let ino = table.assign("/gone");
        table.forget_path("/gone");
        assert!(table.path_of(ino).is_none());
        assert_ne!(table.assign("/gone"), ino);
    }
}
