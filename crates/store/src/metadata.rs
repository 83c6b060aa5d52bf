//! Object metadata as bosfs sees it.
//!
//! POSIX attributes ride along with each object in its user metadata under
//! the `bosfs-*` keys; everything else (content type, length, mtime, storage
//! class) comes from the standard object headers.

use std::collections::BTreeMap;

/// User-metadata key holding the file mtime (unix seconds).
pub const META_MTIME: &str = "bosfs-mtime";
/// User-metadata key holding the file mode (octal integer text).
pub const META_MODE: &str = "bosfs-mode";
/// User-metadata key holding the owner uid.
pub const META_UID: &str = "bosfs-uid";
/// User-metadata key holding the owner gid.
pub const META_GID: &str = "bosfs-gid";
/// User-metadata key holding the serialised extended attributes.
pub const META_XATTR: &str = "bosfs-xattr";

/// Metadata of one remote object.
///
/// Copied in from HEAD/GET responses and mutated through the setters before
/// uploads and copy-in-place metadata updates. The user-meta map is ordered
/// so serialised requests are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    content_type: Option<String>,
    content_length: u64,
    last_modified: i64,
    storage_class: Option<String>,
    user_meta: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Content type, with any `; charset=` suffix still attached.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    /// Object size in bytes as reported by the store.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn set_content_length(&mut self, len: u64) {
        self.content_length = len;
    }

    /// Last-modified time in unix seconds.
    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    pub fn set_last_modified(&mut self, secs: i64) {
        self.last_modified = secs;
    }

    pub fn storage_class(&self) -> Option<&str> {
        self.storage_class.as_deref()
    }

    pub fn set_storage_class(&mut self, class: impl Into<String>) {
        self.storage_class = Some(class.into());
    }

    /// Look up one user-metadata value.
    pub fn user_meta(&self, key: &str) -> Option<&str> {
        self.user_meta.get(key).map(String::as_str)
    }

    /// Insert or replace one user-metadata value.
    pub fn set_user_meta(&mut self, key: impl Into<String>, value: impl ToString) {
        self.user_meta.insert(key.into(), value.to_string());
    }

    pub fn remove_user_meta(&mut self, key: &str) {
        self.user_meta.remove(key);
    }

    /// The whole user-metadata map, for request assembly.
    pub fn user_meta_map(&self) -> &BTreeMap<String, String> {
        &self.user_meta
    }

    /// Parse a user-metadata value as an integer, accepting octal with a
    /// leading zero the way the original attribute encoding wrote modes.
    pub fn user_meta_int(&self, key: &str) -> Option<i64> {
        let raw = self.user_meta(key)?.trim();
        if let Some(oct) = raw.strip_prefix("0o") {
            i64::from_str_radix(oct, 8).ok()
        } else if raw.len() > 1 && raw.starts_with('0') {
            i64::from_str_radix(&raw[1..], 8).ok()
        } else {
            raw.parse().ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_meta_int_accepts_decimal_and_octal() {
        let mut meta = ObjectMetadata::new();
        meta.set_user_meta(META_MODE, 0o644);
        assert_eq!(meta.user_meta_int(META_MODE), Some(420));

        meta.set_user_meta(META_MODE, "0644");
        assert_eq!(meta.user_meta_int(META_MODE), Some(0o644));

        meta.set_user_meta(META_MODE, "0o755");
        assert_eq!(meta.user_meta_int(META_MODE), Some(0o755));
    }

    #[test]
    fn setters_round_trip() {
        let mut meta = ObjectMetadata::new();
        meta.set_content_type("application/x-directory");
        meta.set_content_length(42);
        meta.set_last_modified(1_700_000_000);
        meta.set_user_meta(META_UID, 1000);
        assert_eq!(meta.content_type(), Some("application/x-directory"));
        assert_eq!(meta.content_length(), 42);
        assert_eq!(meta.user_meta(META_UID), Some("1000"));
        meta.remove_user_meta(META_UID);
        assert_eq!(meta.user_meta(META_UID), None);
    }
}
