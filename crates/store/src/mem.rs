//! In-memory object store used by tests across the workspace.
//!
//! Keeps whole objects plus their metadata in a sorted map so delimited
//! listings behave like the real service. Call counters let tests assert on
//! how the adapter drove the backend (single PUT vs multipart, batched
//! HEADs, range fan-out).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::{BucketAccess, ListChunk, ListRequest, ObjectBackend, ObjectSummary};
use crate::error::{Result, StoreError};
use crate::metadata::ObjectMetadata;

#[derive(Clone)]
struct MemObject {
    data: Bytes,
    meta: ObjectMetadata,
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<String, MemObject>,
    uploads: HashMap<String, BTreeMap<i32, Bytes>>,
    upload_meta: HashMap<String, ObjectMetadata>,
    next_upload: u64,
}

/// Request counters for assertions.
#[derive(Debug, Default)]
pub struct MemStats {
    pub heads: AtomicU64,
    pub lists: AtomicU64,
    pub range_gets: AtomicU64,
    pub puts: AtomicU64,
    pub multipart_uploads: AtomicU64,
    pub copies: AtomicU64,
    pub deletes: AtomicU64,
}

/// In-memory `ObjectBackend`.
#[derive(Clone, Default)]
pub struct MemBackend {
    state: Arc<Mutex<MemState>>,
    stats: Arc<MemStats>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request counters recorded so far.
    pub fn stats(&self) -> &MemStats {
        &self.stats
    }

    /// Install an object directly, bypassing the counters.
    pub fn seed(&self, key: &str, data: impl Into<Bytes>, meta: ObjectMetadata) {
        let mut state = self.state.lock().unwrap();
        let data = data.into();
        let mut meta = meta;
        meta.set_content_length(data.len() as u64);
        state.objects.insert(key.to_string(), MemObject { data, meta });
    }

    /// Raw bytes of a stored object.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.objects.get(key).map(|o| o.data.to_vec())
    }

    /// Metadata of a stored object.
    pub fn object_meta(&self, key: &str) -> Option<ObjectMetadata> {
        let state = self.state.lock().unwrap();
        state.objects.get(key).map(|o| o.meta.clone())
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.objects.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectBackend for MemBackend {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        self.stats.heads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().unwrap();
        Ok(state.objects.get(key).map(|o| o.meta.clone()))
    }

    async fn list_objects(&self, req: &ListRequest) -> Result<ListChunk> {
        self.stats.lists.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().unwrap();
        let mut chunk = ListChunk::default();
        let mut seen_prefixes: Vec<String> = Vec::new();
        let max = req.max_keys.max(1) as usize;
        let mut count = 0usize;
        for (key, obj) in state.objects.range(req.prefix.clone()..) {
            if !key.starts_with(&req.prefix) {
                break;
            }
            if let Some(marker) = &req.marker {
                if key <= marker {
                    continue;
                }
            }
            if count >= max {
                chunk.truncated = true;
                // Iteration is sorted, so the later of the two is the last
                // entry actually emitted on this page.
                let last_obj = chunk.objects.last().map(|o| o.key.clone());
                let last_prefix = seen_prefixes.last().cloned();
                chunk.next_marker = match (last_obj, last_prefix) {
                    (Some(o), Some(p)) => Some(o.max(p)),
                    (o, p) => o.or(p),
                };
                break;
            }
            if let Some(delim) = &req.delimiter {
                let rest = &key[req.prefix.len()..];
                if let Some(pos) = rest.find(delim.as_str()) {
                    let prefix = format!("{}{}", &key[..req.prefix.len() + pos], delim);
                    // A group already emitted as the marker must not reappear.
                    if req.marker.as_deref().is_some_and(|m| prefix.as_str() <= m) {
                        continue;
                    }
                    if seen_prefixes.last() != Some(&prefix) {
                        seen_prefixes.push(prefix);
                        count += 1;
                    }
                    continue;
                }
            }
            chunk.objects.push(ObjectSummary {
                key: key.clone(),
                size: obj.data.len() as u64,
                last_modified: obj.meta.last_modified(),
            });
            count += 1;
        }
        chunk.common_prefixes = seen_prefixes;
        Ok(chunk)
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        self.stats.range_gets.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().unwrap();
        let obj = state
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let start = (offset as usize).min(obj.data.len());
        let end = ((offset + len) as usize).min(obj.data.len());
        Ok(obj.data.slice(start..end))
    }

    async fn put_object(&self, key: &str, body: Bytes, meta: &ObjectMetadata) -> Result<()> {
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        let mut meta = meta.clone();
        meta.set_content_length(body.len() as u64);
        state
            .objects
            .insert(key.to_string(), MemObject { data: body, meta });
        Ok(())
    }

    async fn create_multipart(&self, key: &str, meta: &ObjectMetadata) -> Result<String> {
        self.stats.multipart_uploads.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.next_upload += 1;
        let upload_id = format!("upload-{}-{}", state.next_upload, key.len());
        state.uploads.insert(upload_id.clone(), BTreeMap::new());
        // Metadata is applied on completion; remember it keyed by upload id.
        state.upload_meta.insert(upload_id.clone(), meta.clone());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let parts = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))?;
        parts.insert(part_number, body);
        Ok(format!("etag-{part_number}"))
    }

    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        src_key: &str,
        offset: u64,
        len: u64,
    ) -> Result<String> {
        let body = self.get_range(src_key, offset, len).await?;
        self.upload_part(key, upload_id, part_number, body).await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::NotFound(upload_id.to_string()))?;
        if parts.len() != stored.len() {
            return Err(StoreError::Service {
                operation: "complete_multipart",
                message: format!("{} parts uploaded, {} completed", stored.len(), parts.len()),
            });
        }
        let mut data = Vec::new();
        for body in stored.values() {
            data.extend_from_slice(body);
        }
        let mut meta = state.upload_meta.remove(upload_id).unwrap_or_default();
        meta.set_content_length(data.len() as u64);
        state.objects.insert(
            key.to_string(),
            MemObject {
                data: Bytes::from(data),
                meta,
            },
        );
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.uploads.remove(upload_id);
        state.upload_meta.remove(upload_id);
        Ok(())
    }

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        replace_meta: Option<&ObjectMetadata>,
        storage_class: Option<&str>,
    ) -> Result<()> {
        self.stats.copies.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        let src = state
            .objects
            .get(src_key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(src_key.to_string()))?;
        let mut meta = replace_meta.cloned().unwrap_or_else(|| src.meta.clone());
        meta.set_content_length(src.data.len() as u64);
        if let Some(class) = storage_class {
            meta.set_storage_class(class);
        }
        state.objects.insert(
            dst_key.to_string(),
            MemObject {
                data: src.data,
                meta,
            },
        );
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.objects.remove(key);
        Ok(())
    }

    async fn bucket_location(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn create_bucket(&self) -> Result<()> {
        Ok(())
    }

    async fn bucket_acl(&self) -> Result<BucketAccess> {
        Ok(BucketAccess {
            can_read: true,
            can_write: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ObjectMetadata {
        ObjectMetadata::new()
    }

    #[tokio::test]
    async fn delimited_listing_groups_prefixes() {
        let backend = MemBackend::new();
        backend.seed("dir/a", "1", meta());
        backend.seed("dir/b", "2", meta());
        backend.seed("dir/sub/c", "3", meta());
        backend.seed("other", "4", meta());

        let chunk = backend
            .list_objects(&ListRequest {
                prefix: "dir/".to_string(),
                delimiter: Some("/".to_string()),
                max_keys: 1000,
                marker: None,
            })
            .await
            .unwrap();
        let keys: Vec<_> = chunk.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["dir/a", "dir/b"]);
        assert_eq!(chunk.common_prefixes, ["dir/sub/"]);
        assert!(!chunk.truncated);
    }

    #[tokio::test]
    async fn listing_paginates_with_marker() {
        let backend = MemBackend::new();
        for name in ["p/a", "p/b", "p/c"] {
            backend.seed(name, "x", meta());
        }
        let first = backend
            .list_objects(&ListRequest {
                prefix: "p/".to_string(),
                delimiter: Some("/".to_string()),
                max_keys: 2,
                marker: None,
            })
            .await
            .unwrap();
        assert_eq!(first.objects.len(), 2);
        assert!(first.truncated);

        let second = backend
            .list_objects(&ListRequest {
                prefix: "p/".to_string(),
                delimiter: Some("/".to_string()),
                max_keys: 2,
                marker: first.next_marker.clone(),
            })
            .await
            .unwrap();
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["p/c"]);
        assert!(!second.truncated);
    }

    #[tokio::test]
    async fn multipart_assembles_in_part_order() {
        let backend = MemBackend::new();
        let id = backend.create_multipart("big", &meta()).await.unwrap();
        let e2 = backend
            .upload_part("big", &id, 2, Bytes::from("world"))
            .await
            .unwrap();
        let e1 = backend
            .upload_part("big", &id, 1, Bytes::from("hello "))
            .await
            .unwrap();
        backend
            .complete_multipart("big", &id, vec![(1, e1), (2, e2)])
            .await
            .unwrap();
        assert_eq!(backend.object("big").unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn copy_replaces_metadata_when_asked() {
        let backend = MemBackend::new();
        let mut m = meta();
        m.set_user_meta("bosfs-mode", 0o644);
        backend.seed("src", "data", m);

        let mut replacement = meta();
        replacement.set_user_meta("bosfs-mode", 0o600);
        backend
            .copy_object("src", "src", Some(&replacement), None)
            .await
            .unwrap();
        let updated = backend.object_meta("src").unwrap();
        assert_eq!(updated.user_meta("bosfs-mode"), Some("384"));
        assert_eq!(backend.object("src").unwrap(), b"data");
    }
}
