//! The narrow contract the core consumes from an object store.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::metadata::ObjectMetadata;

/// One page of a delimited listing.
#[derive(Debug, Clone)]
pub struct ListRequest {
    /// Key prefix to list under.
    pub prefix: String,
    /// Delimiter, normally `"/"` for directory emulation; `None` lists the
    /// whole subtree flat.
    pub delimiter: Option<String>,
    /// Page size; the service may return fewer.
    pub max_keys: i32,
    /// Continuation marker from the previous page.
    pub marker: Option<String>,
}

/// Summary of one listed object.
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: i64,
}

/// Result page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListChunk {
    pub objects: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub next_marker: Option<String>,
    pub truncated: bool,
}

/// Bucket-level permissions derived from the bucket ACL.
#[derive(Debug, Clone, Copy)]
pub struct BucketAccess {
    pub can_read: bool,
    pub can_write: bool,
}

/// Raw object-store operations.
///
/// Implementations must be cheap to clone through `Arc` and safe to call
/// concurrently; the adapter fans requests out over them. A missing key is
/// reported as `Ok(None)` by `head_object` and as `StoreError::NotFound` by
/// the operations that require the key to exist.
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// HEAD one key. `Ok(None)` means 404.
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>>;

    /// List one page of keys.
    async fn list_objects(&self, req: &ListRequest) -> Result<ListChunk>;

    /// GET `len` bytes starting at `offset`.
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes>;

    /// Single-shot PUT.
    async fn put_object(&self, key: &str, body: Bytes, meta: &ObjectMetadata) -> Result<()>;

    /// Begin a multipart upload; returns the upload id.
    async fn create_multipart(&self, key: &str, meta: &ObjectMetadata) -> Result<String>;

    /// Upload one part; returns its etag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String>;

    /// Server-side copy of a source byte range into one part.
    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        src_key: &str,
        offset: u64,
        len: u64,
    ) -> Result<String>;

    /// Complete a multipart upload from `(part_number, etag)` pairs.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<()>;

    /// Abort a multipart upload, releasing stored parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Server-side copy. With `replace_meta` set the destination gets the
    /// given metadata instead of the source's (the copy-in-place metadata
    /// update when `src == dst`).
    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        replace_meta: Option<&ObjectMetadata>,
        storage_class: Option<&str>,
    ) -> Result<()>;

    /// DELETE one key. Deleting a missing key is not an error.
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Location (region) of the bucket; also the existence probe at mount.
    async fn bucket_location(&self) -> Result<String>;

    /// Create the bucket.
    async fn create_bucket(&self) -> Result<()>;

    /// Effective read/write permission from the bucket ACL.
    async fn bucket_acl(&self) -> Result<BucketAccess>;
}
