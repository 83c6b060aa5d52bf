//! Composite storage operations consumed by the cache engine.
//!
//! The adapter owns the multipart geometry (part size, parallelism,
//! single-PUT threshold) and turns the engine's needs — fault a byte range
//! into a cache file, flush a cache file back, stat many keys at once — into
//! fan-outs over the raw [`ObjectBackend`].

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::backend::{BucketAccess, ListChunk, ListRequest, ObjectBackend};
use crate::error::{Result, StoreError};
use crate::metadata::ObjectMetadata;

/// Maximum HEAD requests in flight during a batched stat.
const HEAD_BATCH_CONCURRENCY: usize = 100;

/// Façade over one bucket's backend plus the transfer geometry.
#[derive(Clone)]
pub struct StorageAdapter {
    backend: Arc<dyn ObjectBackend>,
    multipart_size: u64,
    multipart_parallel: usize,
}

impl StorageAdapter {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        multipart_size: u64,
        multipart_parallel: usize,
    ) -> Self {
        Self {
            backend,
            multipart_size: multipart_size.max(1),
            multipart_parallel: multipart_parallel.max(1),
        }
    }

    /// Part size used for multipart transfers and download splitting.
    pub fn multipart_size(&self) -> u64 {
        self.multipart_size
    }

    /// Concurrent parts per multipart transfer.
    pub fn multipart_parallel(&self) -> usize {
        self.multipart_parallel
    }

    /// HEAD one key; `Ok(None)` is a plain 404.
    pub async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        self.backend.head_object(key).await
    }

    /// HEAD many keys with bounded concurrency, results in input order.
    pub async fn head_many(
        &self,
        keys: Vec<String>,
    ) -> Vec<(String, Result<Option<ObjectMetadata>>)> {
        futures::stream::iter(keys.into_iter().map(|key| {
            let backend = self.backend.clone();
            async move {
                let res = backend.head_object(&key).await;
                (key, res)
            }
        }))
        .buffered(HEAD_BATCH_CONCURRENCY)
        .collect()
        .await
    }

    /// One page of a delimited listing.
    pub async fn list_objects(&self, req: &ListRequest) -> Result<ListChunk> {
        self.backend.list_objects(req).await
    }

    /// List every key under `prefix`, following continuation markers.
    pub async fn list_all_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut marker = None;
        loop {
            let chunk = self
                .backend
                .list_objects(&ListRequest {
                    prefix: prefix.to_string(),
                    delimiter: None,
                    max_keys: 1000,
                    marker: marker.clone(),
                })
                .await?;
            keys.extend(chunk.objects.into_iter().map(|o| o.key));
            if !chunk.truncated || chunk.next_marker.is_none() {
                break;
            }
            marker = chunk.next_marker;
        }
        Ok(keys)
    }

    /// Download `[offset, offset+len)` of `key` into `file` at the same
    /// offsets. The range is split by part size and fetched with bounded
    /// concurrency; parts land via positioned writes as they arrive.
    pub async fn parallel_download(
        &self,
        key: &str,
        file: &File,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        debug!(key, offset, len, "parallel download");
        let mut parts = Vec::new();
        let mut cursor = offset;
        let end = offset + len;
        while cursor < end {
            let n = self.multipart_size.min(end - cursor);
            parts.push((cursor, n));
            cursor += n;
        }
        let mut stream = futures::stream::iter(parts.into_iter().map(|(part_off, part_len)| {
            let backend = self.backend.clone();
            let key = key.to_string();
            async move {
                backend
                    .get_range(&key, part_off, part_len)
                    .await
                    .map(|bytes| (part_off, bytes))
            }
        }))
        .buffer_unordered(self.multipart_parallel);
        while let Some(part) = stream.next().await {
            let (part_off, bytes) = part?;
            file.write_all_at(&bytes, part_off)?;
        }
        Ok(())
    }

    /// Upload the first `size` bytes of `file` as a single PUT.
    pub async fn upload_file(
        &self,
        key: &str,
        file: &File,
        size: u64,
        meta: &ObjectMetadata,
    ) -> Result<()> {
        let mut buf = vec![0u8; size as usize];
        file.read_exact_at(&mut buf, 0)?;
        self.backend.put_object(key, Bytes::from(buf), meta).await
    }

    /// Upload the first `size` bytes of `file` as a multipart upload with
    /// the configured geometry; aborted on any part failure.
    pub async fn upload_super_file(
        &self,
        key: &str,
        file: &File,
        size: u64,
        meta: &ObjectMetadata,
    ) -> Result<()> {
        let upload_id = self.backend.create_multipart(key, meta).await?;
        let mut parts = Vec::new();
        let mut cursor = 0u64;
        let mut number = 1i32;
        while cursor < size {
            let n = self.multipart_size.min(size - cursor);
            parts.push((number, cursor, n));
            cursor += n;
            number += 1;
        }
        let uploads = futures::stream::iter(parts.into_iter().map(|(number, part_off, n)| {
            let backend = self.backend.clone();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            let mut buf = vec![0u8; n as usize];
            let read = file.read_exact_at(&mut buf, part_off);
            async move {
                read?;
                let etag = backend
                    .upload_part(&key, &upload_id, number, Bytes::from(buf))
                    .await?;
                Ok::<_, StoreError>((number, etag))
            }
        }))
        .buffered(self.multipart_parallel)
        .collect::<Vec<_>>()
        .await;

        let mut etags = Vec::with_capacity(uploads.len());
        for part in uploads {
            match part {
                Ok(pair) => etags.push(pair),
                Err(err) => {
                    if let Err(abort_err) = self.backend.abort_multipart(key, &upload_id).await {
                        warn!(key, error = %abort_err, "abort of failed multipart upload failed");
                    }
                    return Err(err);
                }
            }
        }
        self.backend.complete_multipart(key, &upload_id, etags).await
    }

    /// Server-side copy of a whole object, optionally replacing metadata.
    pub async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        replace_meta: Option<&ObjectMetadata>,
        storage_class: Option<&str>,
    ) -> Result<()> {
        self.backend
            .copy_object(src_key, dst_key, replace_meta, storage_class)
            .await
    }

    /// Server-side copy of a large object via ranged part copies.
    pub async fn parallel_copy(
        &self,
        src_key: &str,
        dst_key: &str,
        storage_class: Option<&str>,
    ) -> Result<()> {
        let meta = self
            .backend
            .head_object(src_key)
            .await?
            .ok_or_else(|| StoreError::NotFound(src_key.to_string()))?;
        let size = meta.content_length();
        if size <= self.multipart_size {
            return self
                .backend
                .copy_object(src_key, dst_key, None, storage_class)
                .await;
        }
        let mut upload_meta = meta.clone();
        if let Some(class) = storage_class {
            upload_meta.set_storage_class(class);
        }
        let upload_id = self.backend.create_multipart(dst_key, &upload_meta).await?;
        let mut parts = Vec::new();
        let mut cursor = 0u64;
        let mut number = 1i32;
        while cursor < size {
            let n = self.multipart_size.min(size - cursor);
            parts.push((number, cursor, n));
            cursor += n;
            number += 1;
        }
        let copies = futures::stream::iter(parts.into_iter().map(|(number, part_off, n)| {
            let backend = self.backend.clone();
            let src = src_key.to_string();
            let dst = dst_key.to_string();
            let upload_id = upload_id.clone();
            async move {
                let etag = backend
                    .upload_part_copy(&dst, &upload_id, number, &src, part_off, n)
                    .await?;
                Ok::<_, StoreError>((number, etag))
            }
        }))
        .buffered(self.multipart_parallel)
        .collect::<Vec<_>>()
        .await;
        let mut etags = Vec::with_capacity(copies.len());
        for part in copies {
            match part {
                Ok(pair) => etags.push(pair),
                Err(err) => {
                    if let Err(abort_err) = self.backend.abort_multipart(dst_key, &upload_id).await
                    {
                        warn!(dst_key, error = %abort_err, "abort of failed parallel copy failed");
                    }
                    return Err(err);
                }
            }
        }
        self.backend
            .complete_multipart(dst_key, &upload_id, etags)
            .await
    }

    /// Single-shot PUT of in-memory bytes.
    pub async fn put_object(&self, key: &str, body: Bytes, meta: &ObjectMetadata) -> Result<()> {
        self.backend.put_object(key, body, meta).await
    }

    /// DELETE one key; missing keys are tolerated.
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.backend.delete_object(key).await
    }

    /// Mount-time bucket probes.
    pub async fn bucket_location(&self) -> Result<String> {
        self.backend.bucket_location().await
    }

    pub async fn create_bucket(&self) -> Result<()> {
        self.backend.create_bucket().await
    }

    pub async fn bucket_acl(&self) -> Result<BucketAccess> {
        self.backend.bucket_acl().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemBackend;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::atomic::Ordering;

    fn adapter(backend: &MemBackend, part_size: u64, parallel: usize) -> StorageAdapter {
        StorageAdapter::new(Arc::new(backend.clone()), part_size, parallel)
    }

    #[tokio::test]
    async fn parallel_download_splits_by_part_size() {
        let backend = MemBackend::new();
        let body: Vec<u8> = (0..100u8).collect();
        backend.seed("obj", body.clone(), ObjectMetadata::new());

        let adapter = adapter(&backend, 16, 4);
        let mut file = tempfile::tempfile().unwrap();
        adapter
            .parallel_download("obj", &file, 0, 100)
            .await
            .unwrap();

        let mut out = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut out).unwrap();
        assert_eq!(out, body);
        // 100 bytes in 16-byte parts is 7 ranged GETs.
        assert_eq!(backend.stats().range_gets.load(Ordering::Relaxed), 7);
    }

    #[tokio::test]
    async fn upload_file_is_a_single_put() {
        let backend = MemBackend::new();
        let adapter = adapter(&backend, 1024, 2);
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello").unwrap();

        adapter
            .upload_file("f", &file, 5, &ObjectMetadata::new())
            .await
            .unwrap();
        assert_eq!(backend.object("f").unwrap(), b"hello");
        assert_eq!(backend.stats().puts.load(Ordering::Relaxed), 1);
        assert_eq!(backend.stats().multipart_uploads.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn upload_super_file_round_trips() {
        let backend = MemBackend::new();
        let adapter = adapter(&backend, 8, 3);
        let body: Vec<u8> = (0..50u8).collect();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&body).unwrap();

        adapter
            .upload_super_file("big", &file, 50, &ObjectMetadata::new())
            .await
            .unwrap();
        assert_eq!(backend.object("big").unwrap(), body);
        assert_eq!(backend.stats().multipart_uploads.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn head_many_preserves_input_order() {
        let backend = MemBackend::new();
        backend.seed("a", "1", ObjectMetadata::new());
        backend.seed("c", "3", ObjectMetadata::new());

        let adapter = adapter(&backend, 8, 2);
        let results = adapter
            .head_many(vec!["a".into(), "b".into(), "c".into()])
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "a");
        assert!(results[0].1.as_ref().unwrap().is_some());
        assert!(results[1].1.as_ref().unwrap().is_none());
        assert!(results[2].1.as_ref().unwrap().is_some());
    }

    #[tokio::test]
    async fn parallel_copy_uses_part_copies_for_large_objects() {
        let backend = MemBackend::new();
        let body: Vec<u8> = (0..100u8).cycle().take(64).collect();
        backend.seed("src", body.clone(), ObjectMetadata::new());

        let adapter = adapter(&backend, 16, 4);
        adapter.parallel_copy("src", "dst", None).await.unwrap();
        assert_eq!(backend.object("dst").unwrap(), body);
        assert_eq!(backend.stats().copies.load(Ordering::Relaxed), 0);
    }
}
