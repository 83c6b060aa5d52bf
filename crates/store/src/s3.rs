//! S3 backend built on aws-sdk-s3.
//!
//! Works against AWS S3 and any S3-compatible endpoint (MinIO, Ceph RGW);
//! custom endpoints switch the client to path-style addressing.

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, MetadataDirective, Permission, StorageClass,
};
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use bytes::Bytes;
use tracing::debug;

use crate::backend::{BucketAccess, ListChunk, ListRequest, ObjectBackend, ObjectSummary};
use crate::error::{Result, StoreError};
use crate::metadata::ObjectMetadata;

/// Connection settings for the S3 backend.
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// Service endpoint; empty means the AWS default resolved from region.
    pub endpoint: String,
    /// Region hint; when empty the bucket location answers it.
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Optional STS session token.
    pub session_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_s: u64,
}

/// `ObjectBackend` implementation over one bucket.
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Build a client for `bucket` from the given settings.
    pub async fn new(bucket: impl Into<String>, config: &S3Config) -> Result<Self> {
        let credentials = aws_sdk_s3::config::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            config.session_token.clone(),
            None,
            "bosfs",
        );
        let region = if config.region.is_empty() {
            "us-east-1".to_string()
        } else {
            config.region.clone()
        };
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(aws_config::Region::new(region));
        if config.timeout_s > 0 {
            loader = loader.timeout_config(
                aws_config::timeout::TimeoutConfig::builder()
                    .operation_timeout(std::time::Duration::from_secs(config.timeout_s))
                    .build(),
            );
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if !config.endpoint.is_empty() {
            // S3-compatible services rarely support virtual-host addressing.
            builder = builder
                .endpoint_url(normalize_endpoint(&config.endpoint))
                .force_path_style(true);
        }
        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.into(),
        })
    }

    fn meta_to_request_parts(
        meta: &ObjectMetadata,
    ) -> (
        Option<String>,
        Option<std::collections::HashMap<String, String>>,
        Option<StorageClass>,
    ) {
        let content_type = meta.content_type().map(str::to_string);
        let user_meta = if meta.user_meta_map().is_empty() {
            None
        } else {
            Some(
                meta.user_meta_map()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        };
        let class = meta.storage_class().map(StorageClass::from);
        (content_type, user_meta, class)
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

/// Map an SDK error onto the store taxonomy.
fn classify<E>(err: SdkError<E, HttpResponse>, operation: &'static str, key: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = err.code().unwrap_or_default();
            if status == 404 || matches!(code, "NoSuchKey" | "NotFound" | "NoSuchBucket") {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Service {
                    operation,
                    message: format!("{}", DisplayErrorContext(&err)),
                }
            }
        }
        _ => StoreError::Transport {
            operation,
            message: format!("{}", DisplayErrorContext(&err)),
        },
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let res = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match res {
            Ok(out) => {
                let mut meta = ObjectMetadata::new();
                if let Some(ct) = out.content_type() {
                    meta.set_content_type(ct);
                }
                meta.set_content_length(out.content_length().unwrap_or(0).max(0) as u64);
                if let Some(lm) = out.last_modified() {
                    meta.set_last_modified(lm.secs());
                }
                if let Some(class) = out.storage_class() {
                    meta.set_storage_class(class.as_str());
                }
                if let Some(user) = out.metadata() {
                    for (k, v) in user {
                        meta.set_user_meta(k.clone(), v.clone());
                    }
                }
                Ok(Some(meta))
            }
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(None)
                } else {
                    match classify(err, "head_object", key) {
                        StoreError::NotFound(_) => Ok(None),
                        other => Err(other),
                    }
                }
            }
        }
    }

    async fn list_objects(&self, req: &ListRequest) -> Result<ListChunk> {
        let mut call = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&req.prefix)
            .max_keys(req.max_keys);
        if let Some(delim) = &req.delimiter {
            call = call.delimiter(delim);
        }
        if let Some(marker) = &req.marker {
            call = call.continuation_token(marker);
        }
        let out = call
            .send()
            .await
            .map_err(|e| classify(e, "list_objects", &req.prefix))?;
        let objects = out
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj.last_modified().map(|t| t.secs()).unwrap_or(0),
                })
            })
            .collect();
        let common_prefixes = out
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();
        Ok(ListChunk {
            objects,
            common_prefixes,
            next_marker: out.next_continuation_token().map(str::to_string),
            truncated: out.is_truncated().unwrap_or(false),
        })
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes> {
        debug!(key, offset, len, "ranged GET");
        let end = offset + len - 1;
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(|e| classify(e, "get_range", key))?;
        let data = out.body.collect().await.map_err(|e| StoreError::Transport {
            operation: "get_range",
            message: e.to_string(),
        })?;
        Ok(data.into_bytes())
    }

    async fn put_object(&self, key: &str, body: Bytes, meta: &ObjectMetadata) -> Result<()> {
        let (content_type, user_meta, class) = Self::meta_to_request_parts(meta);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body.into())
            .set_content_type(content_type)
            .set_metadata(user_meta)
            .set_storage_class(class)
            .send()
            .await
            .map_err(|e| classify(e, "put_object", key))?;
        Ok(())
    }

    async fn create_multipart(&self, key: &str, meta: &ObjectMetadata) -> Result<String> {
        let (content_type, user_meta, class) = Self::meta_to_request_parts(meta);
        let out = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(content_type)
            .set_metadata(user_meta)
            .set_storage_class(class)
            .send()
            .await
            .map_err(|e| classify(e, "create_multipart", key))?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Service {
                operation: "create_multipart",
                message: "missing upload id".to_string(),
            })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String> {
        let out = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(body.into())
            .send()
            .await
            .map_err(|e| classify(e, "upload_part", key))?;
        Ok(out.e_tag().unwrap_or_default().to_string())
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
        let end = offset + len - 1;
        let out = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .copy_source(format!("{}/{}", self.bucket, src_key))
            .copy_source_range(format!("bytes={offset}-{end}"))
            .send()
            .await
            .map_err(|e| classify(e, "upload_part_copy", src_key))?;
        Ok(out
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .unwrap_or_default()
            .to_string())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|(number, etag)| {
                        CompletedPart::builder()
                            .part_number(number)
                            .e_tag(etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| classify(e, "complete_multipart", key))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify(e, "abort_multipart", key))?;
        Ok(())
    }

    async fn copy_object(
        &self,
        src_key: &str,
        dst_key: &str,
        replace_meta: Option<&ObjectMetadata>,
        storage_class: Option<&str>,
    ) -> Result<()> {
        let mut call = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(dst_key)
            .copy_source(format!("{}/{}", self.bucket, src_key));
        if let Some(meta) = replace_meta {
            let (content_type, user_meta, class) = Self::meta_to_request_parts(meta);
            call = call
                .metadata_directive(MetadataDirective::Replace)
                .set_content_type(content_type)
                .set_metadata(user_meta)
                .set_storage_class(class);
        }
        if let Some(class) = storage_class {
            call = call.storage_class(StorageClass::from(class));
        }
        call.send()
            .await
            .map_err(|e| classify(e, "copy_object", src_key))?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, "delete_object", key))?;
        Ok(())
    }

    async fn bucket_location(&self) -> Result<String> {
        let out = self
            .client
            .get_bucket_location()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify(e, "bucket_location", &self.bucket))?;
        Ok(out
            .location_constraint()
            .map(|c| c.as_str().to_string())
            .unwrap_or_default())
    }

    async fn create_bucket(&self) -> Result<()> {
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify(e, "create_bucket", &self.bucket))?;
        Ok(())
    }

    async fn bucket_acl(&self) -> Result<BucketAccess> {
        let out = self
            .client
            .get_bucket_acl()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify(e, "bucket_acl", &self.bucket))?;
        let owner_id = out.owner().and_then(|o| o.id()).unwrap_or_default();
        let mut access = BucketAccess {
            can_read: false,
            can_write: false,
        };
        for grant in out.grants() {
            let grantee_id = grant.grantee().and_then(|g| g.id()).unwrap_or("*");
            if grantee_id != "*" && grantee_id != owner_id {
                continue;
            }
            match grant.permission() {
                Some(Permission::Read) => access.can_read = true,
                Some(Permission::Write) => access.can_write = true,
                Some(Permission::FullControl) => {
                    access.can_read = true;
                    access.can_write = true;
                }
                _ => {}
            }
        }
        Ok(access)
    }
}
