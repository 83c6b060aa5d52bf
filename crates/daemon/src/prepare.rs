//! Mount-time preparation: credentials, bucket probes, prefix checks and
//! the local cache directories. Every failure here aborts the mount with a
//! message instead of serving a broken tree.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use bosfs_store::{ObjectBackend, S3Backend, S3Config, StorageAdapter, StoreError};
use common::access::uid_in_group;
use common::{FsCore, MountOptions};
use tracing::{info, warn};

use crate::cli::Args;

/// Everything `main` needs to call `fuser::mount2`.
pub struct PreparedMount {
    pub core: Arc<FsCore>,
    pub mountpoint: PathBuf,
    pub allow_other: bool,
}

/// Validate options, probe the service and build the core.
pub async fn prepare(args: &Args) -> anyhow::Result<PreparedMount> {
    let mut opts = args.to_options()?;
    opts.finalize()
        .map_err(|err| anyhow::anyhow!("invalid options: {err}"))?;

    let mountpoint = args
        .mountpoint
        .canonicalize()
        .with_context(|| format!("unable to access mountpoint {}", args.mountpoint.display()))?;
    let meta = std::fs::metadata(&mountpoint)
        .with_context(|| format!("unable to access mountpoint {}", mountpoint.display()))?;
    if !meta.is_dir() {
        bail!("mountpoint {} is not a directory", mountpoint.display());
    }
    if !mountpoint_accessible(&meta, &opts) {
        bail!("mountpoint {}: permission denied", mountpoint.display());
    }

    if opts.ak.is_empty() || opts.sk.is_empty() {
        bail!("ak or sk not specified");
    }

    let mut backend = build_backend(&opts, None).await?;

    // The location lookup doubles as the existence probe.
    match backend.bucket_location().await {
        Ok(location) => {
            if opts.endpoint.is_empty() && !location.is_empty() {
                info!(location, "resolved bucket location");
                backend = build_backend(&opts, Some(&location)).await?;
            }
        }
        Err(err) if err.is_not_found() && opts.create_bucket => {
            info!(bucket = %opts.bucket, "creating bucket");
            backend
                .create_bucket()
                .await
                .map_err(|err| anyhow::anyhow!("create bucket failed: {err}"))?;
        }
        Err(err) if err.is_not_found() => {
            bail!("bucket {} does not exist", opts.bucket);
        }
        Err(err) => {
            bail!("checking bucket {} failed: {err}", opts.bucket);
        }
    }

    match backend.bucket_acl().await {
        Ok(acl) => {
            if !acl.can_read || !acl.can_write {
                bail!("bucket {}: read/write access denied", opts.bucket);
            }
        }
        // Not every S3-compatible service answers ACL reads.
        Err(StoreError::NotFound(_)) => {}
        Err(err) => warn!(error = %err, "bucket ACL check skipped"),
    }

    let opts = Arc::new(opts);
    let adapter = StorageAdapter::new(
        Arc::new(backend),
        opts.multipart_size,
        opts.multipart_parallel,
    );
    let core = Arc::new(FsCore::new(adapter, opts.clone()));

    if !opts.bucket_prefix.is_empty() {
        check_mount_prefix(&core, &opts).await?;
    }

    let config = core.data_cache().config().clone();
    if opts.remove_cache {
        config
            .wipe()
            .map_err(|err| anyhow::anyhow!("wiping cache directories failed: {err}"))?;
    }
    if config.has_cache_dir() {
        for dir in [
            config.cache_file_path("", false).ok().flatten(),
            config.stat_file_path("", false).ok().flatten(),
        ]
        .into_iter()
        .flatten()
        {
            check_local_dir(&dir, false)?;
        }
    }
    check_local_dir(config.tmp_dir(), true)?;

    Ok(PreparedMount {
        core,
        mountpoint,
        allow_other: opts.allow_other,
    })
}

async fn build_backend(opts: &MountOptions, region: Option<&str>) -> anyhow::Result<S3Backend> {
    let config = S3Config {
        endpoint: opts.endpoint.clone(),
        region: region.unwrap_or_default().to_string(),
        access_key: opts.ak.clone(),
        secret_key: opts.sk.clone(),
        session_token: opts.sts_token.clone(),
        timeout_s: opts.client_timeout_s,
    };
    S3Backend::new(opts.bucket.clone(), &config)
        .await
        .map_err(|err| anyhow::anyhow!("building storage client failed: {err}"))
}

/// The mounted prefix must already name a directory, unless the caller
/// asked for it to be created.
async fn check_mount_prefix(core: &Arc<FsCore>, opts: &Arc<MountOptions>) -> anyhow::Result<()> {
    let prefix_path = format!("/{}", opts.bucket_prefix.trim_end_matches('/'));
    match core.file_manager().get(&prefix_path).await {
        Ok(entry) => {
            if !entry.is_dir_obj() && !entry.is_prefix() {
                bail!("{} is not a directory", opts.bucket_prefix);
            }
            Ok(())
        }
        Err(err) if err.is_not_found() && opts.create_prefix => {
            info!(prefix = %opts.bucket_prefix, "creating mount prefix");
            core.create_object(
                &prefix_path,
                libc::S_IFDIR | 0o755,
                opts.mount_uid,
                opts.mount_gid,
                &[],
            )
            .await
            .map_err(|err| anyhow::anyhow!("creating mount prefix failed: {err}"))?;
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            bail!("bucket prefix {} does not exist", opts.bucket_prefix)
        }
        Err(err) => bail!("checking bucket prefix failed: {err}"),
    }
}

/// A mountpoint is usable by root, by its owner, through group membership
/// with group-rwx, or when world-rwx is set.
fn mountpoint_accessible(meta: &std::fs::Metadata, opts: &MountOptions) -> bool {
    if opts.mount_uid == 0 || meta.uid() == opts.mount_uid {
        return true;
    }
    let mode = meta.mode();
    if (meta.gid() == opts.mount_gid || uid_in_group(opts.mount_uid, meta.gid()))
        && mode & 0o070 == 0o070
    {
        return true;
    }
    mode & 0o007 == 0o007
}

fn check_local_dir(dir: &std::path::Path, must_exist: bool) -> anyhow::Result<()> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => bail!("{} is not a directory", dir.display()),
        // Cache subdirectories appear lazily; only their roots may be
        // missing at mount time.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !must_exist => Ok(()),
        Err(err) => bail!("unable to access {}: {err}", dir.display()),
    }
}
