//! Command line of the bosfs daemon.

use std::path::PathBuf;

use clap::Parser;
use common::MountOptions;

/// Mount an object-storage bucket (or a prefix inside it) as a local
/// filesystem.
#[derive(Parser, Debug)]
#[command(name = "bosfs", version, about)]
pub struct Args {
    /// Bucket to mount, optionally with a key prefix (`bucket/sub/dir`).
    pub bucket: String,

    /// Existing directory to mount onto.
    pub mountpoint: PathBuf,

    /// Service endpoint; defaults to the bucket's location.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Access key id.
    #[arg(long)]
    pub ak: Option<String>,

    /// Secret access key.
    #[arg(long)]
    pub sk: Option<String>,

    /// STS session token.
    #[arg(long)]
    pub sts_token: Option<String>,

    /// Storage class for uploads: STANDARD or STANDARD_IA.
    #[arg(long)]
    pub storage_class: Option<String>,

    /// Persistent cache directory; omit to serve from tmp files only.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Scratch directory for tmp files.
    #[arg(long, default_value = "/tmp")]
    pub tmp_dir: PathBuf,

    /// Attribute expiry in seconds; negative means never.
    #[arg(long, default_value_t = -1)]
    pub meta_expires: i64,

    /// Attribute cache soft capacity.
    #[arg(long, default_value_t = 100_000)]
    pub meta_capacity: usize,

    /// Multipart part size in bytes.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub multipart_size: u64,

    /// Single-PUT cutoff in bytes.
    #[arg(long, default_value_t = 100 * 1024 * 1024)]
    pub multipart_threshold: u64,

    /// Concurrent parts per transfer.
    #[arg(long, default_value_t = 10)]
    pub multipart_parallel: usize,

    /// Present every entry as owned by this uid (root only).
    #[arg(long)]
    pub uid: Option<u32>,

    /// Present every entry as owned by this gid (root only).
    #[arg(long)]
    pub gid: Option<u32>,

    /// Mask every entry's permissions with this octal umask.
    #[arg(long)]
    pub umask: Option<String>,

    /// Umask shaping the mount mode when --allow-other is set (octal).
    #[arg(long)]
    pub mount_umask: Option<String>,

    /// Let other users access the mountpoint.
    #[arg(long)]
    pub allow_other: bool,

    /// Wipe the cache and range-index directories before serving.
    #[arg(long)]
    pub remove_cache: bool,

    /// Create the bucket when it does not exist.
    #[arg(long)]
    pub create_bucket: bool,

    /// Create the directory object for a missing mount prefix.
    #[arg(long)]
    pub create_prefix: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Log filter, e.g. `info` or `common=debug` (overrides RUST_LOG).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Remote request timeout in seconds.
    #[arg(long, default_value_t = 1200)]
    pub client_timeout: u64,
}

impl Args {
    /// Turn the raw arguments into validated mount options. The returned
    /// options still need [`MountOptions::finalize`].
    pub fn to_options(&self) -> anyhow::Result<MountOptions> {
        let (bucket, prefix) = match self.bucket.split_once('/') {
            Some((bucket, prefix)) => (bucket.to_string(), prefix.to_string()),
            None => (self.bucket.clone(), String::new()),
        };
        if (self.uid.is_some() || self.gid.is_some()) && unsafe { libc::geteuid() } != 0 {
            anyhow::bail!("only root may override uid or gid");
        }
        let bosfs_mask = self
            .umask
            .as_deref()
            .map(parse_octal)
            .transpose()?
            .map(|mask| mask & 0o777);
        let mount_umask = self
            .mount_umask
            .as_deref()
            .map(parse_octal)
            .transpose()?
            .map(|mask| mask & 0o777)
            .unwrap_or(0o022);

        Ok(MountOptions {
            bucket,
            bucket_prefix: prefix,
            endpoint: self.endpoint.clone().unwrap_or_default(),
            ak: self.ak.clone().unwrap_or_default(),
            sk: self.sk.clone().unwrap_or_default(),
            sts_token: self.sts_token.clone(),
            storage_class: self.storage_class.as_deref().map(str::to_uppercase),
            cache_dir: self.cache_dir.clone(),
            tmp_dir: self.tmp_dir.clone(),
            meta_expires_s: self.meta_expires,
            meta_capacity: self.meta_capacity,
            multipart_size: self.multipart_size,
            multipart_threshold: self.multipart_threshold,
            multipart_parallel: self.multipart_parallel,
            mount_umask,
            allow_other: self.allow_other,
            bosfs_uid: self.uid,
            bosfs_gid: self.gid,
            bosfs_mask,
            remove_cache: self.remove_cache,
            create_bucket: self.create_bucket,
            create_prefix: self.create_prefix,
            client_timeout_s: self.client_timeout,
            ..Default::default()
        })
    }
}

fn parse_octal(text: &str) -> anyhow::Result<u32> {
    u32::from_str_radix(text.trim_start_matches("0o"), 8)
        .map_err(|_| anyhow::anyhow!("invalid octal value: {text}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once("bosfs").chain(args.iter().copied()))
    }

    #[test]
    fn bucket_prefix_splits_on_first_slash() {
        let args = parse(&["data/sub/dir", "/mnt/d"]);
        let opts = args.to_options().unwrap();
        assert_eq!(opts.bucket, "data");
        assert_eq!(opts.bucket_prefix, "sub/dir");
    }

    #[test]
    fn umask_is_octal() {
        let args = parse(&["b", "/mnt/b", "--umask", "077"]);
        let opts = args.to_options().unwrap();
        assert_eq!(opts.bosfs_mask, Some(0o77));

        let bad = parse(&["b", "/mnt/b", "--umask", "9z"]);
        assert!(bad.to_options().is_err());
    }

    #[test]
    fn storage_class_is_uppercased() {
        let args = parse(&["b", "/mnt/b", "--storage-class", "standard_ia"]);
        let opts = args.to_options().unwrap();
        assert_eq!(opts.storage_class.as_deref(), Some("STANDARD_IA"));
    }
}
