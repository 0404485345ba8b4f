//! CLI surface and validated configuration (`spec.md` §6 device properties,
//! `spec.md` §1 Non-goals).
//!
//! Grounded on the teacher's `main.rs` `Opt` (`structopt`-derived,
//! `PathBuf` fields parsed `from_os_str`), generalized from its two
//! positional arguments to the full property set `spec.md` §6 names.

use std::path::PathBuf;

use structopt::StructOpt;

use crate::error::{Error, Result};

#[derive(StructOpt, Debug)]
#[structopt(name = "vhost-user-fs", about = "vhost-user virtio-fs transport daemon")]
pub struct Opt {
    /// Path of the vhost-user control socket to listen on.
    #[structopt(long, parse(from_os_str))]
    pub socket_path: PathBuf,

    /// Directory exposed to the guest (passed through to the FUSE session;
    /// unused by this transport directly).
    #[structopt(long, parse(from_os_str))]
    pub shared_dir: PathBuf,

    /// virtio-fs tag advertised to the guest, 1-36 bytes.
    #[structopt(long)]
    pub tag: String,

    /// Number of request queues. Only 1 is supported (`spec.md` §1
    /// Non-goals); anything else is a configuration error.
    #[structopt(long, default_value = "1")]
    pub num_request_queues: usize,

    /// Virtqueue size, must be a power of two.
    #[structopt(long, default_value = "128")]
    pub queue_size: u32,

    /// DAX cache window size in bytes; 0 disables the cache. Must be a
    /// power of two and at least one page when non-zero.
    #[structopt(long, default_value = "1073741824")]
    pub cache_size: u64,

    /// Worker thread pool size.
    #[structopt(long, default_value = "8")]
    pub thread_pool_size: usize,
}

/// The validated form of [`Opt`] the rest of the daemon consumes.
#[derive(Debug, Clone)]
pub struct FsConfig {
    pub socket_path: PathBuf,
    pub shared_dir: PathBuf,
    pub tag: String,
    pub queue_size: u32,
    pub cache_size: u64,
    pub thread_pool_size: usize,
}

impl FsConfig {
    pub fn from_opt(opt: Opt) -> Result<Self> {
        if opt.num_request_queues != 1 {
            return Err(Error::TooManyRequestQueues(opt.num_request_queues));
        }
        if opt.tag.is_empty() || opt.tag.as_bytes().len() > 36 {
            return Err(Error::InvalidConfig(format!(
                "tag must be 1-36 bytes, got {}",
                opt.tag.as_bytes().len()
            )));
        }
        if !opt.queue_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "queue_size {} is not a power of two",
                opt.queue_size
            )));
        }
        const PAGE_SIZE: u64 = 4096;
        if opt.cache_size != 0 && (!opt.cache_size.is_power_of_two() || opt.cache_size < PAGE_SIZE) {
            return Err(Error::InvalidConfig(format!(
                "cache_size {} must be 0 or a power of two >= one page",
                opt.cache_size
            )));
        }
        if opt.thread_pool_size == 0 {
            return Err(Error::InvalidConfig("thread_pool_size must be non-zero".into()));
        }

        Ok(Self {
            socket_path: opt.socket_path,
            shared_dir: opt.shared_dir,
            tag: opt.tag,
            queue_size: opt.queue_size,
            cache_size: opt.cache_size,
            thread_pool_size: opt.thread_pool_size,
        })
    }

    /// Sized for the largest notification structure (`spec.md` §4.G
    /// `get_config`). A single illustrative constant stands in for the
    /// real per-notification-type sizing FUSE invalidation messages would
    /// need.
    pub fn notify_buf_size(&self) -> u32 {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_opt() -> Opt {
        Opt {
            socket_path: "/tmp/fs.sock".into(),
            shared_dir: "/tmp/shared".into(),
            tag: "myfs".into(),
            num_request_queues: 1,
            queue_size: 128,
            cache_size: 1 << 20,
            thread_pool_size: 4,
        }
    }

    #[test]
    fn accepts_a_well_formed_config() {
        assert!(FsConfig::from_opt(base_opt()).is_ok());
    }

    #[test]
    fn rejects_more_than_one_request_queue() {
        let mut opt = base_opt();
        opt.num_request_queues = 2;
        assert!(matches!(
            FsConfig::from_opt(opt).unwrap_err(),
            Error::TooManyRequestQueues(2)
        ));
    }

    #[test]
    fn rejects_oversized_tag() {
        let mut opt = base_opt();
        opt.tag = "x".repeat(37);
        assert!(FsConfig::from_opt(opt).is_err());
    }

    #[test]
    fn rejects_non_power_of_two_queue_size() {
        let mut opt = base_opt();
        opt.queue_size = 100;
        assert!(FsConfig::from_opt(opt).is_err());
    }

    #[test]
    fn zero_cache_size_is_allowed() {
        let mut opt = base_opt();
        opt.cache_size = 0;
        assert!(FsConfig::from_opt(opt).is_ok());
    }

    #[test]
    fn rejects_sub_page_cache_size() {
        let mut opt = base_opt();
        opt.cache_size = 1024;
        assert!(FsConfig::from_opt(opt).is_err());
    }
}
