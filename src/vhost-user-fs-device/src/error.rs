//! Device-side error taxonomy (`spec.md` §7, restricted to the H/I
//! components this crate owns).

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("realize-time invariant violated: {0}")]
    InvalidConfig(String),

    #[error("slave RPC entry out of cache bounds: offset={offset} len={len} cache_size={cache_size}")]
    OutOfBounds { offset: u64, len: u64, cache_size: u64 },

    #[error("mmap failed: {0}")]
    Mmap(#[source] std::io::Error),

    #[error("msync failed: {0}")]
    Msync(#[source] std::io::Error),

    #[error("i/o through cache fd failed: {0}")]
    Io(#[source] std::io::Error),

    #[error("address {0:#x} is not backed by guest RAM or the cache window")]
    UnresolvedAddress(u64),

    #[error("address {0:#x} resolves to a read-only guest RAM region; refusing to write into it")]
    ReadOnlyRegion(u64),

    #[error("cache is disabled; only a whole-cache UNMAP is accepted")]
    CacheDisabled,

    #[error("device lifecycle step failed: {0}")]
    Lifecycle(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno this maps to on the slave-RPC wire (`spec.md` §7, §4.B):
    /// negative results are sign-extended `-errno`.
    pub fn as_errno(&self) -> i32 {
        match self {
            Error::OutOfBounds { .. } | Error::InvalidConfig(_) => libc::EINVAL,
            Error::UnresolvedAddress(_) | Error::ReadOnlyRegion(_) => libc::EFAULT,
            Error::Mmap(e) | Error::Msync(e) | Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::CacheDisabled => libc::EINVAL,
            Error::Lifecycle(_) => libc::EIO,
        }
    }
}
