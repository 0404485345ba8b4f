//! DAX Cache Controller (`spec.md` §4.H): validates and services the four
//! slave RPCs against a fixed-size cache window.
//!
//! Grounded directly on cloud-hypervisor's `vhost_user::fs::SlaveReqHandler`
//! (`fs_slave_map`/`unmap`/`sync`/`io`): the bounds check, the
//! `MAP_SHARED | MAP_FIXED` splice, the PROT_NONE restore on UNMAP, and the
//! cache-window-or-guest-RAM address resolution in IO all follow that
//! shape, adapted to this crate's `VuFsSlaveMsg` wire type and `Error`
//! taxonomy.

use std::os::unix::io::RawFd;

use vm_memory::{Address, Bytes, GuestAddress, GuestAddressSpace, GuestMemory, GuestMemoryAtomic, GuestMemoryMmap};

use vhost_user_fs_protocol::{VuFsSlaveMsg, VuFsSlaveMsgEntry, VuFsSlaveMsgFlags, VU_FS_UNMAP_ALL};

use crate::error::{Error, Result};

/// Realize-time invariants (`spec.md` §4.H): fails the whole device realize
/// step rather than any individual RPC.
pub fn validate_realize_config(
    tag: &str,
    num_request_queues: u32,
    queue_size: u32,
    cache_size: u64,
) -> Result<()> {
    if tag.is_empty() || tag.as_bytes().len() > 36 {
        return Err(Error::InvalidConfig(format!(
            "tag must be 1-36 bytes, got {}",
            tag.as_bytes().len()
        )));
    }
    if num_request_queues < 1 {
        return Err(Error::InvalidConfig("num_request_queues must be >= 1".into()));
    }
    const MAX_QUEUE_SIZE: u32 = 32768;
    if !queue_size.is_power_of_two() || queue_size > MAX_QUEUE_SIZE {
        return Err(Error::InvalidConfig(format!(
            "queue_size {} must be a power of two <= {}",
            queue_size, MAX_QUEUE_SIZE
        )));
    }
    const PAGE_SIZE: u64 = 4096;
    if cache_size != 0 && (!cache_size.is_power_of_two() || cache_size < PAGE_SIZE) {
        return Err(Error::InvalidConfig(format!(
            "cache_size {} must be 0 or a power of two >= one page",
            cache_size
        )));
    }
    Ok(())
}

/// Owns the cache window's address range and backing guest memory handle.
/// `cache_size == 0` means DAX is disabled entirely (`spec.md` §4.H UNMAP
/// special case).
pub struct CacheController {
    /// Guest-physical address of the cache window, as published in the
    /// shared-memory region.
    cache_gpa: GuestAddress,
    /// Host virtual address the window is mapped at in this process.
    host_addr: u64,
    cache_size: u64,
    mem: GuestMemoryAtomic<GuestMemoryMmap>,
}

impl CacheController {
    /// Allocate the cache as an anonymous private PROT_NONE mapping,
    /// published at `cache_gpa` as a guest-visible RAM region (`spec.md`
    /// §4.H). `cache_size == 0` skips the mapping; every RPC becomes a
    /// no-op except a whole-cache UNMAP.
    pub fn new(host_addr: u64, cache_gpa: GuestAddress, cache_size: u64, mem: GuestMemoryAtomic<GuestMemoryMmap>) -> Self {
        Self {
            cache_gpa,
            host_addr,
            cache_size,
            mem,
        }
    }

    fn is_entry_valid(&self, offset: u64, len: u64) -> bool {
        match offset.checked_add(len) {
            Some(end) => offset < self.cache_size && end <= self.cache_size,
            None => false,
        }
    }

    /// For each non-empty entry, install a shared file mapping at
    /// `cache + c_offset` with the requested permissions. Any failure
    /// issues a best-effort UNMAP over the whole message before returning
    /// (`spec.md` §4.B/§4.H).
    pub fn map(&self, msg: &VuFsSlaveMsg, fd: RawFd) -> Result<u64> {
        let result = self.map_inner(msg, fd);
        if result.is_err() {
            let _ = self.unmap(msg);
        }
        result
    }

    fn map_inner(&self, msg: &VuFsSlaveMsg, fd: RawFd) -> Result<u64> {
        for entry in msg.entries() {
            if self.cache_size == 0 || !self.is_entry_valid(entry.c_offset, entry.len) {
                return Err(Error::OutOfBounds {
                    offset: entry.c_offset,
                    len: entry.len,
                    cache_size: self.cache_size,
                });
            }

            let prot = entry_prot(&entry);
            let addr = self.host_addr + entry.c_offset;
            // SAFETY: `addr` is inside the cache window reserved at
            // construction time; bounds were just checked above.
            let ret = unsafe {
                libc::mmap(
                    addr as *mut libc::c_void,
                    entry.len as usize,
                    prot,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    entry.fd_offset as libc::off_t,
                )
            };
            if ret == libc::MAP_FAILED {
                return Err(Error::Mmap(std::io::Error::last_os_error()));
            }
        }
        Ok(0)
    }

    /// Restore each entry's range to an anonymous PROT_NONE mapping.
    /// `len == VU_FS_UNMAP_ALL` means the entire cache. Individual failures
    /// are logged and do not abort the remaining entries (`spec.md` §4.H).
    /// An all-ones UNMAP while the cache is disabled is the unmount path
    /// and is accepted silently; any other UNMAP on a disabled cache is an
    /// error.
    pub fn unmap(&self, msg: &VuFsSlaveMsg) -> Result<u64> {
        let mut last_err = None;
        for entry in msg.entries() {
            let len = if entry.len == VU_FS_UNMAP_ALL {
                self.cache_size
            } else {
                entry.len
            };

            if self.cache_size == 0 {
                if entry.len == VU_FS_UNMAP_ALL {
                    continue;
                }
                last_err = Some(Error::CacheDisabled);
                continue;
            }
            if !self.is_entry_valid(entry.c_offset, len) {
                last_err = Some(Error::OutOfBounds {
                    offset: entry.c_offset,
                    len,
                    cache_size: self.cache_size,
                });
                continue;
            }

            let addr = self.host_addr + entry.c_offset;
            // SAFETY: see `map_inner`.
            let ret = unsafe {
                libc::mmap(
                    addr as *mut libc::c_void,
                    len as usize,
                    libc::PROT_NONE,
                    libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if ret == libc::MAP_FAILED {
                log::error!("unmap entry at offset {} failed: {}", entry.c_offset, std::io::Error::last_os_error());
                last_err = Some(Error::Mmap(std::io::Error::last_os_error()));
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }

    /// msync each entry's range with `MS_SYNC`; per-entry failures are
    /// logged and the loop continues (`spec.md` §4.H).
    pub fn sync(&self, msg: &VuFsSlaveMsg) -> Result<u64> {
        let mut last_err = None;
        for entry in msg.entries() {
            if !self.is_entry_valid(entry.c_offset, entry.len) {
                last_err = Some(Error::OutOfBounds {
                    offset: entry.c_offset,
                    len: entry.len,
                    cache_size: self.cache_size,
                });
                continue;
            }
            let addr = self.host_addr + entry.c_offset;
            // SAFETY: see `map_inner`.
            let ret = unsafe { libc::msync(addr as *mut libc::c_void, entry.len as usize, libc::MS_SYNC) };
            if ret != 0 {
                log::error!("sync entry at offset {} failed: {}", entry.c_offset, std::io::Error::last_os_error());
                last_err = Some(Error::Msync(std::io::Error::last_os_error()));
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }

    /// Transfer bytes between `fd` and guest physical addresses named by
    /// `msg`. Each entry's `c_offset` is resolved either against the cache
    /// window or, if it falls outside it, against ordinary guest RAM
    /// (`spec.md` §4.H, mirroring cloud-hypervisor's `fs_slave_io`
    /// fallback). `fd` is closed before returning either way.
    pub fn io(&self, msg: &VuFsSlaveMsg, fd: RawFd) -> Result<u64> {
        let result = self.io_inner(msg, fd);
        // SAFETY: `fd` was handed to us by the daemon for this one RPC and
        // is not reused afterward, matching cloud-hypervisor's contract.
        unsafe {
            libc::close(fd);
        }
        result
    }

    fn io_inner(&self, msg: &VuFsSlaveMsg, fd: RawFd) -> Result<u64> {
        let mut done: u64 = 0;
        let guard = self.mem.memory();
        let cache_end = self.cache_gpa.raw_value() + self.cache_size;

        for entry in msg.entries() {
            let mut foffset = entry.fd_offset;
            let mut len = entry.len as usize;
            let gpa = entry.c_offset;

            let mut ptr = if self.cache_size != 0 && gpa >= self.cache_gpa.raw_value() && gpa < cache_end {
                let offset = gpa - self.cache_gpa.raw_value();
                let end = offset.checked_add(entry.len).ok_or(Error::UnresolvedAddress(gpa))?;
                if end > self.cache_size {
                    return Err(Error::OutOfBounds {
                        offset,
                        len: entry.len,
                        cache_size: self.cache_size,
                    });
                }
                self.host_addr + offset
            } else {
                let write_to_fd = entry.flags.contains(VuFsSlaveMsgFlags::MAP_W);
                if !write_to_fd {
                    // file -> RAM: about to pread straight into the resolved
                    // host pointer. A read-only guest RAM region (e.g. a ROM
                    // slot) would take a raw-pointer write and SIGSEGV the
                    // process instead of failing cleanly; refuse it here.
                    let region = guard.find_region(GuestAddress(gpa)).ok_or(Error::UnresolvedAddress(gpa))?;
                    if region.prot() & libc::PROT_WRITE == 0 {
                        return Err(Error::ReadOnlyRegion(gpa));
                    }
                }
                guard
                    .get_host_address(GuestAddress(gpa))
                    .map_err(|_| Error::UnresolvedAddress(gpa))? as u64
            };

            while len > 0 {
                let write_to_fd = entry.flags.contains(VuFsSlaveMsgFlags::MAP_W);
                let ret = if write_to_fd {
                    unsafe { libc::pwrite(fd, ptr as *const libc::c_void, len, foffset as libc::off_t) }
                } else {
                    unsafe { libc::pread(fd, ptr as *mut libc::c_void, len, foffset as libc::off_t) }
                };
                if ret < 0 {
                    return Err(Error::Io(std::io::Error::last_os_error()));
                }
                if ret == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "short transfer against cache fd",
                    )));
                }
                len -= ret as usize;
                foffset += ret as u64;
                ptr += ret as u64;
                done += ret as u64;
            }
        }
        Ok(done)
    }
}

fn entry_prot(entry: &VuFsSlaveMsgEntry) -> i32 {
    let mut prot = 0;
    if entry.flags.contains(VuFsSlaveMsgFlags::MAP_R) {
        prot |= libc::PROT_READ;
    }
    if entry.flags.contains(VuFsSlaveMsgFlags::MAP_W) {
        prot |= libc::PROT_WRITE;
    }
    prot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_tag() {
        assert!(validate_realize_config("", 1, 128, 4096).is_err());
    }

    #[test]
    fn rejects_oversized_tag() {
        assert!(validate_realize_config(&"x".repeat(37), 1, 128, 4096).is_err());
    }

    #[test]
    fn rejects_zero_request_queues() {
        assert!(validate_realize_config("tag", 0, 128, 4096).is_err());
    }

    #[test]
    fn rejects_non_power_of_two_queue_size() {
        assert!(validate_realize_config("tag", 1, 100, 4096).is_err());
    }

    #[test]
    fn accepts_zero_cache_size() {
        assert!(validate_realize_config("tag", 1, 128, 0).is_ok());
    }

    #[test]
    fn rejects_sub_page_cache_size() {
        assert!(validate_realize_config("tag", 1, 128, 1024).is_err());
    }

    #[test]
    fn accepts_well_formed_config() {
        assert!(validate_realize_config("myfs", 1, 128, 1 << 20).is_ok());
    }
}
