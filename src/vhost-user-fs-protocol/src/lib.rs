//! Wire-level shapes for the vhost-user-fs slave channel and device config.
//!
//! Kept in its own crate so the daemon (`vhost-user-fs`) and the
//! hypervisor-resident DAX cache controller (`vhost-user-fs-device`) can't
//! drift apart on the byte layout of the messages they exchange. Nothing
//! here parses FUSE payloads; the handful of FUSE constants below are just
//! what the daemon's queue worker needs to branch on (`spec.md` §4.C), not
//! a FUSE implementation.

use bitflags::bitflags;
use vm_memory::ByteValued;

/// Number of entries in a [`VuFsSlaveMsg`]. Shared by MAP, UNMAP, SYNC and IO.
pub const VHOST_USER_FS_SLAVE_ENTRIES: usize = 8;

/// `len` value on an UNMAP entry meaning "the entire cache".
pub const VU_FS_UNMAP_ALL: u64 = u64::MAX;

bitflags! {
    /// Per-entry permission flags for a slave message.
    #[repr(transparent)]
    pub struct VuFsSlaveMsgFlags: u64 {
        /// Map/transfer for reading (guest/file -> cache/RAM direction for IO).
        const MAP_R = 1 << 0;
        /// Map/transfer for writing.
        const MAP_W = 1 << 1;
    }
}

/// The back-channel MAP/UNMAP/SYNC/IO request body.
///
/// Structure-of-arrays layout, matching the real `VhostUserFSSlaveMsg` wire
/// shape: all `flags`, then all `fd_offset`, then all `cache_offset`, then
/// all `len`, each `VHOST_USER_FS_SLAVE_ENTRIES` long.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct VuFsSlaveMsg {
    pub flags: [u64; VHOST_USER_FS_SLAVE_ENTRIES],
    pub fd_offset: [u64; VHOST_USER_FS_SLAVE_ENTRIES],
    pub c_offset: [u64; VHOST_USER_FS_SLAVE_ENTRIES],
    pub len: [u64; VHOST_USER_FS_SLAVE_ENTRIES],
}

unsafe impl ByteValued for VuFsSlaveMsg {}

impl Default for VuFsSlaveMsg {
    fn default() -> Self {
        Self {
            flags: [0; VHOST_USER_FS_SLAVE_ENTRIES],
            fd_offset: [0; VHOST_USER_FS_SLAVE_ENTRIES],
            c_offset: [0; VHOST_USER_FS_SLAVE_ENTRIES],
            len: [0; VHOST_USER_FS_SLAVE_ENTRIES],
        }
    }
}

impl VuFsSlaveMsg {
    /// Build a single-entry message. Convenience for callers issuing one
    /// range at a time (the common case on the daemon's reply path).
    pub fn single(flags: VuFsSlaveMsgFlags, fd_offset: u64, c_offset: u64, len: u64) -> Self {
        let mut msg = Self::default();
        msg.flags[0] = flags.bits();
        msg.fd_offset[0] = fd_offset;
        msg.c_offset[0] = c_offset;
        msg.len[0] = len;
        msg
    }

    /// Iterate over the non-empty entries (`len != 0`).
    pub fn entries(&self) -> impl Iterator<Item = VuFsSlaveMsgEntry> + '_ {
        (0..VHOST_USER_FS_SLAVE_ENTRIES)
            .filter(move |&i| self.len[i] != 0)
            .map(move |i| VuFsSlaveMsgEntry {
                flags: VuFsSlaveMsgFlags::from_bits_truncate(self.flags[i]),
                fd_offset: self.fd_offset[i],
                c_offset: self.c_offset[i],
                len: self.len[i],
            })
    }
}

/// A single decoded, non-empty entry of a [`VuFsSlaveMsg`].
#[derive(Copy, Clone, Debug)]
pub struct VuFsSlaveMsgEntry {
    pub flags: VuFsSlaveMsgFlags,
    pub fd_offset: u64,
    pub c_offset: u64,
    pub len: u64,
}

/// Feature bit advertising the notification queue (§6).
pub const VIRTIO_FS_F_NOTIFICATION: u64 = 0;

/// `virtio_fs_config`, little-endian, packed (`spec.md` §6).
#[repr(C, packed)]
#[derive(Copy, Clone, Debug)]
pub struct VirtioFsConfig {
    /// UTF-8, NUL-padded, not NUL-terminated.
    pub tag: [u8; 36],
    pub num_request_queues: u32,
    pub notify_buf_size: u32,
}

unsafe impl ByteValued for VirtioFsConfig {}

impl Default for VirtioFsConfig {
    fn default() -> Self {
        Self {
            tag: [0; 36],
            num_request_queues: 0,
            notify_buf_size: 0,
        }
    }
}

impl VirtioFsConfig {
    pub fn new(tag: &str, num_request_queues: u32, notify_buf_size: u32) -> Option<Self> {
        let bytes = tag.as_bytes();
        if bytes.is_empty() || bytes.len() > 36 {
            return None;
        }
        let mut cfg = Self {
            num_request_queues,
            notify_buf_size,
            ..Default::default()
        };
        cfg.tag[..bytes.len()].copy_from_slice(bytes);
        Some(cfg)
    }
}

/// Maximum shared-memory capability index we advertise on the PCI transport
/// (`spec.md` §6): 0 = cache window, 1 = version table.
pub const PCI_SHM_CAP_ID_CACHE: u8 = 0;
pub const PCI_SHM_CAP_ID_VERSION_TABLE: u8 = 1;

/// The handful of FUSE wire constants the daemon's queue worker inspects
/// directly (`spec.md` §4.C). Full opcode parsing is out of scope; these are
/// only what's needed to pick a reconstruction strategy.
pub mod fuse {
    /// `sizeof(struct fuse_in_header)` on the wire.
    pub const FUSE_IN_HEADER_SIZE: usize = 40;
    /// `sizeof(struct fuse_write_in)` on the wire.
    pub const FUSE_WRITE_IN_SIZE: usize = 40;

    pub const FUSE_GETATTR: u32 = 3;
    pub const FUSE_READ: u32 = 15;
    pub const FUSE_WRITE: u32 = 16;

    /// `unique == 0` marks a daemon-originated notification (`spec.md` §4.F,
    /// GLOSSARY).
    pub const FUSE_NOTIFY_UNIQUE: u64 = 0;

    #[repr(C)]
    #[derive(Copy, Clone, Debug, Default)]
    pub struct FuseInHeader {
        pub len: u32,
        pub opcode: u32,
        pub unique: u64,
        pub nodeid: u64,
        pub uid: u32,
        pub gid: u32,
        pub pid: u32,
        pub padding: u32,
    }

    impl FuseInHeader {
        pub fn from_bytes(buf: &[u8]) -> Option<Self> {
            if buf.len() < FUSE_IN_HEADER_SIZE {
                return None;
            }
            Some(Self {
                len: u32::from_ne_bytes(buf[0..4].try_into().ok()?),
                opcode: u32::from_ne_bytes(buf[4..8].try_into().ok()?),
                unique: u64::from_ne_bytes(buf[8..16].try_into().ok()?),
                nodeid: u64::from_ne_bytes(buf[16..24].try_into().ok()?),
                uid: u32::from_ne_bytes(buf[24..28].try_into().ok()?),
                gid: u32::from_ne_bytes(buf[28..32].try_into().ok()?),
                pid: u32::from_ne_bytes(buf[32..36].try_into().ok()?),
                padding: u32::from_ne_bytes(buf[36..40].try_into().ok()?),
            })
        }
    }

    #[repr(C)]
    #[derive(Copy, Clone, Debug, Default)]
    pub struct FuseWriteIn {
        pub offset: u64,
        pub size: u32,
        pub write_flags: u32,
        pub lock_owner: u64,
        pub flags: u32,
        pub padding: u32,
    }

    impl FuseWriteIn {
        pub fn from_bytes(buf: &[u8]) -> Option<Self> {
            if buf.len() < FUSE_WRITE_IN_SIZE {
                return None;
            }
            Some(Self {
                offset: u64::from_ne_bytes(buf[0..8].try_into().ok()?),
                size: u32::from_ne_bytes(buf[8..12].try_into().ok()?),
                write_flags: u32::from_ne_bytes(buf[12..16].try_into().ok()?),
                lock_owner: u64::from_ne_bytes(buf[16..24].try_into().ok()?),
                flags: u32::from_ne_bytes(buf[24..28].try_into().ok()?),
                padding: u32::from_ne_bytes(buf[28..32].try_into().ok()?),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_entry_roundtrips() {
        let msg = VuFsSlaveMsg::single(VuFsSlaveMsgFlags::MAP_R, 10, 20, 30);
        let entries: Vec<_> = msg.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fd_offset, 10);
        assert_eq!(entries[0].c_offset, 20);
        assert_eq!(entries[0].len, 30);
        assert!(entries[0].flags.contains(VuFsSlaveMsgFlags::MAP_R));
    }

    #[test]
    fn zero_length_entries_are_skipped() {
        let msg = VuFsSlaveMsg::default();
        assert_eq!(msg.entries().count(), 0);
    }

    #[test]
    fn config_rejects_oversized_tag() {
        assert!(VirtioFsConfig::new(&"x".repeat(37), 1, 0).is_none());
        assert!(VirtioFsConfig::new("myfs", 1, 0).is_some());
    }

    #[test]
    fn fuse_in_header_parses_minimal_getattr() {
        let mut buf = [0u8; 40];
        buf[0..4].copy_from_slice(&40u32.to_ne_bytes());
        buf[4..8].copy_from_slice(&fuse::FUSE_GETATTR.to_ne_bytes());
        buf[8..16].copy_from_slice(&7u64.to_ne_bytes());
        let hdr = fuse::FuseInHeader::from_bytes(&buf).unwrap();
        assert_eq!(hdr.len, 40);
        assert_eq!(hdr.opcode, fuse::FUSE_GETATTR);
        assert_eq!(hdr.unique, 7);
    }
}
