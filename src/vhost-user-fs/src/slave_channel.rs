//! Slave-channel client: MAP/UNMAP/SYNC/IO RPCs to the DAX cache controller
//! (`spec.md` §4.B).
//!
//! Wraps `vhost::vhost_user::SlaveFsCacheReq` (handed to us by the session
//! controller once the front end acks `set_slave_req_fd`, per `spec.md`
//! §4.G) with the higher-level semantics `spec.md` §4.B/§7 describe: a
//! signed-result decode and best-effort MAP rollback.

use std::os::unix::io::RawFd;

use vhost::vhost_user::SlaveFsCacheReq;
use vhost_user_fs_protocol::VuFsSlaveMsg;

use crate::error::BackChannelError;

/// The four back-channel RPCs, decoded per `spec.md` §4.B/§7: negative ==
/// errno-style failure, zero or positive == bytes transferred (IO) or zero
/// (others). Abstracted as a trait so `worker.rs` can be exercised against
/// a fake channel without a live vhost-user connection.
pub trait SlaveChannelOps: Send + Sync {
    fn map(&self, msg: &VuFsSlaveMsg, fd: RawFd) -> Result<u64, BackChannelError>;
    fn unmap(&self, msg: &VuFsSlaveMsg) -> Result<u64, BackChannelError>;
    fn sync(&self, msg: &VuFsSlaveMsg) -> Result<u64, BackChannelError>;
    fn io(&self, msg: &VuFsSlaveMsg, fd: RawFd) -> Result<u64, BackChannelError>;
}

pub struct SlaveChannel {
    inner: SlaveFsCacheReq,
}

impl SlaveChannel {
    pub fn new(inner: SlaveFsCacheReq) -> Self {
        Self { inner }
    }
}

impl SlaveChannelOps for SlaveChannel {
    /// Splice `fd` ranges into the cache per `msg`. On any failure, issues
    /// a best-effort UNMAP over the same message before returning the
    /// original error (`spec.md` §4.B).
    fn map(&self, msg: &VuFsSlaveMsg, fd: RawFd) -> Result<u64, BackChannelError> {
        let raw = self.inner.fs_slave_map(msg, fd);
        match BackChannelError::check(raw) {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = self.inner.fs_slave_unmap(msg);
                Err(e)
            }
        }
    }

    fn unmap(&self, msg: &VuFsSlaveMsg) -> Result<u64, BackChannelError> {
        BackChannelError::check(self.inner.fs_slave_unmap(msg))
    }

    fn sync(&self, msg: &VuFsSlaveMsg) -> Result<u64, BackChannelError> {
        BackChannelError::check(self.inner.fs_slave_sync(msg))
    }

    /// Transfer bytes between `fd` and guest physical addresses named by
    /// `msg`, in the direction given by each entry's flags. The device
    /// closes `fd` once the call completes, win or lose.
    fn io(&self, msg: &VuFsSlaveMsg, fd: RawFd) -> Result<u64, BackChannelError> {
        BackChannelError::check(self.inner.fs_slave_io(msg, fd))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// A fake channel for worker-level unit tests: `io` transfers zeroed
    /// bytes and always succeeds unless primed with a failure.
    #[derive(Default)]
    pub struct FakeSlaveChannel {
        pub io_calls: Mutex<Vec<(u64, u64, u64)>>,
        pub fail_after: Option<usize>,
    }

    impl SlaveChannelOps for FakeSlaveChannel {
        fn map(&self, _msg: &VuFsSlaveMsg, _fd: RawFd) -> Result<u64, BackChannelError> {
            Ok(0)
        }
        fn unmap(&self, _msg: &VuFsSlaveMsg) -> Result<u64, BackChannelError> {
            Ok(0)
        }
        fn sync(&self, _msg: &VuFsSlaveMsg) -> Result<u64, BackChannelError> {
            Ok(0)
        }
        fn io(&self, msg: &VuFsSlaveMsg, _fd: RawFd) -> Result<u64, BackChannelError> {
            let mut calls = self.io_calls.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if calls.len() >= limit {
                    return Err(BackChannelError(libc::EIO));
                }
            }
            let entry = msg.entries().next().unwrap();
            calls.push((entry.fd_offset, entry.c_offset, entry.len));
            Ok(entry.len)
        }
    }
}
