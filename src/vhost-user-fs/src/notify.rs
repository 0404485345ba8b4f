//! Notification queue pump and sender (`spec.md` §4.E, §4.F).
//!
//! The notification queue (index 1, present only when the guest acked
//! `FS_NOTIFICATION`) runs in the opposite direction from every other
//! queue: the guest posts empty descriptors the daemon fills in to deliver
//! unsolicited messages (invalidations, etc. — opaque here, same as every
//! other FUSE payload). Its pump (§4.E) only drains kicks; the actual work
//! is done by [`NotificationSender`] (§4.F), called from the session side
//! whenever it has something to push.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use vm_memory::{Bytes, GuestAddress, GuestAddressSpace, GuestMemoryAtomic, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

use virtio_queue::Queue;

use crate::descriptor_utils::iovec_copy;
use crate::error::{Error, Result};

type GuestMemory = GuestMemoryAtomic<GuestMemoryMmap>;

/// Drains kicks on the notification queue without dispatching any work —
/// the queue is only ever written to by [`NotificationSender`], never
/// posted to by the guest with real descriptors to pop.
pub struct NotificationPump {
    index: u16,
    kick_fd: EventFd,
    kill_fd: EventFd,
}

impl NotificationPump {
    pub fn new(index: u16, kick_fd: EventFd, kill_fd: EventFd) -> Self {
        Self { index, kick_fd, kill_fd }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let kick_fd = self.kick_fd.try_clone().expect("dup kick_fd");
        let kill_fd = self.kill_fd.try_clone().expect("dup kill_fd");
        let index = self.index;
        std::thread::Builder::new()
            .name(format!("fs-notify-pump-{}", index))
            .spawn(move || pump_loop(index, kick_fd, kill_fd, stop))
            .expect("failed to spawn notification pump thread")
    }
}

fn pump_loop(index: u16, kick_fd: EventFd, kill_fd: EventFd, stop: Arc<AtomicBool>) {
    let pollfds = [
        libc::pollfd {
            fd: kick_fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: kill_fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        },
    ];

    while !stop.load(Ordering::Relaxed) {
        let mut fds = pollfds;
        let ret = unsafe {
            libc::ppoll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                std::ptr::null(),
                std::ptr::null(),
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("ppoll on notification queue {} failed: {}", index, err);
            break;
        }
        if fds[1].revents & libc::POLLIN != 0 {
            let _ = kill_fd.read();
            break;
        }
        if fds[0].revents & libc::POLLIN != 0 {
            let _ = kick_fd.read();
        }
    }
}

/// Pushes daemon-originated notifications onto the notification queue
/// (`spec.md` §4.F). Every message carries `unique == 0`
/// (`vhost_user_fs_protocol::fuse::FUSE_NOTIFY_UNIQUE`) by construction of
/// the caller.
pub struct NotificationSender {
    queue: Arc<Mutex<Queue<GuestMemory>>>,
    mem: GuestMemory,
    call_fd: EventFd,
    queue_mutex: Arc<Mutex<()>>,
    dispatch_lock: Arc<RwLock<()>>,
}

impl NotificationSender {
    pub fn new(
        queue: Arc<Mutex<Queue<GuestMemory>>>,
        mem: GuestMemory,
        call_fd: EventFd,
        queue_mutex: Arc<Mutex<()>>,
        dispatch_lock: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            queue,
            mem,
            call_fd,
            queue_mutex,
            dispatch_lock,
        }
    }

    /// Pop one descriptor, copy `payload` into its sink iovecs, push and
    /// notify. Fails with [`Error::NoSpace`] if the guest hasn't posted a
    /// descriptor to receive it.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let _dispatch_guard = self.dispatch_lock.read().unwrap();
        let _queue_guard = self.queue_mutex.lock().unwrap();

        let guard = self.mem.memory();
        let mut queue = self.queue.lock().unwrap();
        let mut iter = queue
            .iter()
            .map_err(|e| Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let chain = iter.next().ok_or(Error::NoSpace)?;
        let head_index = chain.head_index();

        let descs: Vec<_> = chain.writable().collect();
        let capacity: usize = descs.iter().map(|d| d.len() as usize).sum();
        if payload.len() > capacity {
            return Err(Error::ReplyBufferTooSmall {
                needed: payload.len(),
                available: capacity,
            });
        }

        let mut scratch: Vec<Vec<u8>> = descs.iter().map(|d| vec![0u8; d.len() as usize]).collect();
        {
            let src: [&[u8]; 1] = [payload];
            let mut dst: Vec<&mut [u8]> = scratch.iter_mut().map(|b| b.as_mut_slice()).collect();
            iovec_copy(&src, &mut dst, payload.len());
        }
        for (d, buf) in descs.iter().zip(scratch.iter()) {
            guard
                .write_slice(buf, GuestAddress(d.addr().0))
                .map_err(|e| Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        }

        queue
            .add_used(head_index, payload.len() as u32)
            .expect("head_index came from a chain this queue just popped");
        let _ = self.call_fd.write(1);
        Ok(())
    }
}
