//! Per-queue pump thread and its virtqueue plumbing (`spec.md` §4.D, §4.E).
//!
//! Each request queue gets one pump thread blocked in `ppoll` on its kick
//! and kill eventfds (grounded on the teacher's `handle_event`-per-vring
//! shape in `main.rs`, reworked into a manual loop per `spec.md` §4.D/§9:
//! this transport owns its dispatch instead of delegating to
//! `vhost_user_backend`'s automatic epoll loop, so the read/write split
//! between control-plane dispatch and data-plane pumping in §5 is explicit
//! rather than implicit in a library).

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use vm_memory::{Bytes, GuestAddress, GuestAddressSpace, GuestMemoryAtomic, GuestMemoryMmap};
use vmm_sys_util::eventfd::EventFd;

use virtio_queue::{DescriptorChain, Queue};

use crate::error::{Error, Result};
use crate::fuse_session::FuseSession;
use crate::slave_channel::SlaveChannelOps;
use crate::thread_pool::ThreadPool;
use crate::worker::{self, InSeg, OutSeg, Request, VirtQueueOps};

type GuestMemory = GuestMemoryAtomic<GuestMemoryMmap>;

/// A descriptor reduced to what the worker needs to know before it's
/// serviced: its guest address/length, and whether the daemon can read or
/// write it directly. A descriptor is "unmappable" when it falls outside
/// the guest's ordinary RAM regions — in practice, a reference into the
/// DAX cache window, which is mapped on the device side rather than the
/// daemon's (`spec.md` §1, §4.H).
struct DescRef {
    addr: u64,
    len: u32,
    mappable: bool,
}

fn classify(mem: &GuestMemoryMmap, addr: u64, len: u32) -> DescRef {
    let mappable = mem.get_slice(GuestAddress(addr), len as usize).is_ok();
    DescRef { addr, len, mappable }
}

/// Bridges a popped descriptor chain to the `VirtQueueOps` the worker
/// expects, serialized by `queue_mutex` (`spec.md` §4.C/§5, I1).
struct VringHandle {
    queue: Arc<Mutex<Queue<GuestMemory>>>,
    call_fd: EventFd,
    mem: GuestMemory,
}

impl VirtQueueOps for VringHandle {
    fn push(&self, head_index: u16, len: u32) {
        let mut queue = self.queue.lock().unwrap();
        queue
            .add_used(head_index, len)
            .expect("head_index came from a chain this queue just popped");
    }

    fn notify(&self) {
        let _ = self.call_fd.write(1);
    }

    /// Scatter every mappable reply segment into guest memory. Called by
    /// `Channel::push_and_notify` before `push`/`notify` above, so the
    /// guest never observes a used descriptor before its backing memory is
    /// written (`spec.md` §4.F ordering).
    fn write_back(&self, in_segs: &[worker::InSeg<'_>]) -> Result<()> {
        let guard = self.mem.memory();
        for seg in in_segs {
            if let worker::InSeg::Mappable { addr, buf } = seg {
                guard
                    .write_slice(buf, GuestAddress(*addr))
                    .map_err(|e| Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            }
        }
        Ok(())
    }
}

/// One request queue's pump state (`spec.md` §3 "queue-info", §4.D). Holds
/// only what it needs of shared session state, never the session itself,
/// so a queue-info doesn't keep the session alive on its own (`spec.md` §9
/// Design Note).
pub struct QueueInfo {
    index: u16,
    mem: GuestMemory,
    queue: Arc<Mutex<Queue<GuestMemory>>>,
    call_fd: EventFd,
    kick_fd: EventFd,
    kill_fd: EventFd,
    queue_mutex: Arc<Mutex<()>>,
    dispatch_lock: Arc<RwLock<()>>,
    slave: Arc<dyn SlaveChannelOps>,
    session: Arc<dyn FuseSession>,
    pool: Arc<ThreadPool>,
    buffer_size: usize,
}

impl QueueInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: u16,
        mem: GuestMemory,
        queue: Queue<GuestMemory>,
        call_fd: EventFd,
        kick_fd: EventFd,
        kill_fd: EventFd,
        dispatch_lock: Arc<RwLock<()>>,
        slave: Arc<dyn SlaveChannelOps>,
        session: Arc<dyn FuseSession>,
        pool: Arc<ThreadPool>,
    ) -> Self {
        let buffer_size = session.buffer_size();
        Self {
            index,
            mem,
            queue: Arc::new(Mutex::new(queue)),
            call_fd,
            kick_fd,
            kill_fd,
            queue_mutex: Arc::new(Mutex::new(())),
            dispatch_lock,
            slave,
            session,
            pool,
            buffer_size,
        }
    }

    /// Spawn the pump thread. Returns a handle the session controller joins
    /// on shutdown (`spec.md` §4.E).
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let kick_fd = self.kick_fd.try_clone().expect("dup kick_fd");
        let kill_fd = self.kill_fd.try_clone().expect("dup kill_fd");
        let info = self;
        std::thread::Builder::new()
            .name(format!("fs-pump-{}", info.index))
            .spawn(move || pump_loop(info, kick_fd, kill_fd, stop))
            .expect("failed to spawn pump thread")
    }

    /// Pop everything currently available and hand each chain to the
    /// thread pool. Popping happens under the dispatch rwlock's read side
    /// plus the per-queue mutex, same as every reply push (`spec.md` §5).
    fn drain_and_submit(&self) -> Result<()> {
        struct Popped {
            head_index: u16,
            out: Vec<DescRef>,
            in_descs: Vec<DescRef>,
        }

        let popped: Vec<Popped> = {
            let _dispatch_guard = self.dispatch_lock.read().unwrap();
            let _queue_guard = self.queue_mutex.lock().unwrap();
            let mut queue = self.queue.lock().unwrap();
            let guard = self.mem.memory();
            queue
                .iter()
                .map_err(|e| Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?
                .map(|chain: DescriptorChain<GuestMemory>| {
                    let head_index = chain.head_index();
                    let out = chain
                        .clone()
                        .readable()
                        .map(|d| classify(&guard, d.addr().0, d.len()))
                        .collect();
                    let in_descs = chain
                        .writable()
                        .map(|d| classify(&guard, d.addr().0, d.len()))
                        .collect();
                    Popped {
                        head_index,
                        out,
                        in_descs,
                    }
                })
                .collect()
        };

        for item in popped {
            let handle = Arc::new(VringHandle {
                queue: Arc::clone(&self.queue),
                call_fd: self.call_fd.try_clone().expect("dup call_fd"),
                mem: self.mem.clone(),
            });
            let queue_mutex = Arc::clone(&self.queue_mutex);
            let dispatch_lock = Arc::clone(&self.dispatch_lock);
            let slave = Arc::clone(&self.slave);
            let session = Arc::clone(&self.session);
            let mem = self.mem.clone();
            let buffer_size = self.buffer_size;

            self.pool.execute(move || {
                if let Err(e) = service_one(
                    item.head_index,
                    item.out,
                    item.in_descs,
                    &mem,
                    buffer_size,
                    session.as_ref(),
                    slave.as_ref(),
                    &*handle,
                    &queue_mutex,
                    &dispatch_lock,
                ) {
                    log::error!("request failed: {}", e);
                }
            });
        }
        Ok(())
    }
}

/// Read a request's readable descriptors into owned scratch and hand them
/// (plus freshly zeroed writable scratch) to [`worker::process_request`],
/// which scatters the writable scratch back into guest memory itself (via
/// `queue`'s [`VringHandle::write_back`]) before publishing the reply. All
/// guest memory access goes through `vm_memory`'s `Bytes` trait, the same
/// copy-through-host-buffer approach `DescriptorChainReader`/`Writer` use.
#[allow(clippy::too_many_arguments)]
fn service_one(
    head_index: u16,
    out_descs: Vec<DescRef>,
    in_descs: Vec<DescRef>,
    mem: &GuestMemory,
    buffer_size: usize,
    session: &dyn FuseSession,
    slave: &dyn SlaveChannelOps,
    queue: &dyn VirtQueueOps,
    queue_mutex: &Mutex<()>,
    dispatch_lock: &RwLock<()>,
) -> Result<()> {
    let guard = mem.memory();

    let mut out_bufs: Vec<Vec<u8>> = Vec::with_capacity(out_descs.len());
    let mut out_bytes = 0usize;
    for d in &out_descs {
        if d.mappable {
            if out_bytes + d.len as usize > buffer_size {
                return Err(Error::ProtocolViolation(format!(
                    "readable region exceeds buffer size {}",
                    buffer_size
                )));
            }
            let mut buf = vec![0u8; d.len as usize];
            guard
                .read_slice(&mut buf, GuestAddress(d.addr))
                .map_err(|e| Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            out_bytes += buf.len();
            out_bufs.push(buf);
        } else {
            out_bufs.push(Vec::new());
        }
    }
    let out: Vec<OutSeg> = out_descs
        .iter()
        .zip(out_bufs.iter())
        .map(|(d, buf)| {
            if d.mappable {
                OutSeg::Mappable(buf.as_slice())
            } else {
                OutSeg::Unmappable { addr: d.addr, len: d.len }
            }
        })
        .collect();

    let mut in_bufs: Vec<Vec<u8>> = in_descs
        .iter()
        .map(|d| if d.mappable { vec![0u8; d.len as usize] } else { Vec::new() })
        .collect();
    let in_segs: Vec<InSeg> = in_descs
        .iter()
        .zip(in_bufs.iter_mut())
        .map(|(d, buf)| {
            if d.mappable {
                InSeg::Mappable { addr: d.addr, buf: buf.as_mut_slice() }
            } else {
                InSeg::Unmappable { addr: d.addr, len: d.len }
            }
        })
        .collect();

    let req = Request {
        head_index,
        out,
        in_segs,
    };
    let mut bounce = Vec::new();
    // `process_request` scatters the reply into guest memory itself, via
    // `queue`'s `VirtQueueOps::write_back`, before it marks the descriptor
    // used — there is no write-back left to do here.
    worker::process_request(req, session, slave, queue, queue_mutex, dispatch_lock, &mut bounce)
}

fn pump_loop(info: Arc<QueueInfo>, kick_fd: EventFd, kill_fd: EventFd, stop: Arc<AtomicBool>) {
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
            log::error!("ppoll on queue {} failed: {}", info.index, err);
            break;
        }

        if fds[1].revents & libc::POLLIN != 0 {
            let _ = kill_fd.read();
            break;
        }
        if fds[0].revents & libc::POLLIN != 0 {
            let _ = kick_fd.read();
            if let Err(e) = info.drain_and_submit() {
                log::error!("queue {} pump error: {}", info.index, e);
                break;
            }
        }
    }
}
