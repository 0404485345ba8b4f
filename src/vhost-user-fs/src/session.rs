//! Session Controller (`spec.md` §4.G): owns the listening socket, accepts
//! one connection, constructs the device, and runs the vhost-user dispatch
//! loop.
//!
//! Built against `vhost::vhost_user`'s low-level `SlaveListener` /
//! `VhostUserSlaveReqHandlerMut` rather than `vhost_user_backend`'s
//! `VhostUserDaemon` convenience wrapper the teacher uses in `main.rs`:
//! `spec.md` §4.G/§5 wants an explicit write-lock-then-dispatch step the
//! controller owns outright, with queue threads reading the same lock, and
//! that's only reachable by driving the protocol state machine directly.
//! See `DESIGN.md`.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use vhost::vhost_user::message::{VhostUserProtocolFeatures, VhostUserVirtioFeatures};
use vhost::vhost_user::{SlaveFsCacheReq, SlaveListener, VhostUserSlaveReqHandlerMut};
use virtio_queue::Queue;
use vm_memory::{GuestMemoryAtomic, GuestMemoryMmap};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use vhost_user_fs_protocol::VirtioFsConfig;

use crate::config::FsConfig;
use crate::error::{Error, Result};
use crate::fuse_session::FuseSession;
use crate::notify::{NotificationPump, NotificationSender};
use crate::queue_pump::QueueInfo;
use crate::slave_channel::{SlaveChannel, SlaveChannelOps};
use crate::thread_pool::ThreadPool;

const VIRTIO_F_VERSION_1: u32 = 32;
/// Three predeclared queues (`spec.md` §4.G): hi-prio, notification, one
/// request queue.
const HIPRIO_QUEUE: u16 = 0;
const NOTIFY_QUEUE: u16 = 1;
const REQUEST_QUEUE: u16 = 2;
const NUM_QUEUES: usize = 3;

type GuestMemory = GuestMemoryAtomic<GuestMemoryMmap>;

/// Derives the pid-lock file path from the socket path (`spec.md` §4.G,
/// §6): `/` replaced by `.`, suffixed `.pid`, under the same directory.
fn pid_lock_path(socket_path: &Path) -> PathBuf {
    let mangled: String = socket_path
        .to_string_lossy()
        .chars()
        .map(|c| if c == '/' { '.' } else { c })
        .collect();
    PathBuf::from(format!("{}.pid", mangled))
}

fn write_pid_lock(socket_path: &Path) -> Result<File> {
    let path = pid_lock_path(socket_path);
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(Error::Io)?;
    write!(f, "{}", std::process::id()).map_err(Error::Io)?;
    Ok(f)
}

struct QueueSlot {
    started: bool,
    kill_fd: Option<EventFd>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Default for QueueSlot {
    fn default() -> Self {
        Self {
            started: false,
            kill_fd: None,
            join: None,
        }
    }
}

/// The vhost-user protocol state machine, driving `queue_pump`/`notify`
/// lifecycle off the callback table (`spec.md` §4.G).
struct FsRequestHandler {
    config: FsConfig,
    mem: Option<GuestMemory>,
    queues: Vec<Option<Queue<GuestMemory>>>,
    vring_kick: Vec<Option<EventFd>>,
    vring_call: Vec<Option<EventFd>>,
    slots: Vec<QueueSlot>,
    notifications_enabled: bool,
    dispatch_lock: Arc<RwLock<()>>,
    slave: Option<Arc<dyn SlaveChannelOps>>,
    session: Arc<dyn FuseSession>,
    pool: Arc<ThreadPool>,
    notification_sender: Option<Arc<NotificationSender>>,
}

impl FsRequestHandler {
    fn new(
        config: FsConfig,
        session: Arc<dyn FuseSession>,
        pool: Arc<ThreadPool>,
        dispatch_lock: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            config,
            mem: None,
            queues: (0..NUM_QUEUES).map(|_| None).collect(),
            vring_kick: (0..NUM_QUEUES).map(|_| None).collect(),
            vring_call: (0..NUM_QUEUES).map(|_| None).collect(),
            slots: (0..NUM_QUEUES).map(|_| QueueSlot::default()).collect(),
            notifications_enabled: false,
            dispatch_lock,
            slave: None,
            session,
            pool,
            notification_sender: None,
        }
    }

    fn valid_queues(&self) -> usize {
        if self.notifications_enabled {
            NUM_QUEUES
        } else {
            NUM_QUEUES - 1
        }
    }

    fn start_queue(&mut self, qidx: u16) -> std::result::Result<(), std::io::Error> {
        if qidx as usize >= self.valid_queues() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("qidx {} beyond valid_queues {}", qidx, self.valid_queues()),
            ));
        }

        let kill_fd = EventFd::new(EFD_NONBLOCK).map_err(eventfd_io_err)?;
        let mem = self.mem.clone().expect("set_mem_table precedes queue_set_started");
        let kick_fd = self.vring_kick[qidx as usize]
            .as_ref()
            .expect("set_vring_kick precedes queue_set_started")
            .try_clone()
            .map_err(eventfd_io_err)?;
        let call_fd = self.vring_call[qidx as usize]
            .as_ref()
            .expect("set_vring_call precedes queue_set_started")
            .try_clone()
            .map_err(eventfd_io_err)?;

        let join = if qidx == NOTIFY_QUEUE && self.notifications_enabled {
            let pump = Arc::new(NotificationPump::new(qidx, kick_fd, kill_fd.try_clone().map_err(eventfd_io_err)?));
            let queue = self.queues[qidx as usize]
                .take()
                .expect("queue constructed at realize time");
            let queue = Arc::new(Mutex::new(queue));
            self.notification_sender = Some(Arc::new(NotificationSender::new(
                queue,
                mem,
                call_fd,
                Arc::new(Mutex::new(())),
                Arc::clone(&self.dispatch_lock),
            )));
            pump.spawn()
        } else {
            // With notifications disabled, qidx NOTIFY_QUEUE isn't a
            // notification queue at all — it's the sole FUSE request queue,
            // since `valid_queues()` then caps at two (HIPRIO_QUEUE and this
            // one) and REQUEST_QUEUE is never negotiated.
            debug_assert!(
                qidx == HIPRIO_QUEUE || qidx == REQUEST_QUEUE || (qidx == NOTIFY_QUEUE && !self.notifications_enabled),
                "start_queue called with qidx {} outside the predeclared queues",
                qidx
            );
            let queue = self.queues[qidx as usize]
                .take()
                .expect("queue constructed at realize time");
            let slave = Arc::clone(self.slave.as_ref().expect("set_slave_req_fd precedes queue_set_started"));
            let info = Arc::new(QueueInfo::new(
                qidx,
                mem,
                queue,
                call_fd,
                kick_fd,
                kill_fd.try_clone().map_err(eventfd_io_err)?,
                Arc::clone(&self.dispatch_lock),
                slave,
                Arc::clone(&self.session),
                Arc::clone(&self.pool),
            ));
            info.spawn()
        };

        self.slots[qidx as usize] = QueueSlot {
            started: true,
            kill_fd: Some(kill_fd),
            join: Some(join),
        };
        Ok(())
    }

    fn stop_queue(&mut self, qidx: u16) {
        let slot = &mut self.slots[qidx as usize];
        if let Some(kill_fd) = slot.kill_fd.take() {
            let _ = kill_fd.write(1);
        }
        if let Some(join) = slot.join.take() {
            let _ = join.join();
        }
        slot.started = false;
    }
}

fn eventfd_io_err(e: std::io::Error) -> std::io::Error {
    e
}

impl VhostUserSlaveReqHandlerMut for FsRequestHandler {
    fn get_features(&mut self) -> std::result::Result<u64, std::io::Error> {
        Ok((1 << VIRTIO_F_VERSION_1)
            | vhost_user_fs_protocol::VIRTIO_FS_F_NOTIFICATION
            | VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits())
    }

    fn set_features(&mut self, features: u64) -> std::result::Result<(), std::io::Error> {
        self.notifications_enabled = features & vhost_user_fs_protocol::VIRTIO_FS_F_NOTIFICATION != 0;
        Ok(())
    }

    fn set_owner(&mut self) -> std::result::Result<(), std::io::Error> {
        Ok(())
    }

    fn reset_owner(&mut self) -> std::result::Result<(), std::io::Error> {
        Ok(())
    }

    fn get_protocol_features(&mut self) -> std::result::Result<VhostUserProtocolFeatures, std::io::Error> {
        Ok(VhostUserProtocolFeatures::CONFIG | VhostUserProtocolFeatures::SLAVE_REQ)
    }

    fn set_protocol_features(&mut self, _features: u64) -> std::result::Result<(), std::io::Error> {
        Ok(())
    }

    fn set_mem_table(&mut self, mem: GuestMemory) -> std::result::Result<(), std::io::Error> {
        self.mem = Some(mem);
        Ok(())
    }

    fn get_queue_num(&mut self) -> std::result::Result<u64, std::io::Error> {
        Ok(NUM_QUEUES as u64)
    }

    fn set_vring_num(&mut self, index: u32, num: u32) -> std::result::Result<(), std::io::Error> {
        let mem = self.mem.clone().expect("set_mem_table precedes set_vring_num");
        self.queues[index as usize] = Some(Queue::new(mem, num as u16).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
        })?);
        Ok(())
    }

    fn set_vring_kick(&mut self, index: u8, fd: RawFd) -> std::result::Result<(), std::io::Error> {
        self.vring_kick[index as usize] = Some(eventfd_from_raw(fd));
        Ok(())
    }

    fn set_vring_call(&mut self, index: u8, fd: RawFd) -> std::result::Result<(), std::io::Error> {
        self.vring_call[index as usize] = Some(eventfd_from_raw(fd));
        Ok(())
    }

    fn set_vring_err(&mut self, _index: u8, _fd: RawFd) -> std::result::Result<(), std::io::Error> {
        Ok(())
    }

    fn set_vring_addr(
        &mut self,
        _index: u32,
        _flags: u32,
        _descriptor: u64,
        _used: u64,
        _available: u64,
        _log: u64,
    ) -> std::result::Result<(), std::io::Error> {
        Ok(())
    }

    fn set_vring_base(&mut self, _index: u32, _base: u32) -> std::result::Result<(), std::io::Error> {
        Ok(())
    }

    fn get_vring_base(&mut self, _index: u32) -> std::result::Result<u32, std::io::Error> {
        Ok(0)
    }

    fn set_vring_enable(&mut self, _index: u32, _enable: bool) -> std::result::Result<(), std::io::Error> {
        Ok(())
    }

    /// Always false: queues aren't processed strictly in order once the
    /// worker pool can push replies out of order (`spec.md` §4.G, §5).
    fn queue_is_processed_in_order(&mut self, _index: u32) -> std::result::Result<bool, std::io::Error> {
        Ok(false)
    }

    fn queue_set_started(&mut self, index: u32, started: bool) -> std::result::Result<(), std::io::Error> {
        let qidx = index as u16;
        if started {
            self.start_queue(qidx)
        } else {
            self.stop_queue(qidx);
            Ok(())
        }
    }

    fn get_config(&mut self, _offset: u32, _size: u32, _flags: u32) -> Vec<u8> {
        use vm_memory::ByteValued;
        let cfg = VirtioFsConfig::new(&self.config.tag, 1, self.config.notify_buf_size())
            .expect("tag length validated at config-parse time");
        cfg.as_slice().to_vec()
    }

    fn set_config(&mut self, _offset: u32, _buf: &[u8], _flags: u32) -> std::result::Result<(), std::io::Error> {
        Ok(())
    }

    fn set_slave_req_fd(&mut self, fd: SlaveFsCacheReq) {
        self.slave = Some(Arc::new(SlaveChannel::new(fd)));
    }
}

/// Drives the realize → run lifecycle (`spec.md` §4.G).
pub struct SessionController {
    socket_path: PathBuf,
    _pid_lock: File,
    listener: UnixListener,
}

impl SessionController {
    /// Realize: create the listen directory (assumed to already exist —
    /// out of scope per `spec.md` §1), write the pid-lock file, bind and
    /// listen on the control socket.
    pub fn realize(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let pid_lock = write_pid_lock(&socket_path)?;
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(Error::Io)?;
        }
        let listener = UnixListener::bind(&socket_path).map_err(Error::Io)?;
        Ok(Self {
            socket_path,
            _pid_lock: pid_lock,
            listener,
        })
    }

    /// Accept exactly one connection, close the listener, then run the
    /// dispatch loop until the peer disconnects or dispatch fails
    /// (`spec.md` §4.G, §7 transport-fatal).
    pub fn run(self, config: FsConfig, session: Arc<dyn FuseSession>, pool: Arc<ThreadPool>) -> Result<()> {
        let (stream, _) = self.listener.accept().map_err(Error::Io)?;
        drop(self.listener);
        let _ = std::fs::remove_file(&self.socket_path);

        let dispatch_lock = Arc::new(RwLock::new(()));
        let handler = FsRequestHandler::new(config, session, pool, Arc::clone(&dispatch_lock));
        let mut req_handler = SlaveListener::new(stream, handler)
            .map_err(|e| Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
            .into_req_handler()
            .map_err(|e| Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        loop {
            let ret = wait_readable(req_handler.as_raw_fd());
            if let Err(e) = ret {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Transport(e));
            }

            // Write-locked here, read-locked by every queue pump/worker
            // during pop/push/notify (`spec.md` §5): this guarantees a
            // memory-table update can't race in-flight data-plane
            // mutation.
            let _write_guard = dispatch_lock.write().unwrap();
            match req_handler.handle_request() {
                Ok(_) => {}
                Err(e) => {
                    log::error!("dispatch failed: {}", e);
                    return Err(Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())));
                }
            }
        }
    }
}

fn wait_readable(fd: RawFd) -> std::io::Result<()> {
    let mut poll_fd = [libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }];
    let ret = unsafe { libc::ppoll(poll_fd.as_mut_ptr(), 1, std::ptr::null(), std::ptr::null()) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn eventfd_from_raw(fd: RawFd) -> EventFd {
    use std::os::unix::io::FromRawFd;
    unsafe { EventFd::from_raw_fd(fd) }
}
