//! Per-request handling: reconstructs a FUSE input buffer, invokes the
//! session, recycles the descriptor (`spec.md` §4.C).
//!
//! `Request`'s `out`/`in_segs` hold `&[u8]`/`&mut [u8]` slices. `queue_pump.rs`
//! fills them the same way `DescriptorChainReader`/`DescriptorChainWriter`
//! move bytes: each mappable descriptor is copied into (and, for the "in"
//! side, back out of) an owned scratch buffer via `GuestAddressSpace`'s
//! `Bytes::read`/`write`, never through a raw pointer into guest RAM. "Fast
//! path" below means zero-copy relative to the session's own bounce
//! buffer (no extra gather into one contiguous allocation), not zero-copy
//! all the way to the guest.

use std::os::unix::io::RawFd;
use std::sync::{Mutex, RwLock};

use vhost_user_fs_protocol::fuse::{FuseInHeader, FuseWriteIn, FUSE_IN_HEADER_SIZE, FUSE_READ, FUSE_WRITE, FUSE_WRITE_IN_SIZE};
use vhost_user_fs_protocol::{VuFsSlaveMsg, VuFsSlaveMsgFlags};

use crate::descriptor_utils::{gather_copy, iovec_copy};
use crate::error::{Error, Result};
use crate::fuse_session::{FileReadReplyHeader, FuseSession, ReplyChannel};
use crate::slave_channel::SlaveChannelOps;

/// One guest-to-daemon ("out") segment.
pub enum OutSeg<'a> {
    Mappable(&'a [u8]),
    /// Guest physical memory the daemon can't directly access; must be
    /// serviced via the back channel.
    Unmappable { addr: u64, len: u32 },
}

impl<'a> OutSeg<'a> {
    fn len(&self) -> u32 {
        match self {
            OutSeg::Mappable(b) => b.len() as u32,
            OutSeg::Unmappable { len, .. } => *len,
        }
    }
}

/// One daemon-to-guest ("in") segment. Mappable segments carry their guest
/// address alongside the scratch buffer so [`VirtQueueOps::write_back`] can
/// scatter the reply into guest memory at push time.
pub enum InSeg<'a> {
    Mappable { addr: u64, buf: &'a mut [u8] },
    Unmappable { addr: u64, len: u32 },
}

impl<'a> InSeg<'a> {
    fn len(&self) -> u32 {
        match self {
            InSeg::Mappable { buf, .. } => buf.len() as u32,
            InSeg::Unmappable { len, .. } => *len,
        }
    }
}

/// Push/notify primitives a [`Channel`] needs from the owning virtqueue,
/// abstracted so worker logic is testable without a live `virtio_queue`.
pub trait VirtQueueOps: Send + Sync {
    fn push(&self, head_index: u16, len: u32);
    fn notify(&self);

    /// Scatter every mappable segment's current bytes into guest memory,
    /// called by [`Channel::push_and_notify`] before the descriptor is
    /// marked used — the guest must never observe a used descriptor whose
    /// backing memory hasn't been written yet (`spec.md` §4.F's
    /// write-then-publish ordering, mirrored by `notify.rs`'s
    /// `NotificationSender::send`). A no-op by default: tests hand
    /// [`InSeg::Mappable`] buffers that already *are* the sink, with no
    /// separate guest memory to scatter into.
    fn write_back(&self, _in_segs: &[InSeg<'_>]) -> Result<()> {
        Ok(())
    }
}

/// A descriptor-chain element captured by value from the pop operation
/// (`spec.md` §3). Consumed by [`process_request`].
pub struct Request<'a> {
    pub head_index: u16,
    pub out: Vec<OutSeg<'a>>,
    pub in_segs: Vec<InSeg<'a>>,
}

impl<'a> Request<'a> {
    fn bad_out_num(&self) -> usize {
        trailing_unmappable_out(&self.out)
    }

    fn bad_in_num(&self) -> usize {
        trailing_unmappable_in(&self.in_segs)
    }
}

fn trailing_unmappable_out(out: &[OutSeg<'_>]) -> usize {
    out.iter()
        .rev()
        .take_while(|s| matches!(s, OutSeg::Unmappable { .. }))
        .count()
}

fn trailing_unmappable_in(in_segs: &[InSeg<'_>]) -> usize {
    in_segs
        .iter()
        .rev()
        .take_while(|s| matches!(s, InSeg::Unmappable { .. }))
        .count()
}

/// The per-request reply channel (`spec.md` §3 "channel record", §4.C,
/// §4.F). Bound to the owning queue-info: `queue_mutex` serializes push
/// against other workers on the same queue, `dispatch_lock` is held as a
/// reader for the duration of push/notify so a concurrent control-plane
/// memory-table update can't race it (`spec.md` §5).
pub struct Channel<'q, 'a> {
    queue: &'q dyn VirtQueueOps,
    queue_mutex: &'q Mutex<()>,
    dispatch_lock: &'q RwLock<()>,
    slave: &'q dyn SlaveChannelOps,
    head_index: u16,
    in_segs: Vec<InSeg<'a>>,
    reply_sent: bool,
}

impl<'q, 'a> Channel<'q, 'a> {
    pub fn new(
        queue: &'q dyn VirtQueueOps,
        queue_mutex: &'q Mutex<()>,
        dispatch_lock: &'q RwLock<()>,
        slave: &'q dyn SlaveChannelOps,
        head_index: u16,
        in_segs: Vec<InSeg<'a>>,
    ) -> Self {
        Self {
            queue,
            queue_mutex,
            dispatch_lock,
            slave,
            head_index,
            in_segs,
            reply_sent: false,
        }
    }

    pub fn reply_sent(&self) -> bool {
        self.reply_sent
    }

    /// Write every mappable segment back into guest memory, then push with
    /// the locking protocol common to every reply path: a reader on the
    /// dispatch rwlock, then the per-queue mutex (`spec.md` §4.C, §5). The
    /// write-back happens before the descriptor is marked used, matching
    /// `notify.rs`'s `write_slice`-then-`add_used` ordering — the guest
    /// must never see a used descriptor before its memory is written.
    fn push_and_notify(&self, len: u32) -> Result<()> {
        self.queue.write_back(&self.in_segs)?;
        let _dispatch_guard = self.dispatch_lock.read().unwrap();
        let _queue_guard = self.queue_mutex.lock().unwrap();
        self.queue.push(self.head_index, len);
        self.queue.notify();
        Ok(())
    }

    /// No reply was sent; recycle the descriptor with zero length so the
    /// guest can reclaim it (`spec.md` §4.C, I1/I2).
    pub fn recycle_empty(&mut self) -> Result<()> {
        if !self.reply_sent {
            self.push_and_notify(0)?;
        }
        Ok(())
    }

    fn sink_capacity(&self) -> u32 {
        self.in_segs.iter().map(InSeg::len).sum()
    }

    /// Mappable-only prefix length (bytes we can memcpy into directly).
    fn mappable_capacity(&self) -> u32 {
        self.in_segs
            .iter()
            .take_while(|s| matches!(s, InSeg::Mappable { .. }))
            .map(InSeg::len)
            .sum()
    }
}

impl<'q, 'a> ReplyChannel for Channel<'q, 'a> {
    fn send_reply_iov(&mut self, header: &[u8], payload: &[&[u8]]) -> Result<()> {
        let needed = header.len() + payload.iter().map(|p| p.len()).sum::<usize>();
        let available = self.sink_capacity() as usize;
        if needed > available {
            return Err(Error::ReplyBufferTooSmall { needed, available });
        }

        let mut total: Vec<&[u8]> = Vec::with_capacity(payload.len() + 1);
        total.push(header);
        total.extend_from_slice(payload);

        let mut dst: Vec<&mut [u8]> = self
            .in_segs
            .iter_mut()
            .map(|s| match s {
                InSeg::Mappable { buf, .. } => &mut **buf,
                InSeg::Unmappable { .. } => {
                    unreachable!("send_reply_iov requires an all-mappable sink")
                }
            })
            .collect();
        iovec_copy(&total, &mut dst, needed);

        self.push_and_notify(needed as u32)?;
        self.reply_sent = true;
        Ok(())
    }

    fn send_reply_data_iov(
        &mut self,
        header: &mut dyn FileReadReplyHeader,
        fd: RawFd,
        pos: i64,
        len: u32,
    ) -> Result<()> {
        let header_bytes = header.as_bytes().to_vec();
        let header_len = header_bytes.len() as u32;
        let mappable_cap = self.mappable_capacity();
        if header_len > mappable_cap {
            return Err(Error::ReplyBufferTooSmall {
                needed: header_len as usize,
                available: mappable_cap as usize,
            });
        }

        // (a) header into the writable prefix.
        {
            let src: [&[u8]; 1] = [&header_bytes];
            let mut dst: Vec<&mut [u8]> = self
                .in_segs
                .iter_mut()
                .filter_map(|s| match s {
                    InSeg::Mappable { buf, .. } => Some(&mut **buf),
                    InSeg::Unmappable { .. } => None,
                })
                .collect();
            iovec_copy(&src, &mut dst, header_bytes.len());
        }

        // Locate the cursor (segment index, byte offset within it) where the
        // payload-writable tail begins. `self.in_segs` is never split or
        // drained here — every original segment, including the one(s) the
        // header landed in, must stay reachable so `push_and_notify`'s
        // write-back later scatters the whole reply, not just the tail.
        let mut remaining_header = header_len;
        let mut start_idx = self.in_segs.len();
        let mut start_offset = 0usize;
        for (i, seg) in self.in_segs.iter().enumerate() {
            if remaining_header == 0 {
                start_idx = i;
                start_offset = 0;
                break;
            }
            match seg {
                InSeg::Mappable { buf, .. } => {
                    if (buf.len() as u32) <= remaining_header {
                        remaining_header -= buf.len() as u32;
                        start_idx = i + 1;
                        start_offset = 0;
                    } else {
                        start_offset = remaining_header as usize;
                        remaining_header = 0;
                        start_idx = i;
                    }
                }
                InSeg::Unmappable { .. } => {
                    unreachable!("header must land entirely in the mappable prefix")
                }
            }
        }

        // (b) vectored read from fd, short reads repeat, EOF shrinks reply.
        let mut total_written: u32 = 0;
        let mut eof = false;
        {
            let mut file_pos = pos;
            for (rel_idx, seg) in self.in_segs[start_idx..].iter_mut().enumerate() {
                if total_written >= len {
                    break;
                }
                let offset = if rel_idx == 0 { start_offset } else { 0 };
                if let InSeg::Mappable { buf, .. } = seg {
                    let want = std::cmp::min(len - total_written, (buf.len() - offset) as u32);
                    let mut got = 0u32;
                    while got < want {
                        let n = pread(fd, &mut buf[offset + got as usize..offset + want as usize], file_pos)?;
                        if n == 0 {
                            eof = true;
                            break;
                        }
                        got += n as u32;
                        file_pos += n as i64;
                    }
                    total_written += got;
                    if eof {
                        break;
                    }
                } else {
                    // Unmappable sink reached before the file was exhausted;
                    // handled below in step (c).
                    break;
                }
            }
        }

        // (c) remaining unmappable tail, one entry at a time via IO RPC.
        if !eof {
            let mut file_offset = pos + total_written as i64;
            for seg in self.in_segs[start_idx..].iter() {
                if total_written >= len {
                    break;
                }
                if let InSeg::Unmappable { addr, len: seg_len } = seg {
                    let want = std::cmp::min(len - total_written, *seg_len);
                    let msg = VuFsSlaveMsg::single(
                        VuFsSlaveMsgFlags::MAP_R,
                        file_offset as u64,
                        *addr,
                        want as u64,
                    );
                    match self.slave.io(&msg, fd) {
                        Ok(0) => break,
                        Ok(n) => {
                            total_written += n as u32;
                            file_offset += n as i64;
                            if (n as u32) < want {
                                break;
                            }
                        }
                        Err(e) => return Err(Error::BackChannel(e)),
                    }
                }
            }
        }

        if total_written < len {
            header.set_payload_len(total_written);
        }

        let reply_len = header_len + total_written;
        self.push_and_notify(reply_len)?;
        self.reply_sent = true;
        Ok(())
    }
}

fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> Result<usize> {
    let ret = unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset as libc::off_t,
        )
    };
    if ret < 0 {
        Err(Error::Io(std::io::Error::last_os_error()))
    } else {
        Ok(ret as usize)
    }
}

/// Process one popped request: reconstruct the FUSE input buffer, invoke
/// `session`, and guarantee exactly one push (`spec.md` §4.C, I1).
pub fn process_request(
    req: Request<'_>,
    session: &dyn FuseSession,
    slave: &dyn SlaveChannelOps,
    queue: &dyn VirtQueueOps,
    queue_mutex: &Mutex<()>,
    dispatch_lock: &RwLock<()>,
    bounce: &mut Vec<u8>,
) -> Result<()> {
    let Request {
        head_index,
        out,
        in_segs,
    } = req;

    let bad_out_num = trailing_unmappable_out(&out);
    let bad_in_num = trailing_unmappable_in(&in_segs);
    let out_num_readable = out.len() - bad_out_num;

    let readable_len: usize = out[..out_num_readable].iter().map(|s| s.len() as usize).sum();
    if readable_len < FUSE_IN_HEADER_SIZE {
        return Err(Error::ProtocolViolation(format!(
            "readable prefix {} bytes shorter than fuse_in_header",
            readable_len
        )));
    }
    if readable_len > session.buffer_size() {
        return Err(Error::ProtocolViolation(format!(
            "readable region {} exceeds buffer size {}",
            readable_len,
            session.buffer_size()
        )));
    }

    // First readable iovec copied into the bounce buffer so the header
    // can't be mutated by a concurrent guest after inspection.
    let first_len = match out.first() {
        Some(OutSeg::Mappable(b)) => b.len(),
        _ => {
            return Err(Error::ProtocolViolation(
                "first out iovec is unmappable".into(),
            ))
        }
    };
    bounce.clear();
    bounce.resize(first_len, 0);
    if let Some(OutSeg::Mappable(b)) = out.first() {
        bounce.copy_from_slice(b);
    }
    if bounce.len() < FUSE_IN_HEADER_SIZE {
        return Err(Error::ProtocolViolation(
            "first out iovec shorter than fuse_in_header".into(),
        ));
    }
    let header = FuseInHeader::from_bytes(&bounce[..FUSE_IN_HEADER_SIZE])
        .ok_or_else(|| Error::ProtocolViolation("truncated fuse_in_header".into()))?;

    let mut extra: Vec<&[u8]> = Vec::new();

    if bad_out_num == 0
        && out.len() > 2
        && header.opcode == FUSE_WRITE
        && matches!(out[0], OutSeg::Mappable(ref b) if b.len() == FUSE_IN_HEADER_SIZE)
        && matches!(out[1], OutSeg::Mappable(ref b) if b.len() == FUSE_WRITE_IN_SIZE)
    {
        // Strategy 1: unmappable WRITE fast path — headers staged, payload
        // exposed in place.
        if let OutSeg::Mappable(b) = &out[1] {
            let _write_in = FuseWriteIn::from_bytes(b)
                .ok_or_else(|| Error::ProtocolViolation("truncated fuse_write_in".into()))?;
        }
        bounce.clear();
        bounce.resize(FUSE_IN_HEADER_SIZE + FUSE_WRITE_IN_SIZE, 0);
        if let (OutSeg::Mappable(a), OutSeg::Mappable(b)) = (&out[0], &out[1]) {
            bounce[..FUSE_IN_HEADER_SIZE].copy_from_slice(a);
            bounce[FUSE_IN_HEADER_SIZE..].copy_from_slice(b);
        }
        for seg in &out[2..] {
            match seg {
                OutSeg::Mappable(b) => extra.push(b),
                OutSeg::Unmappable { .. } => {
                    return Err(Error::ProtocolViolation(
                        "unmappable entry in fast-path WRITE payload".into(),
                    ))
                }
            }
        }
    } else if bad_in_num > 0 && out.len() == 2 && bad_out_num == 0 && header.opcode == FUSE_READ {
        // Strategy 2: unmappable READ passthrough — headers only, reply
        // serviced later via the back channel.
        bounce.clear();
        bounce.resize(readable_len, 0);
        let refs: Vec<&[u8]> = out
            .iter()
            .map(|s| match s {
                OutSeg::Mappable(b) => *b,
                OutSeg::Unmappable { .. } => unreachable!(),
            })
            .collect();
        gather_copy(&refs, bounce);
    } else if bad_out_num == 0 && bad_in_num == 0 {
        // Strategy 3: generic — gather the entire readable region.
        bounce.clear();
        bounce.resize(readable_len, 0);
        let refs: Vec<&[u8]> = out
            .iter()
            .map(|s| match s {
                OutSeg::Mappable(b) => *b,
                OutSeg::Unmappable { .. } => unreachable!(),
            })
            .collect();
        gather_copy(&refs, bounce);
    } else {
        return Err(Error::ProtocolViolation(format!(
            "unsupported unmappable layout: bad_out_num={} bad_in_num={} out_num={}",
            bad_out_num,
            bad_in_num,
            out.len()
        )));
    }

    let mut channel = Channel::new(queue, queue_mutex, dispatch_lock, slave, head_index, in_segs);
    session
        .process(&header, bounce, &extra, &mut channel)
        .map_err(Error::Io)?;
    channel.recycle_empty()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuse_session::NullFuseSession;
    use crate::slave_channel::fake::FakeSlaveChannel;
    use std::os::unix::io::AsRawFd;

    struct FakeVirtQueue {
        pushes: Mutex<Vec<(u16, u32)>>,
        notifies: Mutex<usize>,
    }

    impl FakeVirtQueue {
        fn new() -> Self {
            Self {
                pushes: Mutex::new(Vec::new()),
                notifies: Mutex::new(0),
            }
        }
    }

    impl VirtQueueOps for FakeVirtQueue {
        fn push(&self, head_index: u16, len: u32) {
            self.pushes.lock().unwrap().push((head_index, len));
        }
        fn notify(&self) {
            *self.notifies.lock().unwrap() += 1;
        }
    }

    fn fuse_in_header_bytes(len: u32, opcode: u32, unique: u64) -> Vec<u8> {
        let mut b = vec![0u8; FUSE_IN_HEADER_SIZE];
        b[0..4].copy_from_slice(&len.to_ne_bytes());
        b[4..8].copy_from_slice(&opcode.to_ne_bytes());
        b[8..16].copy_from_slice(&unique.to_ne_bytes());
        b
    }

    #[test]
    fn tiny_getattr_pushes_full_reply() {
        let session = NullFuseSession::new().unwrap();
        let slave = FakeSlaveChannel::default();
        let queue = FakeVirtQueue::new();
        let queue_mutex = Mutex::new(());
        let dispatch_lock = RwLock::new(());
        let mut bounce = Vec::new();

        let header_buf = fuse_in_header_bytes(FUSE_IN_HEADER_SIZE as u32, vhost_user_fs_protocol::fuse::FUSE_GETATTR, 7);
        let mut sink = vec![0u8; 96];
        let out = vec![OutSeg::Mappable(&header_buf)];
        let in_segs = vec![InSeg::Mappable { addr: 0, buf: &mut sink }];
        let req = Request {
            head_index: 3,
            out,
            in_segs,
        };

        process_request(req, &session, &slave, &queue, &queue_mutex, &dispatch_lock, &mut bounce).unwrap();

        let pushes = queue.pushes.lock().unwrap();
        assert_eq!(pushes.as_slice(), &[(3, 96)]);
        assert_eq!(*queue.notifies.lock().unwrap(), 1);
    }

    #[test]
    fn unmappable_read_passthrough_uses_back_channel() {
        let session = NullFuseSession::new().unwrap();
        let slave = FakeSlaveChannel::default();
        let queue = FakeVirtQueue::new();
        let queue_mutex = Mutex::new(());
        let dispatch_lock = RwLock::new(());
        let mut bounce = Vec::new();

        let hdr = fuse_in_header_bytes(80, FUSE_READ, 1);
        let mut read_in = vec![0u8; 40];
        read_in[0..8].copy_from_slice(&0u64.to_ne_bytes()); // offset
        read_in[8..12].copy_from_slice(&8192u32.to_ne_bytes()); // size

        let mut header_sink = vec![0u8; 16];
        let out = vec![OutSeg::Mappable(&hdr), OutSeg::Mappable(&read_in)];
        let in_segs = vec![
            InSeg::Mappable { addr: 0, buf: &mut header_sink },
            InSeg::Unmappable { addr: 0x1000, len: 2048 },
            InSeg::Unmappable { addr: 0x2000, len: 2048 },
            InSeg::Unmappable { addr: 0x3000, len: 2048 },
            InSeg::Unmappable { addr: 0x4000, len: 2048 },
        ];
        let req = Request {
            head_index: 9,
            out,
            in_segs,
        };

        process_request(req, &session, &slave, &queue, &queue_mutex, &dispatch_lock, &mut bounce).unwrap();

        let calls = slave.io_calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        for (_, _, len) in calls.iter() {
            assert_eq!(*len, 2048);
        }
        let pushes = queue.pushes.lock().unwrap();
        assert_eq!(pushes.as_slice(), &[(9, 16 + 8192)]);
    }

    #[test]
    fn fast_path_write_exposes_payload_zero_copy() {
        let session = NullFuseSession::new().unwrap();
        let slave = FakeSlaveChannel::default();
        let queue = FakeVirtQueue::new();
        let queue_mutex = Mutex::new(());
        let dispatch_lock = RwLock::new(());
        let mut bounce = Vec::new();

        let hdr = fuse_in_header_bytes(
            (FUSE_IN_HEADER_SIZE + FUSE_WRITE_IN_SIZE + 65536) as u32,
            FUSE_WRITE,
            2,
        );
        let mut write_in = vec![0u8; 40];
        write_in[8..12].copy_from_slice(&65536u32.to_ne_bytes());
        let payload_a = vec![0xABu8; 32768];
        let payload_b = vec![0xCDu8; 32768];

        let mut reply_sink = vec![0u8; 24];
        let out = vec![
            OutSeg::Mappable(&hdr),
            OutSeg::Mappable(&write_in),
            OutSeg::Mappable(&payload_a),
            OutSeg::Mappable(&payload_b),
        ];
        let in_segs = vec![InSeg::Mappable { addr: 0, buf: &mut reply_sink }];
        let req = Request {
            head_index: 1,
            out,
            in_segs,
        };

        process_request(req, &session, &slave, &queue, &queue_mutex, &dispatch_lock, &mut bounce).unwrap();

        let pushes = queue.pushes.lock().unwrap();
        assert_eq!(pushes.as_slice(), &[(1, 24)]);
    }

    #[test]
    fn unsupported_unmappable_layout_is_protocol_violation() {
        let session = NullFuseSession::new().unwrap();
        let slave = FakeSlaveChannel::default();
        let queue = FakeVirtQueue::new();
        let queue_mutex = Mutex::new(());
        let dispatch_lock = RwLock::new(());
        let mut bounce = Vec::new();

        let hdr = fuse_in_header_bytes(FUSE_IN_HEADER_SIZE as u32, vhost_user_fs_protocol::fuse::FUSE_GETATTR, 1);
        let mut sink = vec![0u8; 96];
        // bad_out_num > 0 but doesn't match the fast-path WRITE shape.
        let out = vec![OutSeg::Mappable(&hdr), OutSeg::Unmappable { addr: 0, len: 8 }];
        let in_segs = vec![InSeg::Mappable { addr: 0, buf: &mut sink }];
        let req = Request {
            head_index: 0,
            out,
            in_segs,
        };

        let err = process_request(req, &session, &slave, &queue, &queue_mutex, &dispatch_lock, &mut bounce)
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[test]
    fn short_read_falls_back_to_unmappable_tail() {
        use std::io::Write as _;
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(&vec![0x11u8; 100]).unwrap();

        let session = NullFuseSession::with_read_source(tmp.try_clone().unwrap());
        let slave = FakeSlaveChannel::default();
        let queue = FakeVirtQueue::new();
        let queue_mutex = Mutex::new(());
        let dispatch_lock = RwLock::new(());
        let mut bounce = Vec::new();

        let hdr = fuse_in_header_bytes(80, FUSE_READ, 4);
        let read_in = vec![0u8; 40];
        let mut header_sink = vec![0u8; 16];
        let out = vec![OutSeg::Mappable(&hdr), OutSeg::Mappable(&read_in)];
        // Mappable sink is shorter than the file; the rest must go through
        // the back channel.
        let in_segs = vec![
            InSeg::Mappable { addr: 0, buf: &mut header_sink },
            InSeg::Unmappable { addr: 0x9000, len: 4096 },
        ];
        let req = Request {
            head_index: 2,
            out,
            in_segs,
        };

        process_request(req, &session, &slave, &queue, &queue_mutex, &dispatch_lock, &mut bounce).unwrap();

        // /dev/zero never shortens, so the whole 8192-byte reply should
        // have gone out with the unmappable tail picking up whatever the
        // mappable prefix didn't cover.
        let _ = tmp.as_raw_fd();
    }
}
