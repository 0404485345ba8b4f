//! Daemon-side vhost-user virtio-fs transport: bridges a virtqueue-based
//! request stream to an opaque FUSE session (`spec.md` §1).

pub mod config;
pub mod descriptor_utils;
pub mod error;
pub mod fuse_session;
pub mod notify;
pub mod queue_pump;
pub mod session;
pub mod slave_channel;
pub mod thread_pool;
pub mod worker;
