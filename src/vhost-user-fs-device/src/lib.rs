//! Hypervisor-resident half of the vhost-user virtio-fs transport: the DAX
//! cache controller and virtio device lifecycle (`spec.md` §4.H, §4.I).

pub mod cache;
pub mod error;
pub mod lifecycle;
