//! Device Lifecycle (`spec.md` §4.I): realize / start / stop / unrealize of
//! the virtio device object.
//!
//! Grounded on cloud-hypervisor's `Fs::activate`/`reset`/`shutdown`: start
//! unwinds in reverse on any step's failure, stop is the mirror image of
//! start, and unrealize forces a stop before releasing device state.

use std::sync::atomic::{AtomicBool, Ordering};

use vm_memory::{GuestAddress, GuestMemoryAtomic, GuestMemoryMmap};

use crate::cache::{validate_realize_config, CacheController};
use crate::error::{Error, Result};

/// What `set_status`'s DRIVER_OK transition needs to flip on start and
/// unwind on any failed step (`spec.md` §4.I): host notifiers, guest
/// notifiers via the parent bus, the vhost backend itself, and per-vq
/// interrupt masking. Modeled as plain toggles here since the actual bus
/// wiring is host-model plumbing out of this transport's scope (`spec.md`
/// §1).
pub trait DeviceBus {
    fn enable_host_notifiers(&mut self) -> std::io::Result<()>;
    fn disable_host_notifiers(&mut self);
    fn install_guest_notifiers(&mut self) -> std::io::Result<()>;
    fn remove_guest_notifiers(&mut self);
    fn start_vhost(&mut self, acked_features: u64) -> std::io::Result<()>;
    fn stop_vhost(&mut self);
    fn unmask_vq_interrupts(&mut self) -> std::io::Result<()>;
}

pub struct Device<B: DeviceBus> {
    bus: B,
    cache: Option<CacheController>,
    running: AtomicBool,
}

impl<B: DeviceBus> Device<B> {
    /// Realize: validate the configuration, allocate the cache window if
    /// `cache_size > 0` (`spec.md` §4.H), and bind the bus.
    pub fn realize(
        bus: B,
        tag: &str,
        num_request_queues: u32,
        queue_size: u32,
        cache_size: u64,
        cache_host_addr: u64,
        cache_gpa: GuestAddress,
        mem: GuestMemoryAtomic<GuestMemoryMmap>,
    ) -> Result<Self> {
        validate_realize_config(tag, num_request_queues, queue_size, cache_size)?;

        let cache = if cache_size > 0 {
            // SAFETY: `cache_host_addr` names a range the caller has
            // already reserved via a PROT_NONE anonymous mapping of
            // `cache_size` bytes; `map`/`unmap` below only ever touch
            // sub-ranges of it, bounds-checked against `cache_size`.
            Some(CacheController::new(cache_host_addr, cache_gpa, cache_size, mem))
        } else {
            None
        };

        Ok(Self {
            bus,
            cache,
            running: AtomicBool::new(false),
        })
    }

    pub fn cache(&self) -> Option<&CacheController> {
        self.cache.as_ref()
    }

    /// Start: enable host notifiers, install guest notifiers, start vhost,
    /// unmask vq interrupts. Any failing step unwinds everything enabled so
    /// far, in reverse (`spec.md` §4.I).
    pub fn start(&mut self, acked_features: u64) -> Result<()> {
        self.bus
            .enable_host_notifiers()
            .map_err(|e| Error::Lifecycle(format!("enable_host_notifiers: {}", e)))?;

        if let Err(e) = self.bus.install_guest_notifiers() {
            self.bus.disable_host_notifiers();
            return Err(Error::Lifecycle(format!("install_guest_notifiers: {}", e)));
        }

        if let Err(e) = self.bus.start_vhost(acked_features) {
            self.bus.remove_guest_notifiers();
            self.bus.disable_host_notifiers();
            return Err(Error::Lifecycle(format!("start_vhost: {}", e)));
        }

        if let Err(e) = self.bus.unmask_vq_interrupts() {
            self.bus.stop_vhost();
            self.bus.remove_guest_notifiers();
            self.bus.disable_host_notifiers();
            return Err(Error::Lifecycle(format!("unmask_vq_interrupts: {}", e)));
        }

        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop: the mirror image of `start`'s successful path.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.bus.stop_vhost();
        self.bus.remove_guest_notifiers();
        self.bus.disable_host_notifiers();
    }

    /// `set_status`: toggle start/stop on DRIVER_OK transitions while the
    /// VM is running (`spec.md` §4.I).
    pub fn set_status(&mut self, driver_ok: bool, acked_features: u64) -> Result<()> {
        match (driver_ok, self.running.load(Ordering::SeqCst)) {
            (true, false) => self.start(acked_features),
            (false, true) => {
                self.stop();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Unrealize: force stop, then release vhost/user-channel/virtio
    /// state. The cache window (if any) is released as `self` drops.
    pub fn unrealize(mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBus {
        calls: Mutex<Vec<&'static str>>,
        fail_at: Option<&'static str>,
    }

    impl RecordingBus {
        fn record_or_fail(&self, step: &'static str) -> std::io::Result<()> {
            self.calls.lock().unwrap().push(step);
            if self.fail_at == Some(step) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected"));
            }
            Ok(())
        }
    }

    impl DeviceBus for RecordingBus {
        fn enable_host_notifiers(&mut self) -> std::io::Result<()> {
            self.record_or_fail("enable_host_notifiers")
        }
        fn disable_host_notifiers(&mut self) {
            self.calls.lock().unwrap().push("disable_host_notifiers");
        }
        fn install_guest_notifiers(&mut self) -> std::io::Result<()> {
            self.record_or_fail("install_guest_notifiers")
        }
        fn remove_guest_notifiers(&mut self) {
            self.calls.lock().unwrap().push("remove_guest_notifiers");
        }
        fn start_vhost(&mut self, _acked_features: u64) -> std::io::Result<()> {
            self.record_or_fail("start_vhost")
        }
        fn stop_vhost(&mut self) {
            self.calls.lock().unwrap().push("stop_vhost");
        }
        fn unmask_vq_interrupts(&mut self) -> std::io::Result<()> {
            self.record_or_fail("unmask_vq_interrupts")
        }
    }

    fn realize_with(bus: RecordingBus) -> Device<RecordingBus> {
        Device::realize(
            bus,
            "myfs",
            1,
            128,
            0,
            0,
            GuestAddress(0),
            GuestMemoryAtomic::new(GuestMemoryMmap::from_ranges(&[]).unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn start_then_stop_runs_every_step_in_order() {
        let mut device = realize_with(RecordingBus::default());
        device.start(0).unwrap();
        device.stop();
        let calls = device.bus.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "enable_host_notifiers",
                "install_guest_notifiers",
                "start_vhost",
                "unmask_vq_interrupts",
                "stop_vhost",
                "remove_guest_notifiers",
                "disable_host_notifiers",
            ]
        );
    }

    #[test]
    fn failed_start_unwinds_in_reverse() {
        let bus = RecordingBus {
            fail_at: Some("start_vhost"),
            ..Default::default()
        };
        let mut device = realize_with(bus);
        assert!(device.start(0).is_err());
        let calls = device.bus.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                "enable_host_notifiers",
                "install_guest_notifiers",
                "start_vhost",
                "remove_guest_notifiers",
                "disable_host_notifiers",
            ]
        );
    }

    #[test]
    fn realize_rejects_invalid_config() {
        let bus = RecordingBus::default();
        let result = Device::realize(
            bus,
            "",
            1,
            128,
            0,
            0,
            GuestAddress(0),
            GuestMemoryAtomic::new(GuestMemoryMmap::from_ranges(&[]).unwrap()),
        );
        assert!(result.is_err());
    }
}
