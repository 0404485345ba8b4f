//! End-to-end scenario 6 (`spec.md` §8): writing to a queue pump's kill_fd
//! while it's parked in `ppoll` makes it exit promptly, with no leftover
//! thread.

use std::time::Duration;

use vhost_user_fs::notify::NotificationPump;
use vmm_sys_util::eventfd::EventFd;

#[test]
fn kill_fd_write_stops_the_pump_thread() {
    let kick_fd = EventFd::new(0).unwrap();
    let kill_fd = EventFd::new(0).unwrap();
    let pump = std::sync::Arc::new(NotificationPump::new(
        1,
        kick_fd.try_clone().unwrap(),
        kill_fd.try_clone().unwrap(),
    ));

    let handle = pump.spawn();

    // Give the pump thread a moment to reach ppoll before killing it; not
    // required for correctness (the kill_fd write is durable regardless of
    // when ppoll observes it) but keeps the test from racing its own setup.
    std::thread::sleep(Duration::from_millis(50));

    kill_fd.write(1).unwrap();

    // The pump must join well within any reasonable scheduling slack; a
    // hang here means ppoll never woke on the kill_fd.
    let start = std::time::Instant::now();
    loop {
        if handle.is_finished() {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "pump did not exit after kill_fd write");
        std::thread::sleep(Duration::from_millis(10));
    }
    handle.join().unwrap();
}

#[test]
fn kicks_before_kill_do_not_prevent_shutdown() {
    let kick_fd = EventFd::new(0).unwrap();
    let kill_fd = EventFd::new(0).unwrap();
    let pump = std::sync::Arc::new(NotificationPump::new(
        2,
        kick_fd.try_clone().unwrap(),
        kill_fd.try_clone().unwrap(),
    ));

    let handle = pump.spawn();

    kick_fd.write(1).unwrap();
    kick_fd.write(1).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    kill_fd.write(1).unwrap();

    let start = std::time::Instant::now();
    loop {
        if handle.is_finished() {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "pump did not exit after kill_fd write");
        std::thread::sleep(Duration::from_millis(10));
    }
    handle.join().unwrap();
}
