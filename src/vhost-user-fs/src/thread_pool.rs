//! A small fixed-size worker pool (`spec.md` §9 "Thread-pool choice").
//!
//! Hand-rolled rather than pulled from a crate: the pool only ever runs one
//! job shape (a popped request, dispatched to [`crate::worker::process_request`]),
//! so a generic executor would add a dependency for no behavior we don't
//! already get from a `Vec<JoinHandle>` and a channel.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A job is any `FnOnce` the pool can run once and discard.
type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    workers: Vec<JoinHandle<()>>,
    sender: Option<Sender<Job>>,
}

impl ThreadPool {
    /// Spawns `size` worker threads pulling from a shared job queue. Panics
    /// if `size` is zero — a pool with no workers can never make progress.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "thread pool size must be non-zero");

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|id| spawn_worker(id, Arc::clone(&receiver)))
            .collect();

        Self {
            workers,
            sender: Some(sender),
        }
    }

    /// Enqueue `job`. Jobs run in no particular order relative to one
    /// another; ordering within a single queue is the caller's job
    /// (`queue_pump.rs` only ever has one in-flight submission per queue
    /// slot at a time via the per-queue mutex).
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .as_ref()
            .expect("execute called after shutdown")
            .send(Box::new(job))
            .expect("worker threads outlive the pool while sender is held");
    }
}

fn spawn_worker(id: usize, receiver: Arc<Mutex<Receiver<Job>>>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("fs-worker-{}", id))
        .spawn(move || loop {
            let job = {
                let rx = receiver.lock().unwrap();
                rx.recv()
            };
            match job {
                Ok(job) => job(),
                Err(_) => break, // sender dropped, pool is shutting down.
            }
        })
        .expect("failed to spawn worker thread")
}

impl Drop for ThreadPool {
    /// Close the job queue and join every worker so in-flight requests
    /// finish before the pool's owner (the queue pump) tears down further
    /// state underneath them.
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
