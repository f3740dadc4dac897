//! Fixed-size worker pool used to decompress blocks in parallel.
//!
//! Jobs are boxed closures fed through an unbounded `crossbeam-channel`
//! queue and run in FIFO order by whichever worker is free. Shutting down
//! refuses new jobs, discards the ones still queued, stops every worker and
//! joins it. A panicking job is logged and does not take its worker down.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Error, Result};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Message>>>,
    receiver: Receiver<Message>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers; 0 means one per CPU.
    pub fn new(threads: usize) -> Result<Self> {
        let size = if threads == 0 { num_cpus::get() } else { threads };
        let (sender, receiver) = unbounded::<Message>();

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("zseek-worker-{id}"))
                .spawn(move || worker_loop(id, rx))?;
            workers.push(handle);
        }
        debug!(threads = size, "worker pool started");

        Ok(Self { sender: Mutex::new(Some(sender)), receiver, workers: Mutex::new(workers), size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. Fails with [`Error::PoolClosed`] once shutdown has begun.
    pub fn enqueue<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(Error::PoolClosed)?;
        sender.send(Message::Run(Box::new(job))).map_err(|_| Error::PoolClosed)
    }

    /// Stop accepting jobs, drop queued ones and join every worker. Jobs that
    /// are already running finish first. Calling this twice is harmless.
    pub fn shutdown(&self) {
        let Some(sender) = self.sender.lock().take() else {
            return;
        };
        let discarded = self
            .receiver
            .try_iter()
            .filter(|m| matches!(m, Message::Run(_)))
            .count();
        if discarded > 0 {
            debug!(discarded, "discarding queued jobs at shutdown");
        }
        for _ in 0..self.size {
            // Receivers live as long as the pool, so this cannot fail.
            let _ = sender.send(Message::Stop);
        }
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked outside a job");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, rx: Receiver<Message>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(worker = id, "job panicked");
                }
            }
            Message::Stop => break,
        }
    }
}
