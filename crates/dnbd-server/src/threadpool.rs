//! A small pool recycling detached worker threads for short tasks,
//! mainly client connection handshakes. At most `max_idle` workers
//! linger; the rest die when their task finishes.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    idle: Mutex<Vec<Sender<Job>>>,
    max_idle: usize,
}

#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    #[must_use]
    pub fn new(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(max_idle)),
                max_idle,
            }),
        }
    }

    /// Run `job` on an idle worker, or spin up a new one.
    pub fn run(&self, job: impl FnOnce() + Send + 'static) -> std::io::Result<()> {
        let mut job: Job = Box::new(job);
        loop {
            let idle = self.inner.idle.lock().pop();
            match idle {
                Some(tx) => match tx.send(job) {
                    Ok(()) => return Ok(()),
                    // Worker died between queueing and send; retry.
                    Err(returned) => job = returned.0,
                },
                None => break,
            }
        }
        let (tx, rx) = channel::<Job>();
        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name("dnbd-pool".to_owned())
            .spawn(move || worker_loop(&inner, &tx, rx, job))?;
        Ok(())
    }

    /// Drop all idle workers. Busy ones exit when their task is done.
    pub fn shutdown(&self) {
        self.inner.idle.lock().clear();
    }
}

fn worker_loop(inner: &PoolInner, tx: &Sender<Job>, rx: Receiver<Job>, first: Job) {
    first();
    loop {
        {
            let mut idle = inner.idle.lock();
            if idle.len() >= inner.max_idle {
                debug!(target: "dnbd::pool", event = "worker_retired");
                return;
            }
            idle.push(tx.clone());
        }
        // Parked until someone hands us work or the pool drops our
        // sender.
        match rx.recv() {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}
