//! Fixed-size worker pool used by the scheduler.
//!
//! Deliberately small: named threads draining a shared job channel. The
//! scheduler submits one closure per job set and coordinates rounds itself;
//! the pool only provides the threads.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of named worker threads executing submitted closures.
pub struct ThreadPool {
    workers: Vec<JoinHandle<()>>,
    sender: Option<Sender<Job>>,
    size: usize,
}

impl ThreadPool {
    /// Spawns `size` workers named `"<name>-<i>"`. A `size` of zero is
    /// bumped to one.
    pub fn new(name: &str, size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size)
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(receiver))
                    .expect("failed to spawn pool worker")
            })
            .collect();
        Self {
            workers,
            sender: Some(sender),
            size,
        }
    }

    /// Pool with one worker per available core.
    pub fn with_default_size(name: &str) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(name, threads)
    }

    pub fn max_threads(&self) -> usize {
        self.size
    }

    /// Queues a closure for execution on some worker.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Some(sender) = &self.sender {
            // Send only fails when every worker is gone, i.e. during drop.
            let _ = sender.send(Box::new(job));
        }
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let receiver = receiver.lock().expect("pool receiver poisoned");
            receiver.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break, // channel closed: pool is shutting down
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_executes_all_jobs() {
        let pool = ThreadPool::new("test-pool", 4);
        assert_eq!(pool.max_threads(), 4);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool); // joins the workers
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_zero_size_is_bumped() {
        let pool = ThreadPool::new("tiny", 0);
        assert_eq!(pool.max_threads(), 1);
    }
}
