use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use log::debug;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A cached pool of named worker threads.
///
/// Workers are created lazily: a submitted job is handed to an idle worker if
/// one exists, otherwise a new worker is spawned. Workers are never pinned to
/// a particular connection or request.
pub struct WorkerPool {
    name: String,
    sender: Option<mpsc::Sender<Job>>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    idle: Arc<AtomicUsize>,
    backlog: Arc<AtomicUsize>,
    spawned: AtomicUsize,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            name: name.into(),
            sender: Some(sender),
            receiver: Arc::new(Mutex::new(receiver)),
            idle: Arc::new(AtomicUsize::new(0)),
            backlog: Arc::new(AtomicUsize::new(0)),
            spawned: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads spawned so far.
    pub fn size(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // spawn unless the parked workers already cover every unclaimed job;
        // an idle worker may still be about to take an earlier submission, so
        // idle alone is not enough to skip the spawn
        let backlog = self.backlog.fetch_add(1, Ordering::SeqCst) + 1;
        if self.idle.load(Ordering::SeqCst) < backlog {
            self.spawn_worker();
        }
        let job = Box::new(f);
        self.sender.as_ref().unwrap().send(job).unwrap();
    }

    fn spawn_worker(&self) {
        let id = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("{}-request-{id}", self.name);
        debug!("spawning worker {name}");

        let receiver = Arc::clone(&self.receiver);
        let idle = Arc::clone(&self.idle);
        let backlog = Arc::clone(&self.backlog);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                loop {
                    idle.fetch_add(1, Ordering::SeqCst);
                    let msg = receiver.lock().unwrap().recv();
                    idle.fetch_sub(1, Ordering::SeqCst);
                    match msg {
                        Ok(job) => {
                            backlog.fetch_sub(1, Ordering::SeqCst);
                            debug!("worker {id} picked up a job");
                            job();
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })
            .unwrap();
        self.handles.lock().unwrap().push(handle);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for handle in self.handles.lock().unwrap().drain(..) {
            handle.join().unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use super::*;

    #[test]
    fn executes_submitted_job() {
        let pool = WorkerPool::new("test");
        let (tx, rx) = channel();

        pool.execute(move || tx.send(42).unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn grows_to_run_concurrent_jobs() {
        let pool = WorkerPool::new("test");
        let barrier = Arc::new(Barrier::new(3));
        let (tx, rx) = channel();

        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            // all three jobs must run at once for any to finish
            pool.execute(move || {
                barrier.wait();
                tx.send(()).unwrap();
            });
        }

        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(pool.size() >= 3);
    }

    #[test]
    fn reuses_idle_workers() {
        let pool = WorkerPool::new("test");
        let (tx, rx) = channel();

        for i in 0..5 {
            let tx = tx.clone();
            pool.execute(move || tx.send(i).unwrap());
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
            // give the worker time to park itself as idle again
            thread::sleep(Duration::from_millis(50));
        }

        assert!(pool.size() < 5);
    }
}
