//! A fixed pool of worker threads draining one job channel. Publish
//! dispatch enqueues a delivery task here for every matched queue; nothing
//! in a job may assume which worker runs it.

use crossbeam_channel::{unbounded, Sender};
use log::trace;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> WorkerPool {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..size.max(1))
            .map(|i| {
                let rx = rx.clone();
                thread::spawn(move || {
                    trace!("worker {} started", i);
                    for job in rx.iter() {
                        job();
                    }
                    trace!("worker {} stopped", i);
                })
            })
            .collect();
        WorkerPool {
            tx: Some(tx),
            workers,
        }
    }

    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Box::new(job));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the channel lets the workers drain what is queued and exit
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn all_jobs_run_before_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(4);
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn zero_size_still_gets_one_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(0);
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
