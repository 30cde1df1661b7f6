//! The application thread pool. Receive handlers, accept filters and
//! disconnect callbacks all run here, never on an I/O worker. A panicking
//! job is contained and reported; the pool keeps running.

use crossbeam::channel::{unbounded, Receiver, Sender};
use ember::logging::{self, Logger};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send>;

/// Called with a description when a pooled job panics.
pub type PanicSink = Arc<dyn Fn(&str) + Send + Sync>;

pub struct ThreadPool {
    tx: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(size: usize, log: &Logger, panic_sink: Option<PanicSink>) -> ThreadPool {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();

        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            let rx: Receiver<Job> = rx.clone();
            let log = log.new(logging::o!("pool_thread" => index));
            let sink = panic_sink.clone();

            let handle = thread::Builder::new()
                .name(format!("app-{}", index))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                            let what = payload_text(payload.as_ref());
                            logging::error!(log, "application job panicked"; "what" => %what);
                            if let Some(sink) = &sink {
                                sink(&what);
                            }
                        }
                    }
                })
                .expect("failed to spawn pool thread");

            threads.push(handle);
        }

        ThreadPool {
            tx: Mutex::new(Some(tx)),
            threads: Mutex::new(threads),
        }
    }

    /// Queues a job. Jobs submitted after shutdown are dropped.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        if let Some(tx) = &*self.tx.lock() {
            drop(tx.send(Box::new(job)));
        }
    }

    /// Drains outstanding jobs and joins every thread. Idempotent; safe to
    /// call through a shared handle.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().take();
        drop(tx);

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            drop(handle.join());
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.threads.lock().len()
    }
}

fn payload_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_jobs_run() {
        let pool = ThreadPool::new(4, &logging::discard(), None);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_zero_size_clamps_to_one() {
        let pool = ThreadPool::new(0, &logging::discard(), None);
        assert_eq!(pool.size(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_panic_is_contained_and_reported() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let pool = ThreadPool::new(
            1,
            &logging::discard(),
            Some(Arc::new(move |what: &str| {
                sink.lock().push(what.to_owned());
            })),
        );

        let counter = Arc::new(AtomicUsize::new(0));

        pool.execute(|| panic!("boom in handler"));

        // The pool thread survives and keeps taking work.
        let observer = counter.clone();
        pool.execute(move || {
            observer.fetch_add(1, Ordering::SeqCst);
        });

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().as_slice(), ["boom in handler"]);
    }

    #[test]
    fn test_shutdown_drains_queue_and_is_idempotent() {
        let pool = ThreadPool::new(2, &logging::discard(), None);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.execute(move || {
                std::thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        // Late jobs are dropped, repeated shutdown is a no-op.
        pool.execute(|| unreachable!("job after shutdown"));
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
