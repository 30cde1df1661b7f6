//! Send jobs: resolvable handles to enqueued byte buffers. A job resolves
//! exactly once to `Sent` or `Failed`; waiters block on a condvar and
//! completion callbacks run synchronously on the resolving thread.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum JobState {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl JobState {
    #[inline]
    pub fn is_resolved(self) -> bool {
        matches!(self, JobState::Sent | JobState::Failed)
    }
}

type Callback = Box<dyn FnOnce(JobState) + Send>;

struct Inner {
    state: JobState,
    callbacks: Vec<Callback>,
}

pub struct SendJob {
    inner: Mutex<Inner>,
    resolved: Condvar,
}

impl SendJob {
    pub fn new() -> Arc<SendJob> {
        Arc::new(SendJob {
            inner: Mutex::new(Inner {
                state: JobState::Pending,
                callbacks: Vec::new(),
            }),
            resolved: Condvar::new(),
        })
    }

    /// A job born failed. Returned by sends on a shut-down connection.
    pub fn failed() -> Arc<SendJob> {
        Arc::new(SendJob {
            inner: Mutex::new(Inner {
                state: JobState::Failed,
                callbacks: Vec::new(),
            }),
            resolved: Condvar::new(),
        })
    }

    #[inline]
    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    /// Marks the first byte on the wire. No-op once resolved.
    pub(crate) fn mark_sending(&self) {
        let mut inner = self.inner.lock();
        if inner.state == JobState::Pending {
            inner.state = JobState::Sending;
        }
    }

    /// Resolves the job. The first call wins; later calls are ignored.
    /// Callbacks run on this thread, after the state is visible, without the
    /// lock held; they must not block.
    pub(crate) fn resolve(&self, success: bool) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.state.is_resolved() {
                return;
            }
            inner.state = if success { JobState::Sent } else { JobState::Failed };
            std::mem::take(&mut inner.callbacks)
        };

        self.resolved.notify_all();

        let state = self.state();
        for callback in callbacks {
            callback(state);
        }
    }

    /// Blocks until the job resolves.
    pub fn wait(&self) -> JobState {
        let mut inner = self.inner.lock();
        while !inner.state.is_resolved() {
            self.resolved.wait(&mut inner);
        }
        inner.state
    }

    /// Registers a completion callback. Fires immediately when the job has
    /// already resolved; otherwise exactly once at resolution.
    pub fn on_complete<F: FnOnce(JobState) + Send + 'static>(&self, callback: F) {
        let state = {
            let mut inner = self.inner.lock();
            if !inner.state.is_resolved() {
                inner.callbacks.push(Box::new(callback));
                return;
            }
            inner.state
        };

        callback(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_resolution_is_monotonic() {
        let job = SendJob::new();
        assert_eq!(job.state(), JobState::Pending);

        job.mark_sending();
        assert_eq!(job.state(), JobState::Sending);

        job.resolve(true);
        assert_eq!(job.state(), JobState::Sent);

        // A second resolution is ignored.
        job.resolve(false);
        assert_eq!(job.state(), JobState::Sent);

        // So is a late mark_sending.
        job.mark_sending();
        assert_eq!(job.state(), JobState::Sent);
    }

    #[test]
    fn test_callbacks_fire_once_after_state() {
        let job = SendJob::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let observer = fired.clone();
        job.on_complete(move |state| {
            assert!(state.is_resolved());
            observer.fetch_add(1, Ordering::SeqCst);
        });

        job.resolve(false);
        job.resolve(false);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Late registration fires immediately with the final state.
        let observer = fired.clone();
        job.on_complete(move |state| {
            assert_eq!(state, JobState::Failed);
            observer.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wait_blocks_until_resolution() {
        let job = SendJob::new();

        let waiter = job.clone();
        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(std::time::Duration::from_millis(20));
        job.resolve(true);

        assert_eq!(handle.join().unwrap(), JobState::Sent);
    }

    #[test]
    fn test_pre_failed_job() {
        let job = SendJob::failed();
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.wait(), JobState::Failed);
    }
}
