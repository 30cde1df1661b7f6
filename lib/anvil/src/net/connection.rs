//! Shared per-connection state. The OS socket itself is owned by exactly one
//! I/O worker; everything else — counters, the ordered send queue, the
//! receive baton and the shutdown flag — lives here behind an `Arc` so
//! sessions can reach it without touching the stream.

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::handler::Control;
use super::job::SendJob;
use super::{ErrorKind, NetworkError, NetworkResult};

pub type ConnectionId = usize;

/// How to nudge the worker owning the socket.
pub(crate) enum Wake {
    Worker {
        tx: Sender<Control>,
        waker: Arc<mio::Waker>,
    },
    /// Not bound to any worker. Virtual connections for embedders and tests.
    Detached,
}

impl Wake {
    fn send(&self, message: Control) {
        if let Wake::Worker { tx, waker } = self {
            // A dead worker means the handler is tearing down; nothing left
            // to wake.
            if tx.send(message).is_ok() {
                drop(waker.wake());
            }
        }
    }
}

struct QueuedSend {
    bytes: Vec<u8>,
    offset: usize,
    job: Arc<SendJob>,
}

struct SendQueue {
    jobs: VecDeque<QueuedSend>,
    queued_bytes: usize,
    shutdown: bool,
    reason: Option<String>,
}

struct Baton {
    /// A receive callback is currently running.
    live: bool,
    /// Bytes read while the callback was out.
    staged: Vec<u8>,
}

pub struct Connection {
    id: ConnectionId,
    endpoint: SocketAddr,
    sent: AtomicU64,
    received: AtomicU64,
    max_queue_bytes: usize,
    queue: Mutex<SendQueue>,
    baton: Mutex<Baton>,
    wake: Wake,
}

/// Critical-section access to the send queue. Holding it, a caller can fuse
/// an enqueue with session mutations (state, encryption) such that no other
/// send interleaves.
pub struct Enqueue<'a> {
    queue: &'a mut SendQueue,
    enqueued: bool,
    overflow: bool,
    cap: usize,
}

impl<'a> Enqueue<'a> {
    /// Appends a byte buffer to the ordered queue. Returns a job pre-resolved
    /// to failed when the connection is shut down or the buffer cap would be
    /// exceeded.
    pub fn enqueue(&mut self, bytes: Vec<u8>) -> Arc<SendJob> {
        if self.queue.shutdown {
            return SendJob::failed();
        }

        if self.cap > 0 && self.queue.queued_bytes + bytes.len() > self.cap {
            self.overflow = true;
            return SendJob::failed();
        }

        let job = SendJob::new();
        self.queue.queued_bytes += bytes.len();
        self.queue.jobs.push_back(QueuedSend {
            bytes,
            offset: 0,
            job: job.clone(),
        });
        self.enqueued = true;
        job
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        endpoint: SocketAddr,
        wake: Wake,
        max_queue_bytes: usize,
    ) -> Arc<Connection> {
        Arc::new(Connection {
            id,
            endpoint,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            max_queue_bytes,
            queue: Mutex::new(SendQueue {
                jobs: VecDeque::new(),
                queued_bytes: 0,
                shutdown: false,
                reason: None,
            }),
            baton: Mutex::new(Baton {
                live: false,
                staged: Vec::new(),
            }),
            wake,
        })
    }

    /// Builds a connection not bound to any worker. Sends queue up without a
    /// socket behind them; `drain_queued` plays the part of the flush.
    pub fn detached(id: ConnectionId, endpoint: SocketAddr) -> Arc<Connection> {
        Self::new(id, endpoint, Wake::Detached, 0)
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Total bytes flushed to the socket.
    #[inline]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Total bytes read off the socket.
    #[inline]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Bytes sitting in the send queue.
    #[inline]
    pub fn pending(&self) -> usize {
        self.queue.lock().queued_bytes
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.queue.lock().shutdown
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.queue.lock().reason.clone()
    }

    /// Enqueues one buffer. Equivalent to `with_queue(|q| q.enqueue(bytes))`.
    pub fn send(&self, bytes: Vec<u8>) -> Arc<SendJob> {
        self.with_queue(|queue| queue.enqueue(bytes))
    }

    /// Runs `f` under the send-queue lock. This is the sequentially
    /// consistent enqueue-plus-mutate primitive: everything done inside `f`
    /// is atomic relative to every other send on this connection. `f` must
    /// not call back into the connection.
    pub fn with_queue<R>(&self, f: impl FnOnce(&mut Enqueue) -> R) -> R {
        let mut guard = self.queue.lock();
        let mut ctx = Enqueue {
            queue: &mut guard,
            enqueued: false,
            overflow: false,
            cap: self.max_queue_bytes,
        };

        let result = f(&mut ctx);
        let enqueued = ctx.enqueued;
        let overflow = ctx.overflow;
        drop(guard);

        if overflow {
            self.shutdown(Some("buffer too long"));
        } else if enqueued {
            self.wake.send(Control::WakeWrite(self.id));
        }

        result
    }

    /// Initiates ordered shutdown. Idempotent; the first reason sticks.
    /// Queued jobs fail once the owning worker drains what it can and drops
    /// the socket.
    pub fn shutdown(&self, reason: Option<&str>) {
        {
            let mut queue = self.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            queue.reason = reason.map(str::to_owned);
        }

        match self.wake {
            Wake::Worker { .. } => self.wake.send(Control::Kill(self.id)),
            // No worker will ever flush these.
            Wake::Detached => self.fail_pending(),
        }
    }

    /// Sets the shutdown flag without waking anyone. Used by the worker
    /// during teardown; an already-set reason is preserved.
    pub(crate) fn mark_shutdown(&self, reason: Option<String>) {
        let mut queue = self.queue.lock();
        if !queue.shutdown {
            queue.shutdown = true;
            queue.reason = reason;
        }
    }

    /// Fails every queued job. Called by the owning worker when the
    /// connection dies.
    pub(crate) fn fail_pending(&self) {
        let jobs: Vec<_> = {
            let mut queue = self.queue.lock();
            queue.queued_bytes = 0;
            queue.jobs.drain(..).map(|entry| entry.job).collect()
        };

        for job in jobs {
            job.resolve(false);
        }
    }

    /// Writes queued bytes into `writer` until drained or blocked.
    /// `Ok(true)` means the queue is empty, `Ok(false)` means the writer
    /// blocked mid-queue. Jobs whose final byte got out resolve as sent, in
    /// enqueue order, after the lock is released.
    pub(crate) fn flush_into<W: io::Write>(&self, writer: &mut W) -> NetworkResult<bool> {
        let mut completed = Vec::new();

        let outcome = {
            let mut queue = self.queue.lock();
            loop {
                let entry = match queue.jobs.front_mut() {
                    Some(entry) => entry,
                    None => break Ok(true),
                };

                match writer.write(&entry.bytes[entry.offset..]) {
                    Ok(0) => {
                        break Err(NetworkError::Fatal(ErrorKind::Io(
                            io::ErrorKind::WriteZero,
                        )))
                    }
                    Ok(count) => {
                        entry.job.mark_sending();
                        entry.offset += count;
                        self.sent.fetch_add(count as u64, Ordering::Relaxed);

                        if entry.offset == entry.bytes.len() {
                            let len = entry.bytes.len();
                            let entry = queue.jobs.pop_front().expect("front vanished");
                            queue.queued_bytes -= len;
                            completed.push(entry.job);
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(false),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => break Err(err.into()),
                }
            }
        };

        for job in completed {
            job.resolve(true);
        }

        outcome
    }

    /// Drains the send queue as if it had been flushed, resolving jobs as
    /// sent. Virtual-connection counterpart of `flush_into`.
    pub fn drain_queued(&self) -> Vec<Vec<u8>> {
        let entries: Vec<_> = {
            let mut queue = self.queue.lock();
            queue.queued_bytes = 0;
            queue.jobs.drain(..).collect()
        };

        let mut buffers = Vec::with_capacity(entries.len());
        for entry in entries {
            entry.job.resolve(true);
            buffers.push(entry.bytes);
        }
        buffers
    }

    #[inline]
    pub(crate) fn add_received(&self, count: u64) {
        self.received.fetch_add(count, Ordering::Relaxed);
    }

    /// Hands freshly read bytes to the receive baton. Returns the bytes to
    /// dispatch when no callback is out; otherwise stages them and returns
    /// `None`. At most one receive callback per connection is ever live.
    pub(crate) fn baton_offer(&self, mut bytes: Vec<u8>) -> Option<Vec<u8>> {
        let mut baton = self.baton.lock();
        if baton.live {
            baton.staged.append(&mut bytes);
            return None;
        }
        baton.live = true;
        Some(bytes)
    }

    /// Marks the current receive callback finished. Returns staged bytes to
    /// re-dispatch, keeping the baton live; `None` releases it.
    pub(crate) fn baton_complete(&self) -> Option<Vec<u8>> {
        let mut baton = self.baton.lock();
        debug_assert!(baton.live, "baton completed while idle");
        if baton.staged.is_empty() {
            baton.live = false;
            return None;
        }
        Some(std::mem::take(&mut baton.staged))
    }
}
