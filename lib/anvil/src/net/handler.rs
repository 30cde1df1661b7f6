//! The connection handler: listening sockets, N I/O workers and the
//! application pool. Each worker owns a poll, a waker and a disjoint set of
//! live connections; application callbacks never run on a worker thread.
//!
//! Workers are nudged through a control channel flushed by the waker: new
//! connections are installed on the least-loaded worker, sends wake the
//! owning worker for a write pass, and shutdown drains everything.

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use ember::logging::{self, Logger};
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::buffer::Buffer;
use super::connection::{Connection, ConnectionId, Wake};
use super::pool::ThreadPool;
use super::NetworkError;

const WAKE_TOKEN: Token = Token(usize::MAX);
const LISTENER_BASE: usize = usize::MAX - 4096;
const EVENT_CAPACITY: usize = 1024;

/// Messages nudging a worker out of its poll wait.
pub(crate) enum Control {
    /// Take ownership of a freshly accepted socket.
    Install(TcpStream, SocketAddr),
    /// A send was enqueued; run a write pass.
    WakeWrite(ConnectionId),
    /// Tear the connection down.
    Kill(ConnectionId),
    /// Stop the worker.
    Shutdown,
}

/// Admission decision for a new peer, called before any connection state is
/// allocated.
pub type AcceptFilter = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;
pub type ConnectCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type ReceiveCallback = Arc<dyn Fn(&Arc<Connection>, Vec<u8>) + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&Arc<Connection>, Option<String>) + Send + Sync>;

#[derive(Clone)]
pub struct Callbacks {
    pub accept: AcceptFilter,
    pub connect: ConnectCallback,
    pub receive: ReceiveCallback,
    pub disconnect: DisconnectCallback,
}

pub struct HandlerConfig {
    /// Endpoints to listen on.
    pub binds: Vec<SocketAddr>,
    /// I/O worker threads. Zero means one per hardware thread.
    pub io_workers: usize,
    /// Per-connection send-queue cap in bytes. Zero means unlimited.
    pub max_queue_bytes: usize,
}

pub(crate) struct WorkerLink {
    pub(crate) tx: Sender<Control>,
    pub(crate) waker: Arc<Waker>,
    pub(crate) load: Arc<AtomicUsize>,
}

pub struct Handler {
    links: Arc<Vec<WorkerLink>>,
    threads: Vec<JoinHandle<()>>,
    pool: Arc<ThreadPool>,
    local_addrs: Vec<SocketAddr>,
    log: Logger,
}

impl Handler {
    /// Binds every endpoint, spawns the workers and starts accepting.
    /// Application callbacks run on the supplied pool.
    pub fn bind(
        config: HandlerConfig,
        callbacks: Callbacks,
        pool: Arc<ThreadPool>,
        log: Logger,
    ) -> io::Result<Handler> {
        let worker_count = match config.io_workers {
            0 => num_cpus::get().max(1),
            n => n,
        };

        let mut listeners = Vec::with_capacity(config.binds.len());
        let mut local_addrs = Vec::with_capacity(config.binds.len());
        for (index, addr) in config.binds.iter().enumerate() {
            let listener = TcpListener::bind(*addr)?;
            let local = listener.local_addr()?;
            logging::info!(log, "listening"; "endpoint" => %local);
            local_addrs.push(local);
            listeners.push((Token(LISTENER_BASE + index), listener));
        }

        // Per-worker poll, waker and control channel. Wakers must exist
        // before the polls move into their threads.
        let mut polls = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        let mut links = Vec::with_capacity(worker_count);

        for _ in 0..worker_count {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
            let (tx, rx) = unbounded();

            links.push(WorkerLink {
                tx,
                waker,
                load: Arc::new(AtomicUsize::new(0)),
            });
            polls.push(poll);
            receivers.push(rx);
        }

        // Listeners are spread across workers round-robin and registered
        // with the owning worker's poll up front.
        let mut worker_listeners: Vec<Vec<(Token, TcpListener)>> =
            (0..worker_count).map(|_| Vec::new()).collect();
        for (index, (token, mut listener)) in listeners.into_iter().enumerate() {
            let owner = index % worker_count;
            polls[owner]
                .registry()
                .register(&mut listener, token, Interest::READABLE)?;
            worker_listeners[owner].push((token, listener));
        }

        let links = Arc::new(links);
        let next_id = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::with_capacity(worker_count);

        for (index, (poll, rx)) in polls.into_iter().zip(receivers).enumerate() {
            let worker = Worker {
                index,
                poll,
                rx,
                listeners: std::mem::take(&mut worker_listeners[index]),
                conns: HashMap::new(),
                links: links.clone(),
                pool: pool.clone(),
                callbacks: callbacks.clone(),
                next_id: next_id.clone(),
                max_queue_bytes: config.max_queue_bytes,
                log: log.new(logging::o!("io_worker" => index)),
                running: true,
            };

            let worker_log = log.new(logging::o!("io_worker" => index));
            let handle = thread::Builder::new()
                .name(format!("io-{}", index))
                .spawn(move || {
                    // I/O worker errors are fatal to the process; nothing
                    // above can repair a dead poll loop.
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| worker.run()))
                        .is_err()
                    {
                        logging::crit!(worker_log, "io worker panicked, aborting");
                        std::process::abort();
                    }
                })?;
            threads.push(handle);
        }

        Ok(Handler {
            links,
            threads,
            pool,
            local_addrs,
            log,
        })
    }

    /// The endpoints actually bound, with OS-assigned ports resolved.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Live connections across all workers.
    pub fn connection_count(&self) -> usize {
        self.links
            .iter()
            .map(|link| link.load.load(Ordering::Relaxed))
            .sum()
    }

    /// The application pool, for embedders scheduling their own work.
    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Stops accepting, tears down every connection and joins the worker
    /// threads. The application pool is left to its owner; pending
    /// disconnect callbacks are still queued on it.
    pub fn shutdown(self) {
        logging::info!(self.log, "connection handler shutting down");

        for link in self.links.iter() {
            if link.tx.send(Control::Shutdown).is_ok() {
                drop(link.waker.wake());
            }
        }
        for handle in self.threads {
            drop(handle.join());
        }
    }
}

struct Registered {
    stream: TcpStream,
    conn: Arc<Connection>,
    recv: Buffer,
    want_write: bool,
}

struct Worker {
    index: usize,
    poll: Poll,
    rx: Receiver<Control>,
    listeners: Vec<(Token, TcpListener)>,
    conns: HashMap<ConnectionId, Registered>,
    links: Arc<Vec<WorkerLink>>,
    pool: Arc<ThreadPool>,
    callbacks: Callbacks,
    next_id: Arc<AtomicUsize>,
    max_queue_bytes: usize,
    log: Logger,
    running: bool,
}

impl Worker {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while self.running {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // I/O worker errors are fatal.
                panic!("worker poll failed: {}", err);
            }

            let batch: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect();

            for (token, readable, writable) in batch {
                if token == WAKE_TOKEN {
                    self.drain_control();
                } else if token.0 >= LISTENER_BASE {
                    self.accept(token);
                } else {
                    if readable {
                        self.readable(token.0);
                    }
                    if writable {
                        self.writable(token.0);
                    }
                }
            }
        }

        self.teardown();
    }

    fn drain_control(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(Control::Install(stream, addr)) => self.install(stream, addr),
                Ok(Control::WakeWrite(id)) => self.writable(id),
                Ok(Control::Kill(id)) => self.kill(id, None),
                Ok(Control::Shutdown) => {
                    self.running = false;
                    return;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.running = false;
                    return;
                }
            }
        }
    }

    /// Accept loop for one readable listener. Each accepted socket goes
    /// through the accept filter on the pool before any worker adopts it.
    fn accept(&mut self, token: Token) {
        let listener = match self.listeners.iter().find(|(t, _)| *t == token) {
            Some((_, listener)) => listener,
            None => return,
        };

        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    logging::debug!(self.log, "accepted socket"; "peer" => %addr);

                    let callbacks = self.callbacks.clone();
                    let links = self.links.clone();
                    self.pool.execute(move || {
                        if !(callbacks.accept)(addr) {
                            // Refused: the socket closes on drop.
                            drop(stream);
                            return;
                        }

                        let target = least_loaded(&links);
                        let link = &links[target];
                        if link.tx.send(Control::Install(stream, addr)).is_ok() {
                            drop(link.waker.wake());
                        }
                    });
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Transient accept failures are logged and survived.
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    return;
                }
            }
        }
    }

    fn install(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = Token(id);

        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            logging::warn!(self.log, "socket registration failed"; "peer" => %addr, "error" => %err);
            return;
        }

        let link = &self.links[self.index];
        let conn = Connection::new(
            id,
            addr,
            Wake::Worker {
                tx: link.tx.clone(),
                waker: link.waker.clone(),
            },
            self.max_queue_bytes,
        );

        link.load.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(
            id,
            Registered {
                stream,
                conn: conn.clone(),
                recv: Buffer::new(),
                want_write: false,
            },
        );

        logging::debug!(self.log, "connection installed";
                        "connection_id" => id,
                        "peer" => %addr);

        let connect = self.callbacks.connect.clone();
        self.pool.execute(move || connect(&conn));
    }

    fn readable(&mut self, id: ConnectionId) {
        let (outcome, dispatch) = match self.conns.get_mut(&id) {
            Some(reg) => {
                let outcome = reg.recv.ingress(&mut reg.stream);
                let mut dispatch = None;

                if let Ok(ingress) = &outcome {
                    if ingress.received > 0 {
                        reg.conn.add_received(ingress.received as u64);
                        let bytes = reg.recv.take_all();
                        if let Some(batch) = reg.conn.baton_offer(bytes) {
                            dispatch = Some((reg.conn.clone(), batch));
                        }
                    }
                }

                (outcome, dispatch)
            }
            None => return,
        };

        if let Some((conn, batch)) = dispatch {
            let receive = self.callbacks.receive.clone();
            // One job per baton claim: the loop re-runs the callback for
            // bytes staged while it was out, so at most one receive callback
            // per connection is ever in flight.
            self.pool.execute(move || {
                let mut batch = batch;
                loop {
                    receive(&conn, batch);
                    match conn.baton_complete() {
                        Some(more) => batch = more,
                        None => break,
                    }
                }
            });
        }

        match outcome {
            Ok(ingress) if ingress.closed => self.kill(id, None),
            Ok(_) => {}
            Err(err) => {
                logging::debug!(self.log, "receive failed"; "connection_id" => id, "error" => %err);
                self.kill(id, Some(format!("socket error: {}", err)));
            }
        }
    }

    fn writable(&mut self, id: ConnectionId) {
        let kind = match self.conns.get_mut(&id) {
            Some(reg) => match reg.conn.flush_into(&mut reg.stream) {
                // Drained: drop the writable subscription to avoid spurious
                // wakeups.
                Ok(true) => {
                    if reg.want_write {
                        reg.want_write = false;
                        drop(self.poll.registry().reregister(
                            &mut reg.stream,
                            Token(id),
                            Interest::READABLE,
                        ));
                    }
                    return;
                }
                // Blocked mid-queue: stay subscribed for writable.
                Ok(false) => {
                    if !reg.want_write {
                        reg.want_write = true;
                        drop(self.poll.registry().reregister(
                            &mut reg.stream,
                            Token(id),
                            Interest::READABLE | Interest::WRITABLE,
                        ));
                    }
                    return;
                }
                Err(NetworkError::Wait) => return,
                Err(NetworkError::Fatal(kind)) => kind,
            },
            None => return,
        };

        logging::debug!(self.log, "send failed"; "connection_id" => id, "error" => %kind);
        self.kill(id, Some(format!("socket error: {}", kind)));
    }

    /// Removes a connection: a last non-blocking drain, fail whatever is
    /// left, close the socket and fire the disconnect callback.
    fn kill(&mut self, id: ConnectionId, reason: Option<String>) {
        let mut reg = match self.conns.remove(&id) {
            Some(reg) => reg,
            None => return,
        };

        self.links[self.index].load.fetch_sub(1, Ordering::Relaxed);

        drop(reg.conn.flush_into(&mut reg.stream));

        // The reason set by an explicit shutdown wins over ours.
        let reason = reg.conn.disconnect_reason().or(reason);
        reg.conn.mark_shutdown(reason.clone());
        reg.conn.fail_pending();

        drop(self.poll.registry().deregister(&mut reg.stream));
        drop(reg.stream);

        logging::debug!(self.log, "connection closed";
                        "connection_id" => id,
                        "reason" => reason.as_deref().unwrap_or("peer closed"),
                        "sent" => reg.conn.sent(),
                        "received" => reg.conn.received());

        let disconnect = self.callbacks.disconnect.clone();
        let conn = reg.conn;
        self.pool.execute(move || disconnect(&conn, reason));
    }

    fn teardown(&mut self) {
        let ids: Vec<ConnectionId> = self.conns.keys().copied().collect();
        for id in ids {
            self.kill(id, Some("server shutting down".to_owned()));
        }
        self.listeners.clear();

        logging::debug!(self.log, "io worker stopped"; "io_worker" => self.index);
    }
}

fn least_loaded(links: &[WorkerLink]) -> usize {
    let mut best = 0;
    let mut best_load = usize::MAX;
    for (index, link) in links.iter().enumerate() {
        let load = link.load.load(Ordering::Relaxed);
        if load < best_load {
            best = index;
            best_load = load;
        }
    }
    best
}
