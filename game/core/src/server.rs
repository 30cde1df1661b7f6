//! The server kernel: composes the connection handler, the world, the
//! router and the chat layer; owns the client registry, the clock and
//! maintenance threads, and the panic escalation path.

use anvil::client::Client;
use anvil::net::connection::ConnectionId;
use anvil::net::handler::{Callbacks, Handler, HandlerConfig};
use anvil::net::pool::ThreadPool;
use anvil::router::PacketRouter;
use anvil::world::generator::{FlatGenerator, SurfacePopulator};
use anvil::world::World;
use ember::logging::{self, Level, Logger};
use ember::store::DataProvider;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bans::BanList;
use crate::chat::ChatRouter;
use crate::config::ServerConfig;
use crate::handlers;
use crate::log::LogHub;
use crate::tick;

/// Identity-service seam. The HTTP client talking to the real service lives
/// outside the core; the offline implementation admits everyone.
pub trait Authenticator: Send + Sync {
    /// Verifies a login attempt. `secret` is the session secret from the
    /// encryption response.
    fn authenticate(&self, username: &str, secret: &[u8]) -> Result<bool, String>;
}

pub struct OfflineAuthenticator;

impl Authenticator for OfflineAuthenticator {
    fn authenticate(&self, _username: &str, _secret: &[u8]) -> Result<bool, String> {
        Ok(true)
    }
}

pub type PanicHook = Box<dyn Fn(&str) + Send + Sync>;

pub(crate) struct PendingLogin {
    pub(crate) verify_token: Vec<u8>,
}

/// Shared server state threaded through callbacks, handlers and the clock.
pub struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) log: Logger,
    pub(crate) hub: LogHub,
    pub(crate) world: Arc<World>,
    pub(crate) router: Arc<PacketRouter>,
    pub(crate) pool: Arc<ThreadPool>,
    pub(crate) clients: RwLock<HashMap<ConnectionId, Arc<Client>>>,
    pub(crate) pending_logins: Mutex<HashMap<ConnectionId, PendingLogin>>,
    pub(crate) chat: ChatRouter,
    pub(crate) bans: BanList,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) auth_count: AtomicUsize,
    pub(crate) world_age: AtomicU64,
    pub(crate) time_of_day: AtomicU64,
    pub(crate) keepalive_token: AtomicU64,
    pub(crate) running: AtomicBool,
    panic_hook: Mutex<Option<PanicHook>>,
}

impl ServerInner {
    /// Snapshot of the logged-in clients.
    pub(crate) fn authenticated_clients(&self) -> Vec<Arc<Client>> {
        self.clients
            .read()
            .values()
            .filter(|client| {
                client.state() == anvil::protocol::ProtocolState::Authenticated
            })
            .cloned()
            .collect()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Reports a fatal condition to the installed panic hook. Without a
    /// hook the process aborts; nothing above can continue safely.
    pub(crate) fn escalate_panic(&self, what: &str) {
        self.hub
            .write_log(Level::Critical, &format!("fatal: {}", what));

        let hook = self.panic_hook.lock();
        match &*hook {
            Some(hook) => hook(what),
            None => std::process::abort(),
        }
    }
}

pub struct Server {
    inner: Arc<ServerInner>,
    handler: Option<Handler>,
    threads: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

impl Server {
    /// Builds and starts the whole stack: settings overlay, world, router,
    /// packet handlers, listeners, the clock and maintenance.
    pub fn start(
        mut config: ServerConfig,
        data: Arc<dyn DataProvider>,
        authenticator: Arc<dyn Authenticator>,
        log: Logger,
    ) -> io::Result<Server> {
        config.apply_provider(&*data, &log);

        let binds = config
            .parse_binds()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let pool_log = log.clone();
        let pool = Arc::new(ThreadPool::new(
            config.num_threads,
            &log,
            Some(Arc::new(move |what: &str| {
                logging::error!(pool_log, "contained handler panic"; "what" => what);
            })),
        ));

        let world = World::new(
            data.clone(),
            pool.clone(),
            &config.world_type,
            log.new(logging::o!("component" => "world")),
        );
        world.register_generator(0, "default", Arc::new(FlatGenerator::new()));
        world.add_populator(0, Arc::new(SurfacePopulator));

        let router = Arc::new(PacketRouter::new(
            log.new(logging::o!("component" => "router")),
        ));
        let hub = LogHub::new(data.clone(), log.clone());
        let chat = ChatRouter::new(data.clone(), log.new(logging::o!("component" => "chat")));
        let bans = BanList::load(data.clone(), log.new(logging::o!("component" => "bans")));

        let inner = Arc::new(ServerInner {
            config: config.clone(),
            log: log.clone(),
            hub,
            world,
            router,
            pool: pool.clone(),
            clients: RwLock::new(HashMap::new()),
            pending_logins: Mutex::new(HashMap::new()),
            chat,
            bans,
            authenticator,
            auth_count: AtomicUsize::new(0),
            world_age: AtomicU64::new(0),
            time_of_day: AtomicU64::new(0),
            keepalive_token: AtomicU64::new(1),
            running: AtomicBool::new(true),
            panic_hook: Mutex::new(None),
        });

        handlers::register(&inner);

        let handler = Handler::bind(
            HandlerConfig {
                binds,
                io_workers: config.io_workers,
                max_queue_bytes: config.max_bytes,
            },
            Self::callbacks(&inner),
            pool,
            log.new(logging::o!("component" => "net")),
        )?;
        let local_addrs = handler.local_addrs().to_vec();

        let threads = vec![
            tick::spawn(inner.clone()),
            Self::spawn_maintenance(inner.clone()),
        ];

        inner
            .hub
            .write_log(Level::Info, "server started");

        Ok(Server {
            inner,
            handler: Some(handler),
            threads,
            local_addrs,
        })
    }

    fn callbacks(inner: &Arc<ServerInner>) -> Callbacks {
        let accept_inner = inner.clone();
        let connect_inner = inner.clone();
        let receive_inner = inner.clone();
        let disconnect_inner = inner.clone();

        Callbacks {
            accept: Arc::new(move |addr| {
                if accept_inner.bans.is_ip_banned(&addr.ip()) {
                    logging::info!(accept_inner.log, "refusing banned address";
                                   "peer" => %addr);
                    return false;
                }

                let max = accept_inner.config.max_players;
                if max > 0 && accept_inner.clients.read().len() >= max {
                    logging::info!(accept_inner.log, "refusing connection, server full";
                                   "peer" => %addr);
                    return false;
                }
                true
            }),

            connect: Arc::new(move |conn| {
                let client = Client::new(
                    conn.clone(),
                    connect_inner.log.new(logging::o!("client" => conn.id())),
                );
                connect_inner.clients.write().insert(conn.id(), client);
                logging::info!(connect_inner.log, "client connected";
                               "client" => conn.id(),
                               "peer" => %conn.endpoint());
            }),

            receive: Arc::new(move |conn, bytes| {
                let client = match receive_inner.clients.read().get(&conn.id()).cloned() {
                    Some(client) => client,
                    None => return,
                };

                client.touch();
                client.offer_bytes(&bytes);

                loop {
                    match client.take_packet() {
                        Ok(Some(packet)) => {
                            receive_inner.router.dispatch(&client, &packet)
                        }
                        Ok(None) => break,
                        Err(err) => {
                            logging::warn!(receive_inner.log, "protocol violation";
                                           "client" => client.id(),
                                           "error" => %err);
                            client.disconnect(Some(&format!("protocol error: {}", err)));
                            break;
                        }
                    }
                }
            }),

            disconnect: Arc::new(move |conn, reason| {
                let client = disconnect_inner.clients.write().remove(&conn.id());
                let client = match client {
                    Some(client) => client,
                    None => return,
                };

                disconnect_inner.pending_logins.lock().remove(&conn.id());

                for column in client.drain_columns() {
                    disconnect_inner
                        .world
                        .unsubscribe(column, client.id(), true);
                }

                let username = client.username();
                if client.state() == anvil::protocol::ProtocolState::Authenticated {
                    disconnect_inner.auth_count.fetch_sub(1, Ordering::AcqRel);

                    let others = disconnect_inner.authenticated_clients();
                    disconnect_inner
                        .chat
                        .system(&others, &format!("{} left the game", username));
                }

                logging::info!(disconnect_inner.log, "client disconnected";
                               "client" => conn.id(),
                               "username" => username,
                               "reason" => reason.as_deref().unwrap_or("peer closed"));
            }),
        }
    }

    fn spawn_maintenance(inner: Arc<ServerInner>) -> JoinHandle<()> {
        thread::Builder::new()
            .name("maintenance".to_owned())
            .spawn(move || {
                let interval = Duration::from_millis(inner.config.world_unload_interval.max(50));
                let step = Duration::from_millis(25);
                let mut waited = Duration::ZERO;

                while inner.is_running() {
                    thread::sleep(step);
                    waited += step;
                    if waited < interval {
                        continue;
                    }
                    waited = Duration::ZERO;

                    let world = inner.world.clone();
                    if let Err(payload) =
                        panic::catch_unwind(AssertUnwindSafe(move || world.maintain()))
                    {
                        let what = match payload.downcast_ref::<&str>() {
                            Some(text) => (*text).to_owned(),
                            None => "maintenance panicked".to_owned(),
                        };
                        inner.escalate_panic(&what);
                        return;
                    }
                }
            })
            .expect("failed to spawn maintenance thread")
    }

    /// The endpoints actually bound.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn world(&self) -> &Arc<World> {
        &self.inner.world
    }

    /// Connected peers, authenticated or not.
    pub fn online_count(&self) -> usize {
        self.inner.clients.read().len()
    }

    /// Logged-in peers.
    pub fn authenticated_count(&self) -> usize {
        self.inner.auth_count.load(Ordering::Acquire)
    }

    /// Current world clock: (age, time of day).
    pub fn world_time(&self) -> (u64, u64) {
        (
            self.inner.world_age.load(Ordering::Relaxed),
            self.inner.time_of_day.load(Ordering::Relaxed),
        )
    }

    /// Routes `write_log` and the verbose keys.
    pub fn log_hub(&self) -> &LogHub {
        &self.inner.hub
    }

    /// Address and username bans.
    pub fn bans(&self) -> &BanList {
        &self.inner.bans
    }

    /// Installs the panic hook. Without one, escalated panics abort the
    /// process.
    pub fn set_panic_hook(&self, hook: PanicHook) {
        *self.inner.panic_hook.lock() = Some(hook);
    }

    /// Orderly shutdown: stop the clock and maintenance, tear down the
    /// connections, persist what is dirty, drain the pool.
    pub fn shutdown(mut self) {
        self.inner.running.store(false, Ordering::Release);

        for thread in self.threads.drain(..) {
            drop(thread.join());
        }

        if let Some(handler) = self.handler.take() {
            handler.shutdown();
        }

        // Final save pass so nothing dirty is lost.
        self.inner.world.maintain();
        self.inner.pool.shutdown();

        self.inner.hub.write_log(Level::Info, "server stopped");
    }
}
