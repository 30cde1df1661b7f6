//! Packet routing: a read-mostly map from `(state, id)` to handler, with
//! displaced-handler chaining and debug taps. Handlers run on the
//! application pool — dispatch is called from receive callbacks, which
//! already live there.

use ember::logging::{self, Logger};
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::client::Client;
use crate::protocol::packet::Packet;
use crate::protocol::ProtocolState;

/// A packet handler. Assigning a new handler returns the displaced one;
/// chaining is explicit — a handler that wants the old behavior calls
/// through to the previous handler itself.
pub type PacketHandler = Arc<dyn Fn(&Arc<Client>, &Packet) + Send + Sync>;

pub struct PacketRouter {
    table: RwLock<HashMap<(ProtocolState, u32), PacketHandler>>,
    traced: RwLock<HashSet<u32>>,
    traced_any: AtomicBool,
    log: Logger,
}

impl PacketRouter {
    pub fn new(log: Logger) -> PacketRouter {
        PacketRouter {
            table: RwLock::new(HashMap::new()),
            traced: RwLock::new(HashSet::new()),
            traced_any: AtomicBool::new(false),
            log,
        }
    }

    /// Installs a handler for a tuple, returning whatever it displaced.
    pub fn assign(
        &self,
        state: ProtocolState,
        id: u32,
        handler: PacketHandler,
    ) -> Option<PacketHandler> {
        self.table.write().insert((state, id), handler)
    }

    /// Removes a handler.
    pub fn clear(&self, state: ProtocolState, id: u32) -> Option<PacketHandler> {
        self.table.write().remove(&(state, id))
    }

    /// Routes one packet. Unknown tuples are dropped and logged; the
    /// connection survives (the registry already vouched for the id).
    pub fn dispatch(&self, client: &Arc<Client>, packet: &Packet) {
        if self.traced_any.load(Ordering::Relaxed) && self.traced.read().contains(&packet.id()) {
            logging::debug!(self.log, "packet trace";
                            "client" => client.id(),
                            "state" => ?client.state(),
                            "packet" => ?packet);
        }

        let handler = {
            let table = self.table.read();
            table.get(&(client.state(), packet.id())).cloned()
        };

        match handler {
            Some(handler) => handler(client, packet),
            None => {
                logging::debug!(self.log, "dropping unhandled packet";
                                "client" => client.id(),
                                "state" => ?client.state(),
                                "packet_id" => packet.id());
            }
        }
    }

    /// Adds or removes a packet id from the debug tap set.
    pub fn trace(&self, id: u32, enabled: bool) {
        let mut traced = self.traced.write();
        if enabled {
            traced.insert(id);
        } else {
            traced.remove(&id);
        }
        self.traced_any.store(!traced.is_empty(), Ordering::Relaxed);
    }

    /// Cheap probe for the tap set.
    #[inline]
    pub fn is_traced(&self, id: u32) -> bool {
        self.traced_any.load(Ordering::Relaxed) && self.traced.read().contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Connection;
    use crate::protocol::packet::FieldValue;
    use crate::protocol::registry::ids;
    use crate::protocol::Direction;
    use std::sync::atomic::AtomicUsize;

    fn test_client(state: ProtocolState) -> Arc<Client> {
        let conn = Connection::detached(1, "127.0.0.1:25565".parse().unwrap());
        let client = Client::new(conn, logging::discard());
        client.set_state(state);
        client
    }

    fn keep_alive() -> Packet {
        Packet::new(
            ProtocolState::Authenticated,
            Direction::Serverbound,
            ids::play::KEEP_ALIVE,
            vec![FieldValue::U64(1)],
        )
    }

    #[test]
    fn test_dispatch_reaches_handler() {
        let router = PacketRouter::new(logging::discard());
        let hits = Arc::new(AtomicUsize::new(0));

        let observer = hits.clone();
        router.assign(
            ProtocolState::Authenticated,
            ids::play::KEEP_ALIVE,
            Arc::new(move |_, packet| {
                assert_eq!(packet.u64(0), 1);
                observer.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let client = test_client(ProtocolState::Authenticated);
        router.dispatch(&client, &keep_alive());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatch_is_state_keyed() {
        let router = PacketRouter::new(logging::discard());
        let hits = Arc::new(AtomicUsize::new(0));

        let observer = hits.clone();
        router.assign(
            ProtocolState::Authenticated,
            ids::play::KEEP_ALIVE,
            Arc::new(move |_, _| {
                observer.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Same id, wrong state: dropped.
        let client = test_client(ProtocolState::Connected);
        router.dispatch(&client, &keep_alive());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_assign_returns_displaced_and_chains() {
        let router = PacketRouter::new(logging::discard());
        let order: Arc<parking_lot::Mutex<Vec<&'static str>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        let trace = order.clone();
        router.assign(
            ProtocolState::Authenticated,
            ids::play::KEEP_ALIVE,
            Arc::new(move |_, _| trace.lock().push("original")),
        );

        // Install a wrapper that chains through whatever it displaced.
        let trace = order.clone();
        let previous = router
            .clear(ProtocolState::Authenticated, ids::play::KEEP_ALIVE)
            .unwrap();
        router.assign(
            ProtocolState::Authenticated,
            ids::play::KEEP_ALIVE,
            Arc::new(move |client, packet| {
                trace.lock().push("wrapper");
                previous(client, packet);
            }),
        );

        let client = test_client(ProtocolState::Authenticated);
        router.dispatch(&client, &keep_alive());
        assert_eq!(order.lock().as_slice(), ["wrapper", "original"]);
    }

    #[test]
    fn test_trace_set() {
        let router = PacketRouter::new(logging::discard());
        assert!(!router.is_traced(ids::play::CHUNK_DATA));

        router.trace(ids::play::CHUNK_DATA, true);
        assert!(router.is_traced(ids::play::CHUNK_DATA));

        router.trace(ids::play::CHUNK_DATA, false);
        assert!(!router.is_traced(ids::play::CHUNK_DATA));
    }

    #[test]
    fn test_unknown_tuple_drops_quietly() {
        let router = PacketRouter::new(logging::discard());
        let client = test_client(ProtocolState::Authenticated);
        // No handler assigned at all: must not panic.
        router.dispatch(&client, &keep_alive());
    }
}
