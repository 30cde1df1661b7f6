//! Per-peer session state: protocol state, the optional cipher pair, the
//! receive staging buffer and the timers. A client references its connection
//! through a shared handle; the socket itself stays with the I/O worker.

use ember::crypto::{RecvCipher, SendCipher, IV_SIZE, KEY_SIZE};
use ember::logging::{self, Logger};
use ember::time::ElapsedTimer;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::net::buffer::Buffer;
use crate::net::connection::{Connection, ConnectionId};
use crate::net::job::SendJob;
use crate::protocol::packet::{self, Packet, ParseOutcome};
use crate::protocol::{Direction, ProtocolError, ProtocolState};
use crate::world::block::ColumnId;

/// Result of offering bytes to the session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OfferOutcome {
    /// At least one whole frame is buffered; take it with `take_packet`.
    PacketReady,
    MoreNeeded,
}

/// Session mutations that can be fused with a send.
#[derive(Copy, Clone)]
pub enum SessionOp {
    SetState(ProtocolState),
    EnableEncryption { key: [u8; KEY_SIZE], iv: [u8; IV_SIZE] },
}

/// Whether the fused mutation lands before or after the packet bytes.
/// `SendThenMutate` puts the packet on the wire under the old session
/// (e.g. the last plaintext packet); `MutateThenSend` under the new one.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MutateOrder {
    MutateThenSend,
    SendThenMutate,
}

struct SessionTx {
    cipher: Option<SendCipher>,
}

struct SessionRx {
    cipher: Option<RecvCipher>,
    staging: Buffer,
}

struct KeepaliveProbe {
    token: u64,
    sent_at: Instant,
}

pub struct Client {
    conn: Arc<Connection>,
    state: AtomicU8,
    tx: Mutex<SessionTx>,
    rx: Mutex<SessionRx>,
    username: RwLock<String>,
    ping_ms: AtomicU32,
    inactive: ElapsedTimer,
    connected: ElapsedTimer,
    keepalive: Mutex<Option<KeepaliveProbe>>,
    columns: Mutex<IndexSet<ColumnId>>,
    view_center: Mutex<Option<ColumnId>>,
    log: Logger,
}

impl Client {
    pub fn new(conn: Arc<Connection>, log: Logger) -> Arc<Client> {
        Arc::new(Client {
            conn,
            state: AtomicU8::new(ProtocolState::Connected.as_u8()),
            tx: Mutex::new(SessionTx { cipher: None }),
            rx: Mutex::new(SessionRx {
                cipher: None,
                staging: Buffer::new(),
            }),
            username: RwLock::new(String::new()),
            ping_ms: AtomicU32::new(0),
            inactive: ElapsedTimer::new(),
            connected: ElapsedTimer::new(),
            keepalive: Mutex::new(None),
            columns: Mutex::new(IndexSet::new()),
            view_center: Mutex::new(None),
            log,
        })
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    #[inline]
    pub fn endpoint(&self) -> SocketAddr {
        self.conn.endpoint()
    }

    #[inline]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    #[inline]
    pub fn state(&self) -> ProtocolState {
        ProtocolState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Bare state transition, not fused with any send. Wire-coupled
    /// transitions go through `atomic_send`.
    #[inline]
    pub fn set_state(&self, state: ProtocolState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn set_username(&self, username: &str) {
        *self.username.write() = username.to_owned();
    }

    pub fn username(&self) -> String {
        self.username.read().clone()
    }

    /// Resets the inactivity timer. Called whenever the peer shows life.
    #[inline]
    pub fn touch(&self) {
        self.inactive.reset();
    }

    /// Milliseconds since the peer last showed life.
    #[inline]
    pub fn idle_ms(&self) -> u64 {
        self.inactive.elapsed_ms()
    }

    /// Milliseconds since the session was created.
    #[inline]
    pub fn connected_ms(&self) -> u64 {
        self.connected.elapsed_ms()
    }

    /// Last measured round-trip, best effort.
    #[inline]
    pub fn ping_ms(&self) -> u32 {
        self.ping_ms.load(Ordering::Relaxed)
    }

    /// Records an outstanding keepalive token. A later matching response
    /// updates the ping measurement.
    pub fn begin_keepalive(&self, token: u64) {
        *self.keepalive.lock() = Some(KeepaliveProbe {
            token,
            sent_at: Instant::now(),
        });
    }

    /// Completes a keepalive round trip. Returns false for stale or unknown
    /// tokens, which are ignored rather than punished.
    pub fn complete_keepalive(&self, token: u64) -> bool {
        let mut probe = self.keepalive.lock();
        match probe.take() {
            Some(sent) if sent.token == token => {
                let rtt = sent.sent_at.elapsed().as_millis() as u32;
                self.ping_ms.store(rtt, Ordering::Relaxed);
                true
            }
            other => {
                *probe = other;
                false
            }
        }
    }

    /// Appends bytes from the socket, decrypting when the session cipher is
    /// installed. Returns whether a whole frame is now buffered.
    pub fn offer_bytes(&self, bytes: &[u8]) -> OfferOutcome {
        let mut guard = self.rx.lock();
        let rx = &mut *guard;

        match &mut rx.cipher {
            Some(cipher) => {
                let mut plain = bytes.to_vec();
                cipher.decrypt(&mut plain);
                rx.staging.append(&plain);
            }
            None => rx.staging.append(bytes),
        }

        if packet::frame_ready(rx.staging.read_slice()) {
            OfferOutcome::PacketReady
        } else {
            OfferOutcome::MoreNeeded
        }
    }

    /// Takes the next buffered packet, if a whole frame is present. Errors
    /// are protocol violations; the caller is expected to disconnect.
    pub fn take_packet(&self) -> Result<Option<Packet>, ProtocolError> {
        let mut rx = self.rx.lock();

        match packet::parse(self.state(), Direction::Serverbound, rx.staging.read_slice())? {
            ParseOutcome::Packet { packet, consumed } => {
                rx.staging.consume(consumed);
                Ok(Some(packet))
            }
            ParseOutcome::MoreNeeded => Ok(None),
        }
    }

    /// Serializes and enqueues a clientbound packet, encrypting when the
    /// session cipher is active.
    pub fn send(&self, packet: &Packet) -> Arc<SendJob> {
        let mut tx = self.tx.lock();
        let state = self.state();

        let mut bytes = Vec::new();
        if let Err(err) = packet::serialize(state, Direction::Clientbound, packet, &mut bytes) {
            logging::error!(self.log, "packet serialization failed";
                            "packet_id" => packet.id(),
                            "error" => %err);
            return SendJob::failed();
        }

        if let Some(cipher) = &mut tx.cipher {
            cipher.encrypt(&mut bytes);
        }
        self.conn.send(bytes)
    }

    /// Sends a packet and applies session mutations as one unit: no other
    /// send on this connection can land between the packet bytes and the
    /// mutation. With `SendThenMutate` the packet goes out under the old
    /// session (the canonical way to emit the final plaintext packet before
    /// switching the ciphers on); with `MutateThenSend` under the new one.
    ///
    /// The packet is always serialized against the pre-mutation protocol
    /// state; `SetState` governs the packets that follow.
    pub fn atomic_send(
        &self,
        packet: &Packet,
        ops: &[SessionOp],
        order: MutateOrder,
    ) -> Arc<SendJob> {
        let mut tx = self.tx.lock();
        let wire_state = self.state();

        let mut bytes = Vec::new();
        if let Err(err) = packet::serialize(wire_state, Direction::Clientbound, packet, &mut bytes)
        {
            logging::error!(self.log, "packet serialization failed";
                            "packet_id" => packet.id(),
                            "error" => %err);
            return SendJob::failed();
        }

        self.conn.with_queue(|queue| match order {
            MutateOrder::MutateThenSend => {
                self.apply_ops(&mut tx, ops);
                if let Some(cipher) = &mut tx.cipher {
                    cipher.encrypt(&mut bytes);
                }
                queue.enqueue(bytes)
            }
            MutateOrder::SendThenMutate => {
                if let Some(cipher) = &mut tx.cipher {
                    cipher.encrypt(&mut bytes);
                }
                let job = queue.enqueue(bytes);
                self.apply_ops(&mut tx, ops);
                job
            }
        })
    }

    fn apply_ops(&self, tx: &mut SessionTx, ops: &[SessionOp]) {
        for op in ops {
            match op {
                SessionOp::SetState(state) => self.set_state(*state),
                SessionOp::EnableEncryption { key, iv } => {
                    if tx.cipher.is_some() {
                        // Installed once, never replaced.
                        logging::error!(self.log, "encryption enabled twice"; "client" => self.id());
                        continue;
                    }
                    tx.cipher = Some(SendCipher::new(key, iv));
                    self.rx.lock().cipher = Some(RecvCipher::new(key, iv));
                }
            }
        }
    }

    /// True once both ciphers are installed.
    pub fn is_encrypted(&self) -> bool {
        self.tx.lock().cipher.is_some()
    }

    /// Initiates ordered shutdown. When a reason is given and the connection
    /// still accepts sends, a kick packet carries it to the peer first.
    /// Idempotent; pending sends are not flushed unless awaited by the
    /// caller.
    pub fn disconnect(&self, reason: Option<&str>) {
        if self.conn.is_shutdown() {
            return;
        }

        if let Some(reason) = reason {
            let kick = match self.state() {
                ProtocolState::Connected => Packet::new(
                    ProtocolState::Connected,
                    Direction::Clientbound,
                    crate::protocol::registry::ids::login::DISCONNECT,
                    vec![packet::FieldValue::Str(reason.to_owned())],
                ),
                ProtocolState::Authenticated => Packet::new(
                    ProtocolState::Authenticated,
                    Direction::Clientbound,
                    crate::protocol::registry::ids::play::KICK,
                    vec![packet::FieldValue::Str(reason.to_owned())],
                ),
            };
            drop(self.send(&kick));
        }

        logging::info!(self.log, "disconnecting client";
                       "client" => self.id(),
                       "reason" => reason.unwrap_or("none"));
        self.conn.shutdown(reason);
    }

    /// Remembers a column this client subscribed to. Returns false when it
    /// was already tracked.
    pub fn track_column(&self, id: ColumnId) -> bool {
        self.columns.lock().insert(id)
    }

    pub fn untrack_column(&self, id: ColumnId) {
        self.columns.lock().shift_remove(&id);
    }

    /// Snapshot of the tracked columns.
    pub fn columns(&self) -> Vec<ColumnId> {
        self.columns.lock().iter().copied().collect()
    }

    /// Takes the full subscription list, e.g. for teardown.
    pub fn drain_columns(&self) -> Vec<ColumnId> {
        self.columns.lock().drain(..).collect()
    }

    /// The column the view square is centered on, once placed in a world.
    pub fn view_center(&self) -> Option<ColumnId> {
        *self.view_center.lock()
    }

    pub fn set_view_center(&self, center: ColumnId) {
        *self.view_center.lock() = Some(center);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::job::JobState;
    use crate::protocol::packet::FieldValue;
    use crate::protocol::registry::ids;
    use ember::crypto;

    fn test_client() -> Arc<Client> {
        let conn = Connection::detached(7, "127.0.0.1:25565".parse().unwrap());
        Client::new(conn, logging::discard())
    }

    fn keep_alive_response(token: u64) -> Vec<u8> {
        let packet = Packet::new(
            ProtocolState::Authenticated,
            Direction::Serverbound,
            ids::play::KEEP_ALIVE,
            vec![FieldValue::U64(token)],
        );
        let mut wire = Vec::new();
        packet::serialize(ProtocolState::Authenticated, Direction::Serverbound, &packet, &mut wire)
            .unwrap();
        wire
    }

    #[test]
    fn test_offer_and_take_packet() {
        let client = test_client();
        client.set_state(ProtocolState::Authenticated);

        let wire = keep_alive_response(99);

        // Partial frame: nothing to take, bytes retained.
        assert_eq!(client.offer_bytes(&wire[..3]), OfferOutcome::MoreNeeded);
        assert!(client.take_packet().unwrap().is_none());

        // Remainder completes the frame.
        assert_eq!(client.offer_bytes(&wire[3..]), OfferOutcome::PacketReady);
        let packet = client.take_packet().unwrap().unwrap();
        assert_eq!(packet.id(), ids::play::KEEP_ALIVE);
        assert_eq!(packet.u64(0), 99);

        assert!(client.take_packet().unwrap().is_none());
    }

    #[test]
    fn test_take_packet_surfaces_violations() {
        let client = test_client();

        // length=1, id=0x55: not registered in Connected.
        assert_eq!(client.offer_bytes(&[0x01, 0x55]), OfferOutcome::PacketReady);
        assert!(matches!(
            client.take_packet(),
            Err(ProtocolError::BadPacketId { .. })
        ));
    }

    #[test]
    fn test_send_serializes_to_queue() {
        let client = test_client();
        client.set_state(ProtocolState::Authenticated);

        let packet = Packet::new(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            ids::play::CHAT,
            vec![FieldValue::Str("hello".to_owned())],
        );
        let job = client.send(&packet);

        let buffers = client.connection().drain_queued();
        assert_eq!(job.state(), JobState::Sent);
        assert_eq!(buffers.len(), 1);

        match packet::parse(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            &buffers[0],
        )
        .unwrap()
        {
            ParseOutcome::Packet { packet, .. } => assert_eq!(packet.str(0), "hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_atomic_send_plaintext_then_ciphertext() {
        let client = test_client();
        client.set_state(ProtocolState::Authenticated);
        let secret = [0x42u8; crypto::KEY_SIZE];

        let marker = Packet::new(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            ids::play::CHAT,
            vec![FieldValue::Str("last plaintext".to_owned())],
        );
        client.atomic_send(
            &marker,
            &[SessionOp::EnableEncryption { key: secret, iv: secret }],
            MutateOrder::SendThenMutate,
        );
        assert!(client.is_encrypted());

        let follow_up = Packet::new(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            ids::play::CHAT,
            vec![FieldValue::Str("ciphertext".to_owned())],
        );
        client.send(&follow_up);

        let buffers = client.connection().drain_queued();
        assert_eq!(buffers.len(), 2);

        // The marker is readable as-is.
        match packet::parse(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            &buffers[0],
        )
        .unwrap()
        {
            ParseOutcome::Packet { packet, .. } => assert_eq!(packet.str(0), "last plaintext"),
            other => panic!("unexpected {:?}", other),
        }

        // The follow-up is not plaintext, but decrypts with the mirror
        // cipher into a valid frame.
        assert!(packet::parse(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            &buffers[1],
        )
        .is_err() || {
            // Frame bytes could accidentally parse; they must not equal the
            // plaintext encoding either way.
            let mut plain = Vec::new();
            packet::serialize(
                ProtocolState::Authenticated,
                Direction::Clientbound,
                &follow_up,
                &mut plain,
            )
            .unwrap();
            buffers[1] != plain
        });

        let mut mirrored = buffers[1].clone();
        let (_, mut recv) = crypto::pair(&secret);
        recv.decrypt(&mut mirrored);
        match packet::parse(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            &mirrored,
        )
        .unwrap()
        {
            ParseOutcome::Packet { packet, .. } => assert_eq!(packet.str(0), "ciphertext"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_atomic_send_mutate_then_send_encrypts_packet() {
        let client = test_client();
        let secret = [0x17u8; crypto::KEY_SIZE];

        let success = Packet::new(
            ProtocolState::Connected,
            Direction::Clientbound,
            ids::login::LOGIN_SUCCESS,
            vec![FieldValue::Str("steve".to_owned())],
        );
        client.atomic_send(
            &success,
            &[
                SessionOp::EnableEncryption { key: secret, iv: secret },
                SessionOp::SetState(ProtocolState::Authenticated),
            ],
            MutateOrder::MutateThenSend,
        );

        assert_eq!(client.state(), ProtocolState::Authenticated);

        let buffers = client.connection().drain_queued();
        assert_eq!(buffers.len(), 1);

        // Decrypts into a login-success frame: the packet went out under the
        // new cipher but the old protocol state.
        let mut mirrored = buffers[0].clone();
        let (_, mut recv) = crypto::pair(&secret);
        recv.decrypt(&mut mirrored);
        match packet::parse(
            ProtocolState::Connected,
            Direction::Clientbound,
            &mirrored,
        )
        .unwrap()
        {
            ParseOutcome::Packet { packet, .. } => {
                assert_eq!(packet.id(), ids::login::LOGIN_SUCCESS);
                assert_eq!(packet.str(0), "steve");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encrypted_receive_path() {
        let client = test_client();
        client.set_state(ProtocolState::Authenticated);
        let secret = [9u8; crypto::KEY_SIZE];

        let noop = Packet::new(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            ids::play::KEEP_ALIVE,
            vec![FieldValue::U64(0)],
        );
        client.atomic_send(
            &noop,
            &[SessionOp::EnableEncryption { key: secret, iv: secret }],
            MutateOrder::SendThenMutate,
        );

        // Peer encrypts with the mirror cipher; the session decrypts.
        let wire = keep_alive_response(1234);
        let (mut peer_send, _) = crypto::pair(&secret);
        let mut encrypted = wire.clone();
        peer_send.encrypt(&mut encrypted);

        // Split delivery exercises incremental decryption.
        client.offer_bytes(&encrypted[..4]);
        assert_eq!(client.offer_bytes(&encrypted[4..]), OfferOutcome::PacketReady);

        let packet = client.take_packet().unwrap().unwrap();
        assert_eq!(packet.u64(0), 1234);
    }

    #[test]
    fn test_send_after_disconnect_fails() {
        let client = test_client();
        client.set_state(ProtocolState::Authenticated);

        client.disconnect(Some("be gone"));
        client.disconnect(Some("twice is fine"));

        let packet = Packet::new(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            ids::play::KEEP_ALIVE,
            vec![FieldValue::U64(5)],
        );
        let job = client.send(&packet);
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(
            client.connection().disconnect_reason().as_deref(),
            Some("be gone")
        );
    }

    #[test]
    fn test_keepalive_ping_measurement() {
        let client = test_client();

        client.begin_keepalive(42);
        assert!(!client.complete_keepalive(41));
        assert!(client.complete_keepalive(42));
        assert!(!client.complete_keepalive(42));
    }

    #[test]
    fn test_username_and_timers() {
        let client = test_client();
        client.set_username("alex");
        assert_eq!(client.username(), "alex");

        client.touch();
        assert!(client.idle_ms() < 1000);
        assert!(client.connected_ms() < 1000);
    }

    #[test]
    fn test_column_tracking() {
        let client = test_client();
        let a = ColumnId::new(0, 0, 0);
        let b = ColumnId::new(1, 0, 0);

        assert!(client.track_column(a));
        assert!(!client.track_column(a));
        assert!(client.track_column(b));

        client.untrack_column(a);
        assert_eq!(client.drain_columns(), vec![b]);
    }
}
