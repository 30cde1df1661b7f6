//! The packet handlers: login flow, keepalive, chat and movement stubs.
//! Registered on the router at startup; each runs on the application pool
//! with the originating client.

use anvil::client::{Client, MutateOrder, SessionOp};
use anvil::protocol::packet::{FieldValue, Packet};
use anvil::protocol::registry::ids;
use anvil::protocol::{Direction, ProtocolState};
use anvil::world::block::ColumnId;
use ember::crypto::KEY_SIZE;
use ember::logging;
use ember::PROTOCOL_VERSION;
use rand::RngCore;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::server::{PendingLogin, ServerInner};

/// World spawn, fixed for the stock generator.
const SPAWN_BLOCK: (i32, i32, i32) = (0, 64, 0);
const CHAT_LIMIT: usize = 100;

pub fn register(inner: &Arc<ServerInner>) {
    let ctx = inner.clone();
    inner.router.assign(
        ProtocolState::Connected,
        ids::login::HANDSHAKE,
        Arc::new(move |client, packet| handle_handshake(&ctx, client, packet)),
    );

    let ctx = inner.clone();
    inner.router.assign(
        ProtocolState::Connected,
        ids::login::ENCRYPTION_RESPONSE,
        Arc::new(move |client, packet| handle_encryption_response(&ctx, client, packet)),
    );

    let ctx = inner.clone();
    inner.router.assign(
        ProtocolState::Authenticated,
        ids::play::KEEP_ALIVE,
        Arc::new(move |client, packet| handle_keep_alive(&ctx, client, packet)),
    );

    let ctx = inner.clone();
    inner.router.assign(
        ProtocolState::Authenticated,
        ids::play::CHAT,
        Arc::new(move |client, packet| handle_chat(&ctx, client, packet)),
    );

    // Flying keeps the inactivity timer fresh upstream; nothing more.
    inner.router.assign(
        ProtocolState::Authenticated,
        ids::play::FLYING,
        Arc::new(|_, _| {}),
    );

    let ctx = inner.clone();
    inner.router.assign(
        ProtocolState::Authenticated,
        ids::play::PLAYER_POSITION,
        Arc::new(move |client, packet| handle_player_position(&ctx, client, packet)),
    );
}

fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 16
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn handle_handshake(inner: &Arc<ServerInner>, client: &Arc<Client>, packet: &Packet) {
    let protocol = packet.varint(0);
    let username = packet.str(1);

    if protocol != PROTOCOL_VERSION {
        client.disconnect(Some("outdated protocol version"));
        return;
    }

    if !valid_username(username) {
        client.disconnect(Some("invalid username"));
        return;
    }

    if inner.bans.is_name_banned(username) {
        client.disconnect(Some("you are banned from this server"));
        return;
    }

    let max = inner.config.max_players;
    if max > 0 && inner.auth_count.load(Ordering::Acquire) >= max {
        client.disconnect(Some("server is full"));
        return;
    }

    let taken = inner
        .authenticated_clients()
        .iter()
        .any(|other| other.username() == username);
    if taken {
        client.disconnect(Some("name already taken"));
        return;
    }

    client.set_username(username);

    let mut verify_token = vec![0u8; 4];
    rand::thread_rng().fill_bytes(&mut verify_token);

    inner.pending_logins.lock().insert(
        client.id(),
        PendingLogin {
            verify_token: verify_token.clone(),
        },
    );

    logging::debug!(inner.log, "handshake accepted";
                    "client" => client.id(),
                    "username" => username);

    let request = Packet::new(
        ProtocolState::Connected,
        Direction::Clientbound,
        ids::login::ENCRYPTION_REQUEST,
        vec![
            FieldValue::Str("-".to_owned()),
            FieldValue::Bytes(Vec::new()),
            FieldValue::Bytes(verify_token),
        ],
    );
    drop(client.send(&request));
}

fn handle_encryption_response(inner: &Arc<ServerInner>, client: &Arc<Client>, packet: &Packet) {
    let pending = match inner.pending_logins.lock().remove(&client.id()) {
        Some(pending) => pending,
        None => {
            client.disconnect(Some("unexpected encryption response"));
            return;
        }
    };

    if packet.bytes(1) != pending.verify_token.as_slice() {
        client.disconnect(Some("verify token mismatch"));
        return;
    }

    let secret = packet.bytes(0);
    if secret.len() != KEY_SIZE {
        client.disconnect(Some("malformed session secret"));
        return;
    }

    let username = client.username();
    match inner.authenticator.authenticate(&username, secret) {
        Ok(true) => {}
        Ok(false) => {
            client.disconnect(Some("failed to verify username"));
            return;
        }
        Err(err) => {
            logging::error!(inner.log, "authentication service failure";
                            "client" => client.id(),
                            "error" => %err);
            client.disconnect(Some("authentication service unavailable"));
            return;
        }
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(secret);

    // Everything after this send is ciphertext, and the session speaks the
    // play protocol. Both facts flip atomically with the packet.
    let success = Packet::new(
        ProtocolState::Connected,
        Direction::Clientbound,
        ids::login::LOGIN_SUCCESS,
        vec![FieldValue::Str(username.clone())],
    );
    client.atomic_send(
        &success,
        &[
            SessionOp::EnableEncryption { key, iv: key },
            SessionOp::SetState(ProtocolState::Authenticated),
        ],
        MutateOrder::MutateThenSend,
    );

    inner.auth_count.fetch_add(1, Ordering::AcqRel);
    join_world(inner, client);

    let everyone = inner.authenticated_clients();
    inner
        .chat
        .system(&everyone, &format!("{} joined the game", username));

    logging::info!(inner.log, "client logged in";
                   "client" => client.id(),
                   "username" => username,
                   "peer" => %client.endpoint());
}

/// Serves the initial world view: spawn coordinates, position sync, clock
/// and the subscription square around spawn.
fn join_world(inner: &Arc<ServerInner>, client: &Arc<Client>) {
    let (spawn_x, spawn_y, spawn_z) = SPAWN_BLOCK;

    let spawn = Packet::new(
        ProtocolState::Authenticated,
        Direction::Clientbound,
        ids::play::SPAWN_POSITION,
        vec![
            FieldValue::I32(spawn_x),
            FieldValue::I32(spawn_y),
            FieldValue::I32(spawn_z),
        ],
    );
    drop(client.send(&spawn));

    let x = spawn_x as f64 + 0.5;
    let y = spawn_y as f64 + 1.0;
    let z = spawn_z as f64 + 0.5;
    let look = Packet::new(
        ProtocolState::Authenticated,
        Direction::Clientbound,
        ids::play::POSITION_AND_LOOK,
        vec![
            FieldValue::F64(x),
            FieldValue::F64(y),
            FieldValue::F64(y + 1.62),
            FieldValue::F64(z),
            FieldValue::F32(0.0),
            FieldValue::F32(0.0),
            FieldValue::Bool(false),
        ],
    );
    drop(client.send(&look));

    let time = Packet::new(
        ProtocolState::Authenticated,
        Direction::Clientbound,
        ids::play::TIME_UPDATE,
        vec![
            FieldValue::U64(inner.world_age.load(Ordering::Relaxed)),
            FieldValue::U64(inner.time_of_day.load(Ordering::Relaxed)),
        ],
    );
    drop(client.send(&time));

    let spawn_column = ColumnId::new(spawn_x.div_euclid(16), spawn_z.div_euclid(16), 0);
    client.set_view_center(spawn_column);
    update_view(inner, client, spawn_column);
}

fn view_square(center: ColumnId, radius: i32) -> Vec<ColumnId> {
    let mut square = Vec::with_capacity(((2 * radius + 1) * (2 * radius + 1)) as usize);
    for dx in -radius..=radius {
        for dz in -radius..=radius {
            square.push(ColumnId::new(center.x + dx, center.z + dz, center.dimension));
        }
    }
    square
}

/// Reconciles the client's subscriptions with the square around `center`:
/// columns out of range unsubscribe (sending the unload shape), newly
/// covered ones subscribe.
fn update_view(inner: &Arc<ServerInner>, client: &Arc<Client>, center: ColumnId) {
    let wanted = view_square(center, inner.config.view_distance.max(0));

    for id in client.columns() {
        if !wanted.contains(&id) {
            inner.world.unsubscribe(id, client.id(), false);
            client.untrack_column(id);
        }
    }

    for id in wanted {
        if client.track_column(id) {
            inner.world.clone().subscribe(id, client.clone());
        }
    }
}

/// Moves the view square along with the player. Only column crossings do
/// any work.
fn handle_player_position(inner: &Arc<ServerInner>, client: &Arc<Client>, packet: &Packet) {
    let x = packet.f64(0);
    let z = packet.f64(3);

    let dimension = match client.view_center() {
        Some(center) => center.dimension,
        // Not placed in a world yet; ignore movement.
        None => return,
    };
    let column = ColumnId::new(
        (x.floor() as i32).div_euclid(16),
        (z.floor() as i32).div_euclid(16),
        dimension,
    );

    if client.view_center() == Some(column) {
        return;
    }
    client.set_view_center(column);
    update_view(inner, client, column);
}

fn handle_keep_alive(inner: &Arc<ServerInner>, client: &Arc<Client>, packet: &Packet) {
    if client.complete_keepalive(packet.u64(0)) {
        logging::trace!(inner.log, "keepalive round trip";
                        "client" => client.id(),
                        "ping_ms" => client.ping_ms());
    }
}

fn handle_chat(inner: &Arc<ServerInner>, client: &Arc<Client>, packet: &Packet) {
    let message = packet.str(0).trim();
    if message.is_empty() {
        return;
    }
    if message.len() > CHAT_LIMIT {
        client.disconnect(Some("chat message too long"));
        return;
    }

    let everyone = inner.authenticated_clients();
    inner.chat.broadcast(&everyone, &client.username(), message);
}
