//! Column containers: the dense 16×16×256 cell store, the loading state
//! machine, subscriber bookkeeping and both serializations — the packed,
//! zlib-compressed wire form and the flat backing-store form.

use ember::store::StorageError;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::block::{Block, ColumnId};
use crate::client::Client;
use crate::net::connection::ConnectionId;
use crate::net::pool::ThreadPool;
use crate::protocol::packet::{FieldValue, Packet};
use crate::protocol::registry::ids;
use crate::protocol::{Direction, ProtocolState};

pub const COLUMN_BLOCKS: usize = 16 * 16 * 256;
pub const BIOME_BYTES: usize = 16 * 16;
/// Backing-store form: big-endian cells, biome lane, populated flag.
pub const STORAGE_BYTES: usize = COLUMN_BLOCKS * 4 + BIOME_BYTES + 1;

/// Whether columns in a dimension carry the skylight lane.
#[inline]
pub fn dimension_has_sky(dimension: i8) -> bool {
    dimension >= 0
}

/// Lifecycle of a column. Only ever advances.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum ColumnState {
    Loading,
    Generating,
    Generated,
    Populating,
    Populated,
}

type PendingAction = (ColumnState, Box<dyn FnOnce() + Send>);

pub struct ColumnData {
    pub blocks: Vec<u32>,
    pub biomes: [u8; BIOME_BYTES],
    pub state: ColumnState,
    /// The most advanced state currently being driven toward.
    pub target: ColumnState,
    pub populated: bool,
    pub dirty: bool,
    /// The column serialization has been emitted to subscribers.
    pub sent: bool,
    /// A driver currently owns the state machine.
    pub driving: bool,
    subscribers: IndexMap<ConnectionId, Arc<Client>>,
    pending: Vec<PendingAction>,
}

impl ColumnData {
    #[inline]
    pub fn block_at(&self, offset: usize) -> Block {
        Block::from_cell(self.blocks[offset])
    }

    /// Writes a cell and marks the column dirty.
    #[inline]
    pub fn put_block(&mut self, offset: usize, block: Block) {
        self.blocks[offset] = block.cell();
        self.dirty = true;
    }

    #[inline]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &Arc<Client>> {
        self.subscribers.values()
    }
}

/// One cached column. The data sits behind a single mutex; state waiters
/// share the condvar; interest is a plain atomic so probes never take the
/// lock.
pub struct ColumnContainer {
    id: ColumnId,
    interest: AtomicU32,
    lock: Mutex<ColumnData>,
    advanced: Condvar,
}

impl ColumnContainer {
    pub fn new(id: ColumnId) -> Arc<ColumnContainer> {
        Arc::new(ColumnContainer {
            id,
            interest: AtomicU32::new(0),
            lock: Mutex::new(ColumnData {
                blocks: vec![0; COLUMN_BLOCKS],
                biomes: [0; BIOME_BYTES],
                state: ColumnState::Loading,
                target: ColumnState::Generated,
                populated: false,
                dirty: false,
                sent: false,
                driving: false,
                subscribers: IndexMap::new(),
                pending: Vec::new(),
            }),
            advanced: Condvar::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> ColumnId {
        self.id
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, ColumnData> {
        self.lock.lock()
    }

    #[inline]
    pub fn add_interest(&self) {
        self.interest.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn end_interest(&self) {
        let previous = self.interest.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "interest count underflow");
    }

    #[inline]
    pub fn interest(&self) -> u32 {
        self.interest.load(Ordering::Acquire)
    }

    /// Unloadable: nobody subscribed, no transient holds, nothing unsaved.
    pub fn can_unload(&self, data: &ColumnData) -> bool {
        data.subscribers.is_empty() && self.interest() == 0 && !data.dirty
    }

    /// Blocks until the current driver either finishes or advances the
    /// state. Callers loop on their own predicate.
    #[inline]
    pub fn wait_advance(&self, guard: &mut MutexGuard<'_, ColumnData>) {
        self.advanced.wait(guard);
    }

    /// Wakes waiters without a transition, e.g. after a failed drive.
    #[inline]
    pub fn notify_waiters(&self) {
        self.advanced.notify_all();
    }

    /// Advances the state machine. Sets the populated flag at `Populated`
    /// and emits the column to every subscriber exactly once; drains pending
    /// actions whose requirement is now met onto the pool; wakes waiters.
    /// States never move backwards.
    pub fn advance(
        &self,
        data: &mut ColumnData,
        state: ColumnState,
        dirty: bool,
        pool: &ThreadPool,
    ) {
        debug_assert!(data.state <= state, "column state must not regress");
        data.state = state;

        if dirty {
            data.dirty = true;
        }

        if state == ColumnState::Populated {
            data.populated = true;

            if !data.sent {
                data.sent = true;
                let packet = chunk_data_packet(data, self.id);
                for client in data.subscribers.values() {
                    drop(client.send(&packet));
                }
            }
        }

        let mut index = 0;
        while index < data.pending.len() {
            if data.pending[index].0 <= state {
                let (_, action) = data.pending.swap_remove(index);
                pool.execute(action);
            } else {
                index += 1;
            }
        }

        self.advanced.notify_all();
    }

    /// Runs `action` once the column reaches `required`: immediately when it
    /// already has, otherwise queued until the transition.
    pub fn defer(
        &self,
        data: &mut ColumnData,
        required: ColumnState,
        pool: &ThreadPool,
        action: Box<dyn FnOnce() + Send>,
    ) {
        if data.state >= required {
            pool.execute(action);
        } else {
            data.pending.push((required, action));
        }
    }

    /// Adds a subscriber. When the column has already been emitted, the
    /// serialization is sent right away; otherwise it arrives with the
    /// `Populated` transition. Duplicate subscribers are ignored.
    pub fn subscribe(&self, data: &mut ColumnData, client: Arc<Client>) {
        if data.subscribers.contains_key(&client.id()) {
            return;
        }

        if data.sent {
            drop(client.send(&chunk_data_packet(data, self.id)));
        }
        data.subscribers.insert(client.id(), client);
    }

    /// Removes a subscriber. A clean removal after the column was emitted
    /// tells the peer to unload it; a forced one goes silent.
    pub fn unsubscribe(&self, data: &mut ColumnData, client_id: ConnectionId, force: bool) {
        if let Some(client) = data.subscribers.shift_remove(&client_id) {
            if !force && data.sent {
                drop(client.send(&unload_packet(self.id)));
            }
        }
    }

    /// Sends one packet to every subscriber.
    pub fn broadcast(&self, data: &ColumnData, packet: &Packet) {
        for client in data.subscribers.values() {
            drop(client.send(packet));
        }
    }

    /// Encodes the column for the backing store.
    pub fn storage_bytes(&self, data: &ColumnData) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(STORAGE_BYTES);
        for cell in &data.blocks {
            bytes.extend_from_slice(&cell.to_be_bytes());
        }
        bytes.extend_from_slice(&data.biomes);
        bytes.push(data.populated as u8);
        bytes
    }

    /// Installs column content from backing-store bytes.
    pub fn install_storage(&self, data: &mut ColumnData, bytes: &[u8]) -> Result<(), StorageError> {
        if bytes.len() != STORAGE_BYTES {
            return Err(StorageError::Corrupt("column byte length"));
        }

        for (cell, chunk) in data.blocks.iter_mut().zip(bytes.chunks_exact(4)) {
            *cell = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let biomes_at = COLUMN_BLOCKS * 4;
        data.biomes
            .copy_from_slice(&bytes[biomes_at..biomes_at + BIOME_BYTES]);

        match bytes[STORAGE_BYTES - 1] {
            0 => data.populated = false,
            1 => data.populated = true,
            _ => return Err(StorageError::Corrupt("populated flag")),
        }
        Ok(())
    }
}

/// Packs a nibble lane: first value of each pair in the high nibble.
fn pack_nibble_lane(out: &mut Vec<u8>, values: impl Iterator<Item = u8>) {
    let mut pending: Option<u8> = None;
    for value in values {
        match pending.take() {
            None => pending = Some((value & 0x0F) << 4),
            Some(high) => out.push(high | (value & 0x0F)),
        }
    }
    if let Some(high) = pending {
        out.push(high);
    }
}

/// Builds the chunk-data packet: contiguous lanes — type low bytes, metadata
/// nibbles, block-light nibbles, skylight nibbles (sky dimensions only), add
/// nibbles (only when some type exceeds 255) and the biome lane — deflated
/// with zlib. The primary mask always claims all sixteen sections; the add
/// mask claims them exactly when the add lane is present.
pub fn chunk_data_packet(data: &ColumnData, id: ColumnId) -> Packet {
    let has_sky = dimension_has_sky(id.dimension);
    let add = data
        .blocks
        .iter()
        .any(|&cell| Block::from_cell(cell).id() > 0xFF);

    let mut lanes = COLUMN_BLOCKS + COLUMN_BLOCKS / 2 + COLUMN_BLOCKS / 2 + BIOME_BYTES;
    if has_sky {
        lanes += COLUMN_BLOCKS / 2;
    }
    if add {
        lanes += COLUMN_BLOCKS / 2;
    }

    let mut column = Vec::with_capacity(lanes);
    for &cell in &data.blocks {
        column.push(Block::from_cell(cell).id() as u8);
    }
    pack_nibble_lane(
        &mut column,
        data.blocks.iter().map(|&cell| Block::from_cell(cell).metadata()),
    );
    pack_nibble_lane(
        &mut column,
        data.blocks.iter().map(|&cell| Block::from_cell(cell).light()),
    );
    if has_sky {
        pack_nibble_lane(
            &mut column,
            data.blocks.iter().map(|&cell| Block::from_cell(cell).skylight()),
        );
    }
    if add {
        pack_nibble_lane(
            &mut column,
            data.blocks
                .iter()
                .map(|&cell| (Block::from_cell(cell).id() >> 8) as u8),
        );
    }
    column.extend_from_slice(&data.biomes);
    debug_assert_eq!(column.len(), lanes);

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&column)
        .expect("writing to an in-memory encoder");
    let compressed = encoder.finish().expect("finishing an in-memory encoder");

    Packet::new(
        ProtocolState::Authenticated,
        Direction::Clientbound,
        ids::play::CHUNK_DATA,
        vec![
            FieldValue::I32(id.x),
            FieldValue::I32(id.z),
            FieldValue::Bool(true),
            FieldValue::U16(0xFFFF),
            FieldValue::U16(if add { 0xFFFF } else { 0 }),
            FieldValue::Bytes(compressed),
        ],
    )
}

/// The unload form of the chunk-data packet: empty masks, empty payload.
pub fn unload_packet(id: ColumnId) -> Packet {
    Packet::new(
        ProtocolState::Authenticated,
        Direction::Clientbound,
        ids::play::CHUNK_DATA,
        vec![
            FieldValue::I32(id.x),
            FieldValue::I32(id.z),
            FieldValue::Bool(true),
            FieldValue::U16(0),
            FieldValue::U16(0),
            FieldValue::Bytes(Vec::new()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Connection;
    use crate::world::block::BlockId;
    use ember::logging;
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    fn test_pool() -> ThreadPool {
        ThreadPool::new(1, &logging::discard(), None)
    }

    fn test_client(id: ConnectionId) -> Arc<Client> {
        let conn = Connection::detached(id, "127.0.0.1:25565".parse().unwrap());
        let client = Client::new(conn, logging::discard());
        client.set_state(ProtocolState::Authenticated);
        client
    }

    fn decompress(bytes: &[u8]) -> Vec<u8> {
        let mut decoder = ZlibDecoder::new(bytes);
        let mut plain = Vec::new();
        decoder.read_to_end(&mut plain).unwrap();
        plain
    }

    #[test]
    fn test_chunk_data_lane_shape() {
        let column = ColumnContainer::new(ColumnId::new(3, -2, 0));
        let mut data = column.lock();

        // One recognizable block: stone with metadata 5, lights set.
        let offset = BlockId::new(1, 0, 0, 0).offset();
        data.blocks[offset] = Block::new(1, 5).with_light(7).with_skylight(15).cell();
        data.biomes = [4; BIOME_BYTES];

        let packet = chunk_data_packet(&data, column.id());
        assert_eq!(packet.i32(0), 3);
        assert_eq!(packet.i32(1), -2);
        assert!(packet.bool(2));
        assert_eq!(packet.u16(3), 0xFFFF);
        // No block id above 255: no add lane, empty add mask.
        assert_eq!(packet.u16(4), 0);

        let plain = decompress(packet.bytes(5));
        // type + meta/2 + light/2 + skylight/2 + biomes
        let expected =
            COLUMN_BLOCKS + COLUMN_BLOCKS / 2 + COLUMN_BLOCKS / 2 + COLUMN_BLOCKS / 2 + BIOME_BYTES;
        assert_eq!(plain.len(), expected);

        // Type lane.
        assert_eq!(plain[offset], 1);
        // Metadata lane, offset 1 is the low nibble of the first pair.
        let meta_lane = &plain[COLUMN_BLOCKS..];
        assert_eq!(meta_lane[0], 0x05);
        // Biome lane sits at the tail.
        assert_eq!(plain[plain.len() - BIOME_BYTES..], [4; BIOME_BYTES]);
    }

    #[test]
    fn test_chunk_data_add_lane() {
        let column = ColumnContainer::new(ColumnId::new(0, 0, 0));
        let mut data = column.lock();
        data.blocks[0] = Block::new(276, 0).cell();

        let packet = chunk_data_packet(&data, column.id());
        assert_eq!(packet.u16(4), 0xFFFF);

        let plain = decompress(packet.bytes(5));
        let expected = COLUMN_BLOCKS
            + COLUMN_BLOCKS / 2
            + COLUMN_BLOCKS / 2
            + COLUMN_BLOCKS / 2
            + COLUMN_BLOCKS / 2
            + BIOME_BYTES;
        assert_eq!(plain.len(), expected);

        // Low byte in the type lane, high nibble in the add lane.
        assert_eq!(plain[0], (276 & 0xFF) as u8);
        let add_lane_at = COLUMN_BLOCKS + 3 * (COLUMN_BLOCKS / 2);
        assert_eq!(plain[add_lane_at], ((276 >> 8) as u8) << 4);
    }

    #[test]
    fn test_no_skylight_lane_below_ground_dimension() {
        let column = ColumnContainer::new(ColumnId::new(0, 0, -1));
        let data = column.lock();

        let packet = chunk_data_packet(&data, column.id());
        let plain = decompress(packet.bytes(5));
        let expected = COLUMN_BLOCKS + COLUMN_BLOCKS / 2 + COLUMN_BLOCKS / 2 + BIOME_BYTES;
        assert_eq!(plain.len(), expected);
    }

    #[test]
    fn test_unload_packet_shape() {
        let packet = unload_packet(ColumnId::new(9, 9, 0));
        assert_eq!(packet.i32(0), 9);
        assert_eq!(packet.i32(1), 9);
        assert!(packet.bool(2));
        assert_eq!(packet.u16(3), 0);
        assert_eq!(packet.u16(4), 0);
        assert!(packet.bytes(5).is_empty());
    }

    #[test]
    fn test_storage_roundtrip() {
        let column = ColumnContainer::new(ColumnId::new(0, 0, 0));
        let mut data = column.lock();
        data.blocks[17] = Block::new(300, 3).with_light(2).cell();
        data.biomes[200] = 9;
        data.populated = true;

        let bytes = column.storage_bytes(&data);
        assert_eq!(bytes.len(), STORAGE_BYTES);

        let restore = ColumnContainer::new(ColumnId::new(0, 0, 0));
        let mut restored = restore.lock();
        restore.install_storage(&mut restored, &bytes).unwrap();

        assert_eq!(restored.blocks, data.blocks);
        assert_eq!(restored.biomes[200], 9);
        assert!(restored.populated);
    }

    #[test]
    fn test_storage_rejects_bad_length() {
        let column = ColumnContainer::new(ColumnId::new(0, 0, 0));
        let mut data = column.lock();
        assert_eq!(
            column.install_storage(&mut data, &[0; 10]).unwrap_err(),
            StorageError::Corrupt("column byte length")
        );
    }

    #[test]
    fn test_advance_emits_to_subscribers_once() {
        let pool = test_pool();
        let column = ColumnContainer::new(ColumnId::new(0, 0, 0));
        let alice = test_client(1);
        let bob = test_client(2);

        {
            let mut data = column.lock();
            column.subscribe(&mut data, alice.clone());
            column.subscribe(&mut data, bob.clone());
            // Not yet populated: nothing sent.
            assert!(alice.connection().pending() == 0);

            column.advance(&mut data, ColumnState::Generated, true, &pool);
            assert!(alice.connection().pending() == 0);

            column.advance(&mut data, ColumnState::Populated, true, &pool);
            assert!(data.populated);
            assert!(data.sent);
        }

        assert_eq!(alice.connection().drain_queued().len(), 1);
        assert_eq!(bob.connection().drain_queued().len(), 1);

        // A late subscriber gets the data immediately, the others nothing
        // new.
        let carol = test_client(3);
        {
            let mut data = column.lock();
            column.subscribe(&mut data, carol.clone());
            column.subscribe(&mut data, carol.clone());
        }
        assert_eq!(carol.connection().drain_queued().len(), 1);
        assert!(alice.connection().pending() == 0);

        pool.shutdown();
    }

    #[test]
    fn test_unsubscribe_sends_unload_unless_forced() {
        let pool = test_pool();
        let column = ColumnContainer::new(ColumnId::new(0, 0, 0));
        let alice = test_client(1);
        let bob = test_client(2);

        {
            let mut data = column.lock();
            column.subscribe(&mut data, alice.clone());
            column.subscribe(&mut data, bob.clone());
            column.advance(&mut data, ColumnState::Populated, true, &pool);
        }
        alice.connection().drain_queued();
        bob.connection().drain_queued();

        {
            let mut data = column.lock();
            column.unsubscribe(&mut data, alice.id(), false);
            column.unsubscribe(&mut data, bob.id(), true);
            assert_eq!(data.subscriber_count(), 0);
        }

        // Clean removal sends the unload shape; forced removal is silent.
        let unloads = alice.connection().drain_queued();
        assert_eq!(unloads.len(), 1);
        assert!(bob.connection().drain_queued().is_empty());

        pool.shutdown();
    }

    #[test]
    fn test_pending_actions_drain_at_threshold() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let pool = test_pool();
        let column = ColumnContainer::new(ColumnId::new(0, 0, 0));
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let mut data = column.lock();
            let observer = fired.clone();
            column.defer(
                &mut data,
                ColumnState::Populated,
                &pool,
                Box::new(move || {
                    observer.fetch_add(1, Ordering::SeqCst);
                }),
            );

            column.advance(&mut data, ColumnState::Generated, false, &pool);
        }

        // Requirement not met yet.
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        {
            let mut data = column.lock();
            column.advance(&mut data, ColumnState::Populated, false, &pool);

            // Already satisfied: runs straight away.
            let observer = fired.clone();
            column.defer(
                &mut data,
                ColumnState::Generated,
                &pool,
                Box::new(move || {
                    observer.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        pool.shutdown();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_can_unload_conditions() {
        let pool = test_pool();
        let column = ColumnContainer::new(ColumnId::new(0, 0, 0));
        let client = test_client(1);

        {
            let mut data = column.lock();
            assert!(column.can_unload(&data));

            column.subscribe(&mut data, client.clone());
            assert!(!column.can_unload(&data));
            column.unsubscribe(&mut data, client.id(), true);

            column.add_interest();
            assert!(!column.can_unload(&data));
            column.end_interest();

            column.advance(&mut data, ColumnState::Generated, true, &pool);
            assert!(!column.can_unload(&data));
            data.dirty = false;
            assert!(column.can_unload(&data));
        }

        pool.shutdown();
    }
}
