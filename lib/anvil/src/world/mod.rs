//! The column store: a keyed cache of world columns with a per-column state
//! machine, subscriber fan-out, transient interest counts and dirty-flag
//! persistence. One driver at a time advances a column; everyone else waits
//! on its condvar.

pub mod block;
pub mod column;
pub mod generator;
pub mod maintenance;

use ember::logging::{self, Logger};
use ember::store::{DataProvider, StorageError};
use hashbrown::HashMap;
use parking_lot::{MutexGuard, RwLock};
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::client::Client;
use crate::net::connection::ConnectionId;
use crate::net::pool::ThreadPool;
use crate::protocol::packet::{FieldValue, Packet};
use crate::protocol::registry::ids;
use crate::protocol::{Direction, ProtocolState};

use self::block::{Block, BlockId, ColumnId};
use self::column::{ColumnContainer, ColumnData, ColumnState, BIOME_BYTES, COLUMN_BLOCKS};
use self::generator::{Populator, WorldGenerator};

#[derive(Debug)]
pub enum WorldError {
    /// No generator registered for the dimension and world type.
    GeneratorMissing { dimension: i8, world_type: String },
    Storage(StorageError),
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorldError::GeneratorMissing {
                dimension,
                world_type,
            } => write!(
                f,
                "no generator for dimension {} world type {:?}",
                dimension, world_type
            ),
            WorldError::Storage(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for WorldError {}

impl From<StorageError> for WorldError {
    fn from(err: StorageError) -> Self {
        WorldError::Storage(err)
    }
}

/// A veto-capable observer of block mutations.
pub struct BlockEvent {
    pub id: BlockId,
    pub from: Block,
    pub to: Block,
}

pub type BlockEventHandler = Arc<dyn Fn(&BlockEvent) -> bool + Send + Sync>;

/// Holds a column loaded; interest is released on drop.
pub struct ColumnHandle {
    column: Arc<ColumnContainer>,
}

impl ColumnHandle {
    #[inline]
    pub fn id(&self) -> ColumnId {
        self.column.id()
    }

    #[inline]
    pub fn column(&self) -> &Arc<ColumnContainer> {
        &self.column
    }

    pub fn state(&self) -> ColumnState {
        self.column.lock().state
    }
}

impl Drop for ColumnHandle {
    fn drop(&mut self) {
        self.column.end_interest();
    }
}

enum LoadOutcome {
    Stored(Vec<u8>),
    Generated(Vec<u32>, [u8; BIOME_BYTES]),
}

pub struct World {
    columns: RwLock<HashMap<ColumnId, Arc<ColumnContainer>>>,
    generators: RwLock<HashMap<(i8, String), Arc<dyn WorldGenerator>>>,
    populators: RwLock<Vec<(u32, Arc<dyn Populator>)>>,
    block_events: RwLock<Vec<BlockEventHandler>>,
    data: Arc<dyn DataProvider>,
    pool: Arc<ThreadPool>,
    world_type: String,
    pub(crate) saved: AtomicU64,
    pub(crate) unloaded: AtomicU64,
    pub(crate) maintenances: AtomicU64,
    log: Logger,
}

impl World {
    pub fn new(
        data: Arc<dyn DataProvider>,
        pool: Arc<ThreadPool>,
        world_type: &str,
        log: Logger,
    ) -> Arc<World> {
        Arc::new(World {
            columns: RwLock::new(HashMap::new()),
            generators: RwLock::new(HashMap::new()),
            populators: RwLock::new(Vec::new()),
            block_events: RwLock::new(Vec::new()),
            data,
            pool,
            world_type: world_type.to_owned(),
            saved: AtomicU64::new(0),
            unloaded: AtomicU64::new(0),
            maintenances: AtomicU64::new(0),
            log,
        })
    }

    pub fn register_generator(
        &self,
        dimension: i8,
        world_type: &str,
        generator: Arc<dyn WorldGenerator>,
    ) {
        self.generators
            .write()
            .insert((dimension, world_type.to_owned()), generator);
    }

    /// Adds a populator. Lower priorities run first; equal priorities keep
    /// registration order.
    pub fn add_populator(&self, priority: u32, populator: Arc<dyn Populator>) {
        let mut populators = self.populators.write();
        let at = populators
            .iter()
            .position(|(p, _)| *p > priority)
            .unwrap_or(populators.len());
        populators.insert(at, (priority, populator));
    }

    /// Registers a block mutation observer. Any handler returning false
    /// vetoes the mutation.
    pub fn on_block_change(&self, handler: BlockEventHandler) {
        self.block_events.write().push(handler);
    }

    /// Number of columns currently cached.
    pub fn loaded_count(&self) -> usize {
        self.columns.read().len()
    }

    /// Returns the cached column entry, creating it in `Loading` state.
    fn pin(&self, id: ColumnId) -> Arc<ColumnContainer> {
        {
            let columns = self.columns.read();
            if let Some(column) = columns.get(&id) {
                return column.clone();
            }
        }

        let mut columns = self.columns.write();
        columns
            .entry(id)
            .or_insert_with(|| ColumnContainer::new(id))
            .clone()
    }

    /// Loads a column up to the required state and returns a handle keeping
    /// it resident. Concurrent callers share one driver; the rest wait.
    pub fn load(&self, id: ColumnId, require_populated: bool) -> Result<ColumnHandle, WorldError> {
        let column = self.pin(id);
        column.add_interest();
        let handle = ColumnHandle { column };

        let required = if require_populated {
            ColumnState::Populated
        } else {
            ColumnState::Generated
        };
        self.drive(handle.column(), required)?;
        Ok(handle)
    }

    /// Explicit interest release for callers that bypassed the handle.
    pub fn end_interest(&self, id: ColumnId) {
        if let Some(column) = self.columns.read().get(&id) {
            column.end_interest();
        }
    }

    /// Probes a column's state. With `acquire` the column gains interest
    /// that the caller must later release with `end_interest`.
    pub fn state_of(&self, id: ColumnId, acquire: bool) -> Option<ColumnState> {
        let column = self.columns.read().get(&id).cloned()?;
        if acquire {
            column.add_interest();
        }
        let state = column.lock().state;
        Some(state)
    }

    /// Reads a block under the column lock, loading the column if needed.
    pub fn get_block(&self, id: BlockId) -> Result<Block, WorldError> {
        let handle = self.load(id.column(), false)?;
        let data = handle.column().lock();
        Ok(data.block_at(id.offset()))
    }

    /// Writes a block: fires the mutation observers (any may veto), marks
    /// the column dirty and sends the delta to subscribers of a populated
    /// column. Returns false when vetoed.
    pub fn set_block(&self, id: BlockId, to: Block) -> Result<bool, WorldError> {
        let handle = self.load(id.column(), false)?;
        let column = handle.column();

        let from = column.lock().block_at(id.offset());
        let event = BlockEvent { id, from, to };

        let handlers = self.block_events.read().clone();
        for handler in &handlers {
            if !handler(&event) {
                logging::debug!(self.log, "block change vetoed"; "block" => %id);
                return Ok(false);
            }
        }

        let mut guard = column.lock();
        let data = &mut *guard;
        data.put_block(id.offset(), to);

        // Populated columns get delta packets; earlier states are still
        // private to the generator pipeline.
        if data.state == ColumnState::Populated {
            column.broadcast(data, &block_change_packet(id, to));
        }
        Ok(true)
    }

    /// Writes a batch of blocks. Observers may veto individual mutations;
    /// the survivors apply per column under one lock and subscribers of a
    /// populated column get one coalesced packet per column instead of a
    /// delta flood. Returns the number of blocks applied.
    pub fn set_blocks(&self, changes: &[(BlockId, Block)]) -> Result<usize, WorldError> {
        let handlers = self.block_events.read().clone();

        let mut per_column: HashMap<ColumnId, Vec<(BlockId, Block)>> = HashMap::new();
        for &(id, to) in changes {
            per_column.entry(id.column()).or_default().push((id, to));
        }

        let mut applied_total = 0;
        for (column_id, group) in per_column {
            let handle = self.load(column_id, false)?;
            let column = handle.column();

            let mut applied = Vec::with_capacity(group.len());
            for (id, to) in group {
                let from = column.lock().block_at(id.offset());
                let event = BlockEvent { id, from, to };
                if handlers.iter().all(|handler| handler(&event)) {
                    applied.push((id, to));
                }
            }
            if applied.is_empty() {
                continue;
            }

            let mut guard = column.lock();
            let data = &mut *guard;
            for &(id, to) in &applied {
                data.put_block(id.offset(), to);
            }

            if data.state == ColumnState::Populated {
                // A single change keeps the lean delta shape.
                if applied.len() == 1 {
                    let (id, to) = applied[0];
                    column.broadcast(data, &block_change_packet(id, to));
                } else {
                    for batch in applied.chunks(i16::MAX as usize) {
                        column.broadcast(data, &multi_block_change_packet(column_id, batch));
                    }
                }
            }
            applied_total += applied.len();
        }

        Ok(applied_total)
    }

    /// Subscribes a client. An already-served column is sent immediately;
    /// otherwise the serialization arrives with the `Populated` transition,
    /// driven in the background.
    pub fn subscribe(self: Arc<Self>, id: ColumnId, client: Arc<Client>) {
        let column = self.pin(id);

        let needs_drive = {
            let mut data = column.lock();
            column.subscribe(&mut data, client);
            data.state < ColumnState::Populated
        };

        if needs_drive {
            let pool = self.pool.clone();
            pool.execute(move || {
                if let Err(err) = self.load(id, true) {
                    logging::warn!(self.log, "column load for subscriber failed";
                                   "column" => %id,
                                   "error" => %err);
                }
            });
        }
    }

    /// Removes a subscriber; a clean removal sends the unload packet.
    pub fn unsubscribe(&self, id: ColumnId, client_id: ConnectionId, force: bool) {
        let column = self.columns.read().get(&id).cloned();
        if let Some(column) = column {
            let mut data = column.lock();
            column.unsubscribe(&mut data, client_id, force);
        }
    }

    fn generator_for(&self, dimension: i8) -> Result<Arc<dyn WorldGenerator>, WorldError> {
        let generators = self.generators.read();
        generators
            .get(&(dimension, self.world_type.clone()))
            .or_else(|| generators.get(&(dimension, "default".to_owned())))
            .cloned()
            .ok_or_else(|| WorldError::GeneratorMissing {
                dimension,
                world_type: self.world_type.clone(),
            })
    }

    /// Drives a column to at least `required`. At most one driver works a
    /// column at a time; concurrent callers wait on the condvar and recheck.
    fn drive(&self, column: &Arc<ColumnContainer>, required: ColumnState) -> Result<(), WorldError> {
        let mut data = column.lock();

        while data.state < required {
            if data.driving {
                column.wait_advance(&mut data);
                continue;
            }

            data.driving = true;
            if data.target < required {
                data.target = required;
            }

            let result = if data.state < ColumnState::Generated {
                self.step_generate(column, &mut data)
            } else {
                self.step_populate(column, &mut data)
            };

            data.driving = false;
            if result.is_err() {
                column.notify_waiters();
                return result;
            }
        }

        Ok(())
    }

    /// Loading → Generated (or Populated when the stored column already
    /// was). Backing-store I/O and generation run with the lock released;
    /// the `driving` flag keeps the machine exclusive.
    fn step_generate(
        &self,
        column: &Arc<ColumnContainer>,
        data: &mut MutexGuard<'_, ColumnData>,
    ) -> Result<(), WorldError> {
        let id = column.id();
        column.advance(data, ColumnState::Generating, false, &self.pool);

        let outcome = MutexGuard::unlocked(data, || {
            match self.data.load_column(id.dimension, id.x, id.z) {
                Ok(Some(bytes)) => Ok(LoadOutcome::Stored(bytes)),
                Ok(None) => {
                    let generator = self.generator_for(id.dimension)?;
                    let mut blocks = vec![0u32; COLUMN_BLOCKS];
                    let mut biomes = [0u8; BIOME_BYTES];
                    generator.generate(id, &mut blocks, &mut biomes);
                    Ok(LoadOutcome::Generated(blocks, biomes))
                }
                Err(err) => Err(WorldError::Storage(err)),
            }
        })?;

        match outcome {
            LoadOutcome::Stored(bytes) => {
                column.install_storage(data, &bytes)?;
                let reached = if data.populated {
                    ColumnState::Populated
                } else {
                    ColumnState::Generated
                };
                // Loaded from the store: nothing new to save.
                column.advance(data, reached, false, &self.pool);
                logging::debug!(self.log, "column loaded from store";
                                "column" => %id, "state" => ?reached);
            }
            LoadOutcome::Generated(blocks, biomes) => {
                data.blocks = blocks;
                data.biomes = biomes;
                column.advance(data, ColumnState::Generated, true, &self.pool);
                logging::debug!(self.log, "column generated"; "column" => %id);
            }
        }
        Ok(())
    }

    /// Generated → Populated: the ordered populator chain runs under the
    /// column lock, then the transition emits to subscribers.
    fn step_populate(
        &self,
        column: &Arc<ColumnContainer>,
        data: &mut MutexGuard<'_, ColumnData>,
    ) -> Result<(), WorldError> {
        let id = column.id();
        column.advance(data, ColumnState::Populating, false, &self.pool);

        let populators: Vec<Arc<dyn Populator>> = self
            .populators
            .read()
            .iter()
            .map(|(_, populator)| populator.clone())
            .collect();

        let inner: &mut ColumnData = &mut *data;
        for populator in &populators {
            populator.populate(id, &mut inner.blocks, &inner.biomes);
        }

        column.advance(data, ColumnState::Populated, true, &self.pool);
        logging::debug!(self.log, "column populated";
                        "column" => %id, "populators" => populators.len());
        Ok(())
    }

    pub(crate) fn data_provider(&self) -> &Arc<dyn DataProvider> {
        &self.data
    }

    pub(crate) fn columns_snapshot(&self) -> Vec<Arc<ColumnContainer>> {
        self.columns.read().values().cloned().collect()
    }

    pub(crate) fn evict_if_idle(&self, column: &Arc<ColumnContainer>) -> bool {
        let id = column.id();
        let mut columns = self.columns.write();

        if let Some(live) = columns.get(&id) {
            if Arc::ptr_eq(live, column) {
                let data = column.lock();
                if !data.driving && column.can_unload(&data) {
                    drop(data);
                    columns.remove(&id);
                    return true;
                }
            }
        }
        false
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }
}

fn block_change_packet(id: BlockId, to: Block) -> Packet {
    Packet::new(
        ProtocolState::Authenticated,
        Direction::Clientbound,
        ids::play::BLOCK_CHANGE,
        vec![
            FieldValue::I32(id.x),
            FieldValue::U8(id.y),
            FieldValue::I32(id.z),
            FieldValue::VarInt(u32::from(to.id())),
            FieldValue::U8(to.metadata()),
        ],
    )
}

/// Coalesced delta: one four-byte record per block — packed local x/z, y,
/// then twelve bits of type and the metadata nibble.
fn multi_block_change_packet(column: ColumnId, changes: &[(BlockId, Block)]) -> Packet {
    let mut records = Vec::with_capacity(changes.len() * 4);
    for &(id, to) in changes {
        let local = ((id.x.rem_euclid(16) as u8) << 4) | id.z.rem_euclid(16) as u8;
        records.push(local);
        records.push(id.y);
        let type_meta = (to.id() << 4) | u16::from(to.metadata());
        records.extend_from_slice(&type_meta.to_be_bytes());
    }

    Packet::new(
        ProtocolState::Authenticated,
        Direction::Clientbound,
        ids::play::MULTI_BLOCK_CHANGE,
        vec![
            FieldValue::I32(column.x),
            FieldValue::I32(column.z),
            FieldValue::I16(changes.len() as i16),
            FieldValue::Bytes(records),
        ],
    )
}
