//! Generator and populator seams. A generator produces the initial terrain
//! of a column for a `(dimension, world type)` pair; populators are the
//! ordered decoration passes that run before a column counts as populated.
//! The noise-driven terrain math lives outside the core; the layered flat
//! generator below is the stock fallback.

use super::block::{Block, BlockId, ColumnId};
use super::column::{dimension_has_sky, BIOME_BYTES, COLUMN_BLOCKS};

/// Produces the initial terrain of one column.
pub trait WorldGenerator: Send + Sync {
    fn generate(&self, id: ColumnId, blocks: &mut [u32], biomes: &mut [u8; BIOME_BYTES]);
}

/// A deterministic post-generation decoration pass.
pub trait Populator: Send + Sync {
    fn populate(&self, id: ColumnId, blocks: &mut [u32], biomes: &[u8; BIOME_BYTES]);
}

pub mod block_ids {
    pub const AIR: u16 = 0;
    pub const STONE: u16 = 1;
    pub const GRASS: u16 = 2;
    pub const DIRT: u16 = 3;
    pub const BEDROCK: u16 = 7;
}

/// Flat layered terrain: bedrock floor, stone body, a band of dirt and air
/// above, full skylight over the surface in sky dimensions.
pub struct FlatGenerator {
    pub surface: u8,
    pub biome: u8,
}

impl FlatGenerator {
    pub fn new() -> FlatGenerator {
        FlatGenerator {
            surface: 63,
            biome: 1,
        }
    }
}

impl WorldGenerator for FlatGenerator {
    fn generate(&self, id: ColumnId, blocks: &mut [u32], biomes: &mut [u8; BIOME_BYTES]) {
        debug_assert_eq!(blocks.len(), COLUMN_BLOCKS);

        let has_sky = dimension_has_sky(id.dimension);
        let surface = self.surface as usize;

        for y in 0..256usize {
            let block = if y == 0 {
                Block::new(block_ids::BEDROCK, 0)
            } else if y < surface.saturating_sub(3) {
                Block::new(block_ids::STONE, 0)
            } else if y <= surface {
                Block::new(block_ids::DIRT, 0)
            } else if has_sky {
                Block::AIR.with_skylight(15)
            } else {
                Block::AIR
            };

            let cell = block.cell();
            let base = y * 256;
            for column_cell in &mut blocks[base..base + 256] {
                *column_cell = cell;
            }
        }

        *biomes = [self.biome; BIOME_BYTES];
    }
}

/// Turns the exposed dirt layer into grass. Runs after terrain generation,
/// before the column is served.
pub struct SurfacePopulator;

impl Populator for SurfacePopulator {
    fn populate(&self, id: ColumnId, blocks: &mut [u32], _biomes: &[u8; BIOME_BYTES]) {
        for local_z in 0..16i32 {
            for local_x in 0..16i32 {
                // Walk down from the sky to the first solid block.
                for y in (0..=255u8).rev() {
                    let offset = BlockId::new(
                        id.x * 16 + local_x,
                        y,
                        id.z * 16 + local_z,
                        id.dimension,
                    )
                    .offset();

                    let block = Block::from_cell(blocks[offset]);
                    if block.id() == block_ids::AIR {
                        continue;
                    }
                    if block.id() == block_ids::DIRT {
                        blocks[offset] = Block::new(block_ids::GRASS, 0)
                            .with_light(block.light())
                            .with_skylight(block.skylight())
                            .cell();
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(id: ColumnId) -> (Vec<u32>, [u8; BIOME_BYTES]) {
        let mut blocks = vec![0u32; COLUMN_BLOCKS];
        let mut biomes = [0u8; BIOME_BYTES];
        FlatGenerator::new().generate(id, &mut blocks, &mut biomes);
        (blocks, biomes)
    }

    #[test]
    fn test_flat_layers() {
        let (blocks, biomes) = generate(ColumnId::new(0, 0, 0));

        let at = |x: i32, y: u8, z: i32| {
            Block::from_cell(blocks[BlockId::new(x, y, z, 0).offset()])
        };

        assert_eq!(at(0, 0, 0).id(), block_ids::BEDROCK);
        assert_eq!(at(5, 30, 5).id(), block_ids::STONE);
        assert_eq!(at(5, 63, 5).id(), block_ids::DIRT);
        assert_eq!(at(5, 64, 5).id(), block_ids::AIR);
        assert_eq!(at(5, 64, 5).skylight(), 15);
        assert_eq!(biomes, [1; BIOME_BYTES]);
    }

    #[test]
    fn test_no_skylight_without_sky() {
        let (blocks, _) = generate(ColumnId::new(0, 0, -1));
        let above = Block::from_cell(blocks[BlockId::new(0, 200, 0, -1).offset()]);
        assert_eq!(above.id(), block_ids::AIR);
        assert_eq!(above.skylight(), 0);
    }

    #[test]
    fn test_surface_populator_grasses_topsoil() {
        let id = ColumnId::new(2, -3, 0);
        let (mut blocks, biomes) = generate(id);

        SurfacePopulator.populate(id, &mut blocks, &biomes);

        let surface = Block::from_cell(blocks[BlockId::new(32, 63, -48, 0).offset()]);
        assert_eq!(surface.id(), block_ids::GRASS);

        // Buried dirt stays dirt.
        let buried = Block::from_cell(blocks[BlockId::new(32, 62, -48, 0).offset()]);
        assert_eq!(buried.id(), block_ids::DIRT);
    }

    #[test]
    fn test_generation_is_deterministic() {
        let id = ColumnId::new(-7, 11, 0);
        let (first, _) = generate(id);
        let (second, _) = generate(id);
        assert_eq!(first, second);
    }
}
