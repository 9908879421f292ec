// ============================================================================
// TileFE — tiled, swappable pixel storage
// ============================================================================
//
// Pixel surfaces are split into fixed 64x64 tiles addressed through a
// TileManager. Tile buffers live in a shared TileStore: an arena of tile
// records, an LRU cache with a byte budget, and an on-disk swap file that
// absorbs evicted tiles. Tiles are copy-on-write — mapping a tile into a
// second manager shares one buffer until somebody writes.
//
// Typical flow:
//
//   let mut store = TileStore::with_swap_dir(8 << 20, std::env::temp_dir());
//   let mut mgr = TileManager::new(&mut store, 1920, 1080, 4);
//   let mut region = PixelRegion::new(&mut mgr, 0, 0, 1920, 1080, true);
//   while let Some(mut chunk) = region.next_chunk(&mut store)? {
//       // chunk.row_mut(r) is a direct slice into the tile buffer
//   }

#![allow(clippy::too_many_arguments)]

pub mod cli;
pub mod error;
pub mod io;
pub mod logger;
pub mod pixel_region;
pub mod tile;
pub mod tile_cache;
pub mod tile_manager;
pub mod tile_store;
pub mod tile_swap;

pub use error::TileError;
pub use io::{manager_from_raw, manager_from_rgba, manager_to_raw, manager_to_rgba};
pub use pixel_region::{Chunk, ChunkPair, PixelRegion, PixelRegionPair};
pub use tile::{ManagerId, RowHint, TILE_HEIGHT, TILE_WIDTH, TileId};
pub use tile_cache::CacheStats;
pub use tile_manager::{SurfaceFiller, TileManager};
pub use tile_store::{DEFAULT_CACHE_BYTES, TileGuard, TileStore};
