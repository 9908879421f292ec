// ============================================================================
// Pixel regions — scanline-chunk iteration over the tile grid
// ============================================================================
//
// A PixelRegion walks an arbitrary rectangle of one manager in row-major
// tile order, handing out chunks that each lie inside a single tile (so
// their rows are contiguous with a fixed stride). The tile behind the
// current chunk is locked — pinned against eviction — until the next
// `next_chunk` call advances past it, so a long-running pass never pins more
// than one tile at a time.
//
// This is the abstraction pixel-processing algorithms are written against;
// nothing downstream needs to know the tile grid exists. Callers must not
// retain a chunk's slice past the next `next_chunk` call (the borrow checker
// enforces this), and a partially-iterated region must be closed with
// `stop` so the last tile's lock is dropped.

use crate::error::TileError;
use crate::tile::{TileId, TILE_HEIGHT, TILE_WIDTH};
use crate::tile_manager::TileManager;
use crate::tile_store::TileStore;

/// One scanline-contiguous piece of a region, confined to a single tile.
pub struct Chunk<'a> {
    /// Surface coordinates of the chunk's top-left pixel.
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    rowstride: usize,
    bpp: u32,
    writable: bool,
    data: &'a mut [u8],
}

impl Chunk<'_> {
    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    /// Byte stride between consecutive rows of this chunk inside its tile.
    pub fn rowstride(&self) -> usize {
        self.rowstride
    }

    /// Pixel bytes of row `row` (0-based within the chunk).
    pub fn row(&self, row: u32) -> &[u8] {
        let start = row as usize * self.rowstride;
        &self.data[start..start + (self.width * self.bpp) as usize]
    }

    /// Mutable pixel bytes of row `row`. Only valid on a dirty region.
    pub fn row_mut(&mut self, row: u32) -> &mut [u8] {
        debug_assert!(self.writable, "row_mut on a read-only pixel region");
        let start = row as usize * self.rowstride;
        &mut self.data[start..start + (self.width * self.bpp) as usize]
    }

    /// The chunk's whole backing slice (first row at the start, rows
    /// `rowstride` apart).
    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.writable, "data_mut on a read-only pixel region");
        self.data
    }
}

pub struct PixelRegion<'m> {
    mgr: &'m mut TileManager,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    dirty: bool,
    cur_x: u32,
    cur_y: u32,
    current: Option<TileId>,
    done: bool,
}

impl<'m> PixelRegion<'m> {
    /// Establish the rectangle; no tile is touched until iteration starts.
    /// The rectangle is clamped to the manager's bounds. `dirty` regions
    /// write-lock each tile (and so trigger copy-on-write on shared tiles).
    pub fn new(mgr: &'m mut TileManager, x: u32, y: u32, w: u32, h: u32, dirty: bool) -> Self {
        let x = x.min(mgr.width());
        let y = y.min(mgr.height());
        let w = w.min(mgr.width() - x);
        let h = h.min(mgr.height() - y);
        PixelRegion {
            mgr,
            x,
            y,
            w,
            h,
            dirty,
            cur_x: x,
            cur_y: y,
            current: None,
            done: w == 0 || h == 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.w
    }

    pub fn height(&self) -> u32 {
        self.h
    }

    /// Advance to the next chunk, releasing the previous chunk's tile lock.
    /// Returns `None` when the rectangle is exhausted (the final lock has
    /// been released).
    pub fn next_chunk<'s>(
        &mut self,
        store: &'s mut TileStore,
    ) -> Result<Option<Chunk<'s>>, TileError> {
        if let Some(id) = self.current.take() {
            store.release(id, self.dirty);
        }
        if self.done {
            return Ok(None);
        }

        let cx = self.cur_x;
        let cy = self.cur_y;
        let chunk_w = (TILE_WIDTH - cx % TILE_WIDTH).min(self.x + self.w - cx);
        let chunk_h = (TILE_HEIGHT - cy % TILE_HEIGHT).min(self.y + self.h - cy);

        let tile_num = self
            .mgr
            .tile_num_at(cx, cy)
            .expect("region rectangle is clamped to the surface");
        let Some(id) = self.mgr.acquire(store, tile_num, true, self.dirty)? else {
            // Unreachable for a clamped rectangle; bail out cleanly anyway.
            self.done = true;
            return Ok(None);
        };
        self.current = Some(id);

        // Row-major advance: across the tile row first, then down.
        if cx + chunk_w >= self.x + self.w {
            self.cur_x = self.x;
            self.cur_y = cy + chunk_h;
            if self.cur_y >= self.y + self.h {
                self.done = true;
            }
        } else {
            self.cur_x = cx + chunk_w;
        }

        let tile = store.arena_mut().get_mut(id);
        let bpp = tile.bpp();
        let rowstride = tile.rowstride();
        let sub_x = (cx % TILE_WIDTH) as usize;
        let sub_y = (cy % TILE_HEIGHT) as usize;
        let start = sub_y * rowstride + sub_x * bpp as usize;
        let len = (chunk_h as usize - 1) * rowstride + (chunk_w * bpp) as usize;
        let data = &mut tile.data_mut().expect("locked tile is resident")[start..start + len];

        Ok(Some(Chunk {
            x: cx,
            y: cy,
            width: chunk_w,
            height: chunk_h,
            rowstride,
            bpp,
            writable: self.dirty,
            data,
        }))
    }

    /// Abandon the iteration early, releasing the current tile lock.
    pub fn stop(&mut self, store: &mut TileStore) {
        if let Some(id) = self.current.take() {
            store.release(id, self.dirty);
        }
        self.done = true;
    }
}

// ============================================================================
// Paired iteration — source and destination regions in lockstep
// ============================================================================

/// One lockstep piece of a source/destination pair. The two rectangles may
/// fall differently on their tile grids, so chunks are split at the finer
/// of the two grids' boundaries; `width`/`height` are valid in both tiles
/// simultaneously.
pub struct ChunkPair<'a> {
    pub src_x: u32,
    pub src_y: u32,
    pub dst_x: u32,
    pub dst_y: u32,
    pub width: u32,
    pub height: u32,
    src_rowstride: usize,
    dst_rowstride: usize,
    bpp: u32,
    src_data: &'a [u8],
    dst_data: &'a mut [u8],
}

impl ChunkPair<'_> {
    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    pub fn src_row(&self, row: u32) -> &[u8] {
        let start = row as usize * self.src_rowstride;
        &self.src_data[start..start + (self.width * self.bpp) as usize]
    }

    pub fn dst_row_mut(&mut self, row: u32) -> &mut [u8] {
        let start = row as usize * self.dst_rowstride;
        &mut self.dst_data[start..start + (self.width * self.bpp) as usize]
    }
}

/// Walks equal-sized rectangles of two managers in lockstep. The
/// destination side is always opened read+write (this is the shadow-buffer
/// pattern: read source, composite into destination), which also guarantees
/// the two sides never alias — a destination tile shared with the source is
/// copied on first write.
pub struct PixelRegionPair<'s, 'd> {
    src_mgr: &'s mut TileManager,
    dst_mgr: &'d mut TileManager,
    src_x: u32,
    src_y: u32,
    dst_x: u32,
    dst_y: u32,
    w: u32,
    h: u32,
    off_x: u32,
    off_y: u32,
    current: Option<(TileId, TileId)>,
    done: bool,
}

impl<'s, 'd> PixelRegionPair<'s, 'd> {
    pub fn new(
        src_mgr: &'s mut TileManager,
        src_x: u32,
        src_y: u32,
        dst_mgr: &'d mut TileManager,
        dst_x: u32,
        dst_y: u32,
        w: u32,
        h: u32,
    ) -> Self {
        debug_assert_eq!(src_mgr.bpp(), dst_mgr.bpp(), "paired regions must agree on bpp");
        let src_x = src_x.min(src_mgr.width());
        let src_y = src_y.min(src_mgr.height());
        let dst_x = dst_x.min(dst_mgr.width());
        let dst_y = dst_y.min(dst_mgr.height());
        let w = w
            .min(src_mgr.width() - src_x)
            .min(dst_mgr.width() - dst_x);
        let h = h
            .min(src_mgr.height() - src_y)
            .min(dst_mgr.height() - dst_y);
        PixelRegionPair {
            src_mgr,
            dst_mgr,
            src_x,
            src_y,
            dst_x,
            dst_y,
            w,
            h,
            off_x: 0,
            off_y: 0,
            current: None,
            done: w == 0 || h == 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.w
    }

    pub fn height(&self) -> u32 {
        self.h
    }

    pub fn next_chunk<'t>(
        &mut self,
        store: &'t mut TileStore,
    ) -> Result<Option<ChunkPair<'t>>, TileError> {
        if let Some((sid, did)) = self.current.take() {
            store.release(sid, false);
            store.release(did, true);
        }
        if self.done {
            return Ok(None);
        }

        let sx = self.src_x + self.off_x;
        let sy = self.src_y + self.off_y;
        let dx = self.dst_x + self.off_x;
        let dy = self.dst_y + self.off_y;

        // Split at whichever grid boundary comes first.
        let chunk_w = (TILE_WIDTH - sx % TILE_WIDTH)
            .min(TILE_WIDTH - dx % TILE_WIDTH)
            .min(self.w - self.off_x);
        let chunk_h = (TILE_HEIGHT - sy % TILE_HEIGHT)
            .min(TILE_HEIGHT - dy % TILE_HEIGHT)
            .min(self.h - self.off_y);

        let src_num = self
            .src_mgr
            .tile_num_at(sx, sy)
            .expect("pair rectangle is clamped to both surfaces");
        let dst_num = self
            .dst_mgr
            .tile_num_at(dx, dy)
            .expect("pair rectangle is clamped to both surfaces");

        // Source first: its read lock pins it while the destination side
        // faults in (and possibly copies-on-write).
        let Some(sid) = self.src_mgr.acquire(store, src_num, true, false)? else {
            self.done = true;
            return Ok(None);
        };
        let did = match self.dst_mgr.acquire(store, dst_num, true, true) {
            Ok(Some(id)) => id,
            Ok(None) => {
                store.release(sid, false);
                self.done = true;
                return Ok(None);
            }
            Err(e) => {
                store.release(sid, false);
                return Err(e);
            }
        };
        self.current = Some((sid, did));

        if self.off_x + chunk_w >= self.w {
            self.off_x = 0;
            self.off_y += chunk_h;
            if self.off_y >= self.h {
                self.done = true;
            }
        } else {
            self.off_x += chunk_w;
        }

        // Two distinct tiles: the write lock on the destination copied any
        // tile the source side could still be attached to.
        let (src_tile, dst_tile) = store.arena_mut().get2_mut(sid, did);
        let bpp = src_tile.bpp();
        let src_rowstride = src_tile.rowstride();
        let dst_rowstride = dst_tile.rowstride();

        let s_start =
            (sy % TILE_HEIGHT) as usize * src_rowstride + ((sx % TILE_WIDTH) * bpp) as usize;
        let s_len = (chunk_h as usize - 1) * src_rowstride + (chunk_w * bpp) as usize;
        let d_start =
            (dy % TILE_HEIGHT) as usize * dst_rowstride + ((dx % TILE_WIDTH) * bpp) as usize;
        let d_len = (chunk_h as usize - 1) * dst_rowstride + (chunk_w * bpp) as usize;

        let src_data =
            &src_tile.data().expect("locked tile is resident")[s_start..s_start + s_len];
        let dst_data =
            &mut dst_tile.data_mut().expect("locked tile is resident")[d_start..d_start + d_len];

        Ok(Some(ChunkPair {
            src_x: sx,
            src_y: sy,
            dst_x: dx,
            dst_y: dy,
            width: chunk_w,
            height: chunk_h,
            src_rowstride,
            dst_rowstride,
            bpp,
            src_data,
            dst_data,
        }))
    }

    /// Abandon the iteration early, releasing both current tile locks.
    pub fn stop(&mut self, store: &mut TileStore) {
        if let Some((sid, did)) = self.current.take() {
            store.release(sid, false);
            store.release(did, true);
        }
        self.done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile_store::TileStore;

    fn store() -> TileStore {
        TileStore::with_swap_dir(1 << 22, std::env::temp_dir())
    }

    #[test]
    fn test_chunks_tile_the_region_exactly() {
        // Region deliberately misaligned to the 64-pixel grid on all sides.
        let mut store = store();
        let mut tm = TileManager::new(&mut store, 200, 150, 1);
        let (rx, ry, rw, rh) = (5u32, 7u32, 130u32, 70u32);

        let mut covered = vec![0u32; (rw * rh) as usize];
        let mut region = PixelRegion::new(&mut tm, rx, ry, rw, rh, false);
        let mut last_pos = None;
        while let Some(chunk) = region.next_chunk(&mut store).unwrap() {
            // Row-major order.
            let pos = (chunk.y, chunk.x);
            if let Some(prev) = last_pos {
                assert!(pos > prev, "chunks out of row-major order");
            }
            last_pos = Some(pos);

            assert!(chunk.width > 0 && chunk.height > 0);
            for row in 0..chunk.height {
                assert_eq!(chunk.row(row).len(), chunk.width as usize);
                for col in 0..chunk.width {
                    let lx = chunk.x + col - rx;
                    let ly = chunk.y + row - ry;
                    covered[(ly * rw + lx) as usize] += 1;
                }
            }
        }
        assert!(
            covered.iter().all(|&c| c == 1),
            "coverage must be exact: no gaps, no overlap"
        );
        tm.destroy(&mut store);
    }

    #[test]
    fn test_no_tile_stays_locked_after_iteration() {
        let mut store = store();
        let mut tm = TileManager::new(&mut store, 100, 100, 1);
        let mut region = PixelRegion::new(&mut tm, 0, 0, 100, 100, true);
        while let Some(_chunk) = region.next_chunk(&mut store).unwrap() {}
        for num in 0..tm.ntiles() {
            let id = tm.tile_at(&mut store, num).unwrap();
            assert_eq!(store.arena().get(id).lock_count(), 0);
        }
        tm.destroy(&mut store);
    }

    #[test]
    fn test_stop_releases_current_lock() {
        let mut store = store();
        let mut tm = TileManager::new(&mut store, 100, 100, 1);
        let mut region = PixelRegion::new(&mut tm, 0, 0, 100, 100, false);
        let chunk = region.next_chunk(&mut store).unwrap().unwrap();
        drop(chunk);
        region.stop(&mut store);
        for num in 0..tm.ntiles() {
            let id = tm.tile_at(&mut store, num).unwrap();
            assert_eq!(store.arena().get(id).lock_count(), 0);
        }
        tm.destroy(&mut store);
    }

    #[test]
    fn test_write_pass_then_read_pass_round_trip() {
        // The end-to-end scenario: 100×80 surface at bpp 3 → a 2×2 grid
        // (64×64, 36×64, 64×16, 36×16). Fill each tile with a distinct
        // byte, evict everything, read it all back.
        let mut store = TileStore::with_swap_dir(64 * 1024, std::env::temp_dir());
        let mut tm = TileManager::new(&mut store, 100, 80, 3);
        assert_eq!((tm.ntile_cols(), tm.ntile_rows()), (2, 2));

        let tile_byte = |x: u32, y: u32| (1 + (y / 64) * 2 + x / 64) as u8;

        let mut region = PixelRegion::new(&mut tm, 0, 0, 100, 80, true);
        while let Some(mut chunk) = region.next_chunk(&mut store).unwrap() {
            let v = tile_byte(chunk.x, chunk.y);
            for row in 0..chunk.height {
                chunk.row_mut(row).fill(v);
            }
        }

        store.flush_all().unwrap();
        assert_eq!(store.resident_bytes(), 0);
        assert_eq!(store.swapped_tile_count(), 4);

        let mut region = PixelRegion::new(&mut tm, 0, 0, 100, 80, false);
        while let Some(chunk) = region.next_chunk(&mut store).unwrap() {
            let v = tile_byte(chunk.x, chunk.y);
            for row in 0..chunk.height {
                assert!(chunk.row(row).iter().all(|&b| b == v));
            }
        }
        tm.destroy(&mut store);
    }

    #[test]
    fn test_pair_iteration_copies_between_offset_grids() {
        // Source and destination rectangles are offset differently from the
        // tile grid, so pair chunks split at the finer boundary of the two.
        let mut store = store();
        let mut src = TileManager::new(&mut store, 200, 120, 1);
        let mut dst = TileManager::new(&mut store, 200, 120, 1);

        // Deterministic pattern in the source rectangle.
        let (w, h) = (100u32, 60u32);
        let pattern: Vec<u8> = (0..w * h).map(|i| (i * 13 % 251) as u8).collect();
        src.write_pixel_data(&mut store, 30, 20, w, h, &pattern, w as usize)
            .unwrap();

        let mut pair = PixelRegionPair::new(&mut src, 30, 20, &mut dst, 57, 11, w, h);
        while let Some(mut chunk) = pair.next_chunk(&mut store).unwrap() {
            // Chunk must respect both grids.
            assert!(chunk.src_x % TILE_WIDTH + chunk.width <= TILE_WIDTH);
            assert!(chunk.dst_x % TILE_WIDTH + chunk.width <= TILE_WIDTH);
            for row in 0..chunk.height {
                let src_row = chunk.src_row(row).to_vec();
                chunk.dst_row_mut(row).copy_from_slice(&src_row);
            }
        }

        let mut back = vec![0u8; pattern.len()];
        dst.read_pixel_data(&mut store, 57, 11, w, h, &mut back, w as usize)
            .unwrap();
        assert_eq!(back, pattern);
        src.destroy(&mut store);
        dst.destroy(&mut store);
    }

    #[test]
    fn test_pair_with_shared_tiles_copies_on_write() {
        // Destination maps the source's tiles; the pair's write locks must
        // split them rather than writing through the share.
        let mut store = store();
        let mut src = TileManager::new(&mut store, 64, 64, 1);
        let mut dst = TileManager::new(&mut store, 64, 64, 1);

        src.write_tile_data(&mut store, 0, &vec![3u8; 64 * 64]).unwrap();
        let shared = src.tile_at(&mut store, 0).unwrap();
        dst.map(&mut store, 0, shared);
        assert_eq!(store.arena().get(shared).share_count(), 2);

        let mut pair = PixelRegionPair::new(&mut src, 0, 0, &mut dst, 0, 0, 64, 64);
        while let Some(mut chunk) = pair.next_chunk(&mut store).unwrap() {
            for row in 0..chunk.height {
                let doubled: Vec<u8> = chunk.src_row(row).iter().map(|&b| b * 2).collect();
                chunk.dst_row_mut(row).copy_from_slice(&doubled);
            }
        }

        assert_eq!(store.arena().get(shared).share_count(), 1);
        let g = src.get(&mut store, 0, true, false).unwrap().unwrap();
        assert!(g.data().iter().all(|&b| b == 3));
        drop(g);
        let g = dst.get(&mut store, 0, true, false).unwrap().unwrap();
        assert!(g.data().iter().all(|&b| b == 6));
        drop(g);
        src.destroy(&mut store);
        dst.destroy(&mut store);
    }

    #[test]
    fn test_iteration_under_tight_cache_budget() {
        // Budget fits a single tile; iteration still works because only the
        // current chunk's tile is pinned.
        let tile_bytes = (TILE_WIDTH * TILE_HEIGHT) as usize;
        let mut store = TileStore::with_swap_dir(tile_bytes, std::env::temp_dir());
        let mut tm = TileManager::new(&mut store, 256, 256, 1);

        let mut region = PixelRegion::new(&mut tm, 0, 0, 256, 256, true);
        while let Some(mut chunk) = region.next_chunk(&mut store).unwrap() {
            let v = (chunk.x / 64 + chunk.y) as u8;
            chunk.data_mut().fill(v);
        }
        assert!(store.cache_stats().evictions > 0);

        let mut region = PixelRegion::new(&mut tm, 0, 0, 256, 256, false);
        while let Some(chunk) = region.next_chunk(&mut store).unwrap() {
            let v = (chunk.x / 64 + chunk.y) as u8;
            assert!(chunk.data().iter().all(|&b| b == v));
        }
        tm.destroy(&mut store);
    }
}
