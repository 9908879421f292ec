// ============================================================================
// TileManager — a 2-D tile grid covering one raster surface
// ============================================================================
//
// One manager per drawable surface (a layer's pixels, a channel, an undo
// snapshot, a shadow buffer). The grid is sized at construction and
// materialised lazily on first access; edge tiles carry their effective
// width/height so the grid covers the declared dimensions exactly.
//
// Sharing: `map` points a slot of this manager at a tile another manager
// already owns, bumping its share count. The first write access through
// either side copies the tile (`get` with `wantwrite`), so a writer never
// observes or corrupts the other owner's view. `invalidate` on a shared
// slot follows the same detach/attach dance but installs a fresh invalid
// tile instead of a copy.
//
// Surfaces whose content is computed on demand (projections, previews)
// construct the manager with a `SurfaceFiller`; it runs the first time an
// invalid tile is read.

use crate::error::TileError;
use crate::pixel_region::PixelRegion;
use crate::tile::{ManagerId, Tile, TileId, TILE_HEIGHT, TILE_WIDTH};
use crate::tile_store::{TileGuard, TileStore};

/// Lazily populates the pixel content of an invalid tile on first read.
///
/// `x`/`y` are the pixel coordinates of the tile's top-left corner within
/// the surface; `data` arrives zeroed, `ewidth × eheight × bpp` bytes with a
/// row stride of `ewidth * bpp`.
pub trait SurfaceFiller {
    fn fill(&self, x: u32, y: u32, ewidth: u32, eheight: u32, bpp: u32, data: &mut [u8]);
}

pub struct TileManager {
    id: ManagerId,
    width: u32,
    height: u32,
    bpp: u32,
    ntile_rows: u32,
    ntile_cols: u32,
    /// Empty until the first `get`/`map`; once materialised, every slot
    /// holds a live tile handle until `destroy`.
    tiles: Vec<TileId>,
    filler: Option<Box<dyn SurfaceFiller>>,
}

impl TileManager {
    /// A manager whose grid covers `width × height` pixels at `bpp` bytes
    /// per pixel. Degenerate dimensions are clamped to 1×1 (with a logged
    /// warning) rather than producing an empty grid.
    pub fn new(store: &mut TileStore, width: u32, height: u32, bpp: u32) -> Self {
        let (width, height) = if width == 0 || height == 0 {
            crate::log_warn!(
                "TileManager::new: degenerate dimensions {}x{}, clamped to 1x1",
                width,
                height
            );
            (width.max(1), height.max(1))
        } else {
            (width, height)
        };
        TileManager {
            id: store.alloc_manager_id(),
            width,
            height,
            bpp,
            ntile_rows: height.div_ceil(TILE_HEIGHT),
            ntile_cols: width.div_ceil(TILE_WIDTH),
            tiles: Vec::new(),
            filler: None,
        }
    }

    /// A manager whose invalid tiles are populated on demand by `filler`.
    pub fn with_filler(
        store: &mut TileStore,
        width: u32,
        height: u32,
        bpp: u32,
        filler: Box<dyn SurfaceFiller>,
    ) -> Self {
        let mut tm = Self::new(store, width, height, bpp);
        tm.filler = Some(filler);
        tm
    }

    // ---- geometry -----------------------------------------------------------

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    pub fn ntile_rows(&self) -> u32 {
        self.ntile_rows
    }

    pub fn ntile_cols(&self) -> u32 {
        self.ntile_cols
    }

    pub fn ntiles(&self) -> usize {
        (self.ntile_rows * self.ntile_cols) as usize
    }

    pub fn manager_id(&self) -> ManagerId {
        self.id
    }

    pub fn has_filler(&self) -> bool {
        self.filler.is_some()
    }

    /// Grid index of the tile containing pixel (x, y), or `None` when the
    /// pixel lies outside the surface.
    pub fn tile_num_at(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let row = y / TILE_HEIGHT;
        let col = x / TILE_WIDTH;
        Some((row * self.ntile_cols + col) as usize)
    }

    // ---- access -------------------------------------------------------------

    /// The tile at `tile_num`, locked per the access flags. `None` for an
    /// out-of-range index (caller contract violation).
    ///
    /// With `wantwrite`, a tile shared with another manager is first copied
    /// so this manager gets a private, single-owner tile (copy-on-write).
    /// `wantwrite` without `wantread` is the narrow full-overwrite path: the
    /// tile comes back zeroed and invalid, and the caller must write every
    /// pixel before the lock is released.
    pub fn get<'a>(
        &mut self,
        store: &'a mut TileStore,
        tile_num: usize,
        wantread: bool,
        wantwrite: bool,
    ) -> Result<Option<TileGuard<'a>>, TileError> {
        if !wantread && !wantwrite {
            crate::log_warn!("TileManager::get: access with neither read nor write");
            return Ok(None);
        }
        if wantwrite && !wantread {
            crate::log_warn!(
                "TileManager::get: write-only tile access; caller must overwrite the whole tile"
            );
        }
        match self.acquire(store, tile_num, wantread, wantwrite)? {
            Some(id) => Ok(Some(TileGuard::new(store, id, wantwrite))),
            None => Ok(None),
        }
    }

    /// `get` addressed by pixel coordinates.
    pub fn get_at_pixel<'a>(
        &mut self,
        store: &'a mut TileStore,
        x: u32,
        y: u32,
        wantread: bool,
        wantwrite: bool,
    ) -> Result<Option<TileGuard<'a>>, TileError> {
        match self.tile_num_at(x, y) {
            Some(num) => self.get(store, num, wantread, wantwrite),
            None => Ok(None),
        }
    }

    /// Prefetch hint: fault the tile under (x, y) in from swap without
    /// locking it. Best effort — failures are logged and swallowed, and a
    /// tile that was never swapped out is left alone.
    pub fn get_async(&mut self, store: &mut TileStore, x: u32, y: u32) {
        let Some(num) = self.tile_num_at(x, y) else {
            return;
        };
        if self.tiles.is_empty() {
            return;
        }
        let id = self.tiles[num];
        let tile = store.arena().get(id);
        if tile.is_resident() || tile.swap_token().is_none() {
            return;
        }
        if let Err(e) = store.ensure_resident(id) {
            crate::log_err!("prefetch of tile {} failed: {}", num, e);
        }
    }

    /// Core access path shared by `get`, the pixel-region iterators, and the
    /// bulk data operations. Returns the (possibly copied) tile locked per
    /// the flags; the caller owns the matching `release`.
    pub(crate) fn acquire(
        &mut self,
        store: &mut TileStore,
        tile_num: usize,
        wantread: bool,
        wantwrite: bool,
    ) -> Result<Option<TileId>, TileError> {
        if tile_num >= self.ntiles() {
            return Ok(None);
        }
        self.materialize(store);

        let mut id = self.tiles[tile_num];
        if wantwrite && store.arena().get(id).share_count() > 1 {
            id = if wantread {
                self.copy_on_write(store, tile_num)?
            } else {
                // Full overwrite pending: the private replacement starts
                // invalid and empty, nothing is worth copying.
                self.replace_with_invalid(store, tile_num)
            };
        }

        store.ensure_resident(id)?;
        if wantread && !store.arena().get(id).is_valid() {
            self.validate_tile(store, id, tile_num);
        }
        store.lock(id, wantwrite);
        Ok(Some(id))
    }

    /// Handle of the tile at `tile_num`, materialising the grid if needed.
    /// This is how a tile travels to another manager's `map`.
    pub fn tile_at(&mut self, store: &mut TileStore, tile_num: usize) -> Option<TileId> {
        if tile_num >= self.ntiles() {
            return None;
        }
        self.materialize(store);
        Some(self.tiles[tile_num])
    }

    // ---- grid materialisation ----------------------------------------------

    fn materialize(&mut self, store: &mut TileStore) {
        if !self.tiles.is_empty() {
            return;
        }
        let right = self.width - (self.ntile_cols - 1) * TILE_WIDTH;
        let bottom = self.height - (self.ntile_rows - 1) * TILE_HEIGHT;

        self.tiles.reserve_exact(self.ntiles());
        for row in 0..self.ntile_rows {
            for col in 0..self.ntile_cols {
                let mut tile = Tile::new(self.bpp);
                let ewidth = if col == self.ntile_cols - 1 { right } else { TILE_WIDTH };
                let eheight = if row == self.ntile_rows - 1 { bottom } else { TILE_HEIGHT };
                tile.set_esize(ewidth, eheight);

                let num = (row * self.ntile_cols + col) as usize;
                let id = store.arena_mut().alloc(tile);
                store.attach_tile(id, self.id, num);
                self.tiles.push(id);
            }
        }
    }

    // ---- copy-on-write ------------------------------------------------------

    fn copy_on_write(&mut self, store: &mut TileStore, tile_num: usize) -> Result<TileId, TileError> {
        let old = self.tiles[tile_num];
        if !store.arena().get(old).is_valid() {
            // Readable-writable access to a tile that was never given
            // content; the copy will be validated below like any other read.
            crate::log_warn!("copy-on-write of an invalid shared tile (slot {})", tile_num);
        }
        let new = store.clone_tile(old)?;
        store.detach_tile(old, self.id, tile_num);
        store.attach_tile(new, self.id, tile_num);
        self.tiles[tile_num] = new;
        Ok(new)
    }

    fn replace_with_invalid(&mut self, store: &mut TileStore, tile_num: usize) -> TileId {
        let old = self.tiles[tile_num];
        let new = store.alloc_invalid_like(old);
        store.detach_tile(old, self.id, tile_num);
        store.attach_tile(new, self.id, tile_num);
        self.tiles[tile_num] = new;
        new
    }

    // ---- validation ---------------------------------------------------------

    /// Mark a resident tile valid, running the surface filler (if any) to
    /// populate its content. Without a filler the tile keeps its zeroed
    /// buffer — an uninitialised surface reads as transparent.
    fn validate_tile(&self, store: &mut TileStore, id: TileId, tile_num: usize) {
        let tile = store.arena_mut().get_mut(id);
        tile.set_valid(true);
        if let Some(filler) = &self.filler {
            let col = tile_num as u32 % self.ntile_cols;
            let row = tile_num as u32 / self.ntile_cols;
            let (ewidth, eheight) = (tile.ewidth(), tile.eheight());
            let data = tile.data_mut().expect("validated tile is resident");
            filler.fill(
                col * TILE_WIDTH,
                row * TILE_HEIGHT,
                ewidth,
                eheight,
                self.bpp,
                data,
            );
        }
    }

    // ---- invalidation -------------------------------------------------------

    /// Drop the cached content of the tile at `tile_num`: its next read
    /// access recomputes it (via the filler) or sees zeroes. A shared tile
    /// is replaced by a fresh invalid one first, so the other owner's view
    /// is untouched.
    pub fn invalidate(&mut self, store: &mut TileStore, tile_num: usize) {
        if tile_num >= self.ntiles() {
            crate::log_warn!("TileManager::invalidate: tile {} out of range", tile_num);
            return;
        }
        if self.tiles.is_empty() {
            return; // nothing materialised, nothing cached
        }
        let id = self.tiles[tile_num];
        let tile = store.arena().get(id);
        if !tile.is_valid() {
            return;
        }
        if tile.lock_count() > 0 {
            crate::log_warn!("TileManager::invalidate: tile {} is locked", tile_num);
            return;
        }
        if tile.share_count() > 1 {
            self.replace_with_invalid(store, tile_num);
        } else {
            store.drop_tile_content(id);
        }
    }

    /// `invalidate` addressed by pixel coordinates.
    pub fn invalidate_at_pixel(&mut self, store: &mut TileStore, x: u32, y: u32) {
        match self.tile_num_at(x, y) {
            Some(num) => self.invalidate(store, num),
            None => {
                crate::log_warn!("TileManager::invalidate_at_pixel: ({}, {}) out of range", x, y)
            }
        }
    }

    // ---- sharing ------------------------------------------------------------

    /// Point slot `tile_num` at `src`, detaching whatever was there. Both
    /// managers then reference identical pixel content; the first write on
    /// either side triggers copy-on-write. The source tile must already be
    /// valid and geometry-conformant (logged otherwise, like the other
    /// contract violations).
    pub fn map(&mut self, store: &mut TileStore, tile_num: usize, src: TileId) {
        if tile_num >= self.ntiles() {
            crate::log_warn!("TileManager::map: tile {} out of range", tile_num);
            return;
        }
        if self.tiles.is_empty() {
            crate::log_warn!("TileManager::map: mapping into an unmaterialised grid");
            self.materialize(store);
        }

        let old = self.tiles[tile_num];
        if old == src {
            return; // already mapped here
        }

        {
            let src_tile = store.arena().get(src);
            if !src_tile.is_valid() {
                crate::log_warn!("TileManager::map: source tile not validated yet");
            }
            let old_tile = store.arena().get(old);
            if old_tile.ewidth() != src_tile.ewidth()
                || old_tile.eheight() != src_tile.eheight()
                || old_tile.bpp() != src_tile.bpp()
            {
                crate::log_warn!("TileManager::map: nonconformant map (slot {})", tile_num);
            }
        }

        store.detach_tile(old, self.id, tile_num);
        store.attach_tile(src, self.id, tile_num);
        self.tiles[tile_num] = src;
    }

    /// `map` addressed by pixel coordinates.
    pub fn map_at_pixel(&mut self, store: &mut TileStore, x: u32, y: u32, src: TileId) {
        match self.tile_num_at(x, y) {
            Some(num) => self.map(store, num, src),
            None => crate::log_warn!("TileManager::map_at_pixel: ({}, {}) out of range", x, y),
        }
    }

    /// Replace the slot currently holding `tile` with `src`.
    pub fn map_over_tile(&mut self, store: &mut TileStore, tile: TileId, src: TileId) {
        match store.arena().get(tile).link_for(self.id) {
            Some(num) => self.map(store, num, src),
            None => crate::log_warn!("TileManager::map_over_tile: tile not attached to manager"),
        }
    }

    /// Pixel coordinates of the top-left corner of `tile` within this
    /// manager, found through the tile's back-links.
    pub fn tile_coordinates(&self, store: &TileStore, tile: TileId) -> Option<(u32, u32)> {
        match store.arena().get(tile).link_for(self.id) {
            Some(num) => {
                let col = num as u32 % self.ntile_cols;
                let row = num as u32 / self.ntile_cols;
                Some((col * TILE_WIDTH, row * TILE_HEIGHT))
            }
            None => {
                crate::log_warn!("TileManager::tile_coordinates: tile not attached to manager");
                None
            }
        }
    }

    /// Validity of the tile at `tile_num` (false while unmaterialised).
    pub fn is_tile_valid(&self, store: &TileStore, tile_num: usize) -> bool {
        if self.tiles.is_empty() || tile_num >= self.ntiles() {
            return false;
        }
        store.arena().get(self.tiles[tile_num]).is_valid()
    }

    // ---- bulk data exchange (plug-in boundary) ------------------------------

    /// Copy the whole content of the tile at `tile_num` into `dst` (exactly
    /// `ewidth * eheight * bpp` bytes, tile-local row stride). This is the
    /// "give me tile N's raw bytes" half of the plug-in exchange.
    pub fn read_tile_data(
        &mut self,
        store: &mut TileStore,
        tile_num: usize,
        dst: &mut [u8],
    ) -> Result<(), TileError> {
        let Some(id) = self.acquire(store, tile_num, true, false)? else {
            crate::log_warn!("TileManager::read_tile_data: tile {} out of range", tile_num);
            return Ok(());
        };
        let tile = store.arena().get(id);
        if dst.len() != tile.size() {
            crate::log_warn!(
                "TileManager::read_tile_data: buffer is {} bytes, tile is {}",
                dst.len(),
                tile.size()
            );
        } else {
            dst.copy_from_slice(tile.data().expect("locked tile is resident"));
        }
        store.release(id, false);
        Ok(())
    }

    /// Overwrite the whole tile at `tile_num` with `data` (the "here are
    /// tile N's modified bytes" half of the plug-in exchange). Goes through
    /// the normal write path so copy-on-write and dirtying stay consistent.
    pub fn write_tile_data(
        &mut self,
        store: &mut TileStore,
        tile_num: usize,
        data: &[u8],
    ) -> Result<(), TileError> {
        let Some(id) = self.acquire(store, tile_num, false, true)? else {
            crate::log_warn!("TileManager::write_tile_data: tile {} out of range", tile_num);
            return Ok(());
        };
        let tile = store.arena_mut().get_mut(id);
        if data.len() != tile.size() {
            crate::log_warn!(
                "TileManager::write_tile_data: buffer is {} bytes, tile is {}",
                data.len(),
                tile.size()
            );
            // The tile was left invalid by the full-overwrite path; releasing
            // the write lock below validates it, so zero the buffer instead
            // of exposing stale bytes.
            tile.data_mut().expect("locked tile is resident").fill(0);
        } else {
            tile.data_mut()
                .expect("locked tile is resident")
                .copy_from_slice(data);
        }
        store.release(id, true);
        store.update_rowhints(id);
        Ok(())
    }

    /// Copy an arbitrary pixel rectangle out of the surface into `dst`
    /// (row stride `dst_stride` bytes). Out-of-bounds rectangles are a
    /// caller error: logged, nothing copied.
    pub fn read_pixel_data(
        &mut self,
        store: &mut TileStore,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        dst: &mut [u8],
        dst_stride: usize,
    ) -> Result<(), TileError> {
        if !self.rect_in_bounds(x, y, w, h) {
            crate::log_warn!(
                "TileManager::read_pixel_data: rect {}x{}+{}+{} out of bounds",
                w, h, x, y
            );
            return Ok(());
        }
        let bpp = self.bpp as usize;
        let needed = (h as usize - 1) * dst_stride + w as usize * bpp;
        if dst.len() < needed {
            crate::log_warn!(
                "TileManager::read_pixel_data: buffer is {} bytes, rect needs {}",
                dst.len(),
                needed
            );
            return Ok(());
        }
        let mut region = PixelRegion::new(self, x, y, w, h, false);
        while let Some(chunk) = region.next_chunk(store)? {
            let row_bytes = chunk.width as usize * bpp;
            for row in 0..chunk.height {
                let dst_off =
                    (chunk.y + row - y) as usize * dst_stride + (chunk.x - x) as usize * bpp;
                dst[dst_off..dst_off + row_bytes].copy_from_slice(chunk.row(row));
            }
        }
        Ok(())
    }

    /// Copy `src` (row stride `src_stride` bytes) into an arbitrary pixel
    /// rectangle of the surface, dirtying every touched tile.
    pub fn write_pixel_data(
        &mut self,
        store: &mut TileStore,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        src: &[u8],
        src_stride: usize,
    ) -> Result<(), TileError> {
        if !self.rect_in_bounds(x, y, w, h) {
            crate::log_warn!(
                "TileManager::write_pixel_data: rect {}x{}+{}+{} out of bounds",
                w, h, x, y
            );
            return Ok(());
        }
        let bpp = self.bpp as usize;
        let needed = (h as usize - 1) * src_stride + w as usize * bpp;
        if src.len() < needed {
            crate::log_warn!(
                "TileManager::write_pixel_data: buffer is {} bytes, rect needs {}",
                src.len(),
                needed
            );
            return Ok(());
        }
        let mut region = PixelRegion::new(self, x, y, w, h, true);
        while let Some(mut chunk) = region.next_chunk(store)? {
            let row_bytes = chunk.width as usize * bpp;
            for row in 0..chunk.height {
                let src_off =
                    (chunk.y + row - y) as usize * src_stride + (chunk.x - x) as usize * bpp;
                chunk
                    .row_mut(row)
                    .copy_from_slice(&src[src_off..src_off + row_bytes]);
            }
        }
        Ok(())
    }

    /// One pixel's bytes, or `None` outside the surface.
    pub fn get_pixel(
        &mut self,
        store: &mut TileStore,
        x: u32,
        y: u32,
    ) -> Result<Option<Vec<u8>>, TileError> {
        let bpp = self.bpp as usize;
        let mut px = vec![0u8; bpp];
        if x >= self.width || y >= self.height {
            return Ok(None);
        }
        self.read_pixel_data(store, x, y, 1, 1, &mut px, bpp)?;
        Ok(Some(px))
    }

    /// Overwrite one pixel. Out of bounds: logged no-op.
    pub fn put_pixel(
        &mut self,
        store: &mut TileStore,
        x: u32,
        y: u32,
        pixel: &[u8],
    ) -> Result<(), TileError> {
        if pixel.len() != self.bpp as usize {
            crate::log_warn!(
                "TileManager::put_pixel: pixel is {} bytes, surface bpp is {}",
                pixel.len(),
                self.bpp
            );
            return Ok(());
        }
        self.write_pixel_data(store, x, y, 1, 1, pixel, pixel.len())
    }

    fn rect_in_bounds(&self, x: u32, y: u32, w: u32, h: u32) -> bool {
        w > 0
            && h > 0
            && (x as u64 + w as u64) <= self.width as u64
            && (y as u64 + h as u64) <= self.height as u64
    }

    // ---- teardown -----------------------------------------------------------

    /// Detach every tile in grid order and consume the manager. Tiles whose
    /// last attachment this was are freed (buffer, swap record, arena slot).
    pub fn destroy(mut self, store: &mut TileStore) {
        for (num, id) in self.tiles.drain(..).enumerate() {
            store.detach_tile(id, self.id, num);
        }
    }
}
