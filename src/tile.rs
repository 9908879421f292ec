// ============================================================================
// Tile — the fixed-size atomic unit of pixel storage
// ============================================================================
//
// A Tile covers at most TILE_WIDTH × TILE_HEIGHT pixels of one raster
// surface. Edge tiles record their effective width/height so the grid covers
// the surface exactly. The pixel buffer exists only while the tile is
// resident; an evicted tile keeps a swap token instead.
//
// Tiles are shared between managers by attach/detach reference counting:
// `share_count` is the number of manager slots currently pointing at this
// tile, and every attachment leaves a back-link so a tile can be traced to
// each (manager, slot) that owns it. A tile with `share_count > 1` is never
// written in place — the write path copies it first (see
// `TileManager::get`).
//
// All tiles live in a `TileArena` and are addressed by `TileId` handles;
// nothing in the crate holds a raw reference to a tile across operations.

use crate::tile_swap::SwapToken;

/// Nominal tile width in pixels.
pub const TILE_WIDTH: u32 = 64;
/// Nominal tile height in pixels.
pub const TILE_HEIGHT: u32 = 64;

/// Identity of a tile manager, used in back-links. Issued by the store so
/// two managers can never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ManagerId(pub(crate) u64);

/// Stable handle to a tile in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileId(u32);

impl TileId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Back-link from a tile to one manager slot that references it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileLink {
    pub manager: ManagerId,
    pub tile_num: usize,
}

/// Per-row content classification, used by compositing fast paths to skip
/// rows that are known fully transparent or fully opaque.
///
/// Hints survive copy-on-write (the copy sees the same pixel bytes) but are
/// discarded whenever a write lock is taken, since the writer may change any
/// row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RowHint {
    #[default]
    Unknown,
    Transparent,
    Opaque,
    Mixed,
}

pub struct Tile {
    ewidth: u32,
    eheight: u32,
    bpp: u32,

    /// Tile holds real pixel content (as opposed to an uninitialized or
    /// invalidated surface that must be filled before read access).
    valid: bool,
    /// Resident content differs from whatever the swap file holds.
    dirty: bool,

    /// Number of manager slots attached to this tile.
    share_count: u32,
    /// Outstanding write locks.
    write_count: u32,
    /// Outstanding locks of any kind. A locked tile is pinned: the cache
    /// never evicts it.
    lock_count: u32,

    /// Pixel buffer; `Some` iff the tile is resident.
    data: Option<Vec<u8>>,
    /// Location of this tile's record in the swap file, once written there.
    swap: Option<SwapToken>,

    /// One back-link per attachment.
    links: Vec<TileLink>,

    /// Per-row hints; `None` = unknown for every row.
    rowhints: Option<Box<[RowHint]>>,

    // Intrusive LRU list membership, maintained by the tile cache.
    pub(crate) lru_prev: Option<TileId>,
    pub(crate) lru_next: Option<TileId>,
    pub(crate) in_lru: bool,
}

impl Tile {
    /// A fresh tile: nominal dimensions, no buffer, not valid. Edge tiles
    /// get their effective size adjusted by the manager after init.
    pub fn new(bpp: u32) -> Self {
        Tile {
            ewidth: TILE_WIDTH,
            eheight: TILE_HEIGHT,
            bpp,
            valid: false,
            dirty: false,
            share_count: 0,
            write_count: 0,
            lock_count: 0,
            data: None,
            swap: None,
            links: Vec::new(),
            rowhints: None,
            lru_prev: None,
            lru_next: None,
            in_lru: false,
        }
    }

    // ---- geometry -----------------------------------------------------------

    pub fn ewidth(&self) -> u32 {
        self.ewidth
    }

    pub fn eheight(&self) -> u32 {
        self.eheight
    }

    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    pub(crate) fn set_esize(&mut self, ewidth: u32, eheight: u32) {
        self.ewidth = ewidth;
        self.eheight = eheight;
    }

    /// Size of the pixel buffer in bytes.
    pub fn size(&self) -> usize {
        (self.ewidth * self.eheight * self.bpp) as usize
    }

    /// Byte stride between the starts of consecutive rows in the buffer.
    pub fn rowstride(&self) -> usize {
        (self.ewidth * self.bpp) as usize
    }

    // ---- state flags --------------------------------------------------------

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn is_resident(&self) -> bool {
        self.data.is_some()
    }

    /// The buffer is the only copy of real content: the tile is dirty, or
    /// it was validated (by a filler or a write) but never written to swap.
    /// Evicting such a tile without a write-back loses its content.
    pub fn must_write_back(&self) -> bool {
        self.dirty || (self.valid && self.swap.is_none())
    }

    pub fn share_count(&self) -> u32 {
        self.share_count
    }

    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub(crate) fn add_lock(&mut self, write: bool) {
        self.lock_count += 1;
        if write {
            self.write_count += 1;
            self.dirty = true;
            // Any row may change under a write lock.
            self.rowhints = None;
        }
    }

    pub(crate) fn remove_lock(&mut self, write: bool) {
        debug_assert!(self.lock_count > 0, "tile released more often than locked");
        if write {
            debug_assert!(self.write_count > 0);
            self.write_count -= 1;
        }
        self.lock_count -= 1;
    }

    // ---- residency ----------------------------------------------------------

    pub(crate) fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub(crate) fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }

    pub(crate) fn set_data(&mut self, data: Option<Vec<u8>>) {
        self.data = data;
    }

    pub(crate) fn swap_token(&self) -> Option<SwapToken> {
        self.swap
    }

    pub(crate) fn set_swap_token(&mut self, token: Option<SwapToken>) {
        self.swap = token;
    }

    // ---- attach / detach ----------------------------------------------------

    /// Record that `manager` slot `tile_num` now references this tile.
    pub(crate) fn attach(&mut self, manager: ManagerId, tile_num: usize) {
        self.share_count += 1;
        self.links.push(TileLink { manager, tile_num });
    }

    /// Remove the back-link for `manager` slot `tile_num`. Returns the new
    /// share count; the caller frees the tile when it reaches zero.
    pub(crate) fn detach(&mut self, manager: ManagerId, tile_num: usize) -> u32 {
        let before = self.links.len();
        if let Some(pos) = self
            .links
            .iter()
            .position(|l| l.manager == manager && l.tile_num == tile_num)
        {
            self.links.remove(pos);
        }
        if self.links.len() == before {
            crate::log_warn!(
                "Tile::detach: no back-link for manager {:?} slot {}",
                manager,
                tile_num
            );
        } else {
            self.share_count -= 1;
        }
        self.share_count
    }

    /// The slot index this tile occupies in `manager`, if attached there.
    pub(crate) fn link_for(&self, manager: ManagerId) -> Option<usize> {
        self.links
            .iter()
            .find(|l| l.manager == manager)
            .map(|l| l.tile_num)
    }

    // ---- row hints ----------------------------------------------------------

    /// Hint for row `row`, defaulting to `Unknown` when no hints exist.
    pub fn rowhint(&self, row: u32) -> RowHint {
        self.rowhints
            .as_ref()
            .and_then(|h| h.get(row as usize).copied())
            .unwrap_or(RowHint::Unknown)
    }

    pub(crate) fn rowhints(&self) -> Option<&[RowHint]> {
        self.rowhints.as_deref()
    }

    pub(crate) fn set_rowhints(&mut self, hints: Option<Box<[RowHint]>>) {
        self.rowhints = hints;
    }

    /// Recompute hints from the resident pixel data. Only meaningful for
    /// pixel formats with an alpha channel in the last component (bpp 2 or
    /// 4); other formats are marked `Opaque` throughout.
    pub(crate) fn update_rowhints(&mut self) {
        let (ewidth, eheight, bpp) = (self.ewidth, self.eheight, self.bpp);
        let Some(data) = self.data.as_deref() else {
            return;
        };
        let has_alpha = bpp == 2 || bpp == 4;
        let stride = (ewidth * bpp) as usize;
        let mut hints = vec![RowHint::Unknown; eheight as usize].into_boxed_slice();

        for (row, hint) in hints.iter_mut().enumerate() {
            if !has_alpha {
                *hint = RowHint::Opaque;
                continue;
            }
            let row_start = row * stride;
            let alpha_off = (bpp - 1) as usize;
            let mut seen_zero = false;
            let mut seen_full = false;
            let mut seen_partial = false;
            for px in 0..ewidth as usize {
                match data[row_start + px * bpp as usize + alpha_off] {
                    0 => seen_zero = true,
                    255 => seen_full = true,
                    _ => seen_partial = true,
                }
                if seen_partial || (seen_zero && seen_full) {
                    break;
                }
            }
            *hint = if seen_partial || (seen_zero && seen_full) {
                RowHint::Mixed
            } else if seen_zero {
                RowHint::Transparent
            } else {
                RowHint::Opaque
            };
        }

        self.rowhints = Some(hints);
    }
}

// ============================================================================
// TileArena — handle-addressed storage of all live tiles
// ============================================================================

/// Owns every live `Tile` and hands out stable `TileId` handles. Slots are
/// recycled through a free list; a slot is only freed when its tile's
/// share count has dropped to zero, so a held `TileId` can never dangle
/// while any manager is attached.
#[derive(Default)]
pub struct TileArena {
    slots: Vec<Option<Tile>>,
    free: Vec<u32>,
}

impl TileArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, tile: Tile) -> TileId {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(tile);
                TileId(idx)
            }
            None => {
                self.slots.push(Some(tile));
                TileId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: TileId) -> &Tile {
        self.slots[id.index()]
            .as_ref()
            .expect("TileArena::get: stale tile id")
    }

    pub fn get_mut(&mut self, id: TileId) -> &mut Tile {
        self.slots[id.index()]
            .as_mut()
            .expect("TileArena::get_mut: stale tile id")
    }

    /// Mutable access to two distinct tiles at once (paired pixel-region
    /// iteration needs a read view of one tile and a write view of another).
    pub fn get2_mut(&mut self, a: TileId, b: TileId) -> (&mut Tile, &mut Tile) {
        assert_ne!(a, b, "TileArena::get2_mut: aliasing tile ids");
        let (ai, bi) = (a.index(), b.index());
        if ai < bi {
            let (lo, hi) = self.slots.split_at_mut(bi);
            (
                lo[ai].as_mut().expect("stale tile id"),
                hi[0].as_mut().expect("stale tile id"),
            )
        } else {
            let (lo, hi) = self.slots.split_at_mut(ai);
            let (ta, tb) = (
                hi[0].as_mut().expect("stale tile id"),
                lo[bi].as_mut().expect("stale tile id"),
            );
            (ta, tb)
        }
    }

    pub fn free(&mut self, id: TileId) -> Tile {
        let tile = self.slots[id.index()]
            .take()
            .expect("TileArena::free: stale tile id");
        debug_assert_eq!(tile.share_count(), 0, "freed tile still attached");
        self.free.push(id.index() as u32);
        tile
    }

    /// Number of live tiles.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tile_is_invalid_and_nonresident() {
        let t = Tile::new(4);
        assert!(!t.is_valid());
        assert!(!t.is_resident());
        assert_eq!(t.share_count(), 0);
        assert_eq!(t.ewidth(), TILE_WIDTH);
        assert_eq!(t.eheight(), TILE_HEIGHT);
        assert_eq!(t.size(), (TILE_WIDTH * TILE_HEIGHT * 4) as usize);
    }

    #[test]
    fn test_edge_tile_size() {
        let mut t = Tile::new(3);
        t.set_esize(36, 16);
        assert_eq!(t.size(), 36 * 16 * 3);
        assert_eq!(t.rowstride(), 36 * 3);
    }

    #[test]
    fn test_attach_detach_share_count() {
        let mut t = Tile::new(1);
        t.attach(ManagerId(1), 0);
        t.attach(ManagerId(2), 5);
        assert_eq!(t.share_count(), 2);
        assert_eq!(t.link_for(ManagerId(2)), Some(5));
        assert_eq!(t.detach(ManagerId(1), 0), 1);
        assert_eq!(t.link_for(ManagerId(1)), None);
        assert_eq!(t.detach(ManagerId(2), 5), 0);
    }

    #[test]
    fn test_write_lock_sets_dirty_and_drops_hints() {
        let mut t = Tile::new(4);
        t.set_data(Some(vec![0u8; t.size()]));
        t.update_rowhints();
        assert_eq!(t.rowhint(0), RowHint::Transparent);
        t.add_lock(true);
        assert!(t.is_dirty());
        assert_eq!(t.write_count(), 1);
        assert_eq!(t.rowhint(0), RowHint::Unknown);
        t.remove_lock(true);
        assert_eq!(t.write_count(), 0);
        assert_eq!(t.lock_count(), 0);
    }

    #[test]
    fn test_rowhints_classification() {
        let mut t = Tile::new(4);
        t.set_esize(4, 3);
        let mut data = vec![0u8; t.size()];
        // row 0: all alpha 0 → Transparent (already)
        // row 1: all alpha 255 → Opaque
        for px in 0..4 {
            data[(4 * 4) + px * 4 + 3] = 255;
        }
        // row 2: mixed
        data[(2 * 4 * 4) + 3] = 255;
        t.set_data(Some(data));
        t.update_rowhints();
        assert_eq!(t.rowhint(0), RowHint::Transparent);
        assert_eq!(t.rowhint(1), RowHint::Opaque);
        assert_eq!(t.rowhint(2), RowHint::Mixed);
    }

    #[test]
    fn test_arena_alloc_free_recycles_slots() {
        let mut arena = TileArena::new();
        let a = arena.alloc(Tile::new(4));
        let b = arena.alloc(Tile::new(4));
        assert_ne!(a, b);
        assert_eq!(arena.len(), 2);
        arena.free(a);
        assert_eq!(arena.len(), 1);
        let c = arena.alloc(Tile::new(1));
        assert_eq!(c, a); // slot recycled
        assert_eq!(arena.get(c).bpp(), 1);
    }

    #[test]
    fn test_arena_get2_mut_disjoint() {
        let mut arena = TileArena::new();
        let a = arena.alloc(Tile::new(4));
        let b = arena.alloc(Tile::new(4));
        let (ta, tb) = arena.get2_mut(b, a);
        ta.set_esize(10, 10);
        tb.set_esize(20, 20);
        assert_eq!(arena.get(b).ewidth(), 10);
        assert_eq!(arena.get(a).ewidth(), 20);
    }
}
