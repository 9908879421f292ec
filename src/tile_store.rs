// ============================================================================
// TileStore — arena + cache + swap, the injected residency dependency
// ============================================================================
//
// Every operation that can touch residency (lock, release, fault-in,
// eviction, copy-on-write allocation) goes through one `TileStore` value
// passed by `&mut`. There is no process-global state: tests build a store
// with a tiny budget and drive eviction deterministically.
//
// Locking model: single-threaded cooperative. A lock pins the tile against
// eviction and, for write locks, marks it dirty. Exclusive access is
// enforced by the `&mut TileStore` threading — a `TileGuard` borrows the
// store for as long as it lives, so a second accessor cannot exist while a
// guard is out.

use std::path::{Path, PathBuf};

use crate::error::TileError;
use crate::tile::{ManagerId, RowHint, Tile, TileArena, TileId};
use crate::tile_cache::{CacheStats, TileCache};
use crate::tile_swap::SwapFile;

/// Default resident-byte budget: 10 MB, enough for ~640 full RGBA tiles.
pub const DEFAULT_CACHE_BYTES: usize = 10 * 1024 * 1024;

pub struct TileStore {
    arena: TileArena,
    cache: TileCache,
    /// Lazily opened on first write-back, so memory-only workloads never
    /// touch the filesystem.
    swap: Option<SwapFile>,
    swap_dir: Option<PathBuf>,
    next_manager_id: u64,
}

impl TileStore {
    /// Memory-only store: clean buffers can be freed under pressure, but
    /// dirty tiles are never evicted (there is nowhere to write them).
    pub fn new(cache_budget_bytes: usize) -> Self {
        TileStore {
            arena: TileArena::new(),
            cache: TileCache::new(cache_budget_bytes),
            swap: None,
            swap_dir: None,
            next_manager_id: 1,
        }
    }

    /// Store with a swap directory; dirty tiles are written back there on
    /// eviction. The file itself is created on first use.
    pub fn with_swap_dir(cache_budget_bytes: usize, dir: impl AsRef<Path>) -> Self {
        let mut store = Self::new(cache_budget_bytes);
        store.swap_dir = Some(dir.as_ref().to_path_buf());
        store
    }

    // ---- introspection ------------------------------------------------------

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn resident_bytes(&self) -> usize {
        self.cache.resident_bytes()
    }

    pub fn cache_budget(&self) -> usize {
        self.cache.budget()
    }

    /// Shrink or grow the budget; shrinking evicts immediately.
    pub fn set_cache_budget(&mut self, budget_bytes: usize) -> Result<(), TileError> {
        self.cache.set_budget(budget_bytes);
        self.ensure_room(0)
    }

    /// Live records in the swap file, 0 when it was never opened.
    pub fn swapped_tile_count(&self) -> usize {
        self.swap.as_ref().map_or(0, |s| s.record_count())
    }

    /// Bytes the swap file currently spans.
    pub fn swap_file_len(&self) -> u64 {
        self.swap.as_ref().map_or(0, |s| s.file_len())
    }

    pub(crate) fn arena(&self) -> &TileArena {
        &self.arena
    }

    pub(crate) fn arena_mut(&mut self) -> &mut TileArena {
        &mut self.arena
    }

    pub(crate) fn alloc_manager_id(&mut self) -> ManagerId {
        let id = ManagerId(self.next_manager_id);
        self.next_manager_id += 1;
        id
    }

    // ---- attach / detach ----------------------------------------------------

    pub(crate) fn attach_tile(&mut self, id: TileId, manager: ManagerId, tile_num: usize) {
        self.arena.get_mut(id).attach(manager, tile_num);
    }

    /// Detach one manager slot; frees the tile (buffer, swap record, arena
    /// slot) when the last attachment goes away.
    pub(crate) fn detach_tile(&mut self, id: TileId, manager: ManagerId, tile_num: usize) {
        if self.arena.get_mut(id).detach(manager, tile_num) == 0 {
            self.cache.flush(&mut self.arena, id);
            let tile = self.arena.free(id);
            if let Some(token) = tile.swap_token()
                && let Some(swap) = self.swap.as_mut()
            {
                swap.delete(token);
            }
        }
    }

    // ---- residency ----------------------------------------------------------

    /// Make the tile's pixel buffer resident, faulting in from swap when a
    /// record exists and allocating a zeroed buffer otherwise.
    pub(crate) fn ensure_resident(&mut self, id: TileId) -> Result<(), TileError> {
        if self.arena.get(id).is_resident() {
            self.cache.stats_mut().hits += 1;
            return Ok(());
        }

        let size = self.arena.get(id).size();
        self.ensure_room(size)?;

        let mut buf = vec![0u8; size];
        if let Some(token) = self.arena.get(id).swap_token() {
            let swap = self.swap.as_mut().ok_or(TileError::NoSwap)?;
            if let Err(e) = swap.read(token, &mut buf) {
                // The record is unreadable: this tile's content is gone.
                // Drop the token and mark the tile invalid so a later access
                // regenerates it instead of re-hitting the bad record.
                swap.delete(token);
                let t = self.arena.get_mut(id);
                t.set_swap_token(None);
                t.set_valid(false);
                return Err(e);
            }
            self.cache.stats_mut().swap_ins += 1;
        }
        self.cache.stats_mut().misses += 1;

        self.arena.get_mut(id).set_data(Some(buf));
        self.cache.touch(&mut self.arena, id);
        Ok(())
    }

    /// Evict unlocked tiles (LRU first) until `incoming` more bytes fit in
    /// the budget. Stops early, without error, when every remaining resident
    /// tile is pinned or un-evictable.
    pub(crate) fn ensure_room(&mut self, incoming: usize) -> Result<(), TileError> {
        while self.cache.resident_bytes() + incoming > self.cache.budget() {
            let swap_ok = self.swap.is_some() || self.swap_dir.is_some();
            let Some(victim) = self.cache.eviction_candidate(&self.arena, swap_ok) else {
                break;
            };
            self.evict(victim)?;
        }
        Ok(())
    }

    /// Evict every unlocked resident tile. Used to force a cold cache in
    /// the CLI verifier and in tests. Returns `NoSwap` if a tile's sole
    /// content copy could not be written back because no swap directory is
    /// configured.
    pub fn flush_all(&mut self) -> Result<(), TileError> {
        for id in self.cache.listed(&self.arena) {
            let t = self.arena.get(id);
            if t.lock_count() > 0 {
                continue;
            }
            if t.must_write_back() && self.swap_dir.is_none() && self.swap.is_none() {
                return Err(TileError::NoSwap);
            }
            self.evict(id)?;
        }
        Ok(())
    }

    fn evict(&mut self, id: TileId) -> Result<(), TileError> {
        debug_assert_eq!(self.arena.get(id).lock_count(), 0, "evicting a locked tile");
        // Dirty tiles and validated tiles that never reached swap both hold
        // the only copy of their content; freeing the buffer without a
        // write-back would lose it (a filler-validated tile stays clean, so
        // dirtiness alone is not the test).
        if self.arena.get(id).must_write_back() {
            self.swap_out(id)?;
        }
        self.cache.flush(&mut self.arena, id);
        self.arena.get_mut(id).set_data(None);
        self.cache.stats_mut().evictions += 1;
        Ok(())
    }

    /// Write a tile's buffer to its swap record (allocating one on first
    /// write-back). Clears the dirty flag; the buffer stays resident.
    fn swap_out(&mut self, id: TileId) -> Result<(), TileError> {
        if self.swap.is_none() {
            let dir = self.swap_dir.as_deref().ok_or(TileError::NoSwap)?;
            self.swap = Some(SwapFile::open(dir)?);
        }
        let swap = self.swap.as_mut().ok_or(TileError::NoSwap)?;

        let tile = self.arena.get(id);
        let (token, fresh) = match tile.swap_token() {
            Some(t) => (t, false),
            None => (swap.alloc(tile.size()), true),
        };
        let data = tile.data().expect("tile being swapped out is resident");
        if let Err(e) = swap.write(token, data) {
            // A record allocated for this write holds nothing yet; return
            // it to the free list instead of leaking it.
            if fresh {
                swap.delete(token);
            }
            return Err(e);
        }

        let t = self.arena.get_mut(id);
        t.set_swap_token(Some(token));
        t.set_dirty(false);
        self.cache.stats_mut().swap_outs += 1;
        Ok(())
    }

    // ---- locking ------------------------------------------------------------

    /// Pin a resident tile. Callers must have run `ensure_resident` first;
    /// a write lock marks the tile dirty and discards its row hints.
    pub(crate) fn lock(&mut self, id: TileId, write: bool) {
        debug_assert!(self.arena.get(id).is_resident(), "locking a non-resident tile");
        self.arena.get_mut(id).add_lock(write);
        self.cache.touch(&mut self.arena, id);
    }

    /// Drop a lock. Releasing the write lock of a full-overwrite access
    /// marks the tile valid — its content is now whatever the writer wrote.
    pub(crate) fn release(&mut self, id: TileId, write: bool) {
        let t = self.arena.get_mut(id);
        t.remove_lock(write);
        if write {
            t.set_valid(true);
        }
    }

    // ---- tile allocation helpers (copy-on-write, invalidate) ---------------

    /// Clone `src` into a fresh single-owner tile: same geometry and
    /// validity, same pixel bytes, same row hints. `src` is pinned while
    /// copying so `ensure_room` cannot evict it under us.
    pub(crate) fn clone_tile(&mut self, src: TileId) -> Result<TileId, TileError> {
        self.ensure_resident(src)?;
        self.lock(src, false);
        let result = self.clone_tile_pinned(src);
        self.release(src, false);
        result
    }

    fn clone_tile_pinned(&mut self, src: TileId) -> Result<TileId, TileError> {
        let size = self.arena.get(src).size();
        self.ensure_room(size)?;

        let s = self.arena.get(src);
        let mut tile = Tile::new(s.bpp());
        tile.set_esize(s.ewidth(), s.eheight());
        tile.set_valid(s.is_valid());
        tile.set_dirty(true); // the copy has no swap record yet
        tile.set_data(s.data().map(|d| d.to_vec()));
        tile.set_rowhints(s.rowhints().map(Box::from));

        let id = self.arena.alloc(tile);
        self.cache.touch(&mut self.arena, id);
        Ok(id)
    }

    /// A fresh invalid tile with the same geometry as `like`, no buffer.
    /// Used when a shared tile is invalidated or full-overwritten: the new
    /// single-owner slot starts with nothing.
    pub(crate) fn alloc_invalid_like(&mut self, like: TileId) -> TileId {
        let s = self.arena.get(like);
        let mut tile = Tile::new(s.bpp());
        tile.set_esize(s.ewidth(), s.eheight());
        self.arena.alloc(tile)
    }

    /// Drop a tile's cached content everywhere: buffer, recency-list entry,
    /// swap record. The tile becomes invalid and will be regenerated (or
    /// zero-filled) on next read access.
    pub(crate) fn drop_tile_content(&mut self, id: TileId) {
        self.cache.flush(&mut self.arena, id);
        let t = self.arena.get_mut(id);
        t.set_data(None);
        t.set_valid(false);
        t.set_dirty(false);
        t.set_rowhints(None);
        if let Some(token) = t.swap_token() {
            t.set_swap_token(None);
            if let Some(swap) = self.swap.as_mut() {
                swap.delete(token);
            }
        }
    }

    /// Recompute row hints from the tile's resident data.
    pub(crate) fn update_rowhints(&mut self, id: TileId) {
        self.arena.get_mut(id).update_rowhints();
    }
}

// ============================================================================
// TileGuard — RAII single-tile access
// ============================================================================

/// A locked tile checked out of the store. Holds `&mut TileStore`, so the
/// borrow checker guarantees no second accessor while the guard lives; the
/// lock (and with it the eviction pin) is dropped with the guard.
pub struct TileGuard<'a> {
    store: &'a mut TileStore,
    id: TileId,
    write: bool,
}

impl<'a> TileGuard<'a> {
    pub(crate) fn new(store: &'a mut TileStore, id: TileId, write: bool) -> Self {
        TileGuard { store, id, write }
    }

    pub fn tile_id(&self) -> TileId {
        self.id
    }

    pub fn ewidth(&self) -> u32 {
        self.store.arena.get(self.id).ewidth()
    }

    pub fn eheight(&self) -> u32 {
        self.store.arena.get(self.id).eheight()
    }

    pub fn bpp(&self) -> u32 {
        self.store.arena.get(self.id).bpp()
    }

    pub fn rowstride(&self) -> usize {
        self.store.arena.get(self.id).rowstride()
    }

    pub fn size(&self) -> usize {
        self.store.arena.get(self.id).size()
    }

    pub fn rowhint(&self, row: u32) -> RowHint {
        self.store.arena.get(self.id).rowhint(row)
    }

    pub fn data(&self) -> &[u8] {
        self.store
            .arena
            .get(self.id)
            .data()
            .expect("locked tile is resident")
    }

    /// Mutable pixel access; only meaningful on a write-locked guard.
    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.write, "data_mut on a read-only tile guard");
        self.store
            .arena
            .get_mut(self.id)
            .data_mut()
            .expect("locked tile is resident")
    }
}

impl Drop for TileGuard<'_> {
    fn drop(&mut self) {
        self.store.release(self.id, self.write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{Tile, TILE_HEIGHT, TILE_WIDTH};

    fn attached_tile(store: &mut TileStore, bpp: u32) -> TileId {
        let mgr = store.alloc_manager_id();
        let id = store.arena_mut().alloc(Tile::new(bpp));
        store.attach_tile(id, mgr, 0);
        id
    }

    const TILE_BYTES: usize = (TILE_WIDTH * TILE_HEIGHT) as usize;

    #[test]
    fn test_ensure_resident_allocates_zeroed() {
        let mut store = TileStore::new(1 << 20);
        let id = attached_tile(&mut store, 1);
        store.ensure_resident(id).unwrap();
        assert!(store.arena().get(id).is_resident());
        assert!(store.arena().get(id).data().unwrap().iter().all(|&b| b == 0));
        assert_eq!(store.resident_bytes(), TILE_BYTES);
    }

    #[test]
    fn test_write_evict_read_round_trip_is_lossless() {
        let dir = std::env::temp_dir();
        let mut store = TileStore::with_swap_dir(1 << 20, &dir);
        let id = attached_tile(&mut store, 1);

        store.ensure_resident(id).unwrap();
        store.lock(id, true);
        let pattern: Vec<u8> = (0..TILE_BYTES).map(|i| (i % 251) as u8).collect();
        store
            .arena_mut()
            .get_mut(id)
            .data_mut()
            .unwrap()
            .copy_from_slice(&pattern);
        store.release(id, true);

        store.flush_all().unwrap();
        assert!(!store.arena().get(id).is_resident());
        assert_eq!(store.swapped_tile_count(), 1);

        store.ensure_resident(id).unwrap();
        assert_eq!(store.arena().get(id).data().unwrap(), &pattern[..]);
        let stats = store.cache_stats();
        assert_eq!(stats.swap_outs, 1);
        assert_eq!(stats.swap_ins, 1);
    }

    #[test]
    fn test_budget_pressure_evicts_lru_first() {
        // Room for exactly two tiles.
        let mut store = TileStore::with_swap_dir(2 * TILE_BYTES, std::env::temp_dir());
        let a = attached_tile(&mut store, 1);
        let b = attached_tile(&mut store, 1);
        let c = attached_tile(&mut store, 1);

        store.ensure_resident(a).unwrap();
        store.ensure_resident(b).unwrap();
        store.ensure_resident(c).unwrap(); // must evict a
        assert!(!store.arena().get(a).is_resident());
        assert!(store.arena().get(b).is_resident());
        assert!(store.arena().get(c).is_resident());
        assert_eq!(store.cache_stats().evictions, 1);
    }

    #[test]
    fn test_locked_tile_survives_pressure() {
        let mut store = TileStore::with_swap_dir(TILE_BYTES, std::env::temp_dir());
        let a = attached_tile(&mut store, 1);
        let b = attached_tile(&mut store, 1);

        store.ensure_resident(a).unwrap();
        store.lock(a, false);
        // b does not fit, but a is pinned: the cache runs over budget
        // rather than evicting it.
        store.ensure_resident(b).unwrap();
        assert!(store.arena().get(a).is_resident());
        assert!(store.arena().get(b).is_resident());
        store.release(a, false);
    }

    #[test]
    fn test_memory_only_store_refuses_dirty_flush() {
        let mut store = TileStore::new(1 << 20);
        let id = attached_tile(&mut store, 1);
        store.ensure_resident(id).unwrap();
        store.lock(id, true);
        store.release(id, true);
        assert!(matches!(store.flush_all(), Err(TileError::NoSwap)));
    }

    #[test]
    fn test_clean_eviction_skips_swap() {
        let dir = std::env::temp_dir();
        let mut store = TileStore::with_swap_dir(1 << 20, &dir);
        let id = attached_tile(&mut store, 1);
        store.ensure_resident(id).unwrap();
        store.flush_all().unwrap();
        // Never dirtied: no swap record was created.
        assert_eq!(store.swapped_tile_count(), 0);
        assert_eq!(store.cache_stats().swap_outs, 0);
    }

    #[test]
    fn test_detach_frees_swap_record() {
        let dir = std::env::temp_dir();
        let mut store = TileStore::with_swap_dir(1 << 20, &dir);
        let mgr = store.alloc_manager_id();
        let id = store.arena_mut().alloc(Tile::new(1));
        store.attach_tile(id, mgr, 3);

        store.ensure_resident(id).unwrap();
        store.lock(id, true);
        store.release(id, true);
        store.flush_all().unwrap();
        assert_eq!(store.swapped_tile_count(), 1);

        store.detach_tile(id, mgr, 3);
        assert_eq!(store.swapped_tile_count(), 0);
        assert!(store.arena().is_empty());
    }

    #[test]
    fn test_clone_tile_copies_bytes_and_is_single_owner() {
        let mut store = TileStore::new(1 << 20);
        let id = attached_tile(&mut store, 1);
        store.ensure_resident(id).unwrap();
        store.lock(id, true);
        store.arena_mut().get_mut(id).data_mut().unwrap()[0] = 0x5A;
        store.release(id, true);

        let copy = store.clone_tile(id).unwrap();
        assert_ne!(copy, id);
        assert_eq!(store.arena().get(copy).share_count(), 0);
        assert_eq!(store.arena().get(copy).data().unwrap()[0], 0x5A);
        assert!(store.arena().get(copy).is_valid());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let mut store = TileStore::new(1 << 20);
        let id = attached_tile(&mut store, 1);
        store.ensure_resident(id).unwrap();
        store.lock(id, true);
        {
            let guard = TileGuard::new(&mut store, id, true);
            assert_eq!(guard.data().len(), TILE_BYTES);
        }
        assert_eq!(store.arena().get(id).lock_count(), 0);
        assert!(store.arena().get(id).is_valid()); // write release validates
    }
}
